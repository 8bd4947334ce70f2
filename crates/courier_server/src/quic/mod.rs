#![forbid(unsafe_code)]

pub mod config;
pub mod listener;
pub mod transport;
