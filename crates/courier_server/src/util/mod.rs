#![forbid(unsafe_code)]

pub mod endpoint;
pub mod time;
