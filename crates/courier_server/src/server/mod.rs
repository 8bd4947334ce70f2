#![forbid(unsafe_code)]

pub mod auth;
pub mod blob;
pub mod connection;
pub mod conversation;
pub mod db;
pub mod error;
pub mod health;
pub mod history;
pub mod hub;
pub mod offline;
pub mod router;
pub mod supervisor;


#[cfg(test)]
mod conversation_tests;


#[cfg(test)]
mod offline_tests;

#[cfg(test)]
mod router_tests;
