//! Core domain + application logic for the Telegram bulk broadcaster.
//!
//! This crate is framework-agnostic. The chat-protocol client, persistence and any
//! push surface live behind ports (traits) implemented in adapter crates.

pub mod auth;
pub mod config;
pub mod contacts;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod media;
pub mod ports;
pub mod utils;

pub use errors::{Error, Result};
