//! Core domain + application logic for the chat-to-mail relay.
//!
//! This crate is framework-agnostic. The chat session bridge, the mail relay
//! and the HTTP status surface live behind ports (traits) implemented in
//! adapter crates.

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod policy;
pub mod ports;
pub mod router;
pub mod settings;

pub use errors::{Error, Result};
