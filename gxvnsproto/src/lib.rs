//! GxvnsChat protocol crate.
//!
//! Shared pieces used by the chat hub and the terminal client: the JSON
//! wire frames (`message`) and the password digest helpers (`auth`). These
//! modules are intentionally minimal and track the wire format exactly
//! rather than being general-purpose libraries.
//!
/// Chat wire frames and their serde mapping
pub mod message;
/// Password digest helpers
pub mod auth;

pub use auth::{hash_password, verify_password};
pub use message::Frame;
