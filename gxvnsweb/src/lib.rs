//! GxvnsChat hub: a WebSocket chat server with persisted accounts.
//!
//! The hub keeps registered users (with SHA-256 password digests and
//! friend lists) in a JSON registry on disk and relays chat frames
//! between logged-in sessions: broadcasts, direct messages, group
//! messages, call and screen-share signalling, and presence events.

#![forbid(unsafe_code)]

pub mod config;
pub mod server;
pub mod state;
pub mod store;

pub use server::{router, run, serve};
pub use state::{AppState, ConnectionHandle};
pub use store::{StoreError, UserRecord, UserStore};
