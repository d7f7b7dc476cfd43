//! JSON-RPC API for daemon IPC.
//!
//! This module provides a JSON-RPC interface for communication between
//! the mailgate CLI (or any local front-end) and the mailgated daemon.

pub mod handlers;
pub mod server;
pub mod types;

pub use handlers::{ApiState, MailgateApiImpl, MailgateApiServer};
pub use server::{ServerHandle, start_server};
pub use types::*;
