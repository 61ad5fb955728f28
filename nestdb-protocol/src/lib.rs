//! # nestdb-protocol
//!
//! Wire protocol implementation for nestdb.
//!
//! This crate provides:
//! - Request, response and event notification records
//! - The closed catalog of dispatchable actions
//! - Per-action parameter types
//! - Line-delimited JSON encoding and decoding

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{encode_line, LineDecoder};
pub use error::ProtocolError;
pub use message::{Action, EventNotification, Request, Response};

/// Default address the server binds to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default interval between expiry sweeps, in milliseconds.
pub const DEFAULT_EXPIRY_ACCURACY_MS: u64 = 1000;

/// Maximum size of a single encoded record (16 MiB).
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;
