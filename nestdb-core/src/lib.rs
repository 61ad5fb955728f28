//! # nestdb-core
//!
//! Data model for nestdb.
//!
//! This crate provides:
//! - Hierarchical keys and event paths
//! - The JSON document store and its rebased views
//! - The expiry index
//! - Per-connection event subscriptions
//! - The scripted-transaction language

pub mod database;
pub mod error;
pub mod events;
pub mod expiry;
pub mod key;
pub mod script;
pub mod store;
pub mod value;

pub use database::Database;
pub use error::CoreError;
pub use events::{ConnectionId, EventRegistry};
pub use expiry::{now_millis, ExpiryIndex};
pub use key::{EventPath, KeyPath};
pub use script::{Capability, Script, ScriptScope};
pub use store::{DataStore, StoreView};
