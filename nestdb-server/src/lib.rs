//! # nestdb-server
//!
//! TCP server for nestdb.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Connection ids, the init handshake and death queries
//! - Command dispatch for the whole action catalog
//! - Event fan-out to subscribed connections
//! - Periodic expiry sweeping
//! - Supervisor reporting and Prometheus metrics

pub mod allocator;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod script;
pub mod server;
pub mod supervisor;
pub mod sweeper;

pub use allocator::ConnectionIdAllocator;
pub use auth::SecretValidator;
pub use broadcast::{DeliveryReport, EventHub};
pub use config::{
    AuthConfig, Config, ConfigError, ExpiryConfig, MetricsConfig, NetworkConfig, ProtocolConfig,
};
pub use connection::{AuthState, ConnectionRecord, ConnectionRegistry};
pub use error::ServerError;
pub use handler::CommandHandler;
pub use metrics::Metrics;
pub use script::ScriptRunner;
pub use server::{Server, ServerConfig, ServerStats};
pub use supervisor::{Supervisor, SupervisorEvent};
pub use sweeper::ExpirySweeper;
