//! Lodestar Core Library
//!
//! Entry model, error types and configuration for the Lodestar directory
//! client.

pub mod config;
pub mod entry;
pub mod error;

pub use config::{
    BindConfig, BindMechanism, ClientConfig, ConnectionConfig, LoggingConfig, TlsMode,
};
pub use entry::{Entry, OperationBatch};
pub use error::{Error, MessageId, Result, Stage};

/// Lodestar version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
