//! Lodestar directory client
//!
//! Connections are established by a pollable state machine
//! ([`ConnectionAttempt`]) that can be driven in blocking or non-blocking
//! mode under a single cumulative timeout. Once bound, operations return a
//! [`MessageId`] that is polled or waited on; entry commits roll back into
//! the entry when the server rejects them.
//!
//! ```no_run
//! use lodestar_client::{open, Scope, SearchRequest};
//! use lodestar_core::ClientConfig;
//!
//! # fn main() -> lodestar_core::Result<()> {
//! let mut connection = open(ClientConfig::from_env())?;
//! let handle = connection.search(SearchRequest::new(
//!     "dc=example,dc=com",
//!     Scope::Subtree,
//!     "(uid=bob)",
//! ))?;
//! let result = connection.wait(handle, None)?;
//! # let _ = result;
//! connection.close()
//! # }
//! ```

pub mod auth;
pub mod budget;
pub mod connect;
pub mod connection;
pub mod engine;
pub mod ldap;
pub mod nonblocking;
pub mod registry;
pub mod task;

#[cfg(test)]
mod mock;

pub use auth::{External, Mechanism, MechanismStep, Simple};
pub use budget::TimeoutBudget;
pub use connect::{ConnectPhase, ConnectionAttempt};
pub use connection::{Connection, OperationResult, SearchPage};
pub use engine::{
    ConnectionInitializer, LdapOutcome, ProtocolEngine, RawResult, Scope, SearchRequest,
};
pub use ldap::{Ldap3Engine, Ldap3Initializer};
pub use registry::{Continuation, PendingOperations};
pub use task::{BlockingTask, WaitHandle};

pub use lodestar_core::MessageId;

use lodestar_core::{ClientConfig, Error, Result};
use std::sync::Arc;
use std::task::Poll;

/// Open and bind a connection over ldap3, blocking for at most the
/// configured timeout.
pub fn open(config: ClientConfig) -> Result<Connection> {
    let mut attempt = ConnectionAttempt::start(Arc::new(config), Arc::new(Ldap3Initializer))?;
    match attempt.advance(true)? {
        Poll::Ready(connection) => Ok(connection),
        Poll::Pending => Err(Error::InvalidState(
            "blocking connect returned without a result".into(),
        )),
    }
}
