//! Protocol engine seam
//!
//! The state machine and the operation layer talk to the wire through
//! [`ProtocolEngine`]: submit a request, get a [`MessageId`], poll for the
//! result. Message encoding, sockets and TLS live behind it.

use serde::{Deserialize, Serialize};
use std::task::Poll;
use std::time::Duration;

use lodestar_core::{ConnectionConfig, MessageId, OperationBatch, Result};

use crate::task::WaitHandle;

/// Result codes the client acts on
pub mod codes {
    pub const SUCCESS: u32 = 0;
    pub const OPERATIONS_ERROR: u32 = 1;
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const TIME_LIMIT_EXCEEDED: u32 = 3;
    pub const SIZE_LIMIT_EXCEEDED: u32 = 4;
    pub const AUTH_METHOD_NOT_SUPPORTED: u32 = 7;
    pub const SASL_BIND_IN_PROGRESS: u32 = 14;
    pub const NO_SUCH_OBJECT: u32 = 32;
    pub const INVALID_CREDENTIALS: u32 = 49;
    pub const UNWILLING_TO_PERFORM: u32 = 53;
    pub const ENTRY_ALREADY_EXISTS: u32 = 68;
    pub const OTHER: u32 = 80;
    /// Client-side failure (mechanism error, local encoding problem)
    pub const LOCAL_ERROR: u32 = 82;
}

/// OID of the StartTLS extended operation
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// OID of the "Who am I?" extended operation
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Server verdict attached to every final response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapOutcome {
    pub code: u32,
    pub matched_dn: String,
    pub message: String,
}

impl LdapOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == codes::SUCCESS
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }

    pub fn into_error(self) -> lodestar_core::Error {
        lodestar_core::Error::Protocol {
            code: self.code,
            message: self.message,
            matched_dn: self.matched_dn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Base,
    OneLevel,
    #[default]
    Subtree,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Some(Self::Base),
            "one" | "onelevel" | "one_level" => Some(Self::OneLevel),
            "sub" | "subtree" => Some(Self::Subtree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub filter: String,
    /// Empty requests all user attributes
    pub attributes: Vec<String>,
    /// 0 = no client-side limit
    pub size_limit: i32,
    /// Seconds; 0 = no limit
    pub time_limit: i32,
    /// Request paged results of this size
    pub page_size: Option<i32>,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, scope: Scope, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
            size_limit: 0,
            time_limit: 0,
            page_size: None,
        }
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn size_limit(mut self, limit: i32) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn time_limit(mut self, seconds: i32) -> Self {
        self.time_limit = seconds;
        self
    }

    pub fn page_size(mut self, size: i32) -> Self {
        self.page_size = Some(size);
        self
    }
}

/// One round of a bind exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub dn: String,
    /// `SIMPLE` or a SASL mechanism name
    pub mechanism: String,
    pub credentials: Option<Vec<u8>>,
}

/// Search result entry as delivered by the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub dn: String,
    pub attributes: Vec<(String, Vec<String>)>,
}

/// A message received for an outstanding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResult {
    /// Streamed; more messages follow for the same handle
    SearchEntry(RawEntry),
    /// Streamed continuation reference URLs
    SearchReference(Vec<String>),
    SearchDone {
        outcome: LdapOutcome,
        /// Paged results cookie; empty or absent on the last page
        cookie: Option<Vec<u8>>,
    },
    Bind {
        outcome: LdapOutcome,
        server_credentials: Option<Vec<u8>>,
    },
    Add(LdapOutcome),
    Modify(LdapOutcome),
    Delete(LdapOutcome),
    ModDn(LdapOutcome),
    Extended {
        outcome: LdapOutcome,
        name: Option<String>,
        value: Option<Vec<u8>>,
    },
}

impl RawResult {
    pub fn kind(&self) -> &'static str {
        match self {
            RawResult::SearchEntry(_) => "search entry",
            RawResult::SearchReference(_) => "search reference",
            RawResult::SearchDone { .. } => "search done",
            RawResult::Bind { .. } => "bind",
            RawResult::Add(_) => "add",
            RawResult::Modify(_) => "modify",
            RawResult::Delete(_) => "delete",
            RawResult::ModDn(_) => "modify dn",
            RawResult::Extended { .. } => "extended",
        }
    }
}

/// Wire-level client for one connection.
///
/// Every `send_*` call returns the message id of the submitted request.
/// Requests are transmitted in submission order.
pub trait ProtocolEngine: Send {
    fn send_search(&mut self, request: &SearchRequest, cookie: Option<&[u8]>) -> Result<MessageId>;

    fn send_add(&mut self, dn: &str, attributes: &[(String, Vec<String>)]) -> Result<MessageId>;

    fn send_modify(&mut self, dn: &str, batch: &OperationBatch) -> Result<MessageId>;

    fn send_delete(&mut self, dn: &str) -> Result<MessageId>;

    fn send_rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
        delete_old_rdn: bool,
    ) -> Result<MessageId>;

    fn send_extended(&mut self, oid: &str, value: Option<&[u8]>) -> Result<MessageId>;

    fn send_bind(&mut self, request: &BindRequest) -> Result<MessageId>;

    /// Submit the in-band transport upgrade (StartTLS)
    fn start_encrypted_transport(&mut self) -> Result<MessageId> {
        self.send_extended(START_TLS_OID, None)
    }

    /// Whether the transport is upgraded by an in-band request after
    /// initialization. Engines that negotiate TLS while connecting return
    /// `false` and the upgrade stage is skipped.
    fn upgrades_in_band(&self) -> bool {
        true
    }

    /// Next message for `handle`.
    ///
    /// `Some(Duration::ZERO)` only checks, `None` waits without bound.
    fn poll_result(&mut self, handle: MessageId, wait: Option<Duration>) -> Result<Poll<RawResult>>;

    /// Give up on an outstanding request; its result is discarded.
    fn abandon(&mut self, handle: MessageId) -> Result<()>;

    fn unbind(&mut self) -> Result<()>;

    /// Readiness handle for external event loops, if the engine has one
    fn wait_handle(&self) -> Option<WaitHandle> {
        None
    }
}

/// Opens the transport for a connection attempt.
///
/// Runs on a worker thread and may block (name resolution, TCP handshake,
/// TLS for `ldaps://`).
pub trait ConnectionInitializer: Send + Sync + 'static {
    fn initialize(&self, config: &ConnectionConfig) -> Result<Box<dyn ProtocolEngine>>;
}

impl<F> ConnectionInitializer for F
where
    F: Fn(&ConnectionConfig) -> Result<Box<dyn ProtocolEngine>> + Send + Sync + 'static,
{
    fn initialize(&self, config: &ConnectionConfig) -> Result<Box<dyn ProtocolEngine>> {
        self(config)
    }
}
