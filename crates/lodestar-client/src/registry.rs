//! Pending-operation registry
//!
//! Maps the message id of every outstanding request to the continuation
//! that interprets its result. Owned by one connection, used from one
//! thread at a time.

use std::collections::HashMap;
use tracing::trace;

use lodestar_core::{Entry, Error, MessageId, OperationBatch, Result};

use crate::engine::SearchRequest;

/// Accumulated state of a search in progress
#[derive(Debug, Clone)]
pub struct SearchContext {
    pub request: SearchRequest,
    pub entries: Vec<Entry>,
    pub references: Vec<String>,
}

impl SearchContext {
    pub fn new(request: SearchRequest) -> Self {
        Self {
            request,
            entries: Vec::new(),
            references: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Add,
    Modify,
}

/// A submitted batch, kept for rollback until the server answers
#[derive(Debug, Clone)]
pub struct ModifyContext {
    pub kind: CommitKind,
    pub dn: String,
    pub batch: OperationBatch,
}

#[derive(Debug, Clone)]
pub struct RenameContext {
    pub dn: String,
    pub new_dn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedTag {
    StartTls,
    WhoAmI,
    Custom(String),
}

/// How the result for a handle is interpreted
#[derive(Debug, Clone)]
pub enum Continuation {
    BindAttempt,
    Search(SearchContext),
    ModifyBatch(ModifyContext),
    Rename(RenameContext),
    Delete { dn: String },
    Extended(ExtendedTag),
}

impl Continuation {
    pub fn kind(&self) -> &'static str {
        match self {
            Continuation::BindAttempt => "bind",
            Continuation::Search(_) => "search",
            Continuation::ModifyBatch(ctx) => match ctx.kind {
                CommitKind::Add => "add",
                CommitKind::Modify => "modify",
            },
            Continuation::Rename(_) => "rename",
            Continuation::Delete { .. } => "delete",
            Continuation::Extended(_) => "extended",
        }
    }
}

#[derive(Debug, Default)]
pub struct PendingOperations {
    operations: HashMap<MessageId, Continuation>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the continuation for a freshly submitted request
    pub fn register(&mut self, handle: MessageId, continuation: Continuation) -> Result<()> {
        if self.operations.contains_key(&handle) {
            return Err(Error::DuplicateHandle(handle));
        }
        trace!(handle, kind = continuation.kind(), "Registered pending operation");
        self.operations.insert(handle, continuation);
        Ok(())
    }

    /// Remove and return the continuation for a completed request
    pub fn take(&mut self, handle: MessageId) -> Result<Continuation> {
        self.operations
            .remove(&handle)
            .ok_or(Error::UnknownHandle(handle))
    }

    pub fn peek(&self, handle: MessageId) -> Result<&Continuation> {
        self.operations
            .get(&handle)
            .ok_or(Error::UnknownHandle(handle))
    }

    /// Mutable access for streamed results (search entries)
    pub fn peek_mut(&mut self, handle: MessageId) -> Result<&mut Continuation> {
        self.operations
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle))
    }

    pub fn contains(&self, handle: MessageId) -> bool {
        self.operations.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Empty the registry, returning everything that was outstanding
    pub fn drain(&mut self) -> Vec<(MessageId, Continuation)> {
        self.operations.drain().collect()
    }
}
