//! Bound connection and directory operations
//!
//! Every operation is submitted immediately and returns the request's
//! [`MessageId`]. Results are collected with [`Connection::poll`] (never
//! blocks) or [`Connection::wait`] (blocks up to a timeout).
//!
//! Entry commits (`add`/`modify`) compile the entry's pending changes into
//! an [`OperationBatch`] and keep it until the server answers. They are
//! completed through the `*_commit` family, which needs the entry back:
//! success clears the entry's local markers, failure replays the batch into
//! it so nothing the caller changed is lost.

use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use lodestar_core::entry::{build, rollback};
use lodestar_core::{ClientConfig, Entry, Error, MessageId, Result, Stage};

use crate::budget;
use crate::engine::{codes, LdapOutcome, ProtocolEngine, RawResult, SearchRequest, WHO_AM_I_OID};
use crate::registry::{
    CommitKind, Continuation, ExtendedTag, ModifyContext, PendingOperations, RenameContext,
    SearchContext,
};

/// Outcome of a search request (one page when paging)
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub entries: Vec<Entry>,
    pub references: Vec<String>,
    /// Handle of the next page, already submitted
    pub next_page: Option<MessageId>,
    /// The server stopped early (size or time limit)
    pub truncated: bool,
}

/// Completed non-commit operation
#[derive(Debug, Clone)]
pub enum OperationResult {
    Search(SearchPage),
    Deleted {
        dn: String,
    },
    Renamed {
        dn: String,
        new_dn: String,
    },
    Extended {
        name: Option<String>,
        value: Option<Vec<u8>>,
    },
}

enum Completion {
    Done(OperationResult),
    Commit {
        context: ModifyContext,
        outcome: LdapOutcome,
    },
}

/// A bound directory connection
pub struct Connection {
    engine: Box<dyn ProtocolEngine>,
    registry: PendingOperations,
    config: Arc<ClientConfig>,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.config.connection.url)
            .field("pending", &self.registry.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    pub(crate) fn from_parts(
        engine: Box<dyn ProtocolEngine>,
        registry: PendingOperations,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
            closed: false,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of outstanding requests
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    pub fn is_pending(&self, handle: MessageId) -> bool {
        self.registry.contains(handle)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    pub fn search(&mut self, request: SearchRequest) -> Result<MessageId> {
        self.ensure_open()?;
        let handle = self.engine.send_search(&request, None).map_err(in_operation)?;
        debug!(handle, base = %request.base, filter = %request.filter, "Search submitted");
        self.registry
            .register(handle, Continuation::Search(SearchContext::new(request)))?;
        Ok(handle)
    }

    pub fn delete(&mut self, dn: &str) -> Result<MessageId> {
        self.ensure_open()?;
        let handle = self.engine.send_delete(dn).map_err(in_operation)?;
        debug!(handle, %dn, "Delete submitted");
        self.registry
            .register(handle, Continuation::Delete { dn: dn.to_string() })?;
        Ok(handle)
    }

    /// Rename (and optionally move) an entry.
    ///
    /// `new_superior` moves the entry under another parent; without it the
    /// entry keeps its current parent.
    pub fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
        delete_old_rdn: bool,
    ) -> Result<MessageId> {
        self.ensure_open()?;
        let new_dn = renamed_dn(dn, new_rdn, new_superior);
        let handle = self
            .engine
            .send_rename(dn, new_rdn, new_superior, delete_old_rdn)
            .map_err(in_operation)?;
        debug!(handle, %dn, %new_dn, "Rename submitted");
        self.registry.register(
            handle,
            Continuation::Rename(RenameContext {
                dn: dn.to_string(),
                new_dn,
            }),
        )?;
        Ok(handle)
    }

    pub fn extended(&mut self, oid: &str, value: Option<&[u8]>) -> Result<MessageId> {
        self.ensure_open()?;
        let handle = self.engine.send_extended(oid, value).map_err(in_operation)?;
        let tag = if oid == WHO_AM_I_OID {
            ExtendedTag::WhoAmI
        } else {
            ExtendedTag::Custom(oid.to_string())
        };
        self.registry.register(handle, Continuation::Extended(tag))?;
        Ok(handle)
    }

    /// "Who am I?" extended operation
    pub fn whoami(&mut self) -> Result<MessageId> {
        self.extended(WHO_AM_I_OID, None)
    }

    /// Submit a new entry.
    ///
    /// Every attribute of the entry is sent. Complete the request with
    /// [`poll_commit`](Self::poll_commit) or [`wait_commit`](Self::wait_commit).
    pub fn add(&mut self, entry: &mut Entry) -> Result<MessageId> {
        self.ensure_open()?;
        let attributes = entry.to_attribute_list();
        if attributes.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "entry {} has no attribute values",
                entry.dn()
            )));
        }

        let mut batch = build(entry.attributes_mut())?;
        let handle = match self.engine.send_add(entry.dn(), &attributes) {
            Ok(handle) => handle,
            Err(e) => {
                rollback(&mut batch, entry.attributes_mut())?;
                return Err(in_operation(e));
            }
        };

        debug!(handle, dn = %entry.dn(), "Add submitted");
        self.register_commit(handle, CommitKind::Add, entry, batch)
    }

    /// Submit the pending changes of an entry.
    ///
    /// Returns `None` when there is nothing to send.
    pub fn modify(&mut self, entry: &mut Entry) -> Result<Option<MessageId>> {
        self.ensure_open()?;
        if !entry.has_changes() {
            return Ok(None);
        }

        let mut batch = build(entry.attributes_mut())?;
        let handle = match self.engine.send_modify(entry.dn(), &batch) {
            Ok(handle) => handle,
            Err(e) => {
                rollback(&mut batch, entry.attributes_mut())?;
                return Err(in_operation(e));
            }
        };

        debug!(handle, dn = %entry.dn(), ops = batch.len(), "Modify submitted");
        self.register_commit(handle, CommitKind::Modify, entry, batch)
            .map(Some)
    }

    fn register_commit(
        &mut self,
        handle: MessageId,
        kind: CommitKind,
        entry: &mut Entry,
        mut batch: lodestar_core::OperationBatch,
    ) -> Result<MessageId> {
        if self.registry.contains(handle) {
            // the batch never gets a continuation; give it back
            let _ = self.engine.abandon(handle);
            rollback(&mut batch, entry.attributes_mut())?;
            return Err(Error::DuplicateHandle(handle));
        }
        self.registry.register(
            handle,
            Continuation::ModifyBatch(ModifyContext {
                kind,
                dn: entry.dn().to_string(),
                batch,
            }),
        )?;
        Ok(handle)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Check for the result of a non-commit operation without blocking
    pub fn poll(&mut self, handle: MessageId) -> Result<Poll<OperationResult>> {
        self.ensure_not_commit(handle)?;
        match self.receive(handle, Some(Duration::ZERO))? {
            Poll::Ready(completion) => self.into_operation_result(completion).map(Poll::Ready),
            Poll::Pending => Ok(Poll::Pending),
        }
    }

    /// Block until a non-commit operation completes.
    ///
    /// On timeout the request is abandoned. `None` waits without bound.
    pub fn wait(&mut self, handle: MessageId, timeout: Option<Duration>) -> Result<OperationResult> {
        self.ensure_not_commit(handle)?;
        let deadline = budget::deadline_after(timeout);
        loop {
            match self.receive(handle, budget::until(deadline))? {
                Poll::Ready(completion) => return self.into_operation_result(completion),
                Poll::Pending if expired(deadline) => {
                    self.abandon(handle)?;
                    return Err(Error::Timeout {
                        stage: Stage::Operation,
                    });
                }
                Poll::Pending => {}
            }
        }
    }

    /// Check for the result of an `add`/`modify` without blocking.
    ///
    /// `entry` must be the entry that was submitted. Failure rolls the
    /// batch back into it before the error is returned.
    pub fn poll_commit(&mut self, handle: MessageId, entry: &mut Entry) -> Result<Poll<()>> {
        self.ensure_commit_for(handle, entry)?;
        match self.receive(handle, Some(Duration::ZERO)) {
            Ok(Poll::Ready(completion)) => self.finish_commit(completion, entry).map(Poll::Ready),
            Ok(Poll::Pending) => Ok(Poll::Pending),
            Err(e) => Err(self.fail_commit(handle, entry, e)),
        }
    }

    /// Block until an `add`/`modify` completes.
    ///
    /// On timeout the request is abandoned and the batch rolled back.
    pub fn wait_commit(
        &mut self,
        handle: MessageId,
        entry: &mut Entry,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_commit_for(handle, entry)?;
        let deadline = budget::deadline_after(timeout);
        loop {
            match self.receive(handle, budget::until(deadline)) {
                Ok(Poll::Ready(completion)) => return self.finish_commit(completion, entry),
                Ok(Poll::Pending) if expired(deadline) => {
                    let err = Error::Timeout {
                        stage: Stage::Operation,
                    };
                    return Err(self.fail_commit(handle, entry, err));
                }
                Ok(Poll::Pending) => {}
                Err(e) => return Err(self.fail_commit(handle, entry, e)),
            }
        }
    }

    /// Submit pending changes and wait for the server.
    ///
    /// Nothing pending is a successful no-op.
    pub fn commit(&mut self, entry: &mut Entry, timeout: Option<Duration>) -> Result<()> {
        match self.modify(entry)? {
            Some(handle) => self.wait_commit(handle, entry, timeout),
            None => Ok(()),
        }
    }

    /// Add a new entry and wait for the server
    pub fn create(&mut self, entry: &mut Entry, timeout: Option<Duration>) -> Result<()> {
        let handle = self.add(entry)?;
        self.wait_commit(handle, entry, timeout)
    }

    /// Give up on a non-commit operation
    pub fn abandon(&mut self, handle: MessageId) -> Result<()> {
        self.ensure_not_commit(handle)?;
        let continuation = self.registry.take(handle)?;
        debug!(handle, kind = continuation.kind(), "Abandoning operation");
        self.engine.abandon(handle).map_err(in_operation)
    }

    /// Give up on an `add`/`modify`; its batch is rolled back into `entry`.
    pub fn abandon_commit(&mut self, handle: MessageId, entry: &mut Entry) -> Result<()> {
        self.ensure_commit_for(handle, entry)?;
        let mut context = self.take_commit(handle)?;
        debug!(handle, dn = %context.dn, "Abandoning commit");
        let abandoned = self.engine.abandon(handle).map_err(in_operation);
        rollback(&mut context.batch, entry.attributes_mut())?;
        abandoned
    }

    /// Unbind and release the transport.
    ///
    /// Outstanding requests are abandoned. Batches of outstanding commits
    /// are dropped; resubmit the entry after re-reading it.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for (handle, continuation) in self.registry.drain() {
            if let Continuation::ModifyBatch(context) = &continuation {
                warn!(handle, dn = %context.dn, "Closing with a commit in flight");
            }
            let _ = self.engine.abandon(handle);
        }

        info!(url = %self.config.connection.url, "Closing connection");
        self.engine.unbind().map_err(in_operation)
    }

    // =========================================================================
    // Result dispatch
    // =========================================================================

    /// Read messages for `handle` until it completes or `wait` runs out.
    ///
    /// An unknown handle is reported without touching the engine.
    fn receive(&mut self, handle: MessageId, wait: Option<Duration>) -> Result<Poll<Completion>> {
        self.ensure_open()?;
        self.registry.peek(handle)?;

        let deadline = budget::deadline_after(wait);
        loop {
            let polled = self
                .engine
                .poll_result(handle, budget::until(deadline))
                .map_err(in_operation)?;
            match polled {
                Poll::Pending => return Ok(Poll::Pending),
                Poll::Ready(result) => {
                    if let Some(completion) = self.dispatch(handle, result)? {
                        return Ok(Poll::Ready(completion));
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, handle: MessageId, result: RawResult) -> Result<Option<Completion>> {
        match result {
            RawResult::SearchEntry(raw) => {
                let context = self.search_context(handle, "search entry")?;
                context.entries.push(Entry::from_search(raw.dn, raw.attributes));
                Ok(None)
            }
            RawResult::SearchReference(urls) => {
                let context = self.search_context(handle, "search reference")?;
                context.references.extend(urls);
                Ok(None)
            }
            result => {
                let continuation = self.registry.take(handle)?;
                self.complete(continuation, result).map(Some)
            }
        }
    }

    fn search_context(&mut self, handle: MessageId, kind: &str) -> Result<&mut SearchContext> {
        match self.registry.peek_mut(handle)? {
            Continuation::Search(context) => Ok(context),
            other => Err(Error::InvalidState(format!(
                "unexpected {} for {} handle {}",
                kind,
                other.kind(),
                handle
            ))),
        }
    }

    fn complete(&mut self, continuation: Continuation, result: RawResult) -> Result<Completion> {
        let done = match (continuation, result) {
            (Continuation::Search(context), RawResult::SearchDone { outcome, cookie }) => {
                return self.complete_search(context, outcome, cookie);
            }
            (
                Continuation::ModifyBatch(context),
                RawResult::Add(outcome) | RawResult::Modify(outcome),
            ) => {
                return Ok(Completion::Commit { context, outcome });
            }
            // keep the batch so the commit path can still roll it back
            (Continuation::ModifyBatch(context), result) => {
                let outcome = LdapOutcome::with_code(
                    codes::PROTOCOL_ERROR,
                    format!("unexpected {} response to {}", result.kind(), context.dn),
                );
                return Ok(Completion::Commit { context, outcome });
            }
            (Continuation::Delete { dn }, RawResult::Delete(outcome)) => {
                outcome.into_result()?;
                info!(%dn, "Entry deleted");
                OperationResult::Deleted { dn }
            }
            (Continuation::Rename(context), RawResult::ModDn(outcome)) => {
                outcome.into_result()?;
                info!(dn = %context.dn, new_dn = %context.new_dn, "Entry renamed");
                OperationResult::Renamed {
                    dn: context.dn,
                    new_dn: context.new_dn,
                }
            }
            (
                Continuation::Extended(_),
                RawResult::Extended {
                    outcome,
                    name,
                    value,
                },
            ) => {
                outcome.into_result()?;
                OperationResult::Extended { name, value }
            }
            (continuation, result) => {
                return Err(Error::InvalidState(format!(
                    "unexpected {} response for {} operation",
                    result.kind(),
                    continuation.kind()
                )))
            }
        };
        Ok(Completion::Done(done))
    }

    fn complete_search(
        &mut self,
        context: SearchContext,
        outcome: LdapOutcome,
        cookie: Option<Vec<u8>>,
    ) -> Result<Completion> {
        let truncated = match outcome.code {
            codes::SUCCESS => false,
            codes::SIZE_LIMIT_EXCEEDED | codes::TIME_LIMIT_EXCEEDED => true,
            _ => return Err(outcome.into_error()),
        };

        let SearchContext {
            request,
            entries,
            references,
        } = context;

        let cookie = cookie.filter(|c| !c.is_empty());
        let next_page = match cookie {
            Some(cookie) if request.page_size.is_some() && !truncated => {
                let next = self
                    .engine
                    .send_search(&request, Some(&cookie))
                    .map_err(in_operation)?;
                self.registry
                    .register(next, Continuation::Search(SearchContext::new(request)))?;
                Some(next)
            }
            _ => None,
        };

        debug!(
            entries = entries.len(),
            references = references.len(),
            next_page = ?next_page,
            truncated,
            "Search completed"
        );

        Ok(Completion::Done(OperationResult::Search(SearchPage {
            entries,
            references,
            next_page,
            truncated,
        })))
    }

    fn into_operation_result(&mut self, completion: Completion) -> Result<OperationResult> {
        match completion {
            Completion::Done(result) => Ok(result),
            Completion::Commit { context, .. } => Err(Error::InvalidState(format!(
                "commit for {} completed through the generic path",
                context.dn
            ))),
        }
    }

    fn finish_commit(&mut self, completion: Completion, entry: &mut Entry) -> Result<()> {
        let (mut context, outcome) = match completion {
            Completion::Commit { context, outcome } => (context, outcome),
            Completion::Done(_) => {
                return Err(Error::InvalidState(
                    "non-commit result on a commit handle".into(),
                ))
            }
        };

        if outcome.is_success() {
            entry.attributes_mut().mark_committed(&context.batch);
            info!(dn = %context.dn, ops = context.batch.len(), "Commit accepted");
            return Ok(());
        }

        warn!(
            dn = %context.dn,
            code = outcome.code,
            message = %outcome.message,
            "Commit rejected, rolling back"
        );
        rollback(&mut context.batch, entry.attributes_mut())?;
        Err(outcome.into_error())
    }

    /// Abandon a commit that failed locally and give its batch back
    fn fail_commit(&mut self, handle: MessageId, entry: &mut Entry, err: Error) -> Error {
        let Ok(mut context) = self.take_commit(handle) else {
            return err;
        };
        warn!(handle, dn = %context.dn, error = %err, "Commit failed, rolling back");
        let _ = self.engine.abandon(handle);
        match rollback(&mut context.batch, entry.attributes_mut()) {
            Ok(()) => err,
            Err(rollback_err) => rollback_err,
        }
    }

    fn take_commit(&mut self, handle: MessageId) -> Result<ModifyContext> {
        match self.registry.take(handle)? {
            Continuation::ModifyBatch(context) => Ok(context),
            other => {
                let kind = other.kind();
                self.registry.register(handle, other)?;
                Err(Error::InvalidArgument(format!(
                    "handle {} is a {} operation, not a commit",
                    handle, kind
                )))
            }
        }
    }

    // =========================================================================
    // Guards
    // =========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidState("connection is closed".into()));
        }
        Ok(())
    }

    fn ensure_not_commit(&self, handle: MessageId) -> Result<()> {
        match self.registry.peek(handle)? {
            Continuation::ModifyBatch(_) => Err(Error::InvalidArgument(format!(
                "handle {} is a commit; complete it with the entry",
                handle
            ))),
            _ => Ok(()),
        }
    }

    fn ensure_commit_for(&self, handle: MessageId, entry: &Entry) -> Result<()> {
        match self.registry.peek(handle)? {
            Continuation::ModifyBatch(context) if context.dn.eq_ignore_ascii_case(entry.dn()) => {
                Ok(())
            }
            Continuation::ModifyBatch(context) => Err(Error::InvalidArgument(format!(
                "handle {} commits {}, not {}",
                handle,
                context.dn,
                entry.dn()
            ))),
            other => Err(Error::InvalidArgument(format!(
                "handle {} is a {} operation, not a commit",
                handle,
                other.kind()
            ))),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            debug!(error = %e, "Unbind on drop failed");
        }
    }
}

fn in_operation(err: Error) -> Error {
    err.with_stage(Stage::Operation)
}

fn expired(deadline: Option<Instant>) -> bool {
    budget::until(deadline).map_or(false, |left| left.is_zero())
}

/// DN an entry will have after a rename
fn renamed_dn(dn: &str, new_rdn: &str, new_superior: Option<&str>) -> String {
    let parent = match new_superior {
        Some(superior) => Some(superior),
        None => parent_dn(dn),
    };
    match parent {
        Some(parent) if !parent.is_empty() => format!("{},{}", new_rdn, parent),
        _ => new_rdn.to_string(),
    }
}

/// Everything after the first unescaped comma
fn parent_dn(dn: &str) -> Option<&str> {
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => return Some(dn[i + 1..].trim_start()),
            _ => escaped = false,
        }
    }
    None
}
