//! Protocol engine backed by ldap3's async connection
//!
//! The connection is driven on a dedicated thread running a current-thread
//! tokio runtime. Requests reach it over an unbounded channel and each one
//! runs as its own task on a clone of the `Ldap` handle, so several
//! operations can be outstanding at once. Results are parked per message
//! id in a mailbox the caller polls with a bounded wait or selects on
//! through its wait handle.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use ldap3::exop::Exop;
use ldap3::{Ldap, LdapConnAsync, LdapError, SearchOptions};

use lodestar_core::entry::Modification;
use lodestar_core::{Error, MessageId, OperationBatch, Result};

use super::types;
use crate::auth::SIMPLE;
use crate::budget;
use crate::engine::{codes, BindRequest, LdapOutcome, ProtocolEngine, RawResult, SearchRequest};
use crate::task::{wake, WaitHandle};

enum Request {
    Search {
        request: SearchRequest,
        cookie: Option<Vec<u8>>,
    },
    Add {
        dn: String,
        attributes: Vec<(String, Vec<String>)>,
    },
    Modify {
        dn: String,
        mods: Vec<Modification>,
    },
    Delete {
        dn: String,
    },
    Rename {
        dn: String,
        new_rdn: String,
        new_superior: Option<String>,
        delete_old_rdn: bool,
    },
    Extended {
        oid: String,
        value: Option<Vec<u8>>,
    },
    Bind(BindRequest),
}

enum Job {
    Run(MessageId, Request),
    Abandon(MessageId),
    Unbind,
}

type Delivery = std::result::Result<RawResult, String>;

struct Inbox {
    results: HashMap<MessageId, VecDeque<Delivery>>,
    /// Submitted requests whose final message has not arrived yet
    outstanding: HashSet<MessageId>,
    abandoned: HashSet<MessageId>,
    closed: Option<String>,
    signalled: bool,
    wake_rx: wake::Receiver,
    wake_tx: wake::Notifier,
}

impl Inbox {
    /// The wake handle is readable while anything is parked or the
    /// connection has closed
    fn signal(&mut self) {
        if !self.signalled {
            self.wake_tx.notify();
            self.signalled = true;
        }
    }

    fn settle(&mut self) {
        if self.signalled && self.results.is_empty() && self.closed.is_none() {
            self.wake_rx.drain();
            self.signalled = false;
        }
    }
}

struct Mailbox {
    inbox: Mutex<Inbox>,
    arrived: Condvar,
}

impl Mailbox {
    fn new() -> std::io::Result<Self> {
        let (wake_rx, wake_tx) = wake::pair()?;
        Ok(Self {
            inbox: Mutex::new(Inbox {
                results: HashMap::new(),
                outstanding: HashSet::new(),
                abandoned: HashSet::new(),
                closed: None,
                signalled: false,
                wake_rx,
                wake_tx,
            }),
            arrived: Condvar::new(),
        })
    }

    fn expect(&self, handle: MessageId) {
        self.inbox.lock().outstanding.insert(handle);
    }

    /// Park messages for `handle`; `last` marks its final message
    fn deliver(&self, handle: MessageId, messages: Vec<Delivery>, last: bool) {
        let mut inbox = self.inbox.lock();
        if last {
            inbox.outstanding.remove(&handle);
        }
        if inbox.abandoned.contains(&handle) {
            if last {
                inbox.abandoned.remove(&handle);
            }
            trace!(handle, "Dropping result of abandoned request");
            return;
        }
        if messages.is_empty() {
            return;
        }
        inbox.results.entry(handle).or_default().extend(messages);
        inbox.signal();
        self.arrived.notify_all();
    }

    /// Pop the next parked message for `handle`
    fn take(&self, handle: MessageId) -> Option<Delivery> {
        let mut inbox = self.inbox.lock();
        Self::take_locked(&mut inbox, handle)
    }

    fn take_locked(inbox: &mut Inbox, handle: MessageId) -> Option<Delivery> {
        let queue = inbox.results.get_mut(&handle)?;
        let delivery = queue.pop_front();
        if queue.is_empty() {
            inbox.results.remove(&handle);
        }
        inbox.settle();
        delivery
    }

    /// Forget parked messages and drop anything still on its way
    fn discard(&self, handle: MessageId) {
        let mut inbox = self.inbox.lock();
        inbox.results.remove(&handle);
        if inbox.outstanding.contains(&handle) {
            inbox.abandoned.insert(handle);
        }
        inbox.settle();
    }

    fn close(&self, reason: &str) {
        let mut inbox = self.inbox.lock();
        inbox.closed = Some(reason.to_string());
        inbox.signal();
        self.arrived.notify_all();
    }
}

/// ldap3-backed engine for one connection
pub struct Ldap3Engine {
    jobs: UnboundedSender<Job>,
    mailbox: Arc<Mailbox>,
    next_id: MessageId,
    unbound: bool,
}

impl Ldap3Engine {
    /// Drive a freshly opened connection on its own runtime thread
    pub fn spawn(runtime: Runtime, conn: LdapConnAsync, ldap: Ldap) -> Result<Self> {
        let (jobs, queue) = mpsc::unbounded_channel();
        let mailbox = Arc::new(Mailbox::new()?);

        let driver_mailbox = Arc::clone(&mailbox);
        thread::Builder::new()
            .name("lodestar-ldap".to_string())
            .spawn(move || {
                debug!("LDAP driver started");
                let serve_mailbox = Arc::clone(&driver_mailbox);
                runtime.block_on(async move {
                    ldap3::drive!(conn);
                    serve(ldap, queue, serve_mailbox).await;
                });
                driver_mailbox.close("connection closed");
                debug!("LDAP driver stopped");
            })?;

        Ok(Self {
            jobs,
            mailbox,
            next_id: 0,
            unbound: false,
        })
    }

    fn submit(&mut self, request: Request) -> Result<MessageId> {
        self.next_id += 1;
        let handle = self.next_id;
        self.mailbox.expect(handle);
        if self.jobs.send(Job::Run(handle, request)).is_err() {
            self.mailbox.deliver(handle, Vec::new(), true);
            return Err(Error::transport("connection closed"));
        }
        Ok(handle)
    }
}

impl ProtocolEngine for Ldap3Engine {
    fn send_search(&mut self, request: &SearchRequest, cookie: Option<&[u8]>) -> Result<MessageId> {
        self.submit(Request::Search {
            request: request.clone(),
            cookie: cookie.map(<[u8]>::to_vec),
        })
    }

    fn send_add(&mut self, dn: &str, attributes: &[(String, Vec<String>)]) -> Result<MessageId> {
        self.submit(Request::Add {
            dn: dn.to_string(),
            attributes: attributes.to_vec(),
        })
    }

    fn send_modify(&mut self, dn: &str, batch: &OperationBatch) -> Result<MessageId> {
        self.submit(Request::Modify {
            dn: dn.to_string(),
            mods: batch.as_slice().to_vec(),
        })
    }

    fn send_delete(&mut self, dn: &str) -> Result<MessageId> {
        self.submit(Request::Delete { dn: dn.to_string() })
    }

    fn send_rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
        delete_old_rdn: bool,
    ) -> Result<MessageId> {
        self.submit(Request::Rename {
            dn: dn.to_string(),
            new_rdn: new_rdn.to_string(),
            new_superior: new_superior.map(str::to_string),
            delete_old_rdn,
        })
    }

    fn send_extended(&mut self, oid: &str, value: Option<&[u8]>) -> Result<MessageId> {
        self.submit(Request::Extended {
            oid: oid.to_string(),
            value: value.map(<[u8]>::to_vec),
        })
    }

    fn send_bind(&mut self, request: &BindRequest) -> Result<MessageId> {
        self.submit(Request::Bind(request.clone()))
    }

    /// ldap3 negotiates StartTLS while connecting
    fn upgrades_in_band(&self) -> bool {
        false
    }

    fn poll_result(&mut self, handle: MessageId, wait: Option<Duration>) -> Result<Poll<RawResult>> {
        let deadline = budget::deadline_after(wait);
        let mut inbox = self.mailbox.inbox.lock();

        loop {
            if let Some(delivery) = Mailbox::take_locked(&mut inbox, handle) {
                return delivery.map(Poll::Ready).map_err(Error::transport);
            }
            if let Some(reason) = &inbox.closed {
                return Err(Error::transport(reason.clone()));
            }

            match deadline {
                None => self.mailbox.arrived.wait(&mut inbox),
                Some(deadline) => {
                    if self
                        .mailbox
                        .arrived
                        .wait_until(&mut inbox, deadline)
                        .timed_out()
                    {
                        return Ok(Poll::Pending);
                    }
                }
            }
        }
    }

    fn abandon(&mut self, handle: MessageId) -> Result<()> {
        self.mailbox.discard(handle);
        // a closed connection has nothing left to abandon
        let _ = self.jobs.send(Job::Abandon(handle));
        Ok(())
    }

    fn unbind(&mut self) -> Result<()> {
        self.unbound = true;
        self.jobs
            .send(Job::Unbind)
            .map_err(|_| Error::transport("connection already closed"))
    }

    fn wait_handle(&self) -> Option<WaitHandle> {
        self.mailbox.inbox.lock().wake_rx.handle()
    }
}

impl Drop for Ldap3Engine {
    fn drop(&mut self) {
        if !self.unbound {
            let _ = self.unbind();
        }
    }
}

/// A request running on the driver's runtime
struct InFlight {
    task: AbortHandle,
    /// Protocol message id, known once a search has been sent
    ldap_id: Option<i32>,
}

type InFlightMap = Arc<Mutex<HashMap<MessageId, InFlight>>>;

async fn serve(ldap: Ldap, mut queue: UnboundedReceiver<Job>, mailbox: Arc<Mailbox>) {
    let in_flight: InFlightMap = Arc::default();

    while let Some(job) = queue.recv().await {
        match job {
            Job::Run(handle, request) => {
                let task = tokio::spawn(run(
                    ldap.clone(),
                    handle,
                    request,
                    Arc::clone(&in_flight),
                    Arc::clone(&mailbox),
                ));
                // the task cannot start before this returns to the runtime
                in_flight.lock().insert(
                    handle,
                    InFlight {
                        task: task.abort_handle(),
                        ldap_id: None,
                    },
                );
            }
            Job::Abandon(handle) => {
                let Some(entry) = in_flight.lock().remove(&handle) else {
                    continue;
                };
                entry.task.abort();
                mailbox.deliver(handle, Vec::new(), true);
                match entry.ldap_id {
                    Some(id) => {
                        debug!(handle, id, "Abandoning request");
                        if let Err(e) = ldap.clone().abandon(id).await {
                            debug!(handle, error = %e, "Abandon failed");
                        }
                    }
                    None => trace!(handle, "Dropped request before its message id was known"),
                }
            }
            Job::Unbind => break,
        }
    }

    for (_, entry) in in_flight.lock().drain() {
        entry.task.abort();
    }
    if let Err(e) = ldap.clone().unbind().await {
        debug!(error = %e, "Unbind failed");
    }
}

async fn run(
    mut ldap: Ldap,
    handle: MessageId,
    request: Request,
    in_flight: InFlightMap,
    mailbox: Arc<Mailbox>,
) {
    let outcome = execute(&mut ldap, handle, request, &in_flight, &mailbox).await;
    in_flight.lock().remove(&handle);

    match outcome {
        Ok(message) => mailbox.deliver(handle, vec![Ok(message)], true),
        Err(e) => {
            warn!(handle, error = %e, "LDAP request failed");
            mailbox.deliver(handle, vec![Err(e.to_string())], true);
        }
    }
}

async fn execute(
    ldap: &mut Ldap,
    handle: MessageId,
    request: Request,
    in_flight: &InFlightMap,
    mailbox: &Mailbox,
) -> std::result::Result<RawResult, LdapError> {
    match request {
        Request::Search { request, cookie } => {
            search(ldap, handle, &request, cookie, in_flight, mailbox).await
        }
        Request::Add { dn, attributes } => {
            let result = ldap.add(&dn, types::add_attributes(&attributes)).await?;
            Ok(RawResult::Add(types::outcome(&result)))
        }
        Request::Modify { dn, mods } => {
            let mods = mods.iter().map(types::modification).collect();
            let result = ldap.modify(&dn, mods).await?;
            Ok(RawResult::Modify(types::outcome(&result)))
        }
        Request::Delete { dn } => {
            let result = ldap.delete(&dn).await?;
            Ok(RawResult::Delete(types::outcome(&result)))
        }
        Request::Rename {
            dn,
            new_rdn,
            new_superior,
            delete_old_rdn,
        } => {
            let result = ldap
                .modifydn(&dn, &new_rdn, delete_old_rdn, new_superior.as_deref())
                .await?;
            Ok(RawResult::ModDn(types::outcome(&result)))
        }
        Request::Extended { oid, value } => {
            let ldap3::result::ExopResult(exop, result) = ldap
                .extended(Exop {
                    name: Some(oid),
                    val: value,
                })
                .await?;
            Ok(RawResult::Extended {
                outcome: types::outcome(&result),
                name: exop.name,
                value: exop.val,
            })
        }
        Request::Bind(request) => bind(ldap, &request).await,
    }
}

/// Entries and references are delivered as they stream in; the returned
/// message is the final SearchDone
async fn search(
    ldap: &mut Ldap,
    handle: MessageId,
    request: &SearchRequest,
    cookie: Option<Vec<u8>>,
    in_flight: &InFlightMap,
    mailbox: &Mailbox,
) -> std::result::Result<RawResult, LdapError> {
    let options = SearchOptions::new()
        .sizelimit(request.size_limit)
        .timelimit(request.time_limit);

    let mut controls: Vec<RawControl> = Vec::new();
    if let Some(size) = request.page_size {
        controls.push(
            PagedResults {
                size,
                cookie: cookie.unwrap_or_default(),
            }
            .into(),
        );
    }

    let mut stream = ldap
        .with_search_options(options)
        .with_controls(controls)
        .streaming_search(
            &request.base,
            types::scope(request.scope),
            &request.filter,
            request.attributes.clone(),
        )
        .await?;

    let ldap_id = stream.ldap_handle().last_id();
    if let Some(entry) = in_flight.lock().get_mut(&handle) {
        entry.ldap_id = Some(ldap_id);
    }

    while let Some(entry) = stream.next().await? {
        mailbox.deliver(handle, vec![Ok(types::search_message(entry))], false);
    }

    let result = stream.finish().await;
    let cookie = result.ctrls.iter().find_map(|Control(kind, raw)| match kind {
        Some(ControlType::PagedResults) => Some(raw.parse::<PagedResults>().cookie),
        _ => None,
    });

    Ok(RawResult::SearchDone {
        outcome: types::outcome(&result),
        cookie,
    })
}

async fn bind(ldap: &mut Ldap, request: &BindRequest) -> std::result::Result<RawResult, LdapError> {
    let outcome = match request.mechanism.as_str() {
        SIMPLE => {
            let password = request
                .credentials
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            types::outcome(&ldap.simple_bind(&request.dn, &password).await?)
        }
        "EXTERNAL" => types::outcome(&ldap.sasl_external_bind().await?),
        other => LdapOutcome::with_code(
            codes::AUTH_METHOD_NOT_SUPPORTED,
            format!("mechanism {} is not supported by this transport", other),
        ),
    };

    Ok(RawResult::Bind {
        outcome,
        server_credentials: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done() -> Delivery {
        Ok(RawResult::SearchDone {
            outcome: LdapOutcome::success(),
            cookie: None,
        })
    }

    #[test]
    fn test_abandoned_result_is_dropped() {
        let mailbox = Mailbox::new().unwrap();
        mailbox.expect(3);
        mailbox.discard(3);
        mailbox.deliver(3, vec![Ok(RawResult::Delete(LdapOutcome::success()))], true);

        let inbox = mailbox.inbox.lock();
        assert!(inbox.results.is_empty());
        assert!(inbox.abandoned.is_empty());
        assert!(inbox.outstanding.is_empty());
    }

    #[test]
    fn test_abandon_mid_stream_drops_later_entries() {
        let mailbox = Mailbox::new().unwrap();
        mailbox.expect(1);
        mailbox.deliver(1, vec![Ok(RawResult::SearchReference(vec!["ldap://a".into()]))], false);
        mailbox.discard(1);
        mailbox.deliver(1, vec![Ok(RawResult::SearchReference(vec!["ldap://b".into()]))], false);
        mailbox.deliver(1, vec![done()], true);

        assert!(mailbox.take(1).is_none());
        assert!(mailbox.inbox.lock().abandoned.is_empty());
    }

    #[test]
    fn test_abandon_after_completion_leaves_nothing_behind() {
        let mailbox = Mailbox::new().unwrap();
        mailbox.expect(2);
        mailbox.deliver(2, vec![done()], true);
        mailbox.discard(2);

        let inbox = mailbox.inbox.lock();
        assert!(inbox.results.is_empty());
        assert!(inbox.abandoned.is_empty());
    }

    #[test]
    fn test_streamed_deliveries_queue_in_order() {
        let mailbox = Mailbox::new().unwrap();
        mailbox.expect(1);
        mailbox.deliver(1, vec![Ok(RawResult::SearchReference(vec!["ldap://a".into()]))], false);
        mailbox.deliver(1, vec![done()], true);

        assert!(matches!(mailbox.take(1), Some(Ok(RawResult::SearchReference(_)))));
        assert!(matches!(mailbox.take(1), Some(Ok(RawResult::SearchDone { .. }))));
        assert!(mailbox.take(1).is_none());
    }

    #[test]
    fn test_interleaved_requests_keep_separate_queues() {
        let mailbox = Mailbox::new().unwrap();
        mailbox.expect(1);
        mailbox.expect(2);
        mailbox.deliver(2, vec![Ok(RawResult::Delete(LdapOutcome::success()))], true);
        mailbox.deliver(1, vec![done()], true);

        assert!(matches!(mailbox.take(1), Some(Ok(RawResult::SearchDone { .. }))));
        assert!(matches!(mailbox.take(2), Some(Ok(RawResult::Delete(_)))));
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_handle_readable_while_results_are_parked() {
        use tokio::io::unix::AsyncFd;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mailbox = Mailbox::new().unwrap();
        let handle = mailbox.inbox.lock().wake_rx.handle().unwrap();

        let readable = |handle: WaitHandle| {
            runtime.block_on(async {
                let fd = AsyncFd::new(handle).unwrap();
                tokio::time::timeout(Duration::from_millis(100), fd.readable())
                    .await
                    .is_ok()
            })
        };

        assert!(!readable(handle));

        mailbox.expect(1);
        mailbox.deliver(1, vec![Ok(RawResult::Delete(LdapOutcome::success()))], true);
        assert!(readable(handle));

        assert!(mailbox.take(1).is_some());
        assert!(!readable(handle));

        mailbox.close("connection closed");
        assert!(readable(handle));
    }
}
