//! Scripted protocol engine for tests

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::{Duration, Instant};

use lodestar_core::entry::Modification;
use lodestar_core::{ClientConfig, ConnectionConfig, Error, MessageId, OperationBatch, Result};

use crate::connect::ConnectionAttempt;
use crate::connection::Connection;
use crate::engine::{
    BindRequest, ConnectionInitializer, LdapOutcome, ProtocolEngine, RawEntry, RawResult,
    SearchRequest, START_TLS_OID, WHO_AM_I_OID,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sent {
    Search {
        base: String,
        cookie: Option<Vec<u8>>,
    },
    Add {
        dn: String,
        attributes: Vec<(String, Vec<String>)>,
    },
    Modify {
        dn: String,
        ops: Vec<Modification>,
    },
    Delete {
        dn: String,
    },
    Rename {
        dn: String,
        new_rdn: String,
    },
    Extended {
        oid: String,
    },
    Bind {
        dn: String,
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Default)]
pub(crate) struct Script {
    pub sent: Vec<Sent>,
    /// Answers to successive bind rounds; success once exhausted
    pub bind_replies: VecDeque<RawResult>,
    /// Bind answers become visible this long after the request
    pub bind_delay: Duration,
    pub start_tls: Option<LdapOutcome>,
    /// StartTLS answer becomes visible this long after the request
    pub start_tls_delay: Duration,
    /// Answers to successive add/modify requests; success once exhausted
    pub commit_outcomes: VecDeque<LdapOutcome>,
    /// Messages for successive searches; an empty result once exhausted
    pub search_pages: VecDeque<Vec<RawResult>>,
    /// Operations (not binds, not StartTLS) never get an answer
    pub silent: bool,
    pub fail_poll: Option<String>,
    pub polls: usize,
    pub abandoned: Vec<MessageId>,
    pub unbinds: usize,
    pub engines_dropped: usize,
    ready: HashMap<MessageId, VecDeque<(Instant, RawResult)>>,
}

pub(crate) type SharedScript = Arc<Mutex<Script>>;

pub(crate) fn script() -> SharedScript {
    Arc::new(Mutex::new(Script::default()))
}

pub(crate) struct MockEngine {
    script: SharedScript,
    next_id: MessageId,
    in_band: bool,
}

impl MockEngine {
    fn submit(&mut self, sent: Sent, reply: Option<RawResult>) -> Result<MessageId> {
        self.submit_after(sent, reply, Duration::ZERO)
    }

    fn submit_after(
        &mut self,
        sent: Sent,
        reply: Option<RawResult>,
        delay: Duration,
    ) -> Result<MessageId> {
        self.next_id += 1;
        let handle = self.next_id;
        let mut script = self.script.lock();
        script.sent.push(sent);
        if let Some(reply) = reply {
            let at = Instant::now() + delay;
            script
                .ready
                .entry(handle)
                .or_default()
                .push_back((at, reply));
        }
        Ok(handle)
    }

    fn submit_many(&mut self, sent: Sent, replies: Vec<RawResult>) -> Result<MessageId> {
        let silent = self.script.lock().silent;
        let handle = self.submit(sent, None)?;
        if !silent {
            let now = Instant::now();
            let mut script = self.script.lock();
            let queue = script.ready.entry(handle).or_default();
            queue.extend(replies.into_iter().map(|r| (now, r)));
        }
        Ok(handle)
    }

    fn operation_reply(&self, reply: RawResult) -> Option<RawResult> {
        if self.script.lock().silent {
            None
        } else {
            Some(reply)
        }
    }

    fn commit_outcome(&self) -> LdapOutcome {
        self.script
            .lock()
            .commit_outcomes
            .pop_front()
            .unwrap_or_default()
    }
}

impl ProtocolEngine for MockEngine {
    fn send_search(&mut self, request: &SearchRequest, cookie: Option<&[u8]>) -> Result<MessageId> {
        let page = self.script.lock().search_pages.pop_front().unwrap_or_else(|| {
            vec![RawResult::SearchDone {
                outcome: LdapOutcome::success(),
                cookie: None,
            }]
        });
        self.submit_many(
            Sent::Search {
                base: request.base.clone(),
                cookie: cookie.map(<[u8]>::to_vec),
            },
            page,
        )
    }

    fn send_add(&mut self, dn: &str, attributes: &[(String, Vec<String>)]) -> Result<MessageId> {
        let reply = self.operation_reply(RawResult::Add(self.commit_outcome()));
        self.submit(
            Sent::Add {
                dn: dn.to_string(),
                attributes: attributes.to_vec(),
            },
            reply,
        )
    }

    fn send_modify(&mut self, dn: &str, batch: &OperationBatch) -> Result<MessageId> {
        let reply = self.operation_reply(RawResult::Modify(self.commit_outcome()));
        self.submit(
            Sent::Modify {
                dn: dn.to_string(),
                ops: batch.as_slice().to_vec(),
            },
            reply,
        )
    }

    fn send_delete(&mut self, dn: &str) -> Result<MessageId> {
        let reply = self.operation_reply(RawResult::Delete(LdapOutcome::success()));
        self.submit(Sent::Delete { dn: dn.to_string() }, reply)
    }

    fn send_rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        _new_superior: Option<&str>,
        _delete_old_rdn: bool,
    ) -> Result<MessageId> {
        let reply = self.operation_reply(RawResult::ModDn(LdapOutcome::success()));
        self.submit(
            Sent::Rename {
                dn: dn.to_string(),
                new_rdn: new_rdn.to_string(),
            },
            reply,
        )
    }

    fn send_extended(&mut self, oid: &str, _value: Option<&[u8]>) -> Result<MessageId> {
        if oid == START_TLS_OID {
            let (outcome, delay) = {
                let script = self.script.lock();
                (script.start_tls.clone().unwrap_or_default(), script.start_tls_delay)
            };
            let reply = RawResult::Extended {
                outcome,
                name: None,
                value: None,
            };
            return self.submit_after(Sent::Extended { oid: oid.to_string() }, Some(reply), delay);
        }
        let reply = {
            let value = (oid == WHO_AM_I_OID).then(|| b"dn:cn=admin,dc=example,dc=com".to_vec());
            self.operation_reply(RawResult::Extended {
                outcome: LdapOutcome::success(),
                name: None,
                value,
            })
        };
        self.submit(Sent::Extended { oid: oid.to_string() }, reply)
    }

    fn send_bind(&mut self, request: &BindRequest) -> Result<MessageId> {
        let (reply, delay) = {
            let mut script = self.script.lock();
            let reply = script.bind_replies.pop_front().unwrap_or(RawResult::Bind {
                outcome: LdapOutcome::success(),
                server_credentials: None,
            });
            (reply, script.bind_delay)
        };
        self.submit_after(
            Sent::Bind {
                dn: request.dn.clone(),
                mechanism: request.mechanism.clone(),
                credentials: request.credentials.clone(),
            },
            Some(reply),
            delay,
        )
    }

    fn upgrades_in_band(&self) -> bool {
        self.in_band
    }

    fn poll_result(&mut self, handle: MessageId, wait: Option<Duration>) -> Result<Poll<RawResult>> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            {
                let mut script = self.script.lock();
                script.polls += 1;
                if let Some(message) = script.fail_poll.clone() {
                    return Err(Error::transport(message));
                }
                if let Some(queue) = script.ready.get_mut(&handle) {
                    if queue.front().map_or(false, |(at, _)| *at <= Instant::now()) {
                        let (_, reply) = queue.pop_front().unwrap();
                        return Ok(Poll::Ready(reply));
                    }
                }
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(Poll::Pending),
                _ => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn abandon(&mut self, handle: MessageId) -> Result<()> {
        let mut script = self.script.lock();
        script.ready.remove(&handle);
        script.abandoned.push(handle);
        Ok(())
    }

    fn unbind(&mut self) -> Result<()> {
        self.script.lock().unbinds += 1;
        Ok(())
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.script.lock().engines_dropped += 1;
    }
}

pub(crate) struct MockInitializer {
    pub script: SharedScript,
    pub delay: Duration,
    pub fail: Option<String>,
    pub in_band: bool,
}

impl MockInitializer {
    pub fn new(script: &SharedScript) -> Self {
        Self {
            script: Arc::clone(script),
            delay: Duration::ZERO,
            fail: None,
            in_band: true,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ConnectionInitializer for MockInitializer {
    fn initialize(&self, _config: &ConnectionConfig) -> Result<Box<dyn ProtocolEngine>> {
        thread::sleep(self.delay);
        if let Some(message) = &self.fail {
            return Err(Error::transport(message.clone()));
        }
        Ok(Box::new(MockEngine {
            script: Arc::clone(&self.script),
            next_id: 0,
            in_band: self.in_band,
        }))
    }
}

pub(crate) fn config(timeout_ms: Option<u64>) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connection.url = "ldap://mock.example.com".to_string();
    config.connection.timeout_ms = timeout_ms;
    config.connection.poll_interval_ms = 5;
    config
}

/// Bound connection over a fresh mock engine
pub(crate) fn bound(script: &SharedScript) -> Connection {
    let mut attempt = ConnectionAttempt::start(
        Arc::new(config(Some(5_000))),
        Arc::new(MockInitializer::new(script)),
    )
    .unwrap();
    match attempt.advance(true).unwrap() {
        Poll::Ready(connection) => connection,
        Poll::Pending => panic!("blocking connect returned pending"),
    }
}

pub(crate) fn entry(dn: &str, attributes: &[(&str, &str)]) -> RawResult {
    RawResult::SearchEntry(RawEntry {
        dn: dn.to_string(),
        attributes: attributes
            .iter()
            .map(|(name, value)| (name.to_string(), vec![value.to_string()]))
            .collect(),
    })
}
