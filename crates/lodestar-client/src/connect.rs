//! Connection establishment state machine
//!
//! A [`ConnectionAttempt`] walks through
//!
//! ```text
//! Initializing -> [EncryptUpgrading] -> Authenticating -> Bound
//!                                    \-> AuthenticatingInWorker -/
//! ```
//!
//! Initialization (resolve, connect, TLS for `ldaps://`) always runs on a
//! worker thread. The bind exchange runs on the caller's thread through
//! the engine's result channel, or on a worker when configured (or when a
//! multi-round mechanism is used on Windows).
//!
//! Each call to [`ConnectionAttempt::advance`] waits at most one poll
//! interval in non-blocking mode, or whatever is left of the timeout
//! budget in blocking mode. Every wait is charged against the budget, so
//! the attempt as a whole never outlives its configured timeout.

use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use lodestar_core::{ClientConfig, Error, MessageId, Result, Stage, TlsMode};

use crate::auth::{mechanism_for, BindExchange, BindProgress, Mechanism};
use crate::budget::TimeoutBudget;
use crate::connection::Connection;
use crate::engine::{ConnectionInitializer, ProtocolEngine, RawResult};
use crate::registry::{Continuation, ExtendedTag, PendingOperations};
use crate::task::{BlockingTask, WaitHandle};

/// Externally visible progress of a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    Initializing,
    EncryptUpgrading,
    Authenticating,
    Bound,
    Failed,
}

impl ConnectPhase {
    fn stage(self) -> Stage {
        match self {
            ConnectPhase::Initializing => Stage::Initialize,
            ConnectPhase::EncryptUpgrading => Stage::EncryptUpgrade,
            ConnectPhase::Authenticating => Stage::Authenticate,
            ConnectPhase::Bound | ConnectPhase::Failed => Stage::Operation,
        }
    }
}

type EngineBox = Box<dyn ProtocolEngine>;

struct WorkerBind {
    engine: EngineBox,
    result: Result<()>,
}

enum State {
    Initializing(BlockingTask<Result<EngineBox>>),
    EncryptUpgrading {
        engine: EngineBox,
        handle: MessageId,
    },
    Authenticating {
        engine: EngineBox,
        exchange: BindExchange,
        handle: MessageId,
    },
    AuthenticatingInWorker(BlockingTask<WorkerBind>),
    Bound,
    Failed,
}

enum Step {
    /// A transition happened; keep going without waiting
    Advanced,
    /// The current stage is still waiting
    Waiting,
    Bound(Connection),
}

/// One attempt to open and bind a connection
pub struct ConnectionAttempt {
    config: Arc<ClientConfig>,
    state: State,
    budget: TimeoutBudget,
    registry: PendingOperations,
    mechanism: Option<Box<dyn Mechanism>>,
    started: Instant,
}

impl ConnectionAttempt {
    /// Start connecting with the bind mechanism from the configuration
    pub fn start(config: Arc<ClientConfig>, initializer: Arc<dyn ConnectionInitializer>) -> Result<Self> {
        let mechanism = mechanism_for(&config.bind);
        Self::with_mechanism(config, initializer, mechanism)
    }

    /// Start connecting with a caller-supplied mechanism
    pub fn with_mechanism(
        config: Arc<ClientConfig>,
        initializer: Arc<dyn ConnectionInitializer>,
        mechanism: Box<dyn Mechanism>,
    ) -> Result<Self> {
        config.validate()?;

        let worker_config = config.connection.clone();
        let task = BlockingTask::spawn("connect", move |_| {
            initializer.initialize(&worker_config)
        })?;

        info!(
            url = %config.connection.url,
            mechanism = %mechanism.name(),
            timeout_ms = ?config.connection.timeout_ms,
            "Connecting"
        );

        Ok(Self {
            budget: TimeoutBudget::new(config.connection.timeout()),
            config,
            state: State::Initializing(task),
            registry: PendingOperations::new(),
            mechanism: Some(mechanism),
            started: Instant::now(),
        })
    }

    pub fn phase(&self) -> ConnectPhase {
        match self.state {
            State::Initializing(_) => ConnectPhase::Initializing,
            State::EncryptUpgrading { .. } => ConnectPhase::EncryptUpgrading,
            State::Authenticating { .. } | State::AuthenticatingInWorker(_) => {
                ConnectPhase::Authenticating
            }
            State::Bound => ConnectPhase::Bound,
            State::Failed => ConnectPhase::Failed,
        }
    }

    /// Budget left for the rest of the attempt
    pub fn remaining(&self) -> Option<Duration> {
        self.budget.remaining()
    }

    /// Readiness handle for the stage currently waited on
    pub fn wait_handle(&self) -> Option<WaitHandle> {
        match &self.state {
            State::Initializing(task) => task.wait_handle(),
            State::AuthenticatingInWorker(task) => task.wait_handle(),
            State::EncryptUpgrading { engine, .. } | State::Authenticating { engine, .. } => {
                engine.wait_handle()
            }
            State::Bound | State::Failed => None,
        }
    }

    /// Drive the attempt forward.
    ///
    /// Non-blocking mode returns `Pending` after at most one poll interval
    /// without progress. Blocking mode returns only once bound or failed.
    /// Any error tears the attempt down; it cannot be resumed.
    pub fn advance(&mut self, blocking: bool) -> Result<Poll<Connection>> {
        loop {
            let step = match self.step(blocking) {
                Ok(step) => step,
                Err(e) => {
                    warn!(
                        phase = ?self.phase(),
                        elapsed_ms = self.started.elapsed().as_millis() as u64,
                        error = %e,
                        "Connection attempt failed"
                    );
                    self.teardown();
                    return Err(e);
                }
            };

            match step {
                Step::Advanced => continue,
                Step::Waiting if blocking => continue,
                Step::Waiting => return Ok(Poll::Pending),
                Step::Bound(connection) => return Ok(Poll::Ready(connection)),
            }
        }
    }

    /// Abandon the attempt, releasing workers and in-flight requests
    pub fn cancel(mut self) {
        if !matches!(self.state, State::Bound | State::Failed) {
            info!(phase = ?self.phase(), "Connection attempt cancelled");
        }
        self.teardown();
    }

    fn step(&mut self, blocking: bool) -> Result<Step> {
        let stage = self.phase().stage();
        if matches!(self.state, State::Bound | State::Failed) {
            return Err(Error::InvalidState(
                "connection attempt already finished".into(),
            ));
        }
        if self.budget.is_exhausted() {
            return Err(Error::Timeout { stage });
        }

        let wait = self
            .budget
            .next_wait(blocking, self.config.connection.poll_interval());

        match self.state {
            State::Initializing(_) => self.step_initializing(wait),
            State::EncryptUpgrading { .. } => self.step_encrypt_upgrade(wait),
            State::Authenticating { .. } => self.step_authenticating(wait),
            State::AuthenticatingInWorker(_) => self.step_worker_auth(wait),
            State::Bound | State::Failed => Ok(Step::Waiting),
        }
    }

    fn step_initializing(&mut self, wait: Option<Duration>) -> Result<Step> {
        let State::Initializing(task) = &self.state else {
            return Ok(Step::Waiting);
        };
        let finished = self.budget.timed(|| task.wait(wait));
        if !finished {
            return self.still_waiting(Stage::Initialize);
        }

        let State::Initializing(task) = std::mem::replace(&mut self.state, State::Failed) else {
            return Ok(Step::Waiting);
        };
        let engine = task.join()?.map_err(|e| e.with_stage(Stage::Initialize))?;
        debug!(
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Transport initialized"
        );

        if self.config.connection.tls == TlsMode::StartTls && engine.upgrades_in_band() {
            self.begin_encrypt_upgrade(engine)
        } else {
            self.begin_authentication(engine)
        }
    }

    fn begin_encrypt_upgrade(&mut self, mut engine: EngineBox) -> Result<Step> {
        let handle = engine
            .start_encrypted_transport()
            .map_err(|e| e.with_stage(Stage::EncryptUpgrade))?;
        self.registry
            .register(handle, Continuation::Extended(ExtendedTag::StartTls))?;
        debug!(handle, "StartTLS submitted");
        self.state = State::EncryptUpgrading { engine, handle };
        Ok(Step::Advanced)
    }

    fn step_encrypt_upgrade(&mut self, wait: Option<Duration>) -> Result<Step> {
        let State::EncryptUpgrading { engine, handle } = &mut self.state else {
            return Ok(Step::Waiting);
        };
        let handle = *handle;
        let polled = self
            .budget
            .timed(|| engine.poll_result(handle, wait))
            .map_err(|e| e.with_stage(Stage::EncryptUpgrade))?;

        let result = match polled {
            Poll::Ready(result) => result,
            Poll::Pending => return self.still_waiting(Stage::EncryptUpgrade),
        };
        self.registry.take(handle)?;

        match result {
            RawResult::Extended { outcome, .. } => outcome
                .into_result()
                .map_err(upgrade_failure)?,
            other => {
                return Err(Error::InvalidState(format!(
                    "unexpected {} response to StartTLS",
                    other.kind()
                )))
            }
        }
        debug!("Transport encrypted");

        let State::EncryptUpgrading { engine, .. } = std::mem::replace(&mut self.state, State::Failed)
        else {
            return Ok(Step::Waiting);
        };
        self.begin_authentication(engine)
    }

    fn begin_authentication(&mut self, mut engine: EngineBox) -> Result<Step> {
        let mechanism = self
            .mechanism
            .take()
            .ok_or_else(|| Error::InvalidState("bind mechanism already consumed".into()))?;
        let mut exchange = BindExchange::new(mechanism);

        let in_worker = self
            .config
            .connection
            .auth_in_worker
            .unwrap_or(cfg!(windows) && exchange.is_multi_round());

        if in_worker {
            let deadline = self.budget.deadline();
            debug!(mechanism = %exchange.mechanism_name(), "Authenticating on worker thread");
            let task = BlockingTask::spawn("bind", move |_| {
                let result = exchange.run_blocking(engine.as_mut(), deadline);
                WorkerBind { engine, result }
            })?;
            self.state = State::AuthenticatingInWorker(task);
        } else {
            let handle = exchange.start(engine.as_mut())?;
            self.registry.register(handle, Continuation::BindAttempt)?;
            debug!(handle, mechanism = %exchange.mechanism_name(), "Bind submitted");
            self.state = State::Authenticating {
                engine,
                exchange,
                handle,
            };
        }
        Ok(Step::Advanced)
    }

    fn step_authenticating(&mut self, wait: Option<Duration>) -> Result<Step> {
        let State::Authenticating {
            engine,
            exchange,
            handle,
        } = &mut self.state
        else {
            return Ok(Step::Waiting);
        };
        let current = *handle;
        let polled = self
            .budget
            .timed(|| engine.poll_result(current, wait))
            .map_err(|e| e.with_stage(Stage::Authenticate))?;

        let result = match polled {
            Poll::Ready(result) => result,
            Poll::Pending => return self.still_waiting(Stage::Authenticate),
        };
        self.registry.take(current)?;

        match exchange.on_result(engine.as_mut(), result)? {
            BindProgress::Sent(next) => {
                *handle = next;
                self.registry.register(next, Continuation::BindAttempt)?;
                Ok(Step::Advanced)
            }
            BindProgress::Done => {
                let State::Authenticating { engine, .. } =
                    std::mem::replace(&mut self.state, State::Failed)
                else {
                    return Ok(Step::Waiting);
                };
                self.finish(engine)
            }
        }
    }

    fn step_worker_auth(&mut self, wait: Option<Duration>) -> Result<Step> {
        let State::AuthenticatingInWorker(task) = &self.state else {
            return Ok(Step::Waiting);
        };
        let finished = self.budget.timed(|| task.wait(wait));
        if !finished {
            return self.still_waiting(Stage::Authenticate);
        }

        let State::AuthenticatingInWorker(task) = std::mem::replace(&mut self.state, State::Failed)
        else {
            return Ok(Step::Waiting);
        };
        let WorkerBind { engine, result } = task.join()?;
        result?;
        self.finish(engine)
    }

    fn finish(&mut self, engine: EngineBox) -> Result<Step> {
        self.state = State::Bound;
        info!(
            url = %self.config.connection.url,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Connection bound"
        );

        let registry = std::mem::take(&mut self.registry);
        Ok(Step::Bound(Connection::from_parts(
            engine,
            registry,
            Arc::clone(&self.config),
        )))
    }

    fn still_waiting(&self, stage: Stage) -> Result<Step> {
        if self.budget.is_exhausted() {
            Err(Error::Timeout { stage })
        } else {
            Ok(Step::Waiting)
        }
    }

    fn teardown(&mut self) {
        match std::mem::replace(&mut self.state, State::Failed) {
            State::Initializing(task) => task.cancel(),
            State::AuthenticatingInWorker(task) => task.cancel(),
            State::EncryptUpgrading { mut engine, handle }
            | State::Authenticating {
                mut engine, handle, ..
            } => {
                if self.registry.contains(handle) {
                    let _ = engine.abandon(handle);
                }
                let _ = engine.unbind();
            }
            State::Bound => self.state = State::Bound,
            State::Failed => {}
        }
        self.registry.drain();
    }
}

impl Drop for ConnectionAttempt {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn upgrade_failure(err: Error) -> Error {
    match err {
        Error::Protocol { code, message, .. } => Error::Transport {
            stage: Stage::EncryptUpgrade,
            message: format!("StartTLS rejected (code {}): {}", code, message),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MechanismStep;
    use crate::engine::{codes, LdapOutcome, START_TLS_OID};
    use crate::mock::{self, MockInitializer, Sent};

    fn attempt(config: ClientConfig, initializer: MockInitializer) -> ConnectionAttempt {
        ConnectionAttempt::start(Arc::new(config), Arc::new(initializer)).unwrap()
    }

    fn bind_reply(code: u32, credentials: Option<&[u8]>) -> RawResult {
        RawResult::Bind {
            outcome: LdapOutcome::with_code(code, ""),
            server_credentials: credentials.map(<[u8]>::to_vec),
        }
    }

    /// Two-round mechanism answering the server's challenge
    struct Challenge {
        round: u8,
    }

    impl Mechanism for Challenge {
        fn name(&self) -> &str {
            "X-CHALLENGE"
        }

        fn is_multi_round(&self) -> bool {
            true
        }

        fn step(&mut self, challenge: Option<&[u8]>) -> MechanismStep {
            self.round += 1;
            match (self.round, challenge) {
                (1, None) => MechanismStep::Response(b"hello".to_vec()),
                (2, Some(b"nonce")) => MechanismStep::Response(b"proof".to_vec()),
                (3, Some(b"verifier")) => MechanismStep::Complete,
                _ => MechanismStep::Failed("unexpected challenge".into()),
            }
        }
    }

    #[test]
    fn test_blocking_connect_binds() {
        let script = mock::script();
        let mut config = mock::config(Some(2_000));
        config.bind.mechanism = lodestar_core::BindMechanism::Simple;
        config.bind.bind_dn = "cn=admin,dc=example,dc=com".into();
        config.bind.password = "secret".into();

        let mut attempt = attempt(config, MockInitializer::new(&script));
        let connection = match attempt.advance(true).unwrap() {
            Poll::Ready(connection) => connection,
            Poll::Pending => panic!("blocking connect returned pending"),
        };

        assert_eq!(attempt.phase(), ConnectPhase::Bound);
        assert_eq!(connection.pending(), 0);
        assert_eq!(
            script.lock().sent,
            vec![Sent::Bind {
                dn: "cn=admin,dc=example,dc=com".into(),
                mechanism: "SIMPLE".into(),
                credentials: Some(b"secret".to_vec()),
            }]
        );
    }

    #[test]
    fn test_nonblocking_advance_returns_within_poll_interval() {
        let script = mock::script();
        let initializer = MockInitializer::new(&script).delay(Duration::from_millis(80));
        let mut attempt = attempt(mock::config(Some(2_000)), initializer);

        let start = Instant::now();
        assert!(attempt.advance(false).unwrap().is_pending());
        assert!(start.elapsed() < Duration::from_millis(60));
        assert_eq!(attempt.phase(), ConnectPhase::Initializing);

        let connection = loop {
            if let Poll::Ready(connection) = attempt.advance(false).unwrap() {
                break connection;
            }
            assert!(start.elapsed() < Duration::from_secs(2));
        };
        assert_eq!(connection.pending(), 0);
        assert!(attempt.remaining().unwrap() < Duration::from_millis(1_950));
    }

    #[test]
    fn test_blocking_timeout_spans_all_stages() {
        let script = mock::script();
        script.lock().bind_delay = Duration::from_secs(10);
        let initializer = MockInitializer::new(&script).delay(Duration::from_millis(150));
        let mut attempt = attempt(mock::config(Some(300)), initializer);

        let start = Instant::now();
        let err = attempt.advance(true).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(
            err,
            Error::Timeout {
                stage: Stage::Authenticate
            }
        ));
        assert!(elapsed >= Duration::from_millis(280), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(450), "{:?}", elapsed);
        assert_eq!(attempt.phase(), ConnectPhase::Failed);

        let script = script.lock();
        assert_eq!(script.abandoned.len(), 1);
        assert_eq!(script.engines_dropped, 1);
    }

    #[test]
    fn test_initialize_timeout_detaches_worker() {
        let script = mock::script();
        let initializer = MockInitializer::new(&script).delay(Duration::from_millis(400));
        let mut attempt = attempt(mock::config(Some(100)), initializer);

        let start = Instant::now();
        let err = attempt.advance(true).unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                stage: Stage::Initialize
            }
        ));
        assert!(start.elapsed() < Duration::from_millis(300));

        // the late engine is dropped by the detached worker
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(script.lock().engines_dropped, 1);
        assert!(script.lock().sent.is_empty());
    }

    #[test]
    fn test_initializer_failure_reports_stage() {
        let script = mock::script();
        let mut initializer = MockInitializer::new(&script);
        initializer.fail = Some("connection refused".into());
        let mut attempt = attempt(mock::config(Some(1_000)), initializer);

        let err = attempt.advance(true).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport {
                stage: Stage::Initialize,
                ..
            }
        ));
        assert_eq!(attempt.phase(), ConnectPhase::Failed);
    }

    #[test]
    fn test_starttls_precedes_bind() {
        let script = mock::script();
        let mut config = mock::config(Some(1_000));
        config.connection.tls = TlsMode::StartTls;
        let mut attempt = attempt(config, MockInitializer::new(&script));

        assert!(attempt.advance(true).unwrap().is_ready());
        let sent = script.lock().sent.clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            Sent::Extended {
                oid: START_TLS_OID.into()
            }
        );
        assert!(matches!(sent[1], Sent::Bind { .. }));
    }

    #[test]
    fn test_starttls_rejected() {
        let script = mock::script();
        script.lock().start_tls = Some(LdapOutcome::with_code(
            codes::PROTOCOL_ERROR,
            "unsupported extended operation",
        ));
        let mut config = mock::config(Some(1_000));
        config.connection.tls = TlsMode::StartTls;
        let mut attempt = attempt(config, MockInitializer::new(&script));

        let err = attempt.advance(true).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport {
                stage: Stage::EncryptUpgrade,
                ..
            }
        ));
        assert!(!script
            .lock()
            .sent
            .iter()
            .any(|s| matches!(s, Sent::Bind { .. })));
    }

    #[test]
    fn test_starttls_skipped_when_negotiated_while_connecting() {
        let script = mock::script();
        let mut config = mock::config(Some(1_000));
        config.connection.tls = TlsMode::StartTls;
        let mut initializer = MockInitializer::new(&script);
        initializer.in_band = false;
        let mut attempt = attempt(config, initializer);

        assert!(attempt.advance(true).unwrap().is_ready());
        let sent = script.lock().sent.clone();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Sent::Bind { .. }));
    }

    #[test]
    fn test_multi_round_bind_feeds_challenges() {
        let script = mock::script();
        {
            let mut script = script.lock();
            script
                .bind_replies
                .push_back(bind_reply(codes::SASL_BIND_IN_PROGRESS, Some(b"nonce")));
            script
                .bind_replies
                .push_back(bind_reply(codes::SUCCESS, Some(b"verifier")));
        }
        let mut config = mock::config(Some(1_000));
        config.connection.auth_in_worker = Some(false);

        let mut attempt = ConnectionAttempt::with_mechanism(
            Arc::new(config),
            Arc::new(MockInitializer::new(&script)),
            Box::new(Challenge { round: 0 }),
        )
        .unwrap();

        assert!(attempt.advance(true).unwrap().is_ready());
        let credentials: Vec<_> = script
            .lock()
            .sent
            .iter()
            .filter_map(|s| match s {
                Sent::Bind { credentials, .. } => credentials.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(credentials, vec![b"hello".to_vec(), b"proof".to_vec()]);
    }

    #[test]
    fn test_bind_rejected() {
        let script = mock::script();
        script
            .lock()
            .bind_replies
            .push_back(bind_reply(codes::INVALID_CREDENTIALS, None));
        let mut attempt = attempt(mock::config(Some(1_000)), MockInitializer::new(&script));

        let err = attempt.advance(true).unwrap_err();
        assert!(matches!(
            err,
            Error::AuthenticationFailed { code: 49, .. }
        ));
        assert_eq!(script.lock().engines_dropped, 1);
    }

    #[test]
    fn test_worker_authentication() {
        let script = mock::script();
        let mut config = mock::config(Some(1_000));
        config.connection.auth_in_worker = Some(true);
        let initializer = MockInitializer::new(&script).delay(Duration::from_millis(30));
        let mut attempt = attempt(config, initializer);

        #[cfg(unix)]
        assert!(attempt.wait_handle().is_some());

        let connection = loop {
            if let Poll::Ready(connection) = attempt.advance(false).unwrap() {
                break connection;
            }
        };
        assert_eq!(connection.pending(), 0);
        assert_eq!(script.lock().sent.len(), 1);
    }

    #[test]
    fn test_worker_authentication_timeout() {
        let script = mock::script();
        script.lock().bind_delay = Duration::from_secs(10);
        let mut config = mock::config(Some(200));
        config.connection.auth_in_worker = Some(true);
        let mut attempt = attempt(config, MockInitializer::new(&script));

        let start = Instant::now();
        let err = attempt.advance(true).unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                stage: Stage::Authenticate
            }
        ));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_cancel_releases_in_flight_bind() {
        let script = mock::script();
        script.lock().bind_delay = Duration::from_secs(10);
        let mut attempt = attempt(mock::config(Some(5_000)), MockInitializer::new(&script));

        while attempt.phase() != ConnectPhase::Authenticating {
            assert!(attempt.advance(false).unwrap().is_pending());
        }
        attempt.cancel();

        let script = script.lock();
        assert_eq!(script.abandoned, vec![1]);
        assert_eq!(script.unbinds, 1);
        assert_eq!(script.engines_dropped, 1);
    }

    #[test]
    fn test_cancel_while_initializing_detaches_worker() {
        let script = mock::script();
        let initializer = MockInitializer::new(&script).delay(Duration::from_millis(200));
        let mut attempt = attempt(mock::config(Some(5_000)), initializer);

        assert!(attempt.advance(false).unwrap().is_pending());
        assert_eq!(attempt.phase(), ConnectPhase::Initializing);

        let start = Instant::now();
        attempt.cancel();
        assert!(start.elapsed() < Duration::from_millis(100));

        // the engine produced after cancellation never reaches a caller
        std::thread::sleep(Duration::from_millis(400));
        let script = script.lock();
        assert_eq!(script.engines_dropped, 1);
        assert!(script.sent.is_empty());
        assert!(script.abandoned.is_empty());
        assert_eq!(script.unbinds, 0);
    }

    #[test]
    fn test_cancel_during_starttls_abandons_upgrade() {
        let script = mock::script();
        script.lock().start_tls_delay = Duration::from_secs(10);
        let mut config = mock::config(Some(5_000));
        config.connection.tls = TlsMode::StartTls;
        let mut attempt = attempt(config, MockInitializer::new(&script));

        while attempt.phase() != ConnectPhase::EncryptUpgrading {
            assert!(attempt.advance(false).unwrap().is_pending());
        }
        attempt.cancel();

        let script = script.lock();
        assert_eq!(
            script.sent,
            vec![Sent::Extended {
                oid: START_TLS_OID.into()
            }]
        );
        assert_eq!(script.abandoned, vec![1]);
        assert_eq!(script.unbinds, 1);
        assert_eq!(script.engines_dropped, 1);
    }

    #[test]
    fn test_advance_after_failure_is_invalid() {
        let script = mock::script();
        let mut initializer = MockInitializer::new(&script);
        initializer.fail = Some("unreachable".into());
        let mut attempt = attempt(mock::config(Some(1_000)), initializer);

        assert!(attempt.advance(true).is_err());
        assert!(matches!(
            attempt.advance(false),
            Err(Error::InvalidState(_))
        ));
    }
}
