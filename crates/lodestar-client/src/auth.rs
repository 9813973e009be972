//! Bind mechanisms and the bind exchange
//!
//! A [`Mechanism`] produces the credentials for each bind round. The
//! [`BindExchange`] drives it against a [`ProtocolEngine`]: send, read the
//! server's answer, feed any server challenge back, repeat until the server
//! reports success or failure.

use std::task::Poll;
use std::time::Instant;
use tracing::{debug, info, warn};

use lodestar_core::{BindConfig, BindMechanism, Error, MessageId, Result, Stage};

use crate::budget;
use crate::engine::{codes, BindRequest, LdapOutcome, ProtocolEngine, RawResult};

/// Mechanism name for a simple (DN + password) bind
pub const SIMPLE: &str = "SIMPLE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismStep {
    /// Send these credentials in the next bind request
    Response(Vec<u8>),
    /// Nothing more to send
    Complete,
    /// The mechanism gave up
    Failed(String),
}

/// Client side of an authentication mechanism
pub trait Mechanism: Send {
    /// `SIMPLE` or the SASL mechanism name
    fn name(&self) -> &str;

    /// DN sent with every bind request
    fn bind_dn(&self) -> &str {
        ""
    }

    /// Mechanisms needing several round trips (GSSAPI and friends) may run
    /// their exchange on a worker thread.
    fn is_multi_round(&self) -> bool {
        false
    }

    /// Next step given the server challenge; `None` on the first round
    fn step(&mut self, challenge: Option<&[u8]>) -> MechanismStep;
}

/// Simple bind; empty DN and password make it anonymous
#[derive(Debug, Clone)]
pub struct Simple {
    dn: String,
    password: String,
    sent: bool,
}

impl Simple {
    pub fn new(dn: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            password: password.into(),
            sent: false,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("", "")
    }
}

impl Mechanism for Simple {
    fn name(&self) -> &str {
        SIMPLE
    }

    fn bind_dn(&self) -> &str {
        &self.dn
    }

    fn step(&mut self, _challenge: Option<&[u8]>) -> MechanismStep {
        if self.sent {
            return MechanismStep::Complete;
        }
        self.sent = true;
        MechanismStep::Response(self.password.as_bytes().to_vec())
    }
}

/// SASL EXTERNAL: identity comes from the transport (client certificate,
/// peer credentials on `ldapi://`)
#[derive(Debug, Clone, Default)]
pub struct External {
    authz_id: Option<String>,
    sent: bool,
}

impl External {
    pub fn new(authz_id: Option<String>) -> Self {
        Self {
            authz_id,
            sent: false,
        }
    }
}

impl Mechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn step(&mut self, _challenge: Option<&[u8]>) -> MechanismStep {
        if self.sent {
            return MechanismStep::Complete;
        }
        self.sent = true;
        let authz = self.authz_id.as_deref().unwrap_or_default();
        MechanismStep::Response(authz.as_bytes().to_vec())
    }
}

/// Mechanism described by a bind configuration
pub fn mechanism_for(config: &BindConfig) -> Box<dyn Mechanism> {
    match config.mechanism {
        BindMechanism::Anonymous => Box::new(Simple::anonymous()),
        BindMechanism::Simple => Box::new(Simple::new(&config.bind_dn, &config.password)),
        BindMechanism::External => Box::new(External::new(config.authz_id.clone())),
    }
}

pub(crate) enum BindProgress {
    /// Another round was submitted under this handle
    Sent(MessageId),
    Done,
}

/// Bind handshake state for one connection attempt
pub(crate) struct BindExchange {
    mechanism: Box<dyn Mechanism>,
    rounds: u32,
}

impl BindExchange {
    pub fn new(mechanism: Box<dyn Mechanism>) -> Self {
        Self {
            mechanism,
            rounds: 0,
        }
    }

    pub fn is_multi_round(&self) -> bool {
        self.mechanism.is_multi_round()
    }

    pub fn mechanism_name(&self) -> &str {
        self.mechanism.name()
    }

    /// Submit the first bind request
    pub fn start(&mut self, engine: &mut dyn ProtocolEngine) -> Result<MessageId> {
        match self.mechanism.step(None) {
            MechanismStep::Response(credentials) => self.send(engine, Some(credentials)),
            MechanismStep::Complete => self.send(engine, None),
            MechanismStep::Failed(message) => Err(local_failure(message)),
        }
    }

    /// Consume the server's answer to the last round
    pub fn on_result(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        result: RawResult,
    ) -> Result<BindProgress> {
        let (outcome, server_credentials) = match result {
            RawResult::Bind {
                outcome,
                server_credentials,
            } => (outcome, server_credentials),
            other => {
                return Err(Error::InvalidState(format!(
                    "unexpected {} response to bind",
                    other.kind()
                )))
            }
        };

        match outcome.code {
            codes::SUCCESS => {
                // a final server token still has to be accepted
                if let Some(token) = server_credentials.filter(|_| self.is_multi_round()) {
                    if let MechanismStep::Failed(message) = self.mechanism.step(Some(&token)) {
                        return Err(local_failure(message));
                    }
                }
                info!(
                    mechanism = %self.mechanism.name(),
                    rounds = self.rounds,
                    "Bind succeeded"
                );
                Ok(BindProgress::Done)
            }
            codes::SASL_BIND_IN_PROGRESS => {
                match self.mechanism.step(server_credentials.as_deref()) {
                    MechanismStep::Response(credentials) => {
                        debug!(round = self.rounds + 1, "Continuing bind exchange");
                        self.send(engine, Some(credentials)).map(BindProgress::Sent)
                    }
                    MechanismStep::Complete => Err(local_failure(
                        "mechanism finished before the server".to_string(),
                    )),
                    MechanismStep::Failed(message) => Err(local_failure(message)),
                }
            }
            _ => Err(rejected(outcome)),
        }
    }

    /// Run the whole exchange on the calling thread.
    ///
    /// Used when authentication is delegated to a worker. Gives up once
    /// `deadline` has passed.
    pub fn run_blocking(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut handle = self.start(engine)?;
        loop {
            match engine
                .poll_result(handle, budget::until(deadline))
                .map_err(|e| e.with_stage(Stage::Authenticate))?
            {
                Poll::Ready(result) => match self.on_result(engine, result)? {
                    BindProgress::Sent(next) => handle = next,
                    BindProgress::Done => return Ok(()),
                },
                Poll::Pending => {
                    if budget::until(deadline).map_or(false, |left| left.is_zero()) {
                        let _ = engine.abandon(handle);
                        return Err(Error::Timeout {
                            stage: Stage::Authenticate,
                        });
                    }
                }
            }
        }
    }

    fn send(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        credentials: Option<Vec<u8>>,
    ) -> Result<MessageId> {
        self.rounds += 1;
        let request = BindRequest {
            dn: self.mechanism.bind_dn().to_string(),
            mechanism: self.mechanism.name().to_string(),
            credentials,
        };
        engine
            .send_bind(&request)
            .map_err(|e| e.with_stage(Stage::Authenticate))
    }
}

fn local_failure(message: String) -> Error {
    warn!(%message, "Bind mechanism failed");
    Error::AuthenticationFailed {
        code: codes::LOCAL_ERROR,
        message,
    }
}

fn rejected(outcome: LdapOutcome) -> Error {
    warn!(code = outcome.code, message = %outcome.message, "Bind rejected");
    Error::AuthenticationFailed {
        code: outcome.code,
        message: outcome.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_sends_password_once() {
        let mut simple = Simple::new("cn=admin,dc=example,dc=com", "secret");
        assert_eq!(simple.bind_dn(), "cn=admin,dc=example,dc=com");
        assert_eq!(simple.step(None), MechanismStep::Response(b"secret".to_vec()));
        assert_eq!(simple.step(None), MechanismStep::Complete);
    }

    #[test]
    fn test_anonymous_is_empty_simple_bind() {
        let mut anonymous = Simple::anonymous();
        assert_eq!(anonymous.name(), SIMPLE);
        assert_eq!(anonymous.bind_dn(), "");
        assert_eq!(anonymous.step(None), MechanismStep::Response(Vec::new()));
    }

    #[test]
    fn test_mechanism_for_config() {
        let mut config = BindConfig::default();
        assert_eq!(mechanism_for(&config).name(), SIMPLE);

        config.mechanism = BindMechanism::External;
        config.authz_id = Some("dn:cn=svc".into());
        let mut external = mechanism_for(&config);
        assert_eq!(external.name(), "EXTERNAL");
        assert_eq!(external.step(None), MechanismStep::Response(b"dn:cn=svc".to_vec()));
    }
}
