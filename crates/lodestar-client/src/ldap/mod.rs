//! LDAP transport built on the ldap3 crate
//!
//! Supports `ldap://`, `ldaps://` (TLS from the first byte) and StartTLS.
//! Both TLS variants are negotiated by ldap3 while connecting, so the
//! connection state machine skips its in-band upgrade stage for this
//! engine. Each connection gets its own current-thread tokio runtime, so
//! callers need not run inside one.

mod client;
mod types;

pub use client::Ldap3Engine;

use ldap3::{LdapConnAsync, LdapConnSettings};
use tracing::debug;

use lodestar_core::{ConnectionConfig, Error, Result, Stage, TlsMode};

use crate::engine::{ConnectionInitializer, ProtocolEngine};

/// Opens ldap3 connections
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Initializer;

impl ConnectionInitializer for Ldap3Initializer {
    fn initialize(&self, config: &ConnectionConfig) -> Result<Box<dyn ProtocolEngine>> {
        let mut settings = LdapConnSettings::new()
            .set_starttls(config.tls == TlsMode::StartTls)
            .set_no_tls_verify(config.skip_tls_verify);
        if let Some(timeout) = config.timeout() {
            settings = settings.set_conn_timeout(timeout);
        }

        debug!(url = %config.url, tls = ?config.tls, "Connecting to LDAP server");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (conn, ldap) = runtime
            .block_on(LdapConnAsync::with_settings(settings, &config.url))
            .map_err(|e| Error::Transport {
                stage: Stage::Initialize,
                message: format!("Failed to connect to LDAP server: {}", e),
            })?;

        Ok(Box::new(Ldap3Engine::spawn(runtime, conn, ldap)?))
    }
}
