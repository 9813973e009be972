//! Configuration for Lodestar
//!
//! Configuration is an explicit value threaded through connection
//! construction; there are no process-wide toggles.
//!
//! Example config:
//! ```toml
//! [connection]
//! url = "ldap://ldap.example.com:389"
//! tls = "start_tls"
//! timeout_ms = 5000
//!
//! [bind]
//! mechanism = "simple"
//! bind_dn = "cn=admin,dc=example,dc=com"
//! password = "secret"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("LODESTAR_URL") {
            config.connection.url = url;
        }
        if let Ok(timeout) = std::env::var("LODESTAR_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                config.connection.timeout_ms = Some(ms);
            }
        }
        if std::env::var("LODESTAR_STARTTLS").map(|v| v == "true").unwrap_or(false) {
            config.connection.tls = TlsMode::StartTls;
        }
        if let Ok(dn) = std::env::var("LODESTAR_BIND_DN") {
            config.bind.bind_dn = dn;
            config.bind.mechanism = BindMechanism::Simple;
        }
        if let Ok(password) = std::env::var("LODESTAR_BIND_PASSWORD") {
            config.bind.password = password;
        }
        if let Ok(mechanism) = std::env::var("LODESTAR_BIND_MECHANISM") {
            if let Some(m) = BindMechanism::parse(&mechanism) {
                config.bind.mechanism = m;
            }
        }
        if let Ok(level) = std::env::var("LODESTAR_LOG_LEVEL") {
            config.logging.level = level;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.bind.validate()
    }
}

/// Transport encryption requested for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain transport, or TLS from the first byte when the URL is `ldaps://`
    #[default]
    None,
    /// Upgrade a plain connection with StartTLS before binding
    StartTls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server URL (`ldap://`, `ldaps://` or `ldapi://`)
    pub url: String,

    #[serde(default)]
    pub tls: TlsMode,

    /// Skip TLS certificate verification (not recommended for production)
    #[serde(default)]
    pub skip_tls_verify: bool,

    /// Budget for the whole connection attempt; `None` waits forever
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: Option<u64>,

    /// Upper bound of a single wait in non-blocking mode
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Force (or forbid) running the bind exchange on a worker thread.
    /// Unset picks the platform default.
    #[serde(default)]
    pub auth_in_worker: Option<bool>,
}

fn default_timeout_ms() -> Option<u64> {
    Some(10_000)
}

fn default_poll_interval_ms() -> u64 {
    10
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ldap://localhost:389".to_string(),
            tls: TlsMode::default(),
            skip_tls_verify: false,
            timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            auth_in_worker: None,
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn parsed_url(&self) -> Result<Url> {
        Url::parse(&self.url).map_err(|e| Error::Config(format!("Invalid server URL: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::Config("Server URL is required".into()));
        }

        let url = self.parsed_url()?;
        match url.scheme() {
            "ldap" | "ldapi" => {}
            "ldaps" => {
                if self.tls == TlsMode::StartTls {
                    return Err(Error::Config(
                        "StartTLS cannot be combined with an ldaps:// URL".into(),
                    ));
                }
            }
            other => {
                return Err(Error::Config(format!(
                    "Unsupported URL scheme: {} (expected ldap, ldaps or ldapi)",
                    other
                )));
            }
        }

        if self.poll_interval_ms == 0 {
            return Err(Error::Config("Poll interval must be greater than zero".into()));
        }

        Ok(())
    }
}

/// Authentication mechanism used for the bind handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BindMechanism {
    /// Simple bind with empty credentials
    #[default]
    Anonymous,
    /// Simple bind with DN and password
    Simple,
    /// SASL EXTERNAL (credentials come from the transport, e.g. a client certificate)
    External,
}

impl BindMechanism {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anonymous" | "none" => Some(Self::Anonymous),
            "simple" => Some(Self::Simple),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindConfig {
    #[serde(default)]
    pub mechanism: BindMechanism,

    /// Bind DN (simple bind)
    #[serde(default)]
    pub bind_dn: String,

    /// Bind password (simple bind)
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Authorization identity (SASL EXTERNAL)
    #[serde(default)]
    pub authz_id: Option<String>,
}

impl BindConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mechanism == BindMechanism::Simple {
            if self.bind_dn.is_empty() {
                return Err(Error::Config("Simple bind requires a bind DN".into()));
            }
            // RFC 4513 unauthenticated bind: DN without password
            if self.password.is_empty() {
                return Err(Error::Config("Simple bind requires a password".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
