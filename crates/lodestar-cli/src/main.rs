//! Lodestar - LDAP directory client
//!
//! Command-line front end over `lodestar-client`.

mod commands;
mod utils;

use clap::{Parser, Subcommand, ValueEnum};
use lodestar_client::{nonblocking, Ldap3Initializer};
use lodestar_core::{BindMechanism, ClientConfig, LoggingConfig, TlsMode};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::CommandContext;

#[derive(Parser)]
#[command(name = "lodestar")]
#[command(author = "Lodestar Team")]
#[command(version = lodestar_core::VERSION)]
#[command(about = "LDAP directory client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Server URL (ldap://, ldaps:// or ldapi://)
    #[arg(short = 'H', long, global = true, env = "LODESTAR_URL")]
    url: Option<String>,

    /// Bind DN for a simple bind
    #[arg(short = 'D', long, global = true, env = "LODESTAR_BIND_DN")]
    bind_dn: Option<String>,

    /// Bind password
    #[arg(short = 'w', long, global = true, env = "LODESTAR_BIND_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Authenticate with SASL EXTERNAL
    #[arg(long, global = true, conflicts_with = "bind_dn")]
    external: bool,

    /// Upgrade the connection with StartTLS before binding
    #[arg(short = 'Z', long, global = true)]
    starttls: bool,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Timeout for connecting and for each operation, in milliseconds
    #[arg(long, global = true, env = "LODESTAR_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LODESTAR_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the identity the connection is bound as
    Whoami,

    /// Search the directory
    Search {
        /// Search base DN
        #[arg(short, long)]
        base: String,

        /// Search filter
        #[arg(default_value = "(objectClass=*)")]
        filter: String,

        /// Attributes to return (all user attributes when empty)
        attributes: Vec<String>,

        /// Search scope (base, one, sub)
        #[arg(short, long, default_value = "sub")]
        scope: String,

        /// Maximum number of entries the server should return
        #[arg(long, default_value_t = 0)]
        size_limit: i32,

        /// Server-side time limit in seconds
        #[arg(long, default_value_t = 0)]
        time_limit: i32,

        /// Request results in pages of this size
        #[arg(long)]
        page_size: Option<i32>,
    },

    /// Create an entry from attr=value pairs
    Add {
        /// DN of the new entry
        dn: String,

        /// Attribute values, e.g. objectClass=person cn=Alice
        #[arg(required = true)]
        attributes: Vec<String>,
    },

    /// Change attributes of an existing entry
    Modify {
        /// DN of the entry
        dn: String,

        /// Add a value (attr=value)
        #[arg(long = "add", value_name = "ATTR=VALUE")]
        add: Vec<String>,

        /// Remove a value (attr=value) or a whole attribute (attr)
        #[arg(long = "delete", value_name = "ATTR[=VALUE]")]
        delete: Vec<String>,

        /// Replace all values of an attribute (attr=value, repeatable)
        #[arg(long = "replace", value_name = "ATTR=VALUE")]
        replace: Vec<String>,
    },

    /// Delete an entry
    Delete {
        /// DN of the entry
        dn: String,
    },

    /// Rename or move an entry
    Rename {
        /// DN of the entry
        dn: String,

        /// New relative DN, e.g. cn=Bob
        new_rdn: String,

        /// Move the entry under this parent
        #[arg(long)]
        new_superior: Option<String>,

        /// Keep the old RDN value as an attribute
        #[arg(long)]
        keep_old_rdn: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Load or create config
    let mut config = if let Some(config_path) = &cli.config {
        ClientConfig::from_file(config_path)?
    } else {
        ClientConfig::from_env()
    };

    apply_overrides(&mut config, &cli);
    init_logging(&config.logging);
    config.validate()?;

    debug!(url = %config.connection.url, mechanism = ?config.bind.mechanism, "Connecting");
    let mut connection = nonblocking::connect(config.clone(), Arc::new(Ldap3Initializer)).await?;

    let ctx = CommandContext {
        timeout: config.connection.timeout(),
        config,
        output_format: cli.output,
        quiet: cli.quiet,
    };

    let outcome = match cli.command {
        Commands::Whoami => commands::whoami::execute(&ctx, &mut connection).await,
        Commands::Search {
            base,
            filter,
            attributes,
            scope,
            size_limit,
            time_limit,
            page_size,
        } => {
            let opts = commands::search::SearchOptions {
                base,
                filter,
                attributes,
                scope,
                size_limit,
                time_limit,
                page_size,
            };
            commands::search::execute(&ctx, &mut connection, opts).await
        }
        Commands::Add { dn, attributes } => {
            commands::add::execute(&ctx, &mut connection, &dn, &attributes).await
        }
        Commands::Modify {
            dn,
            add,
            delete,
            replace,
        } => {
            let opts = commands::modify::ModifyOptions {
                add,
                delete,
                replace,
            };
            commands::modify::execute(&ctx, &mut connection, &dn, opts).await
        }
        Commands::Delete { dn } => commands::delete::execute(&ctx, &mut connection, &dn).await,
        Commands::Rename {
            dn,
            new_rdn,
            new_superior,
            keep_old_rdn,
        } => {
            commands::rename::execute(
                &ctx,
                &mut connection,
                &dn,
                &new_rdn,
                new_superior.as_deref(),
                !keep_old_rdn,
            )
            .await
        }
    };

    if let Err(e) = connection.close() {
        warn!(error = %e, "Failed to close connection cleanly");
    }

    outcome
}

/// Logs go to stderr so that command output stays parseable
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

/// Command-line flags win over the config file and the environment
fn apply_overrides(config: &mut ClientConfig, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(url) = &cli.url {
        config.connection.url = url.clone();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.connection.timeout_ms = Some(timeout_ms);
    }
    if cli.starttls {
        config.connection.tls = TlsMode::StartTls;
    }
    if cli.insecure {
        config.connection.skip_tls_verify = true;
    }
    if let Some(bind_dn) = &cli.bind_dn {
        config.bind.bind_dn = bind_dn.clone();
        config.bind.mechanism = BindMechanism::Simple;
    }
    if let Some(password) = &cli.password {
        config.bind.password = password.clone();
    }
    if cli.external {
        config.bind.mechanism = BindMechanism::External;
    }
}
