//! Runtime configuration for vertex-relay.
//!
//! Every option can be given on the command line or through the environment
//! (a `.env` file in the working directory is loaded first when present).
//! Required values are checked in [`Config::from_cli`]; a missing one is fatal.

use std::fmt;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::auth::TOKEN_LIFETIME;

/// Google OAuth2 token endpoint used for the JWT-bearer grant.
pub const DEFAULT_TOKEN_URL: &str = "https://www.googleapis.com/oauth2/v4/token";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required configuration value not set: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Command-line arguments.
#[derive(Parser, Clone)]
#[command(name = "vertex-relay", about = "Quota-metered streaming relay for Vertex AI")]
pub struct Cli {
    /// HTTP listen port.
    #[arg(long, env = "APP_PORT")]
    pub port: Option<u16>,

    /// Google Cloud project hosting the model.
    #[arg(long, env = "GC_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Service account email (assertion issuer).
    #[arg(long, env = "GC_CLIENT_EMAIL")]
    pub client_email: Option<String>,

    /// Service account private key id (assertion `kid` header).
    #[arg(long, env = "GC_PRIVATE_KEY_ID", hide_env_values = true)]
    pub private_key_id: Option<String>,

    /// Service account RSA private key, PEM encoded.
    #[arg(long, env = "GC_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Vertex AI region.
    #[arg(long, env = "GC_REGION", default_value = "us-east5")]
    pub region: String,

    /// Model served by the relay.
    #[arg(long, env = "GC_MODEL", default_value = "claude-3-5-sonnet@20240620")]
    pub model: String,

    /// Model publisher path segment.
    #[arg(long, env = "GC_PUBLISHER", default_value = "anthropic")]
    pub publisher: String,

    /// Overrides `https://{region}-aiplatform.googleapis.com`.
    #[arg(long, env = "UPSTREAM_BASE_URL")]
    pub upstream_base_url: Option<String>,

    /// OAuth2 token endpoint.
    #[arg(long, env = "TOKEN_URL", default_value = DEFAULT_TOKEN_URL)]
    pub token_url: String,

    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    #[arg(long, env = "DB_PORT")]
    pub db_port: Option<u16>,

    #[arg(long, env = "DB_USER")]
    pub db_user: Option<String>,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,

    #[arg(long, env = "DB_NAME")]
    pub db_name: Option<String>,

    /// Upper bound on open pool connections.
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 25)]
    pub db_max_connections: u32,

    /// Pooled connections are closed after this many seconds.
    #[arg(long, env = "DB_MAX_LIFETIME_SECS", default_value_t = 300)]
    pub db_max_lifetime_secs: u64,

    /// Largest accepted request body in bytes.
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Deadline for the upstream response headers.
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 60)]
    pub upstream_timeout_secs: u64,

    /// Longest allowed gap between two upstream body chunks.
    #[arg(long, env = "UPSTREAM_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub upstream_idle_timeout_secs: u64,

    /// Refresh the bearer token when fewer than this many seconds remain.
    #[arg(long, env = "TOKEN_REFRESH_MARGIN_SECS", default_value_t = 300)]
    pub token_refresh_margin_secs: u64,

    /// Deadline for reading a client's request body.
    #[arg(long, env = "BODY_READ_TIMEOUT_SECS", default_value_t = 15)]
    pub body_read_timeout_secs: u64,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl fmt::Debug for Cli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cli")
            .field("port", &self.port)
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("model", &self.model)
            .field("publisher", &self.publisher)
            .field("upstream_base_url", &self.upstream_base_url)
            .field("token_url", &self.token_url)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_user", &self.db_user)
            .field("db_password", &self.db_password.as_ref().map(|_| "<redacted>"))
            .field("db_name", &self.db_name)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_max_lifetime_secs", &self.db_max_lifetime_secs)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("upstream_timeout_secs", &self.upstream_timeout_secs)
            .field("upstream_idle_timeout_secs", &self.upstream_idle_timeout_secs)
            .field("token_refresh_margin_secs", &self.token_refresh_margin_secs)
            .field("body_read_timeout_secs", &self.body_read_timeout_secs)
            .field("verbose", &self.verbose)
            .field("log_json", &self.log_json)
            .finish()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub credentials: CredentialConfig,
    pub database: DatabaseConfig,
}

/// Inbound HTTP settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,

    /// Request bodies above this size are rejected with 413.
    pub max_body_bytes: usize,

    /// Deadline for receiving a client's whole request body.
    pub body_read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_body_bytes: 10 * 1024 * 1024,
            body_read_timeout: Duration::from_secs(15),
        }
    }
}

/// Where and how requests are forwarded.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub project_id: String,
    pub region: String,
    pub publisher: String,
    pub model: String,

    /// Replaces the regional host when set.
    pub base_url: Option<String>,

    pub response_timeout: Duration,

    pub idle_timeout: Duration,
}

/// Service account credential trio plus token lifecycle knobs.
#[derive(Clone)]
pub struct CredentialConfig {
    pub client_email: String,
    pub private_key_id: String,
    pub private_key_pem: String,
    pub token_url: String,
    pub refresh_margin: Duration,
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("private_key_pem", &"<redacted>")
            .field("token_url", &self.token_url)
            .field("refresh_margin", &self.refresh_margin)
            .finish()
    }
}

/// Quota ledger connection settings.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
    pub max_lifetime: Duration,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("max_connections", &self.max_connections)
            .field("max_lifetime", &self.max_lifetime)
            .finish()
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn required_port(value: Option<u16>, name: &'static str) -> Result<u16, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid {
            name,
            reason: "port must be non-zero".to_string(),
        }),
        Some(port) => Ok(port),
        None => Err(ConfigError::Missing(name)),
    }
}

fn nonzero_secs(secs: u64, name: &'static str) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

/// Env files usually carry the PEM on one line with literal `\n` escapes.
fn normalize_pem(raw: &str) -> String {
    raw.trim().trim_matches('"').replace("\\n", "\n")
}

impl Config {
    /// Validate parsed arguments into a complete configuration.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let port = required_port(cli.port, "APP_PORT")?;
        let project_id = required(cli.project_id, "GC_PROJECT_ID")?;
        let client_email = required(cli.client_email, "GC_CLIENT_EMAIL")?;
        let private_key_id = required(cli.private_key_id, "GC_PRIVATE_KEY_ID")?;
        let private_key = required(cli.private_key, "GC_PRIVATE_KEY")?;
        let db_user = required(cli.db_user, "DB_USER")?;
        let db_password = required(cli.db_password, "DB_PASSWORD")?;
        let db_name = required(cli.db_name, "DB_NAME")?;
        let db_port = required_port(cli.db_port, "DB_PORT")?;

        if cli.max_body_bytes == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_BODY_BYTES",
                reason: "must be greater than zero".to_string(),
            });
        }
        if cli.db_max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "DB_MAX_CONNECTIONS",
                reason: "must be greater than zero".to_string(),
            });
        }
        let response_timeout = nonzero_secs(cli.upstream_timeout_secs, "UPSTREAM_TIMEOUT_SECS")?;
        let idle_timeout =
            nonzero_secs(cli.upstream_idle_timeout_secs, "UPSTREAM_IDLE_TIMEOUT_SECS")?;
        let body_read_timeout = nonzero_secs(cli.body_read_timeout_secs, "BODY_READ_TIMEOUT_SECS")?;

        let refresh_margin = Duration::from_secs(cli.token_refresh_margin_secs);
        if refresh_margin >= TOKEN_LIFETIME {
            return Err(ConfigError::Invalid {
                name: "TOKEN_REFRESH_MARGIN_SECS",
                reason: format!("must be less than {}", TOKEN_LIFETIME.as_secs()),
            });
        }

        Ok(Self {
            server: ServerConfig {
                port,
                max_body_bytes: cli.max_body_bytes,
                body_read_timeout,
            },
            upstream: UpstreamConfig {
                project_id,
                region: cli.region,
                publisher: cli.publisher,
                model: cli.model,
                base_url: cli.upstream_base_url.filter(|u| !u.is_empty()),
                response_timeout,
                idle_timeout,
            },
            credentials: CredentialConfig {
                client_email,
                private_key_id,
                private_key_pem: normalize_pem(&private_key),
                token_url: cli.token_url,
                refresh_margin,
            },
            database: DatabaseConfig {
                host: cli.db_host,
                port: db_port,
                user: db_user,
                password: db_password,
                name: db_name,
                max_connections: cli.db_max_connections,
                max_lifetime: Duration::from_secs(cli.db_max_lifetime_secs),
            },
        })
    }

    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.server.port)
    }
}
