//! Broker and IPC configuration.
//!
//! Settings are loaded once at startup: the `key = value` file is parsed,
//! layered under `TRANSFER_AUDIT_*` environment overrides, and the broker
//! host from the DSN is resolved to a literal address. The worker may lose
//! name resolution later (chroot, sandboxing), so nothing after load ever
//! resolves a hostname again.

mod conf_file;

pub use conf_file::{parse_bool, parse_integer, ConfFile, Exhausted, INITIAL_CAPACITY, MAX_CAPACITY};

use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lapin::uri::{AMQPScheme, AMQPUri};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Configuration file used when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/ega/mq.conf";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TRANSFER_AUDIT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TRANSFER_AUDIT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TRANSFER_AUDIT_LOG";

/// Directory holding the per-worker IPC queues.
pub const DEFAULT_IPC_KEY_PREFIX: &str = "/tmp/transfer-audit";
pub const DEFAULT_ATTEMPTS: i64 = 10;
/// Seconds between publish attempts.
pub const DEFAULT_RETRY_DELAY: i64 = 10;
/// Seconds; 0 disables heartbeats.
pub const DEFAULT_HEARTBEAT: i64 = 0;

/// Errors raised while loading configuration. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config file needs more than {limit} bytes of option storage")]
    TooLarge { limit: usize },

    #[error("Config layering failed: {0}")]
    Layer(#[from] ::config::ConfigError),

    #[error("Invalid connection DSN: {0}")]
    Dsn(String),

    #[error("Cannot resolve broker host '{host}': {reason}")]
    Resolve { host: String, reason: String },

    #[error("Missing required option '{0}'")]
    Missing(&'static str),

    #[error("Invalid option '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Options as they come out of the layered sources, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawSettings {
    connection: Option<String>,
    exchange: Option<String>,
    routing_key: Option<String>,
    connection_attempts: i64,
    retry_delay: i64,
    heartbeat: i64,
    enable_ssl: bool,
    verify_peer: bool,
    verify_hostname: bool,
    cacert: Option<String>,
    ipc_key_prefix: String,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            connection: None,
            exchange: None,
            routing_key: None,
            connection_attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            heartbeat: DEFAULT_HEARTBEAT,
            enable_ssl: false,
            verify_peer: true,
            verify_hostname: true,
            cacert: None,
            ipc_key_prefix: DEFAULT_IPC_KEY_PREFIX.to_string(),
        }
    }
}

/// Everything the broker client needs to reach and use the broker.
///
/// Immutable once loaded.
#[derive(Clone)]
pub struct ConnectionParams {
    /// Host as written in the DSN; kept for logging only.
    pub host: String,
    /// Address the host resolved to at load time.
    pub ip: IpAddr,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub ssl: bool,
    pub verify_peer: bool,
    pub verify_hostname: bool,
    pub cacert: Option<PathBuf>,
    /// Heartbeat interval in seconds, 0 to disable.
    pub heartbeat: u16,
    /// Publish attempts per record, at least 1.
    pub attempts: u32,
    pub retry_delay: Duration,
    pub exchange: String,
    pub routing_key: String,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .field("verify_peer", &self.verify_peer)
            .field("verify_hostname", &self.verify_hostname)
            .field("cacert", &self.cacert)
            .field("heartbeat", &self.heartbeat)
            .field("attempts", &self.attempts)
            .field("retry_delay", &self.retry_delay)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

impl ConnectionParams {
    /// Parameters for tests and local tooling: plain AMQP on loopback.
    pub fn for_test() -> Self {
        Self {
            host: "localhost".to_string(),
            ip: IpAddr::from([127, 0, 0, 1]),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            ssl: false,
            verify_peer: true,
            verify_hostname: true,
            cacert: None,
            heartbeat: 0,
            attempts: 1,
            retry_delay: Duration::ZERO,
            exchange: "audit".to_string(),
            routing_key: "files".to_string(),
        }
    }
}

/// Loaded configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Where the file part of the configuration came from.
    pub source: String,
    pub connection: ConnectionParams,
    /// Directory in which IPC queues are created.
    pub ipc_key_prefix: PathBuf,
}

impl Settings {
    /// Load configuration from file and environment.
    ///
    /// File path priority: `path` argument, then `CONFIG_ENV_VAR`, then
    /// `DEFAULT_CONFIG_FILE`. Environment variables prefixed with
    /// `CONFIG_ENV_PREFIX` override file values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var(CONFIG_ENV_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE)),
        };

        info!(path = %path.display(), "Loading configuration");
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let file = ConfFile::parse(&path.to_string_lossy(), &text)?;
        Self::from_conf_file(file)
    }

    /// Layer environment overrides on top of a parsed file and resolve.
    pub fn from_conf_file(file: ConfFile) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment};

        let source = file.origin().to_string();
        let raw: RawSettings = ConfigLib::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Self::resolve(source, raw)
    }

    fn resolve(source: String, raw: RawSettings) -> Result<Self> {
        let dsn = raw
            .connection
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("connection"))?;
        let exchange = raw
            .exchange
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("exchange"))?;
        let routing_key = raw
            .routing_key
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("routing_key"))?;

        let attempts = u32::try_from(raw.connection_attempts)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| ConfigError::Invalid {
                key: "connection_attempts",
                reason: format!("{} is not a positive count", raw.connection_attempts),
            })?;
        let retry_delay = u64::try_from(raw.retry_delay)
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid {
                key: "retry_delay",
                reason: format!("{} is negative", raw.retry_delay),
            })?;
        let heartbeat = u16::try_from(raw.heartbeat).map_err(|_| ConfigError::Invalid {
            key: "heartbeat",
            reason: format!("{} is outside 0..=65535", raw.heartbeat),
        })?;

        let uri: AMQPUri = dsn.parse().map_err(ConfigError::Dsn)?;
        let host = uri.authority.host.clone();
        let port = uri.authority.port;
        let ip = resolve_host(&host, port)?;
        let ssl = matches!(uri.scheme, AMQPScheme::AMQPS) || raw.enable_ssl;

        if !ssl && raw.cacert.is_some() {
            warn!("cacert is set but TLS is disabled, ignoring it");
        }

        let connection = ConnectionParams {
            host,
            ip,
            port,
            vhost: uri.vhost,
            username: uri.authority.userinfo.username,
            password: uri.authority.userinfo.password,
            ssl,
            verify_peer: raw.verify_peer,
            verify_hostname: raw.verify_hostname,
            cacert: raw.cacert.filter(|s| !s.is_empty()).map(PathBuf::from),
            heartbeat,
            attempts,
            retry_delay,
            exchange,
            routing_key,
        };

        debug!(?connection, "Configuration resolved");

        Ok(Self {
            source,
            connection,
            ipc_key_prefix: PathBuf::from(raw.ipc_key_prefix),
        })
    }
}

/// Resolve `host` once to a literal address.
fn resolve_host(host: &str, port: u16) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ConfigError::Resolve {
            host: host.to_string(),
            reason: "no addresses returned".to_string(),
        })
}
