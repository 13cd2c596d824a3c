//! Broker connection settings and the static queue configuration.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use tracing::debug;

use crate::errors::ConfigError;
use crate::queue::QueueConfig;
use crate::rate_limit::RateLimit;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_USER: &str = "postgres";
const DEFAULT_DATABASE: &str = "postgres";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the shared broker lives. Resolved once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database user
    pub username: String,
    /// Database name
    pub database: String,
    /// Optional password
    pub password: Option<String>,
    /// Upper bound of the shared connection pool
    pub max_connections: u32,
    /// How long to wait for a free pooled connection
    pub acquire_timeout: Duration,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: DEFAULT_USER.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            password: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl BrokerConfig {
    /// Read the `QUEUE_BROKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let port = match var("QUEUE_BROKER_PORT") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "QUEUE_BROKER_PORT",
                value,
            })?,
            None => defaults.port,
        };
        let max_connections = match var("QUEUE_BROKER_MAX_CONNECTIONS") {
            Some(value) => match value.parse::<u32>() {
                Ok(max) if max > 0 => max,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "QUEUE_BROKER_MAX_CONNECTIONS",
                        value,
                    });
                }
            },
            None => defaults.max_connections,
        };

        Ok(Self {
            host: var("QUEUE_BROKER_HOST").unwrap_or(defaults.host),
            port,
            username: var("QUEUE_BROKER_USER").unwrap_or(defaults.username),
            database: var("QUEUE_BROKER_DATABASE").unwrap_or(defaults.database),
            password: var("QUEUE_BROKER_PASSWORD").filter(|password| password != "null"),
            max_connections,
            acquire_timeout: defaults.acquire_timeout,
        })
    }

    /// Connection options for `sqlx`.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.database);

        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

/// On-disk layout of the queue configuration file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    queue: Vec<QueueConfig>,
}

/// The queues used when no configuration file exists.
pub fn default_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new("default", 2),
        QueueConfig::new("emails", 2).rate_limit(RateLimit::new(10, Duration::from_secs(60))),
    ]
}

/// Parse queue configuration from TOML text.
pub fn parse_queues(source: &str) -> Result<Vec<QueueConfig>, ConfigError> {
    let file: QueueFile = toml::from_str(source)?;
    Ok(file.queue)
}

/// Load the queue configuration file, falling back to [`default_queues`] if
/// it does not exist.
pub fn load_queues(path: &Path) -> Result<Vec<QueueConfig>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(source) => parse_queues(&source),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Queue configuration not found, using defaults");
            Ok(default_queues())
        }
        Err(error) => Err(error.into()),
    }
}

/// Render queues as a `[[queue]]` TOML document.
pub fn render_queues(queues: &[QueueConfig]) -> Result<String, ConfigError> {
    let file = QueueFile {
        queue: queues.to_vec(),
    };
    Ok(toml::to_string(&file)?)
}

/// Append a queue to the configuration file.
///
/// Existing content, comments included, is left untouched. A missing file is
/// created with the default queues followed by the new one.
pub fn append_queue(path: &Path, queue: &QueueConfig) -> Result<(), ConfigError> {
    let existing = match fs::read_to_string(path) {
        Ok(source) => Some(parse_queues(&source)?),
        Err(error) if error.kind() == io::ErrorKind::NotFound => None,
        Err(error) => return Err(error.into()),
    };
    let known = existing.clone().unwrap_or_else(default_queues);
    if known.iter().any(|current| current.name == queue.name) {
        return Err(ConfigError::DuplicateQueue(queue.name.clone()));
    }

    let Some(existing) = existing else {
        let mut queues = known;
        queues.push(queue.clone());
        fs::write(path, render_queues(&queues)?)?;
        return Ok(());
    };

    let rendered = render_queues(std::slice::from_ref(queue))?;
    let mut file = fs::OpenOptions::new().append(true).open(path)?;
    if !existing.is_empty() {
        file.write_all(b"\n")?;
    }
    file.write_all(rendered.as_bytes())?;
    Ok(())
}
