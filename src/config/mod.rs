//! Configuration Module
//!
//! Two layers of configuration live here:
//! - the connection environment every connector is built from, merged from
//!   built-in defaults, the caller's attribute map, the connection URL query
//!   and explicit credentials (later layers win);
//! - the TOML file read by the `mqmx` binary, with `${VAR:-default}`
//!   substitution and `MQMX__SECTION__KEY` environment overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::transport::DestinationKind;

mod url;

pub use url::{parse_query, rebuild_query, ServiceUrl, SCHEME};


/// Destination kind, `Queue` or `Topic`
pub const DESTINATION_KIND: &str = "destination-kind";
/// Name of the request destination
pub const DESTINATION_NAME: &str = "destination-name";
pub const BROKER_USERNAME: &str = "broker-username";
pub const BROKER_PASSWORD: &str = "broker-password";
/// Reply wait timeout in milliseconds, 0 waits forever
pub const TIMEOUT_MS: &str = "timeout-ms";
pub const CLIENT_ID: &str = "client-id";
/// Delay between reconnect attempts in milliseconds
pub const RETRY_INTERVAL_MS: &str = "retry-interval-ms";

/// Keys consumed by mqmx; stripped from the URI handed to the transport.
pub const KNOWN_KEYS: [&str; 7] = [
    DESTINATION_KIND,
    DESTINATION_NAME,
    BROKER_USERNAME,
    BROKER_PASSWORD,
    TIMEOUT_MS,
    CLIENT_ID,
    RETRY_INTERVAL_MS,
];

pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 30_000;

/// Environment variables consulted by [`Credentials::from_env`].
pub const ENV_USERNAME: &str = "MQMX_BROKER_USERNAME";
pub const ENV_PASSWORD: &str = "MQMX_BROKER_PASSWORD";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
    /// Connection URL could not be parsed or names the wrong protocol
    MalformedUrl(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::MalformedUrl(msg) => write!(f, "Malformed URL: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Broker credentials
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Read `MQMX_BROKER_USERNAME` / `MQMX_BROKER_PASSWORD`.
    ///
    /// `None` unless the username is set; a missing password is empty.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var(ENV_USERNAME).ok()?;
        let password = std::env::var(ENV_PASSWORD).unwrap_or_default();
        Some(Self::new(username, password))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// What the caller hands a connector: free-form attributes plus optional
/// explicit credentials.
#[derive(Debug, Clone, Default)]
pub struct InitialEnvironment {
    pub attributes: BTreeMap<String, String>,
    pub credentials: Option<Credentials>,
}

impl InitialEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

fn default_destination_name() -> String {
    format!("mqmx.{}", uuid::Uuid::new_v4().simple())
}

/// Merged, validated connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionEnvironment {
    pub destination_kind: DestinationKind,
    pub destination_name: String,
    pub credentials: Option<Credentials>,
    pub receive_timeout: Duration,
    pub client_id: Option<String>,
    pub retry_interval: Duration,
}

impl Default for ConnectionEnvironment {
    fn default() -> Self {
        Self {
            destination_kind: DestinationKind::Topic,
            destination_name: default_destination_name(),
            credentials: None,
            receive_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            client_id: None,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
        }
    }
}

impl ConnectionEnvironment {
    /// Layer defaults < initial attributes < URL query < explicit credentials.
    pub fn build(initial: &InitialEnvironment, url: &ServiceUrl) -> Result<Self, ConfigError> {
        let mut merged = initial.attributes.clone();
        merged.extend(url.parameters());
        let mut env = Self::from_attributes(&merged)?;
        if let Some(credentials) = &initial.credentials {
            env.credentials = Some(credentials.clone());
        }
        Ok(env)
    }

    /// Apply `attributes` over the built-in defaults. Unknown keys are ignored;
    /// a password without a username is rejected.
    pub fn from_attributes(attributes: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut env = Self::default();

        if let Some(kind) = attributes.get(DESTINATION_KIND) {
            env.destination_kind = kind.parse()?;
        }
        if let Some(name) = attributes.get(DESTINATION_NAME) {
            if name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{} must not be empty",
                    DESTINATION_NAME
                )));
            }
            env.destination_name = name.clone();
        }
        if let Some(timeout) = attributes.get(TIMEOUT_MS) {
            env.receive_timeout = Duration::from_millis(parse_millis(TIMEOUT_MS, timeout)?);
        }
        if let Some(retry) = attributes.get(RETRY_INTERVAL_MS) {
            let millis = parse_millis(RETRY_INTERVAL_MS, retry)?;
            if millis == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than 0",
                    RETRY_INTERVAL_MS
                )));
            }
            env.retry_interval = Duration::from_millis(millis);
        }
        env.client_id = attributes
            .get(CLIENT_ID)
            .filter(|id| !id.is_empty())
            .cloned();
        match (attributes.get(BROKER_USERNAME), attributes.get(BROKER_PASSWORD)) {
            (Some(username), password) => {
                let password = password.cloned().unwrap_or_default();
                env.credentials = Some(Credentials::new(username.clone(), password));
            }
            (None, Some(_)) => {
                return Err(ConfigError::Validation(format!(
                    "{} requires {}",
                    BROKER_PASSWORD, BROKER_USERNAME
                )));
            }
            (None, None) => {}
        }

        Ok(env)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::Validation(format!(
            "{} must be a whole number of milliseconds, got '{}'",
            key, value
        ))
    })
}

/// Root configuration structure of the `mqmx` binary
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Connector settings shared by the client and the server
    pub connector: ConnectorConfig,
    /// Loopback demonstration settings
    pub demo: DemoConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Connector configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Connection URL (`service:mqmx:...`)
    #[serde(default = "default_url")]
    pub url: String,
    /// Initial attribute map, e.g. `destination-kind = "Queue"`
    pub attributes: BTreeMap<String, String>,
    /// Explicit broker credentials
    pub credentials: Option<Credentials>,
}

fn default_url() -> String {
    "service:mqmx:memory:///local".to_string()
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            attributes: BTreeMap::new(),
            credentials: None,
        }
    }
}

impl ConnectorConfig {
    /// Initial environment for connectors; falls back to credentials from
    /// the process environment.
    pub fn initial_environment(&self) -> InitialEnvironment {
        InitialEnvironment {
            attributes: self.attributes.clone(),
            credentials: self.credentials.clone().or_else(Credentials::from_env),
        }
    }
}

/// Loopback demonstration configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Stop and restart the in-memory broker to show resubscription
    pub restart_broker: bool,
    /// How long to wait for notifications to arrive
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
}

fn default_settle() -> Duration {
    Duration::from_millis(500)
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            restart_broker: false,
            settle: default_settle(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQMX__` prefix with double underscores for nesting:
    ///    - `MQMX__LOG__LEVEL=debug` overrides `log.level`
    ///    - `MQMX__CONNECTOR__URL=...` overrides `connector.url`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("connector.url", default_url())?
            .set_default("demo.restart_broker", false)?
            .set_default("demo.settle", "500ms")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQMX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown log level '{}'",
                    other
                )))
            }
        }

        ServiceUrl::parse(&self.connector.url)?;
        ConnectionEnvironment::from_attributes(&self.connector.attributes)?;

        Ok(())
    }
}
