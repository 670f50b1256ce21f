//! Configuration for the north client
//!
//! The host supplies six device fields; absent ones are reported as
//! [`ConfigError::MissingField`] and replaced with empty strings so the
//! client can still be constructed. Broker and retry settings carry
//! defaults and are normally left alone outside of tests.

use crate::auth::SigningAlgorithm;
use crate::protocol::topics::TopicBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Default IoT Core MQTT bridge
pub const DEFAULT_BROKER_URL: &str = "ssl://mqtt.googleapis.com:8883";

/// The bridge ignores the user name but MQTT requires one alongside a password
pub const DEFAULT_USERNAME: &str = "unused";

/// Regions the registry service is offered in
pub const KNOWN_REGIONS: [&str; 3] = ["us-central1", "europe-west1", "asia-east1"];

/// Primary data directory variable; certificates live in `$FOGLAMP_DATA/etc/certs/`
pub const DATA_DIR_ENV: &str = "FOGLAMP_DATA";
/// Secondary root directory variable; certificates live in `$FOGLAMP_ROOT/data/etc/certs/`
pub const ROOT_DIR_ENV: &str = "FOGLAMP_ROOT";
pub const FALLBACK_CERT_DIR: &str = "/usr/local/foglamp/data/etc/certs/";
pub const TRUST_ANCHOR_FILE: &str = "roots.pem";

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NorthConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// Device identity as supplied by the host. Every field is required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceSection {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub registry_id: Option<String>,
    pub device_id: Option<String>,
    /// Key name; the private key is read from `<key>.pem`
    pub key: Option<String>,
    /// JWT algorithm, "RS256" or "ES256"
    pub algorithm: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long `send` waits for the broker to acknowledge the last message
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_ms: u64,
    /// Explicit certificate directory, bypassing the environment lookup
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_delivery_timeout() -> u64 {
    10_000
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            username: default_username(),
            keep_alive_secs: default_keep_alive(),
            delivery_timeout_ms: default_delivery_timeout(),
            cert_dir: None,
        }
    }
}

/// Connect backoff and publish retry limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
    /// Total time spent waiting between connect attempts before giving up
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_ms: u64,
    /// Extra publish attempts after a disconnect during publish
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
}

fn default_initial_interval() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_max_interval() -> u64 {
    6_000
}

fn default_max_elapsed() -> u64 {
    900_000 // 15 minutes
}

fn default_publish_retries() -> u32 {
    3
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval(),
            max_elapsed_ms: default_max_elapsed(),
            publish_retries: default_publish_retries(),
        }
    }
}

impl RetrySection {
    /// Settings that would stall the backoff. They are clamped at runtime.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();
        if self.initial_interval_ms == 0 {
            problems.push(ConfigError::InvalidRetry {
                field: "initial_interval_ms",
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_interval_ms == 0 {
            problems.push(ConfigError::InvalidRetry {
                field: "max_interval_ms",
                message: "must be at least 1".to_string(),
            });
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            problems.push(ConfigError::InvalidRetry {
                field: "multiplier",
                message: format!("{} is below 1.0", self.multiplier),
            });
        }
        problems
    }
}

/// Configuration problems. None of these stop the client from being built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing {0} in configuration")]
    MissingField(&'static str),
    #[error("Unrecognised JWT algorithm '{0}', falling back to ES256")]
    UnknownAlgorithm(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid retry setting {field}: {message}")]
    InvalidRetry {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    /// Name of the missing field, if this is a missing-field report
    pub fn missing_field(&self) -> Option<&'static str> {
        match self {
            ConfigError::MissingField(name) => Some(name),
            _ => None,
        }
    }
}

impl NorthConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Every problem found in the configuration, in field order
    pub fn validate(&self) -> Vec<ConfigError> {
        let (_, mut problems) = self.device.resolve();
        if let Err(e) = self.broker.broker_address() {
            problems.push(e);
        }
        problems.extend(self.retry.validate());
        problems
    }
}

/// Resolved, host-independent device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
    pub device_id: String,
    pub key_name: String,
    pub algorithm: SigningAlgorithm,
}

impl DeviceIdentity {
    /// MQTT client identifier naming the device within its registry
    pub fn client_id(&self) -> String {
        TopicBuilder::build_client_id(
            &self.project_id,
            &self.region,
            &self.registry_id,
            &self.device_id,
        )
    }

    pub fn events_topic(&self) -> String {
        TopicBuilder::build_events_topic(&self.device_id)
    }

    pub fn errors_topic(&self) -> String {
        TopicBuilder::build_errors_topic(&self.device_id)
    }
}

impl DeviceSection {
    /// Build a section from the six host-supplied fields
    pub fn from_fields(
        device_id: &str,
        project_id: &str,
        region: &str,
        registry_id: &str,
        key: &str,
        algorithm: &str,
    ) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            region: Some(region.to_string()),
            registry_id: Some(registry_id.to_string()),
            device_id: Some(device_id.to_string()),
            key: Some(key.to_string()),
            algorithm: Some(algorithm.to_string()),
        }
    }

    /// Resolve the identity, reporting each missing field
    ///
    /// Missing fields resolve to empty strings; the derived client identifier
    /// then carries an empty segment and the broker will reject it.
    pub fn resolve(&self) -> (DeviceIdentity, Vec<ConfigError>) {
        let mut problems = Vec::new();
        let mut take = |value: &Option<String>, name: &'static str| match value {
            Some(v) => v.clone(),
            None => {
                problems.push(ConfigError::MissingField(name));
                String::new()
            }
        };

        let project_id = take(&self.project_id, "project_id");
        let region = take(&self.region, "region");
        let registry_id = take(&self.registry_id, "registry_id");
        let device_id = take(&self.device_id, "device_id");
        let key_name = take(&self.key, "key");
        let algorithm_name = take(&self.algorithm, "algorithm");

        if !region.is_empty() && !KNOWN_REGIONS.contains(&region.as_str()) {
            warn!(region = %region, "Region is not one of {:?}", KNOWN_REGIONS);
        }

        let algorithm = match SigningAlgorithm::parse(&algorithm_name) {
            Some(algorithm) => algorithm,
            None => {
                if !algorithm_name.is_empty() {
                    problems.push(ConfigError::UnknownAlgorithm(algorithm_name.clone()));
                }
                SigningAlgorithm::from_config(&algorithm_name)
            }
        };

        let identity = DeviceIdentity {
            project_id,
            region,
            registry_id,
            device_id,
            key_name,
            algorithm,
        };
        (identity, problems)
    }
}

/// Broker endpoint split out of the configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(broker_url: &str) -> Result<Self, ConfigError> {
        let url =
            Url::parse(broker_url).map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.into()))?;

        let tls = match url.scheme() {
            "ssl" | "mqtts" => true,
            "tcp" | "mqtt" => false,
            _ => return Err(ConfigError::InvalidBrokerUrl(broker_url.to_string())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl Default for BrokerAddress {
    /// The IoT Core bridge, used when the configured URL cannot be parsed
    fn default() -> Self {
        Self {
            host: "mqtt.googleapis.com".to_string(),
            port: 8883,
            tls: true,
        }
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

impl BrokerSection {
    pub fn broker_address(&self) -> Result<BrokerAddress, ConfigError> {
        BrokerAddress::parse(&self.url)
    }
}

/// Locations of the device private key and the TLS trust anchors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub directory: PathBuf,
    pub private_key: PathBuf,
    pub trust_store: PathBuf,
}

impl CertPaths {
    /// Resolve from the process environment
    pub fn resolve(cert_dir: Option<&Path>, key_name: &str) -> Self {
        Self::resolve_with(|name| std::env::var(name).ok(), cert_dir, key_name)
    }

    /// Resolve with an explicit environment lookup
    pub fn resolve_with<F>(lookup: F, cert_dir: Option<&Path>, key_name: &str) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let directory = match cert_dir {
            Some(dir) => dir.to_path_buf(),
            None => {
                if let Some(data) = lookup(DATA_DIR_ENV) {
                    Path::new(&data).join("etc/certs")
                } else if let Some(root) = lookup(ROOT_DIR_ENV) {
                    Path::new(&root).join("data/etc/certs")
                } else {
                    PathBuf::from(FALLBACK_CERT_DIR)
                }
            }
        };

        Self {
            private_key: directory.join(format!("{key_name}.pem")),
            trust_store: directory.join(TRUST_ANCHOR_FILE),
            directory,
        }
    }
}
