//! Error taxonomy for the north client
//!
//! Component errors are logged with context and converted to counts or
//! booleans at the public boundary of [`crate::client::NorthClient`]. Nothing
//! in here is expected to reach the host process as a panic.

use crate::auth::CredentialError;
use crate::config::ConfigError;
use crate::delivery::DeliveryToken;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// CONNACK refusal reasons reported by the broker (MQTT 3.1.1 return codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalCode {
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
    /// Any code outside the 1..=5 range, including negative client-side codes
    Other(i32),
}

impl RefusalCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::UnacceptableProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadUserNameOrPassword => 4,
            Self::NotAuthorized => 5,
            Self::Other(code) => *code,
        }
    }

    /// Only "server unavailable" is worth waiting out
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerUnavailable)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::UnacceptableProtocolVersion => "Unacceptable protocol version",
            Self::IdentifierRejected => "Identifier rejected",
            Self::ServerUnavailable => "Server unavailable",
            Self::BadUserNameOrPassword => "Bad user name or password",
            Self::NotAuthorized => "Not authorized",
            Self::Other(_) => "Unexpected return code",
        }
    }
}

impl fmt::Display for RefusalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.description(), self.code())
    }
}

/// File I/O failures while resolving TLS material
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to read {kind} file {path}")]
    Unreadable {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures establishing a broker session
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("MQTT connection refused: {0}")]
    Refused(RefusalCode),

    #[error("failed to connect, maximum retry time of {max_elapsed:?} exceeded after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32, max_elapsed: Duration },

    #[error("failed to connect to MQTT server {broker}: {message}")]
    Network { broker: String, message: String },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("credential unavailable: {0}")]
    Credential(#[from] CredentialError),
}

impl ConnectError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Refused(code) if code.is_retryable())
    }

    pub fn refusal_code(&self) -> Option<RefusalCode> {
        match self {
            Self::Refused(code) => Some(*code),
            _ => None,
        }
    }
}

/// Failures handing a payload to the transport
#[derive(Debug, Error)]
pub enum PublishError {
    /// The session dropped while publishing; the only retried publish failure
    #[error("session disconnected during publish")]
    Disconnected,

    #[error("publication to topic {topic} failed: {message}")]
    Failed { topic: String, message: String },

    #[error("no broker session available for publish")]
    NotConnected,
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

#[derive(Debug, Error)]
#[error("failed to subscribe to topic '{topic}': {message}")]
pub struct SubscribeError {
    pub topic: String,
    pub message: String,
}

/// Delivery confirmation not observed in time. The publish itself stands.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("delivery of message {token} not confirmed within {timeout:?}")]
pub struct DeliveryTimeout {
    pub token: DeliveryToken,
    pub timeout: Duration,
}

/// Crate-level error aggregating every component failure
#[derive(Debug, Error)]
pub enum NorthError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Delivery(#[from] DeliveryTimeout),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl NorthError {
    pub fn is_transient(&self) -> bool {
        match self {
            NorthError::Connect(e) => e.is_transient(),
            NorthError::Publish(e) => e.is_transient(),
            NorthError::Delivery(_) => true,
            _ => false,
        }
    }
}

pub type NorthResult<T> = Result<T, NorthError>;

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("static regex is valid")
});

static SIGNED_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").expect("static regex is valid")
});

/// Redact credentials from text headed for the log
///
/// Transport errors can echo the session password, which is the signed device
/// token, so anything that looks like a compact JWS is masked as well.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SIGNED_TOKEN
        .replace_all(message, "***JWT***")
        .to_string();
    sanitized = SECRET_ASSIGNMENT
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
