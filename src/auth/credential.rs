//! Signed device credential and its lifecycle
//!
//! The token is used as the MQTT password. It is kept until its locally
//! tracked expiry, which is set 100 seconds ahead of the signed `exp` claim,
//! and then regenerated from the private key on the next connect.

use super::signer::{Claims, SigningAlgorithm, TokenSigner};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Lifetime written into the signed `exp` claim
pub const CLAIM_LIFETIME: Duration = Duration::from_secs(3600);

/// Lifetime the client trusts the token for
pub const LOCAL_LIFETIME: Duration = Duration::from_secs(3500);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("could not open private key file {path}")]
    KeyUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {algorithm} private key: {message}")]
    InvalidKey {
        algorithm: SigningAlgorithm,
        message: String,
    },

    #[error("error during {algorithm} token creation: {message}")]
    Signing {
        algorithm: SigningAlgorithm,
        message: String,
    },
}

/// A signed token plus the bookkeeping needed to decide when to replace it
#[derive(Clone)]
pub struct Credential {
    token: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    algorithm: SigningAlgorithm,
    key_path: PathBuf,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Local expiry, earlier than the signed claim
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// A token at or past its expiry instant is stale
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"***")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("algorithm", &self.algorithm)
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Owns the current credential and regenerates it when stale
pub struct CredentialManager {
    audience: String,
    algorithm: SigningAlgorithm,
    key_path: PathBuf,
    signer: Arc<dyn TokenSigner>,
    current: Option<Credential>,
}

impl CredentialManager {
    pub fn new(
        audience: impl Into<String>,
        algorithm: SigningAlgorithm,
        key_path: impl Into<PathBuf>,
        signer: Arc<dyn TokenSigner>,
    ) -> Self {
        Self {
            audience: audience.into(),
            algorithm,
            key_path: key_path.into(),
            signer,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Regenerate when there is no token or the token has expired
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        match &self.current {
            None => true,
            Some(credential) => credential.is_expired_at(now),
        }
    }

    /// Return a usable token, generating a new one if needed
    pub async fn ensure_fresh(&mut self) -> Result<String, CredentialError> {
        self.ensure_fresh_at(Utc::now()).await
    }

    pub async fn ensure_fresh_at(&mut self, now: DateTime<Utc>) -> Result<String, CredentialError> {
        if !self.needs_refresh_at(now) {
            if let Some(credential) = &self.current {
                debug!(expires_at = %credential.expires_at, "JWT token has not yet expired");
                return Ok(credential.token.clone());
            }
        }

        info!(algorithm = %self.algorithm, "Generating a new JWT token for MQTT bridge");
        self.invalidate();

        let key_pem = tokio::fs::read(&self.key_path).await.map_err(|source| {
            error!(path = %self.key_path.display(), "Could not open private key file");
            CredentialError::KeyUnreadable {
                path: self.key_path.clone(),
                source,
            }
        })?;

        let claims = Claims::new(now, CLAIM_LIFETIME, &self.audience);
        let token = self
            .signer
            .sign(&claims, self.algorithm, &key_pem)
            .map_err(|e| {
                error!(error = %e, "JWT token creation failed");
                e
            })?;

        let credential = Credential {
            token: token.clone(),
            issued_at: now,
            expires_at: now + LOCAL_LIFETIME,
            algorithm: self.algorithm,
            key_path: self.key_path.clone(),
        };
        debug!(expires_at = %credential.expires_at, "New JWT token ready");
        self.current = Some(credential);
        Ok(token)
    }

    /// Drop the current token, if any
    pub fn invalidate(&mut self) {
        self.current = None;
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("audience", &self.audience)
            .field("algorithm", &self.algorithm)
            .field("key_path", &self.key_path)
            .field("current", &self.current)
            .finish()
    }
}
