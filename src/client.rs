//! Host-facing client
//!
//! [`NorthClient`] wires the components together from a [`NorthConfig`] and
//! serializes calls behind a single lock. Every operation reports failure as
//! a return value; nothing here panics or propagates errors to the host.
//!
//! Dropping the client drops the transport, which stops its event loop, and
//! frees the credential. Call [`NorthClient::shutdown`] first for a clean
//! DISCONNECT.

use crate::auth::{CredentialManager, JwtSigner, TokenSigner};
use crate::config::{CertPaths, ConfigError, DeviceIdentity, NorthConfig};
use crate::connection::{ConnectionManager, ConnectionSettings, ConnectionState};
use crate::delivery::{DeliveryMarker, DeliveryTracker};
use crate::error::ConnectError;
use crate::protocol::Reading;
use crate::publish::PublishCoordinator;
use crate::transport::{MqttTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct NorthClient<T: Transport> {
    inner: Arc<Mutex<PublishCoordinator<T>>>,
    identity: DeviceIdentity,
    cert_paths: CertPaths,
    state: watch::Receiver<ConnectionState>,
    tracker: DeliveryTracker,
}

impl<T: Transport> Clone for NorthClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            identity: self.identity.clone(),
            cert_paths: self.cert_paths.clone(),
            state: self.state.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl NorthClient<MqttTransport> {
    /// Client over the MQTT transport with JWT signing
    pub fn from_config(config: &NorthConfig) -> (Self, Vec<ConfigError>) {
        Self::configure(config, MqttTransport::new())
    }
}

impl<T: Transport> NorthClient<T> {
    /// Build a client. Configuration problems are logged and returned; the
    /// client is usable either way, although connecting will likely fail.
    pub fn configure(config: &NorthConfig, transport: T) -> (Self, Vec<ConfigError>) {
        Self::with_signer(config, transport, Arc::new(JwtSigner))
    }

    pub fn with_signer(
        config: &NorthConfig,
        transport: T,
        signer: Arc<dyn TokenSigner>,
    ) -> (Self, Vec<ConfigError>) {
        let (identity, mut problems) = config.device.resolve();

        let broker = config.broker.broker_address().unwrap_or_else(|e| {
            problems.push(e);
            Default::default()
        });
        problems.extend(config.retry.validate());

        for problem in &problems {
            error!("{}", problem);
        }

        let cert_paths = CertPaths::resolve(config.broker.cert_dir.as_deref(), &identity.key_name);
        info!(
            client_id = %identity.client_id(),
            cert_dir = %cert_paths.directory.display(),
            "Configured north client"
        );

        let credentials = CredentialManager::new(
            identity.project_id.clone(),
            identity.algorithm,
            cert_paths.private_key.clone(),
            signer,
        );
        let settings = ConnectionSettings {
            identity: identity.clone(),
            broker,
            username: config.broker.username.clone(),
            keep_alive: Duration::from_secs(config.broker.keep_alive_secs),
            trust_store: cert_paths.trust_store.clone(),
            retry: config.retry.clone(),
        };

        let tracker = DeliveryTracker::new();
        let connection = ConnectionManager::new(transport, settings, credentials, tracker.clone());
        let state = connection.subscribe_state();
        let coordinator = PublishCoordinator::new(
            connection,
            tracker.clone(),
            Duration::from_millis(config.broker.delivery_timeout_ms),
            config.retry.publish_retries,
        );

        let client = Self {
            inner: Arc::new(Mutex::new(coordinator)),
            identity,
            cert_paths,
            state,
            tracker,
        };
        (client, problems)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn cert_paths(&self) -> &CertPaths {
        &self.cert_paths
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn delivery_marker(&self) -> DeliveryMarker {
        self.tracker.marker()
    }

    /// Connect, blocking for up to the full retry budget
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                false
            }
        }
    }

    pub async fn try_connect(&self) -> Result<(), ConnectError> {
        self.inner.lock().await.connect().await
    }

    /// Publish one batch; returns the number of readings sent
    pub async fn send(&self, readings: &[Reading]) -> usize {
        self.inner.lock().await.send(readings).await
    }

    /// Every normalized asset name seen so far, in sorted order
    pub async fn registered_assets(&self) -> Vec<String> {
        let coordinator = self.inner.lock().await;
        coordinator.registry().iter().map(str::to_string).collect()
    }

    /// Disconnect and drop the credential
    pub async fn shutdown(&self) {
        self.inner.lock().await.shutdown().await;
        info!("North client shut down");
    }
}

impl<T: Transport + 'static> NorthClient<T> {
    /// Run the connect sequence on a background task
    pub fn spawn_connect(&self) -> JoinHandle<bool> {
        let client = self.clone();
        tokio::spawn(async move { client.connect().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSection;
    use crate::testing::mocks::{MockTransport, StaticSigner};
    use chrono::Utc;

    fn config(cert_dir: &std::path::Path) -> NorthConfig {
        let mut config = NorthConfig {
            device: DeviceSection::from_fields(
                "gateway-1",
                "proj",
                "us-central1",
                "reg",
                "device",
                "ES256",
            ),
            ..NorthConfig::default()
        };
        config.broker.cert_dir = Some(cert_dir.to_path_buf());
        config
    }

    fn client(
        dir: &tempfile::TempDir,
        transport: MockTransport,
    ) -> NorthClient<MockTransport> {
        std::fs::write(dir.path().join("device.pem"), b"pem").unwrap();
        let (client, problems) =
            NorthClient::with_signer(&config(dir.path()), transport, Arc::new(StaticSigner::default()));
        assert!(problems.is_empty());
        client
    }

    #[tokio::test]
    async fn test_configure_resolves_paths_from_cert_dir() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, MockTransport::new());

        assert_eq!(client.cert_paths().private_key, dir.path().join("device.pem"));
        assert_eq!(client.cert_paths().trust_store, dir.path().join("roots.pem"));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_broker_url_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.broker.url = "ftp://nowhere".to_string();

        let (_, problems) = NorthClient::configure(&config, MockTransport::new());
        assert!(matches!(problems.as_slice(), [ConfigError::InvalidBrokerUrl(_)]));
    }

    #[tokio::test]
    async fn test_spawn_connect_reports_result() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, MockTransport::new());

        assert!(client.spawn_connect().await.unwrap());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_send_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let client = client(&dir, transport.clone());

        let sent = client
            .send(&[Reading::new("line 3", Utc::now()).with_datapoint("temp", 21.5)])
            .await;
        assert_eq!(sent, 1);
        assert_eq!(client.registered_assets().await, vec!["line_3".to_string()]);

        client.shutdown().await;
        assert!(!client.is_connected());
        assert_eq!(transport.disconnects(), 1);
    }
}
