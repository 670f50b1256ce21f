//! Broker session ownership and the connect state machine
//!
//! `Disconnected -> Connecting -> Connected`, falling back to `Disconnected`
//! on a fatal refusal, an exhausted retry budget, a lost connection or an
//! explicit disconnect. Only "server unavailable" refusals are retried.

pub mod backoff;

pub use backoff::Backoff;

use crate::auth::CredentialManager;
use crate::config::{BrokerAddress, DeviceIdentity, RetrySection};
use crate::connect_span;
use crate::delivery::{DeliveryToken, DeliveryTracker};
use crate::error::{ConnectError, PublishError};
use crate::transport::{EventHandler, SessionOptions, Transport};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything about the session that stays fixed across attempts
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub identity: DeviceIdentity,
    pub broker: BrokerAddress,
    pub username: String,
    pub keep_alive: Duration,
    pub trust_store: PathBuf,
    pub retry: RetrySection,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    settings: ConnectionSettings,
    credentials: CredentialManager,
    state: Arc<watch::Sender<ConnectionState>>,
    tracker: DeliveryTracker,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        settings: ConnectionSettings,
        credentials: CredentialManager,
        tracker: DeliveryTracker,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            settings,
            credentials,
            state: Arc::new(state),
            tracker,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state changes, including those raised by the transport
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.settings.identity
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    fn event_handler(&self) -> EventHandler {
        EventHandler::new(self.state.clone(), self.tracker.clone())
    }

    /// Connect, retrying "server unavailable" refusals within the budget
    ///
    /// Returns immediately when already connected.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        let span = connect_span!(
            client_id = %self.settings.identity.client_id(),
            broker = %self.settings.broker
        );
        self.connect_with_backoff().instrument(span).await
    }

    async fn connect_with_backoff(&mut self) -> Result<(), ConnectError> {
        self.state.send_replace(ConnectionState::Connecting);
        let mut backoff = Backoff::new(&self.settings.retry);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.attempt().await {
                Ok(()) => break,
                Err(ConnectError::Refused(code)) if code.is_retryable() => {
                    let Some(delay) = backoff.next_delay() else {
                        self.state.send_replace(ConnectionState::Disconnected);
                        let err = ConnectError::RetryBudgetExhausted {
                            attempts,
                            max_elapsed: backoff.max_elapsed(),
                        };
                        error!(error = %err, "Giving up on MQTT connection");
                        return Err(err);
                    };
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        waited_ms = backoff.elapsed().as_millis() as u64,
                        "{}, retrying",
                        code
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    error!(attempt = attempts, error = %e, "MQTT connection failed");
                    return Err(e);
                }
            }
        }

        // Transports normally flip the state on CONNACK; cover those that do not
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        info!(attempts, "Connected to {}", self.settings.broker);

        let errors_topic = self.settings.identity.errors_topic();
        match self.transport.subscribe(&errors_topic).await {
            Ok(()) => debug!(topic = %errors_topic, "Subscribed to error notifications"),
            Err(e) => warn!(error = %e, "Error topic subscription failed"),
        }
        Ok(())
    }

    /// One CONNECT with a fresh credential
    async fn attempt(&mut self) -> Result<(), ConnectError> {
        let password = self.credentials.ensure_fresh().await?;
        let options = SessionOptions {
            broker: self.settings.broker.clone(),
            client_id: self.settings.identity.client_id(),
            username: self.settings.username.clone(),
            password,
            trust_store: self.settings.trust_store.clone(),
            keep_alive: self.settings.keep_alive,
        };
        let events = self.event_handler();
        self.transport.connect(&options, events).await
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        token: DeliveryToken,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Disconnected);
        }
        self.transport.publish(topic, payload, token).await
    }

    /// Tear down the session. Idempotent.
    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        if self.state.send_replace(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            info!("Disconnected from {}", self.settings.broker);
        }
    }

    /// Disconnect and release the credential
    pub async fn shutdown(&mut self) {
        self.disconnect().await;
        self.credentials.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SigningAlgorithm;
    use crate::error::RefusalCode;
    use crate::testing::mocks::{MockTransport, StaticSigner};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            identity: DeviceIdentity {
                project_id: "proj".to_string(),
                region: "us-central1".to_string(),
                registry_id: "reg".to_string(),
                device_id: "dev".to_string(),
                key_name: "device".to_string(),
                algorithm: SigningAlgorithm::Es256,
            },
            broker: BrokerAddress {
                host: "localhost".to_string(),
                port: 1883,
                tls: false,
            },
            username: "unused".to_string(),
            keep_alive: Duration::from_secs(60),
            trust_store: PathBuf::from("/nonexistent/roots.pem"),
            retry: RetrySection::default(),
        }
    }

    fn manager(
        transport: MockTransport,
        key_dir: &tempfile::TempDir,
    ) -> ConnectionManager<MockTransport> {
        let key = key_dir.path().join("device.pem");
        std::fs::write(&key, b"pem").unwrap();
        let credentials = CredentialManager::new(
            "proj",
            SigningAlgorithm::Es256,
            key,
            Arc::new(StaticSigner::default()),
        );
        ConnectionManager::new(transport, settings(), credentials, DeliveryTracker::new())
    }

    #[tokio::test]
    async fn test_connect_subscribes_to_errors_topic() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let mut connection = manager(transport.clone(), &dir);

        connection.connect().await.unwrap();

        assert!(connection.is_connected());
        assert_eq!(transport.subscriptions(), vec!["/devices/dev/errors".to_string()]);
        let session = transport.last_session().unwrap();
        assert_eq!(session.username, "unused");
        assert_eq!(session.client_id, "projects/proj/locations/us-central1/registries/reg/devices/dev");
        assert!(session.password.starts_with("signed-"));
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let mut connection = manager(transport.clone(), &dir);

        connection.connect().await.unwrap();
        connection.connect().await.unwrap();
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_subscription_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new().with_failing_subscriptions();
        let mut connection = manager(transport.clone(), &dir);

        assert!(connection.connect().await.is_ok());
        assert!(connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_refusal_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            MockTransport::new().with_connect_results(vec![Err(RefusalCode::BadUserNameOrPassword)]);
        let mut connection = manager(transport.clone(), &dir);

        let err = connection.connect().await.unwrap_err();
        assert_eq!(err.refusal_code(), Some(RefusalCode::BadUserNameOrPassword));
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let mut connection = manager(transport.clone(), &dir);
        std::fs::remove_file(dir.path().join("device.pem")).unwrap();

        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Credential(_)));
        assert_eq!(transport.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_publish_requires_session() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let mut connection = manager(transport.clone(), &dir);

        let err = connection
            .publish("/devices/dev/events", Bytes::from_static(b"{}"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Disconnected));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drops_credential() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let mut connection = manager(transport.clone(), &dir);

        connection.connect().await.unwrap();
        assert!(connection.credentials().current().is_some());

        connection.shutdown().await;
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.credentials().current().is_none());
        assert_eq!(transport.disconnects(), 2);
    }

    #[tokio::test]
    async fn test_lost_connection_observed_by_manager() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let mut connection = manager(transport.clone(), &dir);
        let mut states = connection.subscribe_state();

        connection.connect().await.unwrap();
        transport.drop_connection("keep-alive timeout");

        states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(!connection.is_connected());
    }
}
