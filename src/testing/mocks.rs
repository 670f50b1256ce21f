//! Mock implementations for testing
//!
//! [`MockTransport`] stands in for a broker: connect results and publish
//! outcomes can be scripted, accepted publishes are recorded and, by
//! default, confirmed straight away. Payloads over the bridge packet limit
//! are refused the same way the MQTT transport refuses them. Clones share
//! state, so a test keeps one handle for inspection and moves the other into
//! the client.

use crate::auth::{Claims, CredentialError, SigningAlgorithm, TokenSigner};
use crate::delivery::DeliveryToken;
use crate::error::{ConnectError, PublishError, RefusalCode, SubscribeError};
use crate::protocol::topics::has_empty_segment;
use crate::transport::mqtt::connection::exceeds_packet_limit;
use crate::transport::{EventHandler, SessionOptions, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A publish the mock broker accepted
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub token: DeliveryToken,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Scripted reaction to a publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accept,
    /// Session drops mid-publish; the transient signal
    Disconnect,
    /// Any other rejection
    Fail,
}

#[derive(Debug)]
struct MockState {
    connect_results: VecDeque<Result<(), RefusalCode>>,
    publish_outcomes: VecDeque<PublishOutcome>,
    fallback_outcome: PublishOutcome,
    auto_deliver: bool,
    fail_subscriptions: bool,
    connected: bool,
    events: Option<EventHandler>,
    sessions: Vec<SessionOptions>,
    published: Vec<PublishedMessage>,
    publish_attempts: usize,
    subscriptions: Vec<String>,
    disconnects: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            connect_results: VecDeque::new(),
            publish_outcomes: VecDeque::new(),
            fallback_outcome: PublishOutcome::Accept,
            auto_deliver: true,
            fail_subscriptions: false,
            connected: false,
            events: None,
            sessions: Vec::new(),
            published: Vec::new(),
            publish_attempts: 0,
            subscriptions: Vec::new(),
            disconnects: 0,
        }
    }
}

/// Mock transport for testing
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Results for successive connect attempts; once used up, connects succeed
    pub fn with_connect_results(self, results: Vec<Result<(), RefusalCode>>) -> Self {
        self.lock().connect_results = results.into();
        self
    }

    /// Outcomes for successive publishes; once used up, publishes are accepted
    pub fn with_publish_outcomes(self, outcomes: Vec<PublishOutcome>) -> Self {
        self.lock().publish_outcomes = outcomes.into();
        self
    }

    /// Apply `outcome` to every publish not covered by a scripted outcome
    pub fn with_every_publish(self, outcome: PublishOutcome) -> Self {
        self.lock().fallback_outcome = outcome;
        self
    }

    /// Leave delivery confirmation to [`MockTransport::deliver`]
    pub fn without_auto_delivery(self) -> Self {
        self.lock().auto_deliver = false;
        self
    }

    pub fn with_failing_subscriptions(self) -> Self {
        self.lock().fail_subscriptions = true;
        self
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn last_session(&self) -> Option<SessionOptions> {
        self.lock().sessions.last().cloned()
    }

    pub fn sessions(&self) -> Vec<SessionOptions> {
        self.lock().sessions.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.lock().publish_attempts
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self, reason: &str) {
        let events = {
            let mut state = self.lock();
            state.connected = false;
            state.events.clone()
        };
        if let Some(events) = events {
            events.connection_lost(reason);
        }
    }

    /// Confirm delivery of `token`
    pub fn deliver(&self, token: DeliveryToken) {
        let events = self.lock().events.clone();
        if let Some(events) = events {
            events.delivered(token);
        }
    }

    /// Simulate an inbound message on a subscribed topic
    pub fn inject_message(&self, topic: &str, payload: &[u8]) {
        let events = self.lock().events.clone();
        if let Some(events) = events {
            events.message_arrived(topic, payload);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &mut self,
        options: &SessionOptions,
        events: EventHandler,
    ) -> Result<(), ConnectError> {
        let result = {
            let mut state = self.lock();
            state.sessions.push(options.clone());
            state.connected = false;

            let scripted = state.connect_results.pop_front().unwrap_or(Ok(()));
            if has_empty_segment(&options.client_id) {
                Err(RefusalCode::IdentifierRejected)
            } else {
                scripted
            }
        };

        match result {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    state.connected = true;
                    state.events = Some(events.clone());
                }
                events.connected();
                Ok(())
            }
            Err(code) => Err(ConnectError::Refused(code)),
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        token: DeliveryToken,
    ) -> Result<(), PublishError> {
        let (outcome, events, auto_deliver) = {
            let mut state = self.lock();
            state.publish_attempts += 1;
            if !state.connected {
                return Err(PublishError::Disconnected);
            }
            if exceeds_packet_limit(topic, payload.len()) {
                return Err(PublishError::Failed {
                    topic: topic.to_string(),
                    message: "mock broker packet limit exceeded".to_string(),
                });
            }
            let outcome = state
                .publish_outcomes
                .pop_front()
                .unwrap_or(state.fallback_outcome);
            if outcome == PublishOutcome::Accept {
                state.published.push(PublishedMessage {
                    topic: topic.to_string(),
                    payload,
                    token,
                });
            } else if outcome == PublishOutcome::Disconnect {
                state.connected = false;
            }
            (outcome, state.events.clone(), state.auto_deliver)
        };

        match outcome {
            PublishOutcome::Accept => {
                if auto_deliver {
                    if let Some(events) = events {
                        events.delivered(token);
                    }
                }
                Ok(())
            }
            PublishOutcome::Disconnect => {
                if let Some(events) = events {
                    events.connection_lost("connection dropped during publish");
                }
                Err(PublishError::Disconnected)
            }
            PublishOutcome::Fail => Err(PublishError::Failed {
                topic: topic.to_string(),
                message: "mock broker rejected the message".to_string(),
            }),
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), SubscribeError> {
        let mut state = self.lock();
        if state.fail_subscriptions || !state.connected {
            return Err(SubscribeError {
                topic: topic.to_string(),
                message: "mock broker refused subscription".to_string(),
            });
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.lock();
        state.disconnects += 1;
        state.connected = false;
        state.events = None;
    }
}

/// Signer producing predictable tokens and counting its calls
#[derive(Debug, Default)]
pub struct StaticSigner {
    calls: AtomicUsize,
    last_claims: Mutex<Option<Claims>>,
}

impl StaticSigner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_claims(&self) -> Option<Claims> {
        self.last_claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TokenSigner for StaticSigner {
    fn sign(
        &self,
        claims: &Claims,
        algorithm: SigningAlgorithm,
        _key_pem: &[u8],
    ) -> Result<String, CredentialError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .last_claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(claims.clone());
        Ok(format!("signed-{n}-{algorithm}-{}", claims.iat))
    }
}

/// Signer that always fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingSigner;

impl TokenSigner for FailingSigner {
    fn sign(
        &self,
        _claims: &Claims,
        algorithm: SigningAlgorithm,
        _key_pem: &[u8],
    ) -> Result<String, CredentialError> {
        Err(CredentialError::Signing {
            algorithm,
            message: "mock signing failure".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerAddress;
    use crate::connection::ConnectionState;
    use crate::delivery::DeliveryTracker;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::watch;

    fn session(client_id: &str) -> SessionOptions {
        SessionOptions {
            broker: BrokerAddress::default(),
            client_id: client_id.to_string(),
            username: "unused".to_string(),
            password: "token".to_string(),
            trust_store: PathBuf::from("roots.pem"),
            keep_alive: Duration::from_secs(60),
        }
    }

    fn events() -> (EventHandler, DeliveryTracker) {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        let tracker = DeliveryTracker::new();
        (EventHandler::new(Arc::new(tx), tracker.clone()), tracker)
    }

    #[tokio::test]
    async fn test_mock_broker_rejects_empty_identifier_segment() {
        let mut transport = MockTransport::new();
        let (handler, _) = events();

        let err = transport
            .connect(&session("projects/p/locations/r/registries//devices/d"), handler)
            .await
            .unwrap_err();
        assert_eq!(err.refusal_code(), Some(RefusalCode::IdentifierRejected));
    }

    #[tokio::test]
    async fn test_scripted_outcomes_then_defaults() {
        let mut transport = MockTransport::new()
            .with_connect_results(vec![Err(RefusalCode::ServerUnavailable)])
            .with_publish_outcomes(vec![PublishOutcome::Fail]);
        let (handler, tracker) = events();
        let id = "projects/p/locations/r/registries/g/devices/d";

        assert!(transport.connect(&session(id), handler.clone()).await.is_err());
        assert!(transport.connect(&session(id), handler).await.is_ok());

        let payload = Bytes::from_static(b"{}");
        assert!(transport.publish("/t", payload.clone(), 1).await.is_err());
        assert!(transport.publish("/t", payload, 2).await.is_ok());

        assert_eq!(transport.published().len(), 1);
        assert_eq!(transport.publish_attempts(), 2);
        assert_eq!(tracker.last_delivered(), 2);
    }

    #[test]
    fn test_static_signer_counts_calls() {
        let signer = StaticSigner::default();
        let claims = Claims::new(chrono::Utc::now(), Duration::from_secs(3600), "proj");

        let token = signer.sign(&claims, SigningAlgorithm::Rs256, b"").unwrap();
        assert!(token.starts_with("signed-1-RS256-"));
        assert_eq!(signer.calls(), 1);
        assert_eq!(signer.last_claims(), Some(claims));
    }
}
