//! Transport layer for the device bridge
//!
//! The core drives a broker session through [`Transport`]. The MQTT
//! implementation lives in [`mqtt`]; tests substitute
//! [`crate::testing::mocks::MockTransport`].

use crate::config::BrokerAddress;
use crate::delivery::DeliveryToken;
use crate::error::{ConnectError, PublishError, SubscribeError};
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod events;
pub mod mqtt;

pub use events::EventHandler;
pub use mqtt::MqttTransport;

/// Everything needed for a single CONNECT
#[derive(Clone)]
pub struct SessionOptions {
    pub broker: BrokerAddress,
    pub client_id: String,
    pub username: String,
    /// Signed device token
    pub password: String,
    /// PEM trust anchors, only read for TLS brokers
    pub trust_store: PathBuf,
    pub keep_alive: Duration,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("broker", &self.broker)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("trust_store", &self.trust_store)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Broker session capability consumed by the connection manager
///
/// `connect` is a single attempt; retry policy belongs to the caller.
/// Implementations report session events through the supplied
/// [`EventHandler`], calling [`EventHandler::connected`] once the broker has
/// accepted the session.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Open a session, replacing any previous one
    async fn connect(
        &mut self,
        options: &SessionOptions,
        events: EventHandler,
    ) -> Result<(), ConnectError>;

    /// Hand a payload to the broker. Delivery is confirmed later through
    /// [`EventHandler::delivered`] with the same token.
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        token: DeliveryToken,
    ) -> Result<(), PublishError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), SubscribeError>;

    /// Tear down the session. Safe to call when already disconnected.
    async fn disconnect(&mut self);
}
