//! Session notifications raised from the transport's event loop
//!
//! Runs concurrently with `send`. State changes go through the shared watch
//! channel and the delivery tracker, so nothing here blocks.

use crate::connection::ConnectionState;
use crate::delivery::{DeliveryToken, DeliveryTracker};
use crate::error::sanitize_error_message;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct EventHandler {
    state: Arc<watch::Sender<ConnectionState>>,
    tracker: DeliveryTracker,
}

impl EventHandler {
    pub fn new(state: Arc<watch::Sender<ConnectionState>>, tracker: DeliveryTracker) -> Self {
        Self { state, tracker }
    }

    /// The broker accepted the session
    pub fn connected(&self) {
        self.state.send_replace(ConnectionState::Connected);
        info!("MQTT session established");
    }

    pub fn connection_lost(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                false
            } else {
                *state = ConnectionState::Disconnected;
                true
            }
        });
        if changed {
            error!(reason = %sanitize_error_message(reason), "MQTT connection lost");
        } else {
            debug!(reason = %sanitize_error_message(reason), "Connection loss reported while disconnected");
        }
    }

    pub fn delivered(&self, token: DeliveryToken) {
        if self.tracker.record_delivered(token) {
            debug!(token, "Message delivery confirmed");
        } else {
            debug!(token, "Ignoring stale delivery confirmation");
        }
    }

    /// Inbound messages are not processed, only logged
    pub fn message_arrived(&self, topic: &str, payload: &[u8]) {
        warn!(
            topic = %topic,
            payload = %String::from_utf8_lossy(payload),
            "Message arrived on subscribed topic"
        );
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}
