//! Impure I/O for the MQTT transport
//!
//! Owns the rumqttc client and drives its event loop on a tokio task. The
//! loop reports session events through the [`EventHandler`] and matches
//! PUBACK packet ids back to the delivery tokens handed to `publish`.

use super::connection::{
    configure_mqtt_options, exceeds_packet_limit, publish_packet_size, refusal_from_return_code,
    MAX_PACKET_SIZE,
};
use crate::delivery::DeliveryToken;
use crate::error::{
    sanitize_error_message, ConnectError, PublishError, ResourceError, SubscribeError,
};
use crate::protocol::topics::is_publishable_topic;
use crate::transport::{EventHandler, SessionOptions, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for CONNACK before giving up on an attempt
const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for the event loop to flush DISCONNECT
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// rumqttc request channel capacity
const REQUEST_CAPACITY: usize = 10;

/// Tokens waiting for their outgoing PUBLISH to be assigned a packet id
type PendingTokens = Arc<Mutex<VecDeque<DeliveryToken>>>;

#[derive(Default)]
pub struct MqttTransport {
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    pending: PendingTokens,
    closing: Arc<AtomicBool>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_alive(&self) -> bool {
        self.client.is_some()
            && self
                .event_loop_handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the current event loop without sending DISCONNECT
    fn abort_session(&mut self) {
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
        self.client = None;
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    /// Poll until the broker answers CONNECT
    async fn await_connack(event_loop: &mut EventLoop, broker: &str) -> Result<(), ConnectError> {
        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match refusal_from_return_code(ack.code) {
                            None => Ok(()),
                            Some(code) => Err(ConnectError::Refused(code)),
                        };
                    }
                    Ok(event) => {
                        debug!(target: "mqtt_transport", "Event before CONNACK: {:?}", event);
                    }
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return Err(match refusal_from_return_code(code) {
                            Some(code) => ConnectError::Refused(code),
                            None => ConnectError::Network {
                                broker: broker.to_string(),
                                message: "refused with success code".to_string(),
                            },
                        });
                    }
                    Err(e) => {
                        return Err(ConnectError::Network {
                            broker: broker.to_string(),
                            message: sanitize_error_message(&e.to_string()),
                        });
                    }
                }
            }
        };

        tokio::time::timeout(CONNACK_TIMEOUT, handshake)
            .await
            .map_err(|_| ConnectError::Network {
                broker: broker.to_string(),
                message: format!("no CONNACK within {CONNACK_TIMEOUT:?}"),
            })?
    }

    /// Drive the event loop until the session ends
    async fn run_event_loop(
        mut event_loop: EventLoop,
        events: EventHandler,
        pending: PendingTokens,
        closing: Arc<AtomicBool>,
    ) {
        let mut in_flight: HashMap<u16, DeliveryToken> = HashMap::new();

        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    let token = pending.lock().ok().and_then(|mut queue| queue.pop_front());
                    match token {
                        // QoS 0 publishes carry no packet id and are never acknowledged
                        Some(token) if pkid == 0 => events.delivered(token),
                        Some(token) => {
                            in_flight.insert(pkid, token);
                        }
                        None => warn!(pkid, "Outgoing publish without a delivery token"),
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => match in_flight.remove(&ack.pkid) {
                    Some(token) => events.delivered(token),
                    None => debug!(pkid = ack.pkid, "PUBACK for unknown packet id"),
                },
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    events.message_arrived(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(target: "mqtt_transport", "Subscription confirmed: {:?}", ack.return_codes);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    events.connection_lost("broker sent DISCONNECT");
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT session closed");
                    break;
                }
                Ok(event) => {
                    debug!(target: "mqtt_transport", "MQTT event: {:?}", event);
                }
                Err(e) => {
                    if closing.load(Ordering::SeqCst) {
                        debug!(error = %e, "Event loop ended during shutdown");
                    } else {
                        events.connection_lost(&e.to_string());
                    }
                    break;
                }
            }
        }
    }
}

/// Read the PEM trust anchors for a TLS session
pub async fn load_trust_anchors(path: &Path) -> Result<Vec<u8>, ResourceError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| ResourceError::Unreadable {
            kind: "trust anchor",
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &mut self,
        options: &SessionOptions,
        events: EventHandler,
    ) -> Result<(), ConnectError> {
        self.abort_session();

        let trust_anchors = if options.broker.tls {
            Some(load_trust_anchors(&options.trust_store).await?)
        } else {
            None
        };

        let mqtt_options = configure_mqtt_options(options, trust_anchors);
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let broker = options.broker.to_string();
        debug!(broker = %broker, client_id = %options.client_id, "Sending CONNECT");
        Self::await_connack(&mut event_loop, &broker).await?;
        events.connected();

        self.closing.store(false, Ordering::SeqCst);
        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            events,
            self.pending.clone(),
            self.closing.clone(),
        ));

        self.client = Some(client);
        self.event_loop_handle = Some(handle);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        token: DeliveryToken,
    ) -> Result<(), PublishError> {
        if !is_publishable_topic(topic) {
            return Err(PublishError::Failed {
                topic: topic.to_string(),
                message: "invalid topic name".to_string(),
            });
        }
        if exceeds_packet_limit(topic, payload.len()) {
            return Err(PublishError::Failed {
                topic: topic.to_string(),
                message: format!(
                    "message of {} bytes exceeds the {} byte packet limit",
                    publish_packet_size(topic, payload.len()),
                    MAX_PACKET_SIZE
                ),
            });
        }
        if !self.session_alive() {
            return Err(PublishError::Disconnected);
        }
        let Some(client) = self.client.as_ref() else {
            return Err(PublishError::Disconnected);
        };

        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(token);
        }

        if let Err(e) = client
            .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            // The request never reached the event loop
            if let Ok(mut pending) = self.pending.lock() {
                pending.retain(|queued| *queued != token);
            }
            warn!(error = %e, "Publish request rejected by MQTT client");
            return Err(PublishError::Disconnected);
        }
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), SubscribeError> {
        let client = self.client.as_ref().ok_or_else(|| SubscribeError {
            topic: topic.to_string(),
            message: "not connected".to_string(),
        })?;

        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| SubscribeError {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn disconnect(&mut self) {
        self.closing.store(true, Ordering::SeqCst);

        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "DISCONNECT not sent, event loop already stopped");
            }
        }

        if let Some(mut handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!("MQTT event loop task failed: {}", e),
                Err(_) => {
                    warn!("MQTT event loop did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                    handle.abort();
                }
            }
        }

        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}
