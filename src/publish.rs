//! Send path: assemble, publish with bounded retry, wait for confirmation
//!
//! A disconnect during publish is retried after forcing a fresh session, up
//! to `publish_retries` extra attempts. Any other failure ends the call. The
//! returned count covers readings the transport accepted, whether or not the
//! confirmation arrived in time.

use crate::batch::{AssetRegistry, BatchAssembler};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::delivery::{DeliveryMarker, DeliveryToken, DeliveryTracker};
use crate::error::{sanitize_error_message, ConnectError, NorthError, PublishError};
use crate::protocol::Reading;
use crate::publish_span;
use crate::transport::Transport;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

pub struct PublishCoordinator<T: Transport> {
    connection: ConnectionManager<T>,
    assembler: BatchAssembler,
    tracker: DeliveryTracker,
    delivery_timeout: Duration,
    publish_retries: u32,
}

impl<T: Transport> PublishCoordinator<T> {
    /// `tracker` must be the one the connection reports confirmations to
    pub fn new(
        connection: ConnectionManager<T>,
        tracker: DeliveryTracker,
        delivery_timeout: Duration,
        publish_retries: u32,
    ) -> Self {
        Self {
            connection,
            assembler: BatchAssembler::new(),
            tracker,
            delivery_timeout,
            publish_retries,
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn registry(&self) -> &AssetRegistry {
        self.assembler.registry()
    }

    pub fn delivery_marker(&self) -> DeliveryMarker {
        self.tracker.marker()
    }

    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.connection.connect().await
    }

    pub async fn shutdown(&mut self) {
        self.connection.shutdown().await;
    }

    /// Publish `readings` as one message and return how many were sent
    ///
    /// Failures are logged and reported as 0; the coordinator stays usable
    /// and reconnects on the next call.
    pub async fn send(&mut self, readings: &[Reading]) -> usize {
        if readings.is_empty() {
            debug!("Nothing to send");
            return 0;
        }

        let span = publish_span!(
            device_id = %self.connection.identity().device_id,
            readings = readings.len()
        );
        match self.send_batch(readings).instrument(span).await {
            Ok(count) => count,
            Err(e) => {
                error!(
                    error = %sanitize_error_message(&e.to_string()),
                    transient = e.is_transient(),
                    "Failed to send readings"
                );
                0
            }
        }
    }

    async fn send_batch(&mut self, readings: &[Reading]) -> Result<usize, NorthError> {
        let started = Instant::now();

        if !self.connection.is_connected() {
            self.connection.connect().await?;
        }

        let batch = self.assembler.assemble(readings);
        debug!(
            assets = batch.asset_count,
            bytes = batch.payload.len(),
            "Assembled batch"
        );

        let topic = self.connection.identity().events_topic();
        let token = self
            .publish_with_retry(&topic, Bytes::from(batch.payload))
            .await?;

        if let Err(timeout) = self
            .tracker
            .wait_for_delivery(token, self.delivery_timeout)
            .await
        {
            warn!(error = %timeout, "Publish accepted but not yet confirmed");
        }

        let elapsed = started.elapsed();
        let rate = batch.reading_count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            readings = batch.reading_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "Sent {} readings ({:.1} readings/sec)",
            batch.reading_count,
            rate
        );
        Ok(batch.reading_count)
    }

    async fn publish_with_retry(
        &mut self,
        topic: &str,
        payload: Bytes,
    ) -> Result<DeliveryToken, PublishError> {
        let mut retries = 0u32;

        loop {
            if !self.connection.is_connected() {
                if let Err(e) = self.connection.connect().await {
                    warn!(error = %e, "Reconnect before publish failed");
                    return Err(PublishError::NotConnected);
                }
            }

            let token = self.tracker.record_sent();
            match self.connection.publish(topic, payload.clone(), token).await {
                Ok(()) => {
                    debug!(token, topic = %topic, "Publish accepted");
                    return Ok(token);
                }
                Err(PublishError::Disconnected) if retries < self.publish_retries => {
                    retries += 1;
                    warn!(
                        retry = retries,
                        max_retries = self.publish_retries,
                        "Disconnected during publish, retrying"
                    );
                    self.connection.disconnect().await;
                }
                Err(e) => {
                    error!(error = %e, retries, "Publish failed");
                    self.connection.disconnect().await;
                    return Err(e);
                }
            }
        }
    }
}
