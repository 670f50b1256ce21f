//! Sent/delivered sequence markers
//!
//! `send` runs on the caller's task while delivery confirmations arrive from
//! the transport's event loop. The tracker ties the two together: every
//! publish takes the next sequence number, confirmations raise the delivered
//! mark, and the caller waits for the mark to reach its number.

use crate::error::DeliveryTimeout;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Sequence number attached to a publish
pub type DeliveryToken = u64;

/// Snapshot of the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryMarker {
    pub last_sent: DeliveryToken,
    pub last_delivered: DeliveryToken,
}

#[derive(Debug, Clone)]
pub struct DeliveryTracker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    last_sent: AtomicU64,
    delivered: watch::Sender<DeliveryToken>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        let (delivered, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                last_sent: AtomicU64::new(0),
                delivered,
            }),
        }
    }

    /// Allocate and record the next sequence number
    pub fn record_sent(&self) -> DeliveryToken {
        self.inner.last_sent.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raise the delivered mark to `token`. Returns false for stale or
    /// duplicate confirmations, which leave the mark untouched.
    pub fn record_delivered(&self, token: DeliveryToken) -> bool {
        self.inner.delivered.send_if_modified(|current| {
            if token > *current {
                *current = token;
                true
            } else {
                false
            }
        })
    }

    pub fn last_sent(&self) -> DeliveryToken {
        self.inner.last_sent.load(Ordering::SeqCst)
    }

    pub fn last_delivered(&self) -> DeliveryToken {
        *self.inner.delivered.borrow()
    }

    pub fn marker(&self) -> DeliveryMarker {
        DeliveryMarker {
            last_sent: self.last_sent(),
            last_delivered: self.last_delivered(),
        }
    }

    /// Wait until `token` (or anything later) has been confirmed
    pub async fn wait_for_delivery(
        &self,
        token: DeliveryToken,
        timeout: Duration,
    ) -> Result<(), DeliveryTimeout> {
        let mut delivered = self.inner.delivered.subscribe();
        let confirmed =
            match tokio::time::timeout(timeout, delivered.wait_for(|mark| *mark >= token)).await {
                Ok(Ok(_)) => true,
                // The sender lives as long as `self`, so a closed channel cannot happen here
                Ok(Err(_)) | Err(_) => false,
            };

        if confirmed {
            Ok(())
        } else {
            Err(DeliveryTimeout { token, timeout })
        }
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}
