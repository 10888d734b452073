//! Dedicated publisher task for reply envelopes.
//!
//! Handler tasks run concurrently, but the broker channel sees one publish
//! at a time: every reply goes through an mpsc queue to a single task that
//! owns the channel's publish path and reports each outcome back.
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<PublishRequest> ─► Publisher Task ─► channel.publish
//! Handler N ─┘            ◄── oneshot result ──┘
//! ```
//!
//! The handle tracks pending publishes; once `max_pending` is reached,
//! callers wait for the queue to drain and give up after the configured
//! timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broker::{BrokerChannel, PublishOptions};
use crate::envelope::Envelope;
use crate::error::{Result, RpcError};

/// Default maximum pending publishes before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default queue capacity between handlers and the publisher task.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout in milliseconds.
pub const DEFAULT_BACKPRESSURE_TIMEOUT_MS: u64 = 5_000;

const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// A reply ready to be published.
#[derive(Debug, Clone)]
pub struct OutboundReply {
    /// Exchange to publish to.
    pub exchange: String,
    /// Routing key to publish with.
    pub routing_key: String,
    /// The reply envelope.
    pub envelope: Envelope,
}

struct PublishRequest {
    reply: OutboundReply,
    done: oneshot::Sender<Result<()>>,
}

/// Configuration for the publisher task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Maximum pending publishes before backpressure kicks in.
    pub max_pending: usize,
    /// Queue capacity for publish requests.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear, in milliseconds.
    pub backpressure_timeout_ms: u64,
}

impl PublisherConfig {
    /// Backpressure timeout as a `Duration`.
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT_MS,
        }
    }
}

/// Handle for submitting replies to the publisher task.
///
/// Cheaply cloneable; one clone per in-flight request.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<PublishRequest>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl PublisherHandle {
    fn new(
        tx: mpsc::Sender<PublishRequest>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Publish a reply and wait for the broker's verdict.
    ///
    /// # Errors
    ///
    /// - `BackpressureTimeout` if the queue stayed full past the timeout
    /// - `ConnectionClosed` if the publisher task is gone
    /// - whatever the broker channel returned for the publish
    pub async fn publish(&self, reply: OutboundReply) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        let (done, result) = oneshot::channel();
        if self.tx.send(PublishRequest { reply, done }).await.is_err() {
            self.pending.fetch_sub(1, Ordering::Release);
            return Err(RpcError::ConnectionClosed);
        }

        result.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(RpcError::BackpressureTimeout);
            }

            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the publisher task and return a handle for submitting replies.
///
/// The task exits once every handle has been dropped.
pub fn spawn_publisher_task(
    channel: Arc<dyn BrokerChannel>,
    config: PublisherConfig,
) -> (PublisherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = PublisherHandle::new(
        tx,
        pending.clone(),
        config.max_pending,
        config.backpressure_timeout(),
    );

    let task = tokio::spawn(publisher_loop(rx, channel, pending));

    (handle, task)
}

async fn publisher_loop(
    mut rx: mpsc::Receiver<PublishRequest>,
    channel: Arc<dyn BrokerChannel>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(request) = rx.recv().await {
        let OutboundReply {
            exchange,
            routing_key,
            envelope,
        } = request.reply;

        let result = channel
            .publish(&exchange, &routing_key, PublishOptions::default(), envelope)
            .await;

        pending.fetch_sub(1, Ordering::Release);
        // Requester may have given up; nothing to report to.
        let _ = request.done.send(result);
    }
}
