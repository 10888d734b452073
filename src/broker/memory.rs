//! In-process broker with topic-exchange routing.
//!
//! [`MemoryBroker`] models the subset of AMQP 0-9-1 semantics the RPC
//! protocol touches:
//!
//! - topic exchanges with `*` / `#` binding patterns
//! - queue declaration with option-mismatch checks
//! - round-robin delivery across the consumers of one queue, with a backlog
//!   while no consumer is attached
//! - per-delivery acknowledgement tracking, with channel prefetch limiting
//!   how many unacked deliveries a consumer holds
//!
//! Every publish and ack is appended to a journal that tests can inspect.
//! The broker is cheaply cloneable; clones share state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    BrokerChannel, ConsumeOptions, Connection, DeliveryStream, PublishOptions, QueueOptions,
};
use crate::envelope::{Delivery, Envelope};
use crate::error::{Result, RpcError};
use crate::topology::topic_matches;

/// Journal entry recorded by [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A message was accepted by an exchange.
    Published {
        exchange: String,
        routing_key: String,
        envelope: Envelope,
    },
    /// A delivery was acknowledged.
    Acked { delivery_tag: u64 },
}

struct Consumer {
    tag: String,
    channel_id: u64,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueuedMessage {
    exchange: String,
    routing_key: String,
    envelope: Envelope,
}

struct Queue {
    options: QueueOptions,
    consumers: Vec<Consumer>,
    exclusive_consumer: bool,
    next_consumer: usize,
    backlog: VecDeque<QueuedMessage>,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    /// delivery tag -> owning channel id
    unacked: HashMap<u64, u64>,
    /// channel id -> (purpose, prefetch)
    channels: HashMap<u64, (String, u16)>,
    rejected_routes: Vec<String>,
    journal: Vec<BrokerEvent>,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    next_tag: AtomicU64,
    next_channel: AtomicU64,
    fail_topology: AtomicBool,
}

/// In-process message broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker with no exchanges.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                next_tag: AtomicU64::new(1),
                next_channel: AtomicU64::new(1),
                fail_topology: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a topic exchange. Declaring an existing exchange is a no-op.
    pub fn declare_exchange(&self, name: &str) {
        self.state().exchanges.insert(name.to_string());
    }

    /// Make every subsequent queue declaration and binding fail.
    pub fn fail_topology(&self, fail: bool) {
        self.inner.fail_topology.store(fail, Ordering::Release);
    }

    /// Reject publishes whose routing key matches `pattern`.
    pub fn reject_publishes(&self, pattern: &str) {
        self.state().rejected_routes.push(pattern.to_string());
    }

    /// Tear down every consumer. Open delivery streams end and further
    /// operations fail with [`RpcError::ConnectionClosed`].
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    /// Snapshot of the publish/ack journal, oldest first.
    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state().journal.clone()
    }

    /// Envelopes published with a routing key matching `pattern`.
    pub fn published(&self, pattern: &str) -> Vec<(String, Envelope)> {
        self.state()
            .journal
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Published {
                    routing_key,
                    envelope,
                    ..
                } if topic_matches(pattern, routing_key) => {
                    Some((routing_key.clone(), envelope.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Delivery tags acknowledged so far, in ack order.
    pub fn acked_tags(&self) -> Vec<u64> {
        self.state()
            .journal
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Acked { delivery_tag } => Some(*delivery_tag),
                _ => None,
            })
            .collect()
    }

    /// Number of deliveries handed out but not yet acknowledged.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    /// Options a queue was declared with, if it exists.
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state().queues.get(name).map(|q| q.options)
    }

    /// Messages waiting in a queue for a consumer.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state().queues.get(name).map(|q| q.backlog.len())
    }

    /// `(exchange, pattern)` pairs bound to a queue.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.pattern.clone()))
            .collect()
    }

    /// Tags of the consumers attached to a queue.
    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    /// Prefetch count of the most recently opened channel with this purpose.
    pub fn channel_prefetch(&self, purpose: &str) -> Option<u16> {
        let state = self.state();
        state
            .channels
            .iter()
            .filter(|(_, (p, _))| p == purpose)
            .max_by_key(|(id, _)| **id)
            .map(|(_, (_, prefetch))| *prefetch)
    }

    fn check_topology(&self, op: &str) -> Result<()> {
        if self.inner.fail_topology.load(Ordering::Acquire) {
            return Err(RpcError::Broker(format!("{} refused", op)));
        }
        Ok(())
    }

    fn next_tag(&self) -> u64 {
        self.inner.next_tag.fetch_add(1, Ordering::AcqRel)
    }

    /// Hand a message to the next consumer of `queue` with prefetch room,
    /// or park it at the back of the backlog.
    fn deliver(&self, state: &mut State, queue_name: &str, message: QueuedMessage) {
        if let Some(message) = self.try_deliver(state, queue_name, message) {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.backlog.push_back(message);
            }
        }
    }

    /// Returns the message if no consumer can take it right now.
    fn try_deliver(
        &self,
        state: &mut State,
        queue_name: &str,
        mut message: QueuedMessage,
    ) -> Option<QueuedMessage> {
        let State {
            queues,
            unacked,
            channels,
            ..
        } = state;
        let queue = queues.get_mut(queue_name)?;
        queue.prune_closed();

        let count = queue.consumers.len();
        for offset in 0..count {
            let idx = (queue.next_consumer + offset) % count;
            let consumer = &queue.consumers[idx];
            if !consumer.auto_ack && at_prefetch_limit(unacked, channels, consumer.channel_id) {
                continue;
            }

            let delivery = Delivery {
                delivery_tag: self.next_tag(),
                exchange: message.exchange,
                routing_key: message.routing_key,
                redelivered: false,
                envelope: message.envelope,
            };
            let tag = delivery.delivery_tag;

            match consumer.tx.send(delivery) {
                Ok(()) => {
                    if !consumer.auto_ack {
                        unacked.insert(tag, consumer.channel_id);
                    }
                    queue.next_consumer = idx + 1;
                    return None;
                }
                // Stream dropped since the prune; try the next consumer.
                Err(mpsc::error::SendError(returned)) => {
                    message = QueuedMessage {
                        exchange: returned.exchange,
                        routing_key: returned.routing_key,
                        envelope: returned.envelope,
                    };
                }
            }
        }

        Some(message)
    }

    /// Deliver parked messages of `queue_name`, in order, while consumers
    /// have room.
    fn drain_backlog(&self, state: &mut State, queue_name: &str) {
        loop {
            let message = match state
                .queues
                .get_mut(queue_name)
                .and_then(|q| q.backlog.pop_front())
            {
                Some(m) => m,
                None => return,
            };

            if let Some(message) = self.try_deliver(state, queue_name, message) {
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.backlog.push_front(message);
                }
                return;
            }
        }
    }

    fn drain_backlogs(&self, state: &mut State) {
        let parked: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.backlog.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        for queue_name in parked {
            self.drain_backlog(state, &queue_name);
        }
    }
}

impl Queue {
    /// Forget consumers whose delivery stream was dropped.
    fn prune_closed(&mut self) {
        self.consumers.retain(|c| !c.tx.is_closed());
        if self.consumers.is_empty() {
            self.exclusive_consumer = false;
        }
    }
}

/// Whether `channel_id` already holds as many unacked deliveries as its
/// prefetch allows. A prefetch of 0 means unlimited.
fn at_prefetch_limit(
    unacked: &HashMap<u64, u64>,
    channels: &HashMap<u64, (String, u16)>,
    channel_id: u64,
) -> bool {
    let prefetch = match channels.get(&channel_id) {
        Some((_, prefetch)) if *prefetch > 0 => usize::from(*prefetch),
        _ => return false,
    };
    unacked.values().filter(|owner| **owner == channel_id).count() >= prefetch
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    async fn open_channel(&self, prefetch: u16, purpose: &str) -> Result<Arc<dyn BrokerChannel>> {
        let id = self.inner.next_channel.fetch_add(1, Ordering::AcqRel);
        {
            let mut state = self.state();
            if state.closed {
                return Err(RpcError::ConnectionClosed);
            }
            state.channels.insert(id, (purpose.to_string(), prefetch));
        }
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.clone(),
        }))
    }
}

/// Channel handed out by [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.broker.check_topology("queue declare")?;
        let mut state = self.broker.state();
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }

        match state.queues.get(name) {
            Some(existing) if existing.options != options => Err(RpcError::Broker(format!(
                "queue '{}' already declared with different options",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    Queue {
                        options,
                        consumers: Vec::new(),
                        exclusive_consumer: false,
                        next_consumer: 0,
                        backlog: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.broker.check_topology("queue bind")?;
        let mut state = self.broker.state();
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }
        if !state.exchanges.contains(exchange) {
            return Err(RpcError::Broker(format!("no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(RpcError::Broker(format!("no queue '{}'", queue)));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let mut state = self.broker.state();
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| RpcError::Broker(format!("no queue '{}'", queue)))?;
            q.prune_closed();

            if q.exclusive_consumer || (options.exclusive && !q.consumers.is_empty()) {
                return Err(RpcError::Broker(format!(
                    "queue '{}' is in exclusive use",
                    queue
                )));
            }
            if q.consumers.iter().any(|c| c.tag == consumer_tag) {
                return Err(RpcError::Broker(format!(
                    "consumer tag '{}' already in use",
                    consumer_tag
                )));
            }

            q.exclusive_consumer = options.exclusive;
            q.consumers.push(Consumer {
                tag: consumer_tag.to_string(),
                channel_id: self.id,
                auto_ack: options.auto_ack,
                tx,
            });
        }

        self.broker.drain_backlog(&mut state, queue);

        Ok(DeliveryStream::new(rx))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: PublishOptions,
        envelope: Envelope,
    ) -> Result<()> {
        let mut state = self.broker.state();
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }
        if !state.exchanges.contains(exchange) {
            return Err(RpcError::Broker(format!("no exchange '{}'", exchange)));
        }
        if state
            .rejected_routes
            .iter()
            .any(|pattern| topic_matches(pattern, routing_key))
        {
            return Err(RpcError::Broker(format!(
                "publish to '{}' rejected",
                routing_key
            )));
        }

        state.journal.push(BrokerEvent::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        });

        // Unroutable messages are dropped; mandatory returns are not modelled.
        let mut targets: Vec<String> = Vec::new();
        for binding in &state.bindings {
            if binding.exchange == exchange
                && topic_matches(&binding.pattern, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        for queue in targets {
            let message = QueuedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                envelope: envelope.clone(),
            };
            self.broker.deliver(&mut state, &queue, message);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let mut state = self.broker.state();
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }

        if state.unacked.get(&delivery_tag) != Some(&self.id) {
            return Err(RpcError::Broker(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        }

        let mut tags: Vec<u64> = if multiple {
            state
                .unacked
                .iter()
                .filter(|(tag, owner)| **tag <= delivery_tag && **owner == self.id)
                .map(|(tag, _)| *tag)
                .collect()
        } else {
            vec![delivery_tag]
        };
        tags.sort_unstable();

        for tag in tags {
            state.unacked.remove(&tag);
            state.journal.push(BrokerEvent::Acked { delivery_tag: tag });
        }

        self.broker.drain_backlogs(&mut state);
        Ok(())
    }
}
