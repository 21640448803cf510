//! In-process broker.
//!
//! Topics fan out to subscriptions; each subscription keeps its own backlog
//! and hands messages to its consumers according to its
//! [`SubscriptionType`]. Handed-out messages stay pending until acked.
//! A nack puts the message back at the head of the backlog, or moves it to
//! the subscription's dead letters once `max_redeliveries` is exceeded.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::message::{Message, MessageId};
use crate::subscription::{SubscriptionOptions, SubscriptionType};
use crate::traits::{BrokerClient, MessageSink, MessageSource};

/// Brokers registered under a `memory://<name>` URL.
static REGISTRY: OnceLock<Mutex<HashMap<String, MemoryBroker>>> = OnceLock::new();

// ── Broker ──────────────────────────────────────────────────────────

/// Handle to an in-process broker. Clones share the same topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    topics: Mutex<HashMap<String, Topic>>,
    next_consumer: AtomicU64,
}

#[derive(Default)]
struct Topic {
    subscriptions: HashMap<String, Arc<Subscription>>,
}

struct Subscription {
    name: String,
    topic: String,
    kind: SubscriptionType,
    max_redeliveries: u32,
    state: Mutex<SubscriptionState>,
    notify: Notify,
}

#[derive(Default)]
struct SubscriptionState {
    backlog: VecDeque<Message>,
    /// Handed out and not yet settled, with the consumer holding each.
    pending: HashMap<MessageId, (u64, Message)>,
    /// Attached consumers in attach order.
    consumers: Vec<u64>,
    dead_letters: Vec<Message>,
}

impl SubscriptionState {
    fn may_receive(&self, kind: SubscriptionType, consumer: u64) -> bool {
        match kind {
            SubscriptionType::Failover => self.consumers.first() == Some(&consumer),
            _ => self.consumers.contains(&consumer),
        }
    }
}

impl MemoryBroker {
    /// A fresh broker not shared with anything else.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide broker registered under `name`, created on first use.
    pub async fn named(name: &str) -> Self {
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let mut brokers = registry.lock().await;
        brokers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name, "creating in-process broker");
                MemoryBroker::new()
            })
            .clone()
    }

    /// A new client connection to this broker.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver `message` to every subscription on its topic.
    ///
    /// A topic without subscriptions drops the message.
    pub async fn publish(&self, message: Message) {
        let topics = self.hub.topics.lock().await;
        let Some(topic) = topics.get(&message.topic) else {
            debug!(topic = %message.topic, "no subscriptions, message dropped");
            return;
        };
        for subscription in topic.subscriptions.values() {
            subscription.state.lock().await.backlog.push_back(message.clone());
            subscription.notify.notify_waiters();
        }
    }

    /// Messages waiting to be handed out on a subscription.
    pub async fn backlog_len(&self, topic: &str, subscription: &str) -> usize {
        match self.subscription(topic, subscription).await {
            Some(sub) => sub.state.lock().await.backlog.len(),
            None => 0,
        }
    }

    /// Messages handed out on a subscription and not yet acked or nacked.
    pub async fn pending_len(&self, topic: &str, subscription: &str) -> usize {
        match self.subscription(topic, subscription).await {
            Some(sub) => sub.state.lock().await.pending.len(),
            None => 0,
        }
    }

    /// Messages that ran out of redeliveries on a subscription.
    pub async fn dead_letters(&self, topic: &str, subscription: &str) -> Vec<Message> {
        match self.subscription(topic, subscription).await {
            Some(sub) => sub.state.lock().await.dead_letters.clone(),
            None => Vec::new(),
        }
    }

    async fn subscription(&self, topic: &str, name: &str) -> Option<Arc<Subscription>> {
        let topics = self.hub.topics.lock().await;
        topics.get(topic)?.subscriptions.get(name).cloned()
    }

    async fn attach(
        &self,
        topic: &str,
        options: &SubscriptionOptions,
    ) -> Result<(Arc<Subscription>, u64), BrokerError> {
        let mut topics = self.hub.topics.lock().await;
        let subscription = topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .entry(options.name.clone())
            .or_insert_with(|| {
                Arc::new(Subscription {
                    name: options.name.clone(),
                    topic: topic.to_string(),
                    kind: options.kind,
                    max_redeliveries: options.max_redeliveries,
                    state: Mutex::new(SubscriptionState::default()),
                    notify: Notify::new(),
                })
            })
            .clone();

        let refuse = |reason: String| BrokerError::Subscription {
            topic: topic.to_string(),
            subscription: options.name.clone(),
            reason,
        };

        if subscription.kind != options.kind {
            return Err(refuse(format!(
                "already exists as {}, requested {}",
                subscription.kind, options.kind
            )));
        }

        let mut state = subscription.state.lock().await;
        if subscription.kind == SubscriptionType::Exclusive && !state.consumers.is_empty() {
            return Err(refuse("exclusive subscription already has a consumer".into()));
        }
        let id = self.hub.next_consumer.fetch_add(1, Ordering::Relaxed);
        state.consumers.push(id);
        drop(state);

        info!(
            topic,
            subscription = %options.name,
            kind = %options.kind,
            consumer = id,
            "consumer attached"
        );
        Ok((subscription, id))
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// A connection to a [`MemoryBroker`].
pub struct MemoryClient {
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
}

impl MemoryClient {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn subscribe(
        &self,
        topic: &str,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn MessageSource>, BrokerError> {
        self.ensure_open()?;
        let (subscription, id) = self.broker.attach(topic, options).await?;
        Ok(Arc::new(MemoryConsumer {
            id,
            subscription,
            closed: AtomicBool::new(false),
            connection: self.closed.clone(),
        }))
    }

    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn MessageSink>, BrokerError> {
        self.ensure_open()?;
        Ok(Arc::new(MemoryProducer {
            topic: topic.to_string(),
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            connection: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Producer ────────────────────────────────────────────────────────

pub struct MemoryProducer {
    topic: String,
    broker: MemoryBroker,
    closed: AtomicBool,
    connection: Arc<AtomicBool>,
}

#[async_trait]
impl MessageSink for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, mut message: Message) -> Result<MessageId, BrokerError> {
        if self.closed.load(Ordering::SeqCst) || self.connection.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        message.topic = self.topic.clone();
        message.publish_time = Utc::now();
        let id = message.id;
        self.broker.publish(message).await;
        Ok(id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Consumer ────────────────────────────────────────────────────────

pub struct MemoryConsumer {
    id: u64,
    subscription: Arc<Subscription>,
    closed: AtomicBool,
    connection: Arc<AtomicBool>,
}

impl MemoryConsumer {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.connection.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for MemoryConsumer {
    async fn receive(&self) -> Result<Message, BrokerError> {
        let sub = &self.subscription;
        loop {
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }

            // Register for wakeups before looking, so a publish between the
            // check and the await is not missed.
            let notified = sub.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = sub.state.lock().await;
                if state.may_receive(sub.kind, self.id) {
                    if let Some(message) = state.backlog.pop_front() {
                        state.pending.insert(message.id, (self.id, message.clone()));
                        return Ok(message);
                    }
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        let mut state = self.subscription.state.lock().await;
        match state.pending.remove(&message.id) {
            Some(_) => Ok(()),
            None => Err(BrokerError::UnknownMessage(message.id)),
        }
    }

    async fn nack(&self, message: &Message) -> Result<(), BrokerError> {
        let sub = &self.subscription;
        let mut state = sub.state.lock().await;
        let Some((_, mut message)) = state.pending.remove(&message.id) else {
            return Err(BrokerError::UnknownMessage(message.id));
        };

        message.redelivery_count += 1;
        if message.redelivery_count > sub.max_redeliveries {
            warn!(
                topic = %sub.topic,
                subscription = %sub.name,
                message_id = %message.id,
                redeliveries = message.redelivery_count - 1,
                "redeliveries exhausted, dead-lettering message"
            );
            state.dead_letters.push(message);
        } else {
            state.backlog.push_front(message);
            drop(state);
            sub.notify.notify_waiters();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sub = &self.subscription;
        let mut state = sub.state.lock().await;
        state.consumers.retain(|&c| c != self.id);

        // Unsettled messages go back to the front, keeping their order.
        let mut returned: Vec<Message> = Vec::new();
        state.pending.retain(|_, (holder, message)| {
            if *holder == self.id {
                returned.push(message.clone());
                false
            } else {
                true
            }
        });
        returned.sort_by_key(|m| m.publish_time);
        for message in returned.into_iter().rev() {
            state.backlog.push_front(message);
        }
        drop(state);

        sub.notify.notify_waiters();
        debug!(topic = %sub.topic, subscription = %sub.name, consumer = self.id, "consumer closed");
        Ok(())
    }
}
