//! ZeroMQ backend.
//!
//! Producers connect a PUB socket to the proxy frontend; consumers connect a
//! SUB socket to the proxy backend. Messages are two-frame ZMQ messages:
//! 1. Topic string (used by SUB sockets for prefix filtering)
//! 2. MessagePack-encoded [`Message`] envelope
//!
//! PUB/SUB has no acknowledgements. Ack is a no-op and nack re-queues the
//! message locally, so redelivery only happens within the consumer that
//! nacked it. Every consumer receives every message regardless of the
//! subscription type.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket, ZmqMessage};

use crate::error::BrokerError;
use crate::message::{Message, MessageId};
use crate::subscription::{SubscriptionOptions, SubscriptionType};
use crate::traits::{BrokerClient, MessageSink, MessageSource};
use crate::transport::Transport;

/// Upper bound on locally queued redeliveries per consumer.
pub const REDELIVERY_CAPACITY: usize = 1024;

// ── Client ──────────────────────────────────────────────────────────

pub struct ZmqClient {
    frontend: Transport,
    backend: Transport,
    connect_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl ZmqClient {
    pub fn new(frontend: Transport, backend: Transport, connect_timeout: Duration) -> Self {
        Self {
            frontend,
            backend,
            connect_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
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
impl BrokerClient for ZmqClient {
    async fn subscribe(
        &self,
        topic: &str,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn MessageSource>, BrokerError> {
        self.ensure_open()?;
        if matches!(
            options.kind,
            SubscriptionType::Shared | SubscriptionType::KeyShared
        ) {
            warn!(
                subscription = %options.name,
                kind = %options.kind,
                "ZeroMQ delivers every message to every consumer; competing consumers are not supported"
            );
        }
        let consumer = ZmqConsumer::connect(
            &self.backend,
            topic,
            options,
            self.connect_timeout,
            self.closed.clone(),
        )
        .await?;
        Ok(Arc::new(consumer))
    }

    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn MessageSink>, BrokerError> {
        self.ensure_open()?;
        let producer =
            ZmqProducer::connect(&self.frontend, topic, self.connect_timeout, self.closed.clone())
                .await?;
        Ok(Arc::new(producer))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        info!(frontend = %self.frontend, backend = %self.backend, "ZeroMQ client closed");
        Ok(())
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, zeromq::ZmqError>>,
) -> Result<T, BrokerError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(BrokerError::from),
        Err(_) => Err(BrokerError::Timeout(limit)),
    }
}

// ── Producer ────────────────────────────────────────────────────────

/// PUB socket connected to the proxy frontend.
pub struct ZmqProducer {
    topic: String,
    socket: Mutex<Option<PubSocket>>,
    connection: Arc<AtomicBool>,
}

impl ZmqProducer {
    #[instrument(skip_all, fields(endpoint = %transport, topic))]
    async fn connect(
        transport: &Transport,
        topic: &str,
        limit: Duration,
        connection: Arc<AtomicBool>,
    ) -> Result<Self, BrokerError> {
        let mut socket = PubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting PUB socket to proxy frontend");
        with_timeout(limit, socket.connect(&endpoint)).await?;
        Ok(Self {
            topic: topic.to_string(),
            socket: Mutex::new(Some(socket)),
            connection,
        })
    }
}

#[async_trait]
impl MessageSink for ZmqProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, mut message: Message) -> Result<MessageId, BrokerError> {
        if self.connection.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        message.topic = self.topic.clone();
        message.publish_time = Utc::now();
        let id = message.id;
        let envelope_bytes = message.to_bytes()?;

        let mut zmq_msg = ZmqMessage::from(self.topic.as_str());
        zmq_msg.push_back(envelope_bytes.into());

        let mut guard = self.socket.lock().await;
        let socket = guard.as_mut().ok_or(BrokerError::Closed)?;
        socket.send(zmq_msg).await?;

        debug!(topic = %self.topic, message_id = %id, "published message");
        Ok(id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Dropping the socket disconnects it.
        self.socket.lock().await.take();
        Ok(())
    }
}

// ── Consumer ────────────────────────────────────────────────────────

/// SUB socket connected to the proxy backend, filtered to one topic.
pub struct ZmqConsumer {
    topic: String,
    subscription: String,
    max_redeliveries: u32,
    socket: Mutex<Option<SubSocket>>,
    redelivery: Mutex<VecDeque<Message>>,
    connection: Arc<AtomicBool>,
}

impl ZmqConsumer {
    #[instrument(skip_all, fields(endpoint = %transport, topic))]
    async fn connect(
        transport: &Transport,
        topic: &str,
        options: &SubscriptionOptions,
        limit: Duration,
        connection: Arc<AtomicBool>,
    ) -> Result<Self, BrokerError> {
        let mut socket = SubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting SUB socket to proxy backend");
        with_timeout(limit, socket.connect(&endpoint)).await?;
        socket.subscribe(topic).await?;
        info!(topic, subscription = %options.name, "subscribed");
        Ok(Self {
            topic: topic.to_string(),
            subscription: options.name.clone(),
            max_redeliveries: options.max_redeliveries,
            socket: Mutex::new(Some(socket)),
            redelivery: Mutex::new(VecDeque::new()),
            connection,
        })
    }

    async fn recv_frames(&self) -> Result<ZmqMessage, BrokerError> {
        let mut guard = self.socket.lock().await;
        let socket = guard.as_mut().ok_or(BrokerError::Closed)?;
        Ok(socket.recv().await?)
    }
}

/// Decode the envelope from a `[topic, envelope]` message.
///
/// A single frame is taken to be the envelope itself.
fn decode_frames(zmq_msg: &ZmqMessage) -> Result<Message, BrokerError> {
    let frames: Vec<_> = zmq_msg.iter().collect();
    let envelope = match frames.as_slice() {
        [] => return Err(BrokerError::Transport("empty ZMQ message".into())),
        [only] => only.as_ref(),
        [_, envelope, ..] => envelope.as_ref(),
    };
    Ok(Message::from_bytes(envelope)?)
}

#[async_trait]
impl MessageSource for ZmqConsumer {
    async fn receive(&self) -> Result<Message, BrokerError> {
        if self.connection.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if let Some(message) = self.redelivery.lock().await.pop_front() {
            return Ok(message);
        }
        loop {
            let zmq_msg = self.recv_frames().await?;
            let message = decode_frames(&zmq_msg)?;
            // SUB filtering is by prefix; drop longer topic names.
            if message.topic != self.topic {
                debug!(topic = %message.topic, wanted = %self.topic, "skipping prefix match");
                continue;
            }
            debug!(topic = %message.topic, message_id = %message.id, "received message");
            return Ok(message);
        }
    }

    async fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        debug!(message_id = %message.id, "ack (no-op on ZeroMQ)");
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<(), BrokerError> {
        let mut message = message.clone();
        message.redelivery_count += 1;
        if message.redelivery_count > self.max_redeliveries {
            warn!(
                topic = %self.topic,
                subscription = %self.subscription,
                message_id = %message.id,
                "redeliveries exhausted, dropping message"
            );
            return Ok(());
        }
        let mut queue = self.redelivery.lock().await;
        if queue.len() >= REDELIVERY_CAPACITY {
            return Err(BrokerError::RedeliveryFull(queue.len()));
        }
        queue.push_back(message);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.socket.lock().await.take();
        let dropped = {
            let mut queue = self.redelivery.lock().await;
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            warn!(topic = %self.topic, dropped, "closing consumer with queued redeliveries");
        }
        Ok(())
    }
}
