use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::message::{Message, MessageId};
use crate::subscription::SubscriptionOptions;

/// Consumer side of a subscription.
///
/// Every message handed out by `receive` must be settled with `ack` or
/// `nack`. Unsettled messages are redelivered when the consumer closes.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Receive the next message. Blocks until one is available.
    async fn receive(&self) -> Result<Message, BrokerError>;

    /// Acknowledge successful processing.
    async fn ack(&self, message: &Message) -> Result<(), BrokerError>;

    /// Negative-acknowledge; the message is redelivered later.
    async fn nack(&self, message: &Message) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Producer bound to a single topic.
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn topic(&self) -> &str;

    /// Publish a message to this producer's topic.
    async fn send(&self, message: Message) -> Result<MessageId, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Blanket implementation so `Arc<dyn MessageSink>` can be used directly.
#[async_trait]
impl<T: MessageSink + ?Sized> MessageSink for Arc<T> {
    fn topic(&self) -> &str {
        (**self).topic()
    }

    async fn send(&self, message: Message) -> Result<MessageId, BrokerError> {
        (**self).send(message).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }
}

/// A connection to a broker, from which consumers and producers are made.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn MessageSource>, BrokerError>;

    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn MessageSink>, BrokerError>;

    /// Close the connection. Consumers and producers made from it stop working.
    async fn close(&self) -> Result<(), BrokerError>;
}
