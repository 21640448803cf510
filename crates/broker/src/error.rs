use std::time::Duration;

use thiserror::Error;

use crate::message::MessageId;

/// Errors raised by broker clients, producers and consumers.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    #[error("subscription '{subscription}' on '{topic}': {reason}")]
    Subscription {
        topic: String,
        subscription: String,
        reason: String,
    },

    #[error("message {0} is not pending acknowledgement")]
    UnknownMessage(MessageId),

    #[error("redelivery queue full ({0} messages)")]
    RedeliveryFull(usize),

    #[error("closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
