use std::time::Duration;

use sensorflow_broker::BrokerError;
use sensorflow_core::CoreError;
use thiserror::Error;

/// Failures fetching an agent's processing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no processing config for agent {0}")]
    NotFound(String),

    #[error("config service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("config request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed config response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures publishing a record downstream.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Permanent; retrying cannot help.
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("send to '{topic}' failed: {source}")]
    Broker {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("send to '{topic}' timed out after {after:?}")]
    Timeout { topic: String, after: Duration },
}

/// Failures of the consumer loop, the sample handler and the coordinator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cancelled")]
    Cancelled,

    #[error("subscribe to '{topic}' failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("undecodable sample: {0}")]
    Decode(#[from] CoreError),

    #[error("processing config unavailable: {0}")]
    Config(#[from] ConfigError),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Failures registering the agent with the server.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registration rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
}
