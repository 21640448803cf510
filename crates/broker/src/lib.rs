//! Message broker abstraction for the sensor pipeline.
//!
//! Two backends sit behind the same [`BrokerClient`] trait:
//! - `memory://<name>`: an in-process broker with subscriptions, ack/nack
//!   and redelivery, shared by every client in the process using that name
//! - `tcp://host:port` / `ipc://name`: ZeroMQ PUB/SUB through a forwarding
//!   [`proxy::Proxy`]

pub mod error;
pub mod memory;
pub mod message;
pub mod proxy;
pub mod subscription;
pub mod traits;
pub mod transport;
pub mod zmq;

use std::sync::Arc;
use std::time::Duration;

pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use message::{Message, MessageId};
pub use subscription::{SubscriptionOptions, SubscriptionType};
pub use traits::{BrokerClient, MessageSink, MessageSource};
pub use transport::{BrokerUrl, Transport};
pub use zmq::ZmqClient;

/// How to reach the broker.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    /// ZeroMQ only: where consumers connect. Defaults to the port after `url`.
    pub backend_url: Option<String>,
    pub connection_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backend_url: None,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// Open a client for the backend named by the URL scheme.
pub async fn connect(options: &ConnectOptions) -> Result<Arc<dyn BrokerClient>, BrokerError> {
    match BrokerUrl::parse(&options.url)? {
        BrokerUrl::Memory(name) => {
            tracing::info!(name = %name, "using in-process broker");
            Ok(Arc::new(MemoryBroker::named(&name).await.client()))
        }
        BrokerUrl::Zmq(frontend) => {
            let backend = match &options.backend_url {
                Some(url) => match BrokerUrl::parse(url)? {
                    BrokerUrl::Zmq(t) => t,
                    BrokerUrl::Memory(_) => {
                        return Err(BrokerError::InvalidUrl(format!(
                            "backend_url must be tcp:// or ipc://, got {url}"
                        )))
                    }
                },
                None => frontend.paired(),
            };
            tracing::info!(frontend = %frontend, backend = %backend, "using ZeroMQ broker");
            Ok(Arc::new(ZmqClient::new(
                frontend,
                backend,
                options.connection_timeout,
            )))
        }
    }
}
