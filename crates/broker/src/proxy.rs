use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket, ZmqMessage};

use crate::error::BrokerError;
use crate::transport::Transport;

/// Counters kept while forwarding.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub total_messages: AtomicU64,
    pub topic_counts: Mutex<HashMap<String, u64>>,
}

impl ProxyStats {
    pub fn total(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Where producers connect (proxy binds SUB here).
    pub frontend: Transport,
    /// Where consumers connect (proxy binds PUB here).
    pub backend: Transport,
}

impl ProxyConfig {
    pub fn local() -> Self {
        let frontend = Transport::ipc("proxy");
        Self {
            backend: frontend.paired(),
            frontend,
        }
    }

    pub fn tcp(host: &str, frontend_port: u16, backend_port: u16) -> Self {
        Self {
            frontend: Transport::tcp(host, frontend_port),
            backend: Transport::tcp(host, backend_port),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::local()
    }
}

/// PUB/SUB forwarding proxy between producers and consumers.
///
/// - Producers connect to the **frontend** (SUB socket the proxy binds).
/// - Consumers connect to the **backend** (PUB socket the proxy binds).
///
/// `zeromq` 0.4 has no XPUB/XSUB, so the frontend subscribes to all topics
/// and every frame set is forwarded as is.
pub struct Proxy {
    config: ProxyConfig,
    stats: Arc<ProxyStats>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            stats: Arc::new(ProxyStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Bind both sockets and forward until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        for transport in [&self.config.frontend, &self.config.backend] {
            transport.ensure_ipc_dir()?;
            transport.remove_stale_socket()?;
        }

        let mut frontend = SubSocket::new();
        frontend.bind(&self.config.frontend.endpoint()).await?;
        frontend.subscribe("").await?;
        tracing::info!(
            endpoint = %self.config.frontend.endpoint(),
            "proxy frontend (SUB) bound, producers connect here"
        );

        let mut backend = PubSocket::new();
        backend.bind(&self.config.backend.endpoint()).await?;
        tracing::info!(
            endpoint = %self.config.backend.endpoint(),
            "proxy backend (PUB) bound, consumers connect here"
        );

        loop {
            let msg = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = frontend.recv() => match received {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(error = %e, "frontend recv error");
                        continue;
                    }
                },
            };

            let topic = extract_topic(&msg);
            self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
            *self
                .stats
                .topic_counts
                .lock()
                .await
                .entry(topic.clone())
                .or_insert(0) += 1;

            tracing::debug!(topic = %topic, "forwarding message");
            if let Err(e) = backend.send(msg).await {
                tracing::warn!(error = %e, "backend send error");
            }
        }

        tracing::info!(total = self.stats.total(), "proxy stopped");
        Ok(())
    }
}

/// Topic from the first frame, lossily decoded.
fn extract_topic(msg: &ZmqMessage) -> String {
    msg.iter()
        .next()
        .map(|frame| String::from_utf8_lossy(frame.as_ref()).into_owned())
        .unwrap_or_else(|| "<empty>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_config_pairs_ipc_sockets() {
        let cfg = ProxyConfig::local();
        assert!(cfg.frontend.endpoint().ends_with("proxy.sock"));
        assert!(cfg.backend.endpoint().ends_with("proxy-backend.sock"));
    }

    #[test]
    fn tcp_config_endpoints() {
        let cfg = ProxyConfig::tcp("0.0.0.0", 5555, 5556);
        assert_eq!(cfg.frontend.endpoint(), "tcp://0.0.0.0:5555");
        assert_eq!(cfg.backend.endpoint(), "tcp://0.0.0.0:5556");
    }

    #[test]
    fn extract_topic_from_first_frame() {
        let mut msg: ZmqMessage = "alert-data".into();
        msg.push_back(b"envelope".to_vec().into());
        assert_eq!(extract_topic(&msg), "alert-data");
    }
}
