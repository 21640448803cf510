//! sensorflow-proxy: PUB/SUB forwarding proxy for the ZeroMQ broker backend.
//!
//! Agents publish to the frontend and consume from the backend.
//!
//! # Usage
//!
//! ```bash
//! # TCP, backend on the next port (5556)
//! sensorflow-proxy --frontend tcp://0.0.0.0:5555
//!
//! # IPC
//! sensorflow-proxy --frontend ipc://proxy --backend ipc://proxy-backend
//!
//! # Via environment variables
//! SENSORFLOW_PROXY_FRONTEND=tcp://0.0.0.0:7000 sensorflow-proxy
//! ```

use clap::Parser;
use sensorflow_broker::proxy::{Proxy, ProxyConfig};
use sensorflow_broker::Transport;

/// PUB/SUB forwarding proxy for sensorflow agents.
#[derive(Parser, Debug)]
#[command(name = "sensorflow-proxy", version, about)]
struct Cli {
    /// Frontend endpoint, where producers connect.
    #[arg(long, env = "SENSORFLOW_PROXY_FRONTEND", default_value = "tcp://0.0.0.0:5555")]
    frontend: String,

    /// Backend endpoint, where consumers connect. Defaults to the frontend's pair.
    #[arg(long, env = "SENSORFLOW_PROXY_BACKEND")]
    backend: Option<String>,

    /// Interval in seconds between stats log lines (0 = disabled).
    #[arg(long, env = "SENSORFLOW_PROXY_STATS_INTERVAL", default_value_t = 30)]
    stats_interval: u64,
}

impl Cli {
    fn proxy_config(&self) -> anyhow::Result<ProxyConfig> {
        let frontend = Transport::parse(&self.frontend)?;
        let backend = match &self.backend {
            Some(url) => Transport::parse(url)?,
            None => frontend.paired(),
        };
        Ok(ProxyConfig { frontend, backend })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting sensorflow-proxy");

    let proxy = Proxy::new(cli.proxy_config()?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if cli.stats_interval > 0 {
        let stats = proxy.stats().clone();
        let mut shutdown = shutdown_rx.clone();
        let period = std::time::Duration::from_secs(cli.stats_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let counts = stats.topic_counts.lock().await;
                        tracing::info!(
                            total_messages = stats.total(),
                            unique_topics = counts.len(),
                            "proxy stats"
                        );
                        for (topic, count) in counts.iter() {
                            tracing::debug!(topic = %topic, count = count, "topic stats");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    proxy.run(shutdown_rx).await?;

    tracing::info!("sensorflow-proxy exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
