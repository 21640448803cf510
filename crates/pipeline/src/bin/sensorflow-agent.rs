//! sensorflow-agent: consumes sensor samples, applies the agent's rules and
//! publishes results, alerts, outcomes and host metrics.
//!
//! # Usage
//!
//! ```bash
//! # Settings from config/sensorflow.toml
//! sensorflow-agent --agent-uuid 7f7c...
//!
//! # In-process broker, no server registration
//! sensorflow-agent --agent-uuid dev --broker-url memory://dev --no-register
//!
//! # Profile-specific overrides
//! SENSORFLOW_PROFILE=prod PROD_SENSORFLOW_BROKER_URL=tcp://broker:5555 sensorflow-agent
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sensorflow_pipeline::settings::DEFAULT_PATH;
use sensorflow_pipeline::{
    PipelineCoordinator, PipelineError, RegisterAgentRequest, RegistrationClient, Settings,
};

/// Sensor stream processing agent.
#[derive(Parser, Debug)]
#[command(name = "sensorflow-agent", version, about)]
struct Cli {
    /// Settings file. Missing files fall back to built-in defaults.
    #[arg(long, env = "SENSORFLOW_CONFIG", default_value = DEFAULT_PATH)]
    config: PathBuf,

    /// Agent UUID, overriding `agent.uuid`.
    #[arg(long)]
    agent_uuid: Option<String>,

    /// Broker URL, overriding `broker.url`.
    #[arg(long)]
    broker_url: Option<String>,

    /// Skip registration with the server.
    #[arg(long)]
    no_register: bool,
}

impl Cli {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = Settings::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(uuid) = &self.agent_uuid {
            settings.agent.uuid = uuid.clone();
        }
        if let Some(url) = &self.broker_url {
            settings.broker.url = url.clone();
        }
        if self.no_register {
            settings.agent.register_on_start = false;
        }
        settings.validate().context("invalid settings")?;
        Ok(settings)
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
    let settings = cli.settings()?;
    tracing::info!(
        agent_uuid = %settings.agent.uuid,
        server = %settings.agent.server_endpoint,
        broker = %settings.broker.url,
        input = %settings.broker.topics.input,
        subscription = %settings.broker.consumer.subscription_name,
        kind = %settings.broker.consumer.subscription_type,
        fail_closed = settings.agent.fail_closed,
        "starting sensorflow-agent"
    );

    if settings.agent.register_on_start {
        let client = RegistrationClient::new(
            &settings.agent.server_endpoint,
            settings.broker.operation_timeout(),
        );
        client
            .register(&RegisterAgentRequest::for_host(&settings.agent.uuid))
            .await
            .context("agent registration failed")?;
    }

    let coordinator = PipelineCoordinator::connect(settings)
        .await
        .context("failed to connect pipeline")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let run = coordinator.start(shutdown_rx).await;
    let closed = coordinator.close().await;

    match run {
        Ok(()) | Err(PipelineError::Cancelled) => {}
        Err(e) => return Err(e).context("pipeline failed"),
    }
    closed.context("failed to close pipeline")?;

    tracing::info!(stats = ?coordinator.stats(), "sensorflow-agent exited cleanly");
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
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
