//! Wires the consumer, handler, publisher and metrics reporter over one
//! broker connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use sensorflow_broker::{BrokerClient, ConnectOptions, MessageSource, SubscriptionOptions};
use sensorflow_rules::AnomalyDetector;

use crate::consumer::{Backoff, IngestionConsumer};
use crate::error::PipelineError;
use crate::handler::SampleProcessor;
use crate::metrics::{MetricsReporter, SysinfoProbe, SystemProbe};
use crate::observer::{CompositeObserver, PipelineStats, StatsSnapshot, TracingObserver};
use crate::provider::{CachedConfigProvider, ConfigProvider, HttpConfigProvider};
use crate::publisher::OutboundPublisher;
use crate::settings::Settings;

pub struct PipelineCoordinator {
    settings: Settings,
    client: Arc<dyn BrokerClient>,
    provider: Arc<dyn ConfigProvider>,
    publisher: Arc<OutboundPublisher>,
    stats: Arc<PipelineStats>,
    probe: Mutex<Option<Box<dyn SystemProbe>>>,
    source: Mutex<Option<Arc<dyn MessageSource>>>,
}

impl PipelineCoordinator {
    /// Connect to the configured broker and config service.
    pub async fn connect(settings: Settings) -> Result<Self, PipelineError> {
        let client = sensorflow_broker::connect(&ConnectOptions {
            url: settings.broker.url.clone(),
            backend_url: settings.broker.backend_url.clone(),
            connection_timeout: settings.broker.connection_timeout(),
        })
        .await?;

        let http = HttpConfigProvider::new(
            &settings.agent.server_endpoint,
            settings.broker.operation_timeout(),
        );
        let provider = CachedConfigProvider::new(
            http,
            Duration::from_secs(settings.agent.config_cache_ttl_secs),
        );

        Self::new(client, settings, Arc::new(provider)).await
    }

    /// Build over an existing connection. Creates the outbound producers.
    pub async fn new(
        client: Arc<dyn BrokerClient>,
        settings: Settings,
        provider: Arc<dyn ConfigProvider>,
    ) -> Result<Self, PipelineError> {
        let publisher = OutboundPublisher::connect(
            client.as_ref(),
            &settings.broker.topics,
            settings.broker.producer.send_timeout(),
        )
        .await?;

        Ok(Self {
            settings,
            client,
            provider,
            publisher: Arc::new(publisher),
            stats: Arc::new(PipelineStats::default()),
            probe: Mutex::new(None),
            source: Mutex::new(None),
        })
    }

    /// Replace the host probe used by the metrics reporter.
    pub fn with_probe(self, probe: Box<dyn SystemProbe>) -> Self {
        Self {
            probe: Mutex::new(Some(probe)),
            ..self
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribe and consume until `shutdown` turns true.
    ///
    /// A failed subscription is returned immediately. Otherwise the result
    /// is the consumer's: [`PipelineError::Cancelled`] after shutdown.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let broker = &self.settings.broker;
        let options = SubscriptionOptions::new(&broker.consumer.subscription_name)
            .kind(broker.consumer.subscription_type)
            .max_redeliveries(broker.consumer.max_redeliveries);

        let source = self
            .client
            .subscribe(&broker.topics.input, &options)
            .await
            .map_err(|source| PipelineError::Subscribe {
                topic: broker.topics.input.clone(),
                source,
            })?;
        *self.source.lock().await = Some(source.clone());

        let agent = &self.settings.agent;
        let probe = self
            .probe
            .lock()
            .await
            .take()
            .unwrap_or_else(|| Box::new(SysinfoProbe::new()));
        let reporter = MetricsReporter::new(
            &agent.uuid,
            Duration::from_secs(agent.metrics_interval_secs),
            probe,
            self.publisher.clone(),
        )
        .spawn(shutdown.clone());

        let handler = SampleProcessor::new(
            &agent.uuid,
            &agent.processing_type,
            self.provider.clone(),
            self.publisher.clone(),
            AnomalyDetector::new(self.settings.detection),
        )
        .fail_closed(agent.fail_closed);
        let observer = CompositeObserver::new()
            .with(Arc::new(TracingObserver))
            .with(self.stats.clone());
        let mut consumer = IngestionConsumer::new(
            source,
            Arc::new(handler),
            Arc::new(observer),
            Backoff::from(self.settings.backoff),
        );

        info!(
            agent_uuid = %agent.uuid,
            topic = %broker.topics.input,
            subscription = %options.name,
            kind = %options.kind,
            "pipeline started"
        );
        let result = consumer.run(shutdown).await;

        reporter.abort();
        reporter.await.ok();
        info!(stats = ?self.stats(), "pipeline stopped");
        result
    }

    /// Close the consumer, then the producers, then the connection.
    ///
    /// Every step runs; the first failure is returned.
    pub async fn close(&self) -> Result<(), PipelineError> {
        let mut first_err: Option<PipelineError> = None;

        if let Some(source) = self.source.lock().await.take() {
            if let Err(e) = source.close().await {
                warn!(error = %e, "failed to close consumer");
                first_err.get_or_insert(e.into());
            }
        }
        if let Err(e) = self.publisher.close().await {
            first_err.get_or_insert(e.into());
        }
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "failed to close broker connection");
            first_err.get_or_insert(e.into());
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!("pipeline closed");
                Ok(())
            }
        }
    }
}
