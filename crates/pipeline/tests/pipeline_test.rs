//! End-to-end pipeline tests over the in-process broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use sensorflow_broker::{
    BrokerClient, BrokerError, MemoryBroker, Message, MessageId, MessageSink, MessageSource,
    SubscriptionOptions, SubscriptionType,
};
use sensorflow_core::{AlertRecord, ProcessedResult, ProcessingOutcome, Severity};
use sensorflow_pipeline::settings::BackoffSettings;
use sensorflow_pipeline::{
    ConfigError, ConfigProvider, HostUsage, PipelineCoordinator, PipelineError, Settings,
    StaticConfigProvider, SystemProbe,
};
use sensorflow_rules::AgentProcessingConfig;

const AGENT: &str = "agent-e2e";
const INPUT: &str = "external-sensor-data";
const SUBSCRIPTION: &str = "agent-processor";
const TIMEOUT: Duration = Duration::from_secs(2);

fn settings(max_redeliveries: u32) -> Settings {
    let mut settings = Settings::default();
    settings.agent.uuid = AGENT.into();
    settings.agent.metrics_interval_secs = 0;
    settings.broker.consumer.max_redeliveries = max_redeliveries;
    settings.backoff = BackoffSettings {
        initial_ms: 1,
        max_ms: 10,
    };
    settings
}

struct Outputs {
    processed: Arc<dyn MessageSource>,
    alerts: Arc<dyn MessageSource>,
    results: Arc<dyn MessageSource>,
    metrics: Arc<dyn MessageSource>,
}

/// A broker with the input subscription and every output subscription in
/// place, so samples published before the pipeline starts are kept.
async fn broker(settings: &Settings) -> (MemoryBroker, Outputs) {
    let broker = MemoryBroker::new();
    let client = broker.client();

    let consumer = &settings.broker.consumer;
    let warmup = client
        .subscribe(
            INPUT,
            &SubscriptionOptions::new(&consumer.subscription_name)
                .kind(consumer.subscription_type)
                .max_redeliveries(consumer.max_redeliveries),
        )
        .await
        .unwrap();
    warmup.close().await.unwrap();

    let opts = SubscriptionOptions::new("observer");
    let outputs = Outputs {
        processed: client.subscribe("processed-sensor-data", &opts).await.unwrap(),
        alerts: client.subscribe("alert-data", &opts).await.unwrap(),
        results: client.subscribe("processing-results", &opts).await.unwrap(),
        metrics: client.subscribe("system-metrics", &opts).await.unwrap(),
    };
    (broker, outputs)
}

async fn publish(broker: &MemoryBroker, payload: &[u8]) {
    broker.publish(Message::new(INPUT, payload.to_vec())).await;
}

async fn next<T: serde::de::DeserializeOwned>(source: &Arc<dyn MessageSource>) -> (Message, T) {
    let msg = tokio::time::timeout(TIMEOUT, source.receive())
        .await
        .expect("timed out waiting for output")
        .unwrap();
    source.ack(&msg).await.unwrap();
    let record = serde_json::from_slice(&msg.payload).unwrap();
    (msg, record)
}

async fn nothing_on(source: &Arc<dyn MessageSource>) -> bool {
    tokio::time::timeout(Duration::from_millis(100), source.receive())
        .await
        .is_err()
}

struct Running {
    coordinator: Arc<PipelineCoordinator>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<Result<(), PipelineError>>,
}

impl Running {
    async fn start(coordinator: PipelineCoordinator) -> Self {
        let coordinator = Arc::new(coordinator);
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.start(rx).await }
        });
        Self {
            coordinator,
            shutdown,
            task,
        }
    }

    async fn wait_for_acks(&self, acked: u64, nacked: u64) {
        for _ in 0..400 {
            let stats = self.coordinator.stats();
            if stats.acked >= acked && stats.nacked >= nacked {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stats not reached: {:?}", self.coordinator.stats());
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        let result = tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("pipeline did not stop")
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        self.coordinator.close().await.unwrap();
    }
}

async fn coordinator(
    broker: &MemoryBroker,
    settings: Settings,
    provider: Arc<dyn ConfigProvider>,
) -> PipelineCoordinator {
    PipelineCoordinator::new(Arc::new(broker.client()), settings, provider)
        .await
        .unwrap()
}

#[tokio::test]
async fn anomalous_sample_flows_end_to_end() {
    let settings = settings(3);
    let (broker, out) = broker(&settings).await;
    publish(&broker, br#"{"id":"s-1","sensor_type":"temp","value":5.0}"#).await;

    let provider = StaticConfigProvider::new().with(AgentProcessingConfig::empty(AGENT));
    let running = Running::start(coordinator(&broker, settings, Arc::new(provider)).await).await;

    let (msg, result): (_, ProcessedResult) = next(&out.processed).await;
    assert_eq!(msg.key.as_deref(), Some(AGENT));
    assert_eq!(msg.property("anomaly"), Some("true"));
    assert_eq!(msg.property("confidence"), Some("0.90"));
    assert_eq!(result.agent_uuid, AGENT);
    assert_eq!(result.original_value, 5.0);
    assert_eq!(result.processed_value, 5.0);
    assert!(result.anomaly);
    assert_eq!(result.confidence, 0.9);

    let (_, alert): (_, AlertRecord) = next(&out.alerts).await;
    assert_eq!(alert.threshold, 10.0);
    assert_eq!(alert.severity, Severity::Medium);
    assert_eq!(alert.sensor_type, "temp");

    let (msg, outcome): (_, ProcessingOutcome) = next(&out.results).await;
    assert!(outcome.success);
    assert_eq!(outcome.error_message, None);
    assert_eq!(msg.property("success"), Some("true"));

    running.wait_for_acks(1, 0).await;
    assert!(nothing_on(&out.processed).await);
    assert!(nothing_on(&out.alerts).await);
    assert_eq!(broker.pending_len(INPUT, SUBSCRIPTION).await, 0);
    assert_eq!(broker.backlog_len(INPUT, SUBSCRIPTION).await, 0);

    running.stop().await;
}

#[tokio::test]
async fn undecodable_payload_is_nacked_and_consumption_continues() {
    let settings = settings(0);
    let (broker, out) = broker(&settings).await;
    publish(&broker, b"\x00\x01 definitely not json").await;
    publish(&broker, br#"{"id":"s-2","sensor_type":"temp","value":30.0}"#).await;

    let running =
        Running::start(coordinator(&broker, settings, Arc::new(StaticConfigProvider::new())).await)
            .await;

    let (_, result): (_, ProcessedResult) = next(&out.processed).await;
    assert!(!result.anomaly);
    let (_, outcome): (_, ProcessingOutcome) = next(&out.results).await;
    assert!(outcome.success);

    running.wait_for_acks(1, 1).await;
    let stats = running.coordinator.stats();
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.received, 2);

    // Only the valid sample produced output.
    assert!(nothing_on(&out.processed).await);
    assert!(nothing_on(&out.results).await);
    assert!(nothing_on(&out.alerts).await);
    assert_eq!(broker.dead_letters(INPUT, SUBSCRIPTION).await.len(), 1);

    running.stop().await;
}

/// Fails every fetch the way an unreachable config service would.
struct Unavailable;

#[async_trait]
impl ConfigProvider for Unavailable {
    async fn get_config(&self, _agent_uuid: &str) -> Result<AgentProcessingConfig, ConfigError> {
        Err(ConfigError::Status {
            status: 503,
            body: "maintenance".into(),
        })
    }
}

#[tokio::test]
async fn provider_failure_falls_back_to_default_rules() {
    let settings = settings(3);
    let (broker, out) = broker(&settings).await;
    publish(&broker, br#"{"id":"s-3","sensor_type":"temp","value":8.0}"#).await;

    let running = Running::start(coordinator(&broker, settings, Arc::new(Unavailable)).await).await;

    let (_, result): (_, ProcessedResult) = next(&out.processed).await;
    assert!(result.anomaly);
    assert_eq!(result.confidence, 0.9);
    let (_, alert): (_, AlertRecord) = next(&out.alerts).await;
    assert_eq!(alert.severity, Severity::Low);
    running.wait_for_acks(1, 0).await;

    running.stop().await;
}

#[tokio::test]
async fn fail_closed_nacks_samples_without_config() {
    let mut settings = settings(0);
    settings.agent.fail_closed = true;
    let (broker, out) = broker(&settings).await;
    publish(&broker, br#"{"id":"s-4","sensor_type":"temp","value":8.0}"#).await;

    let running = Running::start(coordinator(&broker, settings, Arc::new(Unavailable)).await).await;

    running.wait_for_acks(0, 1).await;
    assert_eq!(running.coordinator.stats().handle_failures, 1);
    assert!(nothing_on(&out.processed).await);
    assert!(nothing_on(&out.results).await);
    assert_eq!(broker.dead_letters(INPUT, SUBSCRIPTION).await.len(), 1);

    running.stop().await;
}

#[tokio::test]
async fn refused_subscription_is_fatal() {
    let mut settings = settings(3);
    settings.broker.consumer.subscription_type = SubscriptionType::Exclusive;
    let broker = MemoryBroker::new();
    let _holder = broker
        .client()
        .subscribe(
            INPUT,
            &SubscriptionOptions::new(SUBSCRIPTION).kind(SubscriptionType::Exclusive),
        )
        .await
        .unwrap();

    let coordinator =
        coordinator(&broker, settings, Arc::new(StaticConfigProvider::new())).await;
    let (_tx, rx) = watch::channel(false);
    let err = coordinator.start(rx).await.unwrap_err();
    assert!(matches!(err, PipelineError::Subscribe { ref topic, .. } if topic == INPUT));
    coordinator.close().await.unwrap();
}

struct Steady;

impl SystemProbe for Steady {
    fn sample(&mut self) -> std::io::Result<HostUsage> {
        Ok(HostUsage {
            cpu: 42.0,
            memory: 61.5,
            disk: 0.0,
        })
    }
}

#[tokio::test]
async fn metrics_reporter_runs_alongside_consumer() {
    let mut settings = settings(3);
    settings.agent.metrics_interval_secs = 1;
    let (broker, out) = broker(&settings).await;

    let coordinator = coordinator(&broker, settings, Arc::new(StaticConfigProvider::new()))
        .await
        .with_probe(Box::new(Steady));
    let running = Running::start(coordinator).await;

    let (msg, sample): (_, sensorflow_core::MetricsSample) = next(&out.metrics).await;
    assert_eq!(sample.agent_uuid, AGENT);
    assert_eq!(sample.cpu_usage, 42.0);
    assert_eq!(msg.property("memory_usage"), Some("61.50"));

    running.stop().await;
}

#[tokio::test]
async fn close_after_shutdown_closes_connection() {
    let settings = settings(3);
    let (broker, _out) = broker(&settings).await;
    let client = Arc::new(broker.client());
    let coordinator = PipelineCoordinator::new(
        client.clone(),
        settings,
        Arc::new(StaticConfigProvider::new()),
    )
    .await
    .unwrap();
    let running = Running::start(coordinator).await;
    running.stop().await;

    let err = client.create_producer("anything").await.err().unwrap();
    assert!(matches!(err, sensorflow_broker::BrokerError::Closed));
}

/// Wraps a broker client: consumers refuse to close, and producer and
/// connection closes are counted.
struct StubbornClient {
    inner: Arc<dyn BrokerClient>,
    producer_closes: Arc<AtomicUsize>,
    client_closed: AtomicBool,
}

struct StubbornSource(Arc<dyn MessageSource>);

#[async_trait]
impl MessageSource for StubbornSource {
    async fn receive(&self) -> Result<Message, BrokerError> {
        self.0.receive().await
    }

    async fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        self.0.ack(message).await
    }

    async fn nack(&self, message: &Message) -> Result<(), BrokerError> {
        self.0.nack(message).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Err(BrokerError::Transport("consumer close refused".into()))
    }
}

struct CountingSink {
    inner: Arc<dyn MessageSink>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageSink for CountingSink {
    fn topic(&self) -> &str {
        self.inner.topic()
    }

    async fn send(&self, message: Message) -> Result<MessageId, BrokerError> {
        self.inner.send(message).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

#[async_trait]
impl BrokerClient for StubbornClient {
    async fn subscribe(
        &self,
        topic: &str,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn MessageSource>, BrokerError> {
        let source = self.inner.subscribe(topic, options).await?;
        Ok(Arc::new(StubbornSource(source)))
    }

    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn MessageSink>, BrokerError> {
        let inner = self.inner.create_producer(topic).await?;
        Ok(Arc::new(CountingSink {
            inner,
            closes: self.producer_closes.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.client_closed.store(true, Ordering::SeqCst);
        self.inner.close().await
    }
}

#[tokio::test]
async fn close_finishes_after_consumer_close_fails() {
    let settings = settings(3);
    let (broker, _out) = broker(&settings).await;
    let producer_closes = Arc::new(AtomicUsize::new(0));
    let client = Arc::new(StubbornClient {
        inner: Arc::new(broker.client()),
        producer_closes: producer_closes.clone(),
        client_closed: AtomicBool::new(false),
    });
    let coordinator = PipelineCoordinator::new(
        client.clone(),
        settings,
        Arc::new(StaticConfigProvider::new()),
    )
    .await
    .unwrap();

    // Already shut down: start subscribes, then returns straight away.
    let (_tx, rx) = watch::channel(true);
    let result = coordinator.start(rx).await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));

    let err = coordinator.close().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Broker(BrokerError::Transport(ref reason)) if reason == "consumer close refused"
    ));
    assert_eq!(producer_closes.load(Ordering::SeqCst), 4);
    assert!(client.client_closed.load(Ordering::SeqCst));
}

#[test]
fn sample_settings_file_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/sensorflow.toml");
    let env = std::collections::HashMap::from([(
        "SENSORFLOW_AGENT_UUID".to_string(),
        "agent-from-env".to_string(),
    )]);
    let settings = Settings::load_with(path, &env).unwrap();
    settings.validate().unwrap();
    assert_eq!(settings.agent.uuid, "agent-from-env");
    assert_eq!(settings.broker.topics.input, INPUT);
    assert_eq!(settings.broker.consumer.subscription_name, SUBSCRIPTION);
}
