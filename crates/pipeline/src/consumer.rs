//! The ingestion loop: receive, decode, handle, settle.
//!
//! The loop is sequential with one sample in flight. It only suspends while
//! waiting for a message or sleeping off a receive failure, and both waits
//! end early on shutdown. A sample already received is handled and settled
//! before the loop looks at the shutdown signal again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::trace;

use sensorflow_broker::{BrokerError, Message, MessageSource};
use sensorflow_core::IncomingSample;

use crate::error::PipelineError;
use crate::observer::PipelineObserver;
use crate::settings::BackoffSettings;

/// Processes one decoded sample. An error nacks the message.
#[async_trait]
pub trait SampleHandler: Send + Sync {
    async fn handle(&self, sample: IncomingSample) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Subscribed,
    Receiving,
    Decoding,
    Handling,
    Acknowledging,
    NegativeAcknowledging,
    Closed,
}

// ── Backoff ─────────────────────────────────────────────────────────

/// Capped exponential delay between consecutive receive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// `initial * 2^(n-1)`, capped at `max`. Zero for `n == 0`.
    pub fn delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow((consecutive_errors - 1).min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl From<BackoffSettings> for Backoff {
    fn from(settings: BackoffSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_ms),
            Duration::from_millis(settings.max_ms),
        )
    }
}

/// Resolves once `shutdown` is true or its sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// ── Consumer ────────────────────────────────────────────────────────

pub struct IngestionConsumer {
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn SampleHandler>,
    observer: Arc<dyn PipelineObserver>,
    backoff: Backoff,
    state: ConsumerState,
}

impl IngestionConsumer {
    /// Wrap an already subscribed source.
    pub fn new(
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn SampleHandler>,
        observer: Arc<dyn PipelineObserver>,
        backoff: Backoff,
    ) -> Self {
        Self {
            source,
            handler,
            observer,
            backoff,
            state: ConsumerState::Subscribed,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    fn transition(&mut self, to: ConsumerState) {
        trace!(from = ?self.state, to = ?to, "consumer state");
        self.state = to;
    }

    /// Run until `shutdown` turns true, returning [`PipelineError::Cancelled`].
    ///
    /// A closed source ends the loop with the broker error.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.transition(ConsumerState::Receiving);

            let source = self.source.clone();
            let received = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => None,
                r = source.receive() => Some(r),
            };
            let Some(received) = received else {
                break;
            };

            let message = match received {
                Ok(message) => {
                    consecutive_errors = 0;
                    message
                }
                Err(BrokerError::Closed) => {
                    self.transition(ConsumerState::Closed);
                    return Err(PipelineError::Broker(BrokerError::Closed));
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.observer.on_receive_error(&e, consecutive_errors);
                    let delay = self.backoff.delay(consecutive_errors);
                    let interrupted = tokio::select! {
                        _ = cancelled(&mut shutdown) => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if interrupted {
                        break;
                    }
                    continue;
                }
            };

            self.observer.on_received(&message);
            self.process(&message).await;
        }

        self.transition(ConsumerState::Closed);
        Err(PipelineError::Cancelled)
    }

    async fn process(&mut self, message: &Message) {
        self.transition(ConsumerState::Decoding);
        let sample = match IncomingSample::from_json(&message.payload) {
            Ok(sample) => sample,
            Err(e) => {
                self.observer.on_decode_failed(message, &e);
                self.nack(message).await;
                return;
            }
        };

        self.transition(ConsumerState::Handling);
        match self.handler.handle(sample).await {
            Ok(()) => self.ack(message).await,
            Err(e) => {
                self.observer.on_handle_failed(message, &e);
                self.nack(message).await;
            }
        }
    }

    async fn ack(&mut self, message: &Message) {
        self.transition(ConsumerState::Acknowledging);
        match self.source.ack(message).await {
            Ok(()) => self.observer.on_acked(message),
            Err(e) => self.observer.on_settle_failed(message, &e),
        }
    }

    async fn nack(&mut self, message: &Message) {
        self.transition(ConsumerState::NegativeAcknowledging);
        match self.source.nack(message).await {
            Ok(()) => self.observer.on_nacked(message),
            Err(e) => self.observer.on_settle_failed(message, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use sensorflow_broker::{BrokerClient, MemoryBroker, SubscriptionOptions};
    use tokio::sync::Mutex;

    use super::*;
    use crate::observer::{CompositeObserver, PipelineStats, StatsSnapshot, TracingObserver};

    /// Records handled sample ids; fails the first `fail_first` calls.
    #[derive(Default)]
    struct Recording {
        handled: Mutex<Vec<String>>,
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SampleHandler for Recording {
        async fn handle(&self, sample: IncomingSample) -> Result<(), PipelineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(PipelineError::Publish("downstream unavailable".into()));
            }
            self.handled.lock().await.push(sample.id);
            Ok(())
        }
    }

    fn sample(id: &str, value: f64) -> Vec<u8> {
        format!(r#"{{"id":"{id}","sensor_type":"temp","value":{value}}}"#).into_bytes()
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(5))
    }

    async fn wait_for(stats: &PipelineStats, done: impl Fn(StatsSnapshot) -> bool) {
        for _ in 0..500 {
            if done(stats.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:?}", stats.snapshot());
    }

    struct Harness {
        broker: MemoryBroker,
        stats: Arc<PipelineStats>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<(IngestionConsumer, Result<(), PipelineError>)>,
    }

    async fn start(handler: Arc<Recording>, max_redeliveries: u32) -> Harness {
        let broker = MemoryBroker::new();
        let source = broker
            .client()
            .subscribe(
                "external-sensor-data",
                &SubscriptionOptions::new("agent-processor").max_redeliveries(max_redeliveries),
            )
            .await
            .unwrap();
        let stats = Arc::new(PipelineStats::default());
        let observer = CompositeObserver::new()
            .with(Arc::new(TracingObserver))
            .with(stats.clone());
        let mut consumer =
            IngestionConsumer::new(source, handler, Arc::new(observer), fast_backoff());
        assert_eq!(consumer.state(), ConsumerState::Subscribed);

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let result = consumer.run(rx).await;
            (consumer, result)
        });
        Harness {
            broker,
            stats,
            shutdown,
            task,
        }
    }

    async fn publish(broker: &MemoryBroker, payload: Vec<u8>) {
        broker
            .publish(Message::new("external-sensor-data", payload))
            .await;
    }

    #[tokio::test]
    async fn acks_handled_samples_in_order() {
        let handler = Arc::new(Recording::default());
        let h = start(handler.clone(), 3).await;

        for (id, v) in [("s-1", 1.0), ("s-2", 2.0), ("s-3", 3.0)] {
            publish(&h.broker, sample(id, v)).await;
        }
        wait_for(&h.stats, |s| s.acked == 3).await;

        assert_eq!(*handler.handled.lock().await, vec!["s-1", "s-2", "s-3"]);
        assert_eq!(
            h.broker
                .pending_len("external-sensor-data", "agent-processor")
                .await,
            0
        );

        h.shutdown.send(true).unwrap();
        let (consumer, result) = h.task.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(consumer.state(), ConsumerState::Closed);
    }

    #[tokio::test]
    async fn undecodable_payload_is_nacked_and_loop_continues() {
        let handler = Arc::new(Recording::default());
        let h = start(handler.clone(), 0).await;

        publish(&h.broker, b"not json".to_vec()).await;
        publish(&h.broker, sample("s-ok", 30.0)).await;
        wait_for(&h.stats, |s| s.acked == 1).await;

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.nacked, 1);
        assert_eq!(*handler.handled.lock().await, vec!["s-ok"]);
        let dead = h
            .broker
            .dead_letters("external-sensor-data", "agent-processor")
            .await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"not json");

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn handler_failure_is_redelivered() {
        let handler = Arc::new(Recording {
            fail_first: 1,
            ..Default::default()
        });
        let h = start(handler.clone(), 3).await;

        publish(&h.broker, sample("s-1", 20.0)).await;
        wait_for(&h.stats, |s| s.acked == 1).await;

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.handle_failures, 1);
        assert_eq!(snapshot.nacked, 1);
        assert_eq!(snapshot.received, 2);
        assert_eq!(*handler.handled.lock().await, vec!["s-1"]);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_receive() {
        let h = start(Arc::new(Recording::default()), 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.shutdown.send(true).unwrap();

        let (consumer, result) = tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(h.stats.snapshot().received, 0);
    }

    /// Fails every receive with a transient error.
    struct Flaky;

    #[async_trait]
    impl MessageSource for Flaky {
        async fn receive(&self) -> Result<Message, BrokerError> {
            Err(BrokerError::Transport("connection reset".into()))
        }

        async fn ack(&self, _message: &Message) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn nack(&self, _message: &Message) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn receive_errors_back_off_and_keep_looping() {
        let stats = Arc::new(PipelineStats::default());
        let mut consumer = IngestionConsumer::new(
            Arc::new(Flaky),
            Arc::new(Recording::default()),
            stats.clone(),
            fast_backoff(),
        );
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move { consumer.run(rx).await });

        wait_for(&stats, |s| s.receive_errors >= 3).await;
        shutdown.send(true).unwrap();
        assert!(matches!(task.await.unwrap(), Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn closed_source_ends_the_loop() {
        let broker = MemoryBroker::new();
        let client = broker.client();
        let source = client
            .subscribe("external-sensor-data", &SubscriptionOptions::new("s"))
            .await
            .unwrap();
        client.close().await.unwrap();

        let mut consumer = IngestionConsumer::new(
            source,
            Arc::new(Recording::default()),
            Arc::new(TracingObserver),
            fast_backoff(),
        );
        let (_shutdown, rx) = watch::channel(false);
        let result = consumer.run(rx).await;
        assert!(matches!(result, Err(PipelineError::Broker(BrokerError::Closed))));
        assert_eq!(consumer.state(), ConsumerState::Closed);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_from_settings() {
        let backoff = Backoff::from(BackoffSettings::default());
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(20), Duration::from_secs(30));
    }
}
