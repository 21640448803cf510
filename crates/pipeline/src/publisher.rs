//! Outbound publishing of pipeline records.
//!
//! Each record type has its own producer. Payloads are JSON; the message key
//! is the agent UUID and a few fields are copied into flat string properties
//! so subscribers can route without decoding the payload.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use sensorflow_broker::{BrokerClient, BrokerError, Message, MessageId, MessageSink};
use sensorflow_core::{AlertRecord, MetricsSample, ProcessedResult, ProcessingOutcome};

use crate::error::PublishError;
use crate::settings::TopicSettings;

fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct OutboundPublisher {
    processed: Arc<dyn MessageSink>,
    alerts: Arc<dyn MessageSink>,
    metrics: Arc<dyn MessageSink>,
    results: Arc<dyn MessageSink>,
    send_timeout: Duration,
}

impl OutboundPublisher {
    pub fn new(
        processed: Arc<dyn MessageSink>,
        alerts: Arc<dyn MessageSink>,
        metrics: Arc<dyn MessageSink>,
        results: Arc<dyn MessageSink>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            processed,
            alerts,
            metrics,
            results,
            send_timeout,
        }
    }

    /// Create one producer per outbound topic.
    pub async fn connect(
        client: &dyn BrokerClient,
        topics: &TopicSettings,
        send_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        Ok(Self::new(
            client.create_producer(&topics.processed).await?,
            client.create_producer(&topics.alerts).await?,
            client.create_producer(&topics.metrics).await?,
            client.create_producer(&topics.results).await?,
            send_timeout,
        ))
    }

    pub async fn send_processed(&self, result: &ProcessedResult) -> Result<MessageId, PublishError> {
        let properties = [
            ("agent_uuid", result.agent_uuid.clone()),
            ("timestamp", rfc3339(&result.timestamp)),
            ("anomaly", result.anomaly.to_string()),
            ("confidence", format!("{:.2}", result.confidence)),
        ];
        self.send(&self.processed, &result.agent_uuid, result, properties)
            .await
    }

    pub async fn send_alert(&self, alert: &AlertRecord) -> Result<MessageId, PublishError> {
        let properties = [
            ("agent_uuid", alert.agent_uuid.clone()),
            ("severity", alert.severity.to_string()),
            ("timestamp", rfc3339(&alert.timestamp)),
        ];
        self.send(&self.alerts, &alert.agent_uuid, alert, properties)
            .await
    }

    pub async fn send_metrics(&self, sample: &MetricsSample) -> Result<MessageId, PublishError> {
        let properties = [
            ("agent_uuid", sample.agent_uuid.clone()),
            ("timestamp", rfc3339(&sample.timestamp)),
            ("cpu_usage", format!("{:.2}", sample.cpu_usage)),
            ("memory_usage", format!("{:.2}", sample.memory_usage)),
            ("disk_usage", format!("{:.2}", sample.disk_usage)),
        ];
        self.send(&self.metrics, &sample.agent_uuid, sample, properties)
            .await
    }

    pub async fn send_outcome(
        &self,
        outcome: &ProcessingOutcome,
    ) -> Result<MessageId, PublishError> {
        let properties = [
            ("agent_uuid", outcome.agent_uuid.clone()),
            ("processing_type", outcome.processing_type.clone()),
            ("success", outcome.success.to_string()),
            ("timestamp", rfc3339(&outcome.timestamp)),
            ("processing_time", outcome.processing_time_micros.to_string()),
        ];
        self.send(&self.results, &outcome.agent_uuid, outcome, properties)
            .await
    }

    async fn send<T, const N: usize>(
        &self,
        sink: &Arc<dyn MessageSink>,
        key: &str,
        record: &T,
        properties: [(&str, String); N],
    ) -> Result<MessageId, PublishError>
    where
        T: Serialize + Sync,
    {
        let payload = serde_json::to_vec(record)?;
        let topic = sink.topic().to_string();
        let message = Message::new(topic.clone(), payload)
            .with_key(key)
            .with_properties(properties);

        match tokio::time::timeout(self.send_timeout, sink.send(message)).await {
            Ok(Ok(id)) => {
                debug!(topic = %topic, message_id = %id, "record published");
                Ok(id)
            }
            Ok(Err(source)) => Err(PublishError::Broker { topic, source }),
            Err(_) => Err(PublishError::Timeout {
                topic,
                after: self.send_timeout,
            }),
        }
    }

    /// Close every producer, returning the first failure.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let mut first_err = None;
        for sink in [&self.processed, &self.alerts, &self.metrics, &self.results] {
            if let Err(e) = sink.close().await {
                tracing::warn!(topic = %sink.topic(), error = %e, "failed to close producer");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
