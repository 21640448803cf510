//! Per-sample processing: configuration, transform, detection, publishing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use sensorflow_core::{AlertRecord, IncomingSample, ProcessedResult, ProcessingOutcome};
use sensorflow_rules::{AgentProcessingConfig, AnomalyDetector, Detection, ProcessingRule, RuleChain};

use crate::consumer::SampleHandler;
use crate::error::PipelineError;
use crate::provider::ConfigProvider;
use crate::publisher::OutboundPublisher;

pub struct SampleProcessor {
    agent_uuid: String,
    processing_type: String,
    fail_closed: bool,
    provider: Arc<dyn ConfigProvider>,
    publisher: Arc<OutboundPublisher>,
    detector: AnomalyDetector,
    /// Stateful transform chains keyed by (agent, sensor type).
    chains: Mutex<HashMap<(String, String), RuleChain>>,
}

impl SampleProcessor {
    pub fn new(
        agent_uuid: impl Into<String>,
        processing_type: impl Into<String>,
        provider: Arc<dyn ConfigProvider>,
        publisher: Arc<OutboundPublisher>,
        detector: AnomalyDetector,
    ) -> Self {
        Self {
            agent_uuid: agent_uuid.into(),
            processing_type: processing_type.into(),
            fail_closed: false,
            provider,
            publisher,
            detector,
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Refuse samples whose configuration cannot be fetched.
    pub fn fail_closed(mut self, fail_closed: bool) -> Self {
        self.fail_closed = fail_closed;
        self
    }

    async fn config(&self) -> Result<AgentProcessingConfig, PipelineError> {
        match self.provider.get_config(&self.agent_uuid).await {
            Ok(config) => Ok(config),
            Err(e) if self.fail_closed => Err(e.into()),
            Err(e) => {
                warn!(agent_uuid = %self.agent_uuid, error = %e, "config unavailable, using empty rule set");
                Ok(AgentProcessingConfig::empty(&self.agent_uuid))
            }
        }
    }

    /// Run the sample through a copy of the chain for its sensor,
    /// recompiling when the rules changed since the chain was built.
    ///
    /// The stored chain is untouched until [`Self::commit`], so a sample that
    /// is nacked and redelivered is only counted once.
    async fn transform(&self, rules: &[ProcessingRule], sample: &IncomingSample) -> (f64, RuleChain) {
        let key = (self.agent_uuid.clone(), sample.sensor_type.clone());
        let stored = self.chains.lock().await.get(&key).cloned();
        let mut chain = match stored {
            Some(chain) if chain.is_compiled_from(rules) => chain,
            Some(_) => {
                debug!(sensor_type = %sample.sensor_type, "rules changed, rebuilding transform chain");
                RuleChain::compile(rules)
            }
            None => RuleChain::compile(rules),
        };
        let value = chain.apply(sample.value);
        (value, chain)
    }

    /// Keep `chain` as the history for this sensor. Chains without state
    /// are not stored.
    async fn commit(&self, sample: &IncomingSample, chain: RuleChain) {
        let key = (self.agent_uuid.clone(), sample.sensor_type.clone());
        let mut chains = self.chains.lock().await;
        if chain.is_stateless() {
            chains.remove(&key);
        } else {
            chains.insert(key, chain);
        }
    }

    #[cfg(test)]
    async fn retained_chains(&self) -> usize {
        self.chains.lock().await.len()
    }

    fn alert(&self, sample: &IncomingSample, processed_value: f64, detection: &Detection) -> Option<AlertRecord> {
        let violation = detection.violation?;
        let direction = if processed_value < violation.threshold {
            "below"
        } else {
            "above"
        };
        Some(AlertRecord {
            id: Uuid::new_v4(),
            agent_uuid: self.agent_uuid.clone(),
            sensor_type: sample.sensor_type.clone(),
            original_value: sample.value,
            processed_value,
            threshold: violation.threshold,
            severity: violation.severity,
            message: format!(
                "{} reading {:.2} is {} threshold {:.2}",
                sample.sensor_type, processed_value, direction, violation.threshold
            ),
            timestamp: Utc::now(),
        })
    }
}

fn micros_since(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_micros()).unwrap_or(i64::MAX)
}

#[async_trait]
impl SampleHandler for SampleProcessor {
    async fn handle(&self, sample: IncomingSample) -> Result<(), PipelineError> {
        let started = Instant::now();

        let config = self.config().await?;
        let rules = config.rules_for(&sample.sensor_type);
        let (processed_value, chain) = self.transform(rules, &sample).await;
        let detection = self.detector.evaluate(processed_value, rules);

        let result = ProcessedResult {
            id: Uuid::new_v4(),
            agent_uuid: self.agent_uuid.clone(),
            original_value: sample.value,
            processed_value,
            anomaly: detection.is_anomaly,
            confidence: detection.confidence,
            processing_time_micros: micros_since(started),
            timestamp: Utc::now(),
        };

        let mut failures = Vec::new();
        if let Err(e) = self.publisher.send_processed(&result).await {
            failures.push(e.to_string());
        }
        if let Some(alert) = self.alert(&sample, processed_value, &detection) {
            if let Err(e) = self.publisher.send_alert(&alert).await {
                failures.push(e.to_string());
            }
        }

        let outcome = ProcessingOutcome {
            id: Uuid::new_v4(),
            agent_uuid: self.agent_uuid.clone(),
            processing_type: self.processing_type.clone(),
            success: failures.is_empty(),
            error_message: (!failures.is_empty()).then(|| failures.join("; ")),
            processing_time_micros: micros_since(started),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.publisher.send_outcome(&outcome).await {
            failures.push(e.to_string());
        }

        debug!(
            sample_id = %sample.id,
            sensor_type = %sample.sensor_type,
            value = sample.value,
            processed_value,
            anomaly = detection.is_anomaly,
            elapsed_us = outcome.processing_time_micros,
            "sample processed"
        );

        if failures.is_empty() {
            self.commit(&sample, chain).await;
            Ok(())
        } else {
            Err(PipelineError::Publish(failures.join("; ")))
        }
    }
}
