//! Event-scoped records flowing through the pipeline.
//!
//! Every record is created once per processing cycle, published once, and
//! never mutated afterwards. Field names are snake_case on the wire.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// A single sensor reading delivered by the external data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingSample {
    #[serde(default, alias = "uuid")]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub sensor_type: String,
    pub value: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Original device payload, base64-encoded on the wire.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub raw_payload: Vec<u8>,
}

impl IncomingSample {
    /// Decode a sample from a JSON message payload.
    ///
    /// Rejects non-finite values so downstream comparisons stay meaningful.
    pub fn from_json(payload: &[u8]) -> Result<Self, CoreError> {
        let sample: Self = serde_json::from_slice(payload).map_err(CoreError::Decode)?;
        if !sample.value.is_finite() {
            return Err(CoreError::Invalid(format!(
                "sample {} has non-finite value",
                sample.id
            )));
        }
        Ok(sample)
    }
}

/// Result of running one sample through transform and detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub id: Uuid,
    pub agent_uuid: String,
    pub original_value: f64,
    pub processed_value: f64,
    pub anomaly: bool,
    /// Classification certainty in `[0, 1]`.
    pub confidence: f64,
    /// Microseconds spent processing the sample.
    #[serde(rename = "processing_time")]
    pub processing_time_micros: i64,
    pub timestamp: DateTime<Utc>,
}

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted for anomalous samples only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub agent_uuid: String,
    pub sensor_type: String,
    pub original_value: f64,
    pub processed_value: f64,
    /// The band boundary the processed value crossed.
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Periodic host resource usage, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub id: Uuid,
    pub agent_uuid: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub timestamp: DateTime<Utc>,
}

/// One per processed sample, regardless of anomaly status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    pub id: Uuid,
    pub agent_uuid: String,
    pub processing_type: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "processing_time")]
    pub processing_time_micros: i64,
    pub timestamp: DateTime<Utc>,
}

/// Serde helper: `Vec<u8>` as a standard base64 string.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        match encoded {
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
