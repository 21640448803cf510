//! Per-agent processing rules for sensor samples.
//!
//! This crate provides:
//! - Typed rule definitions, validated when a configuration is decoded
//! - The transform engine (pure `apply` plus a stateful `RuleChain`)
//! - The band-based anomaly detector with a configurable `DetectionPolicy`

pub mod detector;
pub mod error;
pub mod schema;
pub mod transform;

pub use detector::{AnomalyDetector, Band, Detection, DetectionPolicy, Violation};
pub use error::RuleError;
pub use schema::{
    AgentProcessingConfig, MovingAverageParams, OutlierDetectionParams, ProcessingRule, RuleKind,
};
pub use transform::{MovingAverageWindow, RuleChain, TransformEngine};
