//! Processing rule definitions and per-agent configuration.
//!
//! On the wire a rule is the flat object `{name, enabled, params}`. Decoding
//! goes through [`RawRule`] and dispatches on `name`, so malformed parameters
//! for a known rule fail at decode time instead of being skipped silently
//! while samples are processed.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::RuleError;

pub const MOVING_AVERAGE: &str = "moving_average";
pub const OUTLIER_DETECTION: &str = "outlier_detection";

fn default_window() -> usize {
    5
}

// ── Rule parameters ─────────────────────────────────────────────────

/// Parameters for `moving_average`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovingAverageParams {
    /// Number of trailing inputs averaged. Must be at least 1.
    #[serde(default = "default_window")]
    pub window: usize,
}

impl Default for MovingAverageParams {
    fn default() -> Self {
        Self {
            window: default_window(),
        }
    }
}

/// Parameters for `outlier_detection`.
///
/// A rule without `threshold_sigma` is kept but never selected by the
/// detector.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OutlierDetectionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_sigma: Option<f64>,
}

// ── Rules ───────────────────────────────────────────────────────────

/// What a rule does.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    MovingAverage(MovingAverageParams),
    OutlierDetection(OutlierDetectionParams),
    /// A rule this agent does not understand. Kept so the list round-trips,
    /// ignored by transform and detection.
    Unrecognized { name: String, params: Value },
}

impl RuleKind {
    pub fn name(&self) -> &str {
        match self {
            RuleKind::MovingAverage(_) => MOVING_AVERAGE,
            RuleKind::OutlierDetection(_) => OUTLIER_DETECTION,
            RuleKind::Unrecognized { name, .. } => name,
        }
    }
}

/// One entry in an agent's ordered rule list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRule", into = "RawRule")]
pub struct ProcessingRule {
    pub enabled: bool,
    pub kind: RuleKind,
}

impl ProcessingRule {
    pub fn moving_average(window: usize) -> Self {
        Self {
            enabled: true,
            kind: RuleKind::MovingAverage(MovingAverageParams { window }),
        }
    }

    pub fn outlier_detection(threshold_sigma: f64) -> Self {
        Self {
            enabled: true,
            kind: RuleKind::OutlierDetection(OutlierDetectionParams {
                threshold_sigma: Some(threshold_sigma),
            }),
        }
    }

    pub fn unrecognized(name: impl Into<String>, params: Value) -> Self {
        Self {
            enabled: true,
            kind: RuleKind::Unrecognized {
                name: name.into(),
                params,
            },
        }
    }

    /// Same rule, switched off.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn name(&self) -> &str {
        self.kind.name()
    }
}

impl RuleKind {
    fn validate(&self) -> Result<(), RuleError> {
        match self {
            RuleKind::MovingAverage(p) if p.window == 0 => Err(RuleError::Invalid {
                rule: MOVING_AVERAGE.into(),
                reason: "window must be at least 1".into(),
            }),
            RuleKind::OutlierDetection(OutlierDetectionParams {
                threshold_sigma: Some(s),
            }) if !s.is_finite() || *s < 0.0 => Err(RuleError::Invalid {
                rule: OUTLIER_DETECTION.into(),
                reason: format!("threshold_sigma must be a non-negative number, got {s}"),
            }),
            _ => Ok(()),
        }
    }
}

/// Wire shape of a rule. A missing `enabled` means disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRule {
    name: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    params: Value,
}

fn decode_params<T: for<'de> Deserialize<'de>>(name: &str, params: Value) -> Result<T, RuleError> {
    // Absent params decode as an empty object so every field takes its default.
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|source| RuleError::InvalidParams {
        rule: name.to_string(),
        source,
    })
}

impl TryFrom<RawRule> for ProcessingRule {
    type Error = RuleError;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        if !raw.enabled {
            return Ok(ProcessingRule::decode(&raw.name, raw.params.clone())
                .map(|kind| ProcessingRule {
                    enabled: false,
                    kind,
                })
                .unwrap_or_else(|_| ProcessingRule {
                    enabled: false,
                    kind: RuleKind::Unrecognized {
                        name: raw.name,
                        params: raw.params,
                    },
                }));
        }
        let kind = ProcessingRule::decode(&raw.name, raw.params)?;
        Ok(ProcessingRule {
            enabled: true,
            kind,
        })
    }
}

impl ProcessingRule {
    /// Decode and validate the parameters of a rule called `name`.
    fn decode(name: &str, params: Value) -> Result<RuleKind, RuleError> {
        let kind = match name {
            MOVING_AVERAGE => RuleKind::MovingAverage(decode_params(name, params)?),
            OUTLIER_DETECTION => RuleKind::OutlierDetection(decode_params(name, params)?),
            _ => RuleKind::Unrecognized {
                name: name.to_string(),
                params,
            },
        };
        kind.validate()?;
        Ok(kind)
    }
}

/// Decode a rule list, dropping enabled rules whose parameters are invalid
/// instead of failing the whole list.
fn lenient_rules<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ProcessingRule>, D::Error> {
    let raw = Vec::<RawRule>::deserialize(d)?;
    Ok(raw
        .into_iter()
        .filter_map(|raw| {
            let name = raw.name.clone();
            match ProcessingRule::try_from(raw) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!(rule = %name, error = %e, "dropping invalid rule");
                    None
                }
            }
        })
        .collect())
}

impl From<ProcessingRule> for RawRule {
    fn from(rule: ProcessingRule) -> Self {
        let name = rule.name().to_string();
        let params = match rule.kind {
            RuleKind::MovingAverage(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            RuleKind::OutlierDetection(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            RuleKind::Unrecognized { params, .. } => params,
        };
        RawRule {
            name,
            enabled: rule.enabled,
            params,
        }
    }
}

// ── Agent configuration ─────────────────────────────────────────────

fn default_enabled() -> bool {
    true
}

/// Rules the configuration service holds for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProcessingConfig {
    #[serde(default)]
    pub agent_uuid: String,
    /// Sensor type the rules target. Empty applies them to every sensor.
    #[serde(default)]
    pub sensor_type: String,
    #[serde(
        default,
        rename = "processing_rules",
        alias = "rules",
        deserialize_with = "lenient_rules"
    )]
    pub rules: Vec<ProcessingRule>,
    #[serde(default)]
    pub output_streams: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AgentProcessingConfig {
    /// The fallback used when no configuration can be fetched.
    pub fn empty(agent_uuid: impl Into<String>) -> Self {
        Self {
            agent_uuid: agent_uuid.into(),
            sensor_type: String::new(),
            rules: Vec::new(),
            output_streams: Vec::new(),
            enabled: true,
        }
    }

    /// Rules that apply to a sample of `sensor_type`.
    ///
    /// A disabled configuration, or one scoped to another sensor type,
    /// contributes no rules.
    pub fn rules_for(&self, sensor_type: &str) -> &[ProcessingRule] {
        if !self.enabled {
            return &[];
        }
        if !self.sensor_type.is_empty() && self.sensor_type != sensor_type {
            return &[];
        }
        &self.rules
    }
}
