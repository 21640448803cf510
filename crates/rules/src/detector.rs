//! Band-based anomaly detection.
//!
//! A value is anomalous when it falls strictly outside a band. The band comes
//! from the first enabled `outlier_detection` rule that carries a
//! `threshold_sigma`, centred on the policy midpoint; with no such rule the
//! policy's default band applies.

use serde::{Deserialize, Serialize};
use sensorflow_core::Severity;

use crate::error::RuleError;
use crate::schema::{OutlierDetectionParams, ProcessingRule, RuleKind};

// ── Policy ──────────────────────────────────────────────────────────

/// Constants of the detector, loaded from the `[detection]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionPolicy {
    pub midpoint: f64,
    pub sigma_multiplier: f64,
    pub default_lower: f64,
    pub default_upper: f64,
    pub anomaly_confidence: f64,
    pub normal_confidence: f64,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            midpoint: 25.0,
            sigma_multiplier: 5.0,
            default_lower: 10.0,
            default_upper: 50.0,
            anomaly_confidence: 0.9,
            normal_confidence: 0.7,
        }
    }
}

impl DetectionPolicy {
    pub fn validate(&self) -> Result<(), RuleError> {
        let numbers = [
            ("midpoint", self.midpoint),
            ("sigma_multiplier", self.sigma_multiplier),
            ("default_lower", self.default_lower),
            ("default_upper", self.default_upper),
            ("anomaly_confidence", self.anomaly_confidence),
            ("normal_confidence", self.normal_confidence),
        ];
        if let Some((name, _)) = numbers.iter().find(|(_, v)| !v.is_finite()) {
            return Err(RuleError::Policy(format!("{name} must be finite")));
        }
        if self.sigma_multiplier < 0.0 {
            return Err(RuleError::Policy("sigma_multiplier must be non-negative".into()));
        }
        if self.default_lower > self.default_upper {
            return Err(RuleError::Policy(format!(
                "default band is inverted: {} > {}",
                self.default_lower, self.default_upper
            )));
        }
        for (name, value) in [
            ("anomaly_confidence", self.anomaly_confidence),
            ("normal_confidence", self.normal_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RuleError::Policy(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.anomaly_confidence <= self.normal_confidence {
            return Err(RuleError::Policy(format!(
                "anomaly_confidence ({}) must exceed normal_confidence ({})",
                self.anomaly_confidence, self.normal_confidence
            )));
        }
        Ok(())
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// Closed interval of normal values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub lower: f64,
    pub upper: f64,
}

impl Band {
    pub fn contains(&self, value: f64) -> bool {
        !(value < self.lower || value > self.upper)
    }

    pub fn half_width(&self) -> f64 {
        (self.upper - self.lower) / 2.0
    }
}

/// Which bound was crossed and how badly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Violation {
    pub threshold: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub is_anomaly: bool,
    pub confidence: f64,
    pub band: Band,
    /// Present iff `is_anomaly`.
    pub violation: Option<Violation>,
}

// ── Detector ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    policy: DetectionPolicy,
}

impl AnomalyDetector {
    pub fn new(policy: DetectionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DetectionPolicy {
        &self.policy
    }

    /// The band in effect for `rules`.
    ///
    /// Enabled `outlier_detection` rules without a sigma are passed over in
    /// favour of a later one that has it.
    pub fn band(&self, rules: &[ProcessingRule]) -> Band {
        let sigma = rules
            .iter()
            .filter(|rule| rule.enabled)
            .find_map(|rule| match rule.kind {
                RuleKind::OutlierDetection(OutlierDetectionParams {
                    threshold_sigma: Some(s),
                }) => Some(s),
                _ => None,
            });

        match sigma {
            Some(s) => {
                let spread = s * self.policy.sigma_multiplier;
                Band {
                    lower: self.policy.midpoint - spread,
                    upper: self.policy.midpoint + spread,
                }
            }
            None => Band {
                lower: self.policy.default_lower,
                upper: self.policy.default_upper,
            },
        }
    }

    /// Classify `value`, returning `(is_anomaly, confidence)`.
    pub fn detect(&self, value: f64, rules: &[ProcessingRule]) -> (bool, f64) {
        let detection = self.evaluate(value, rules);
        (detection.is_anomaly, detection.confidence)
    }

    /// Classify `value` and report the crossed bound with a severity.
    pub fn evaluate(&self, value: f64, rules: &[ProcessingRule]) -> Detection {
        let band = self.band(rules);

        let violation = if value < band.lower {
            Some(self.violation(band, band.lower, band.lower - value))
        } else if value > band.upper {
            Some(self.violation(band, band.upper, value - band.upper))
        } else {
            None
        };

        let is_anomaly = violation.is_some();
        Detection {
            is_anomaly,
            confidence: if is_anomaly {
                self.policy.anomaly_confidence
            } else {
                self.policy.normal_confidence
            },
            band,
            violation,
        }
    }

    fn violation(&self, band: Band, threshold: f64, excess: f64) -> Violation {
        Violation {
            threshold,
            severity: severity_for(excess, band.half_width()),
        }
    }
}

/// Severity from the distance past the bound, relative to the band half-width.
fn severity_for(excess: f64, half_width: f64) -> Severity {
    if half_width <= 0.0 {
        return Severity::Critical;
    }
    let ratio = excess / half_width;
    if ratio < 0.25 {
        Severity::Low
    } else if ratio < 0.5 {
        Severity::Medium
    } else if ratio < 1.0 {
        Severity::High
    } else {
        Severity::Critical
    }
}
