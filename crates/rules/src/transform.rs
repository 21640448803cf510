//! Value transformation through an ordered rule list.

use std::collections::VecDeque;

use crate::schema::{ProcessingRule, RuleKind};

// ── Moving average ──────────────────────────────────────────────────

/// Trailing arithmetic mean over the last `capacity` pushed values.
#[derive(Debug, Clone, PartialEq)]
pub struct MovingAverageWindow {
    capacity: usize,
    values: VecDeque<f64>,
}

impl MovingAverageWindow {
    /// A zero capacity is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a value and return the mean of the window including it.
    pub fn push(&mut self, value: f64) -> f64 {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

// ── Stateless engine ────────────────────────────────────────────────

/// Applies a rule list to a single value with no history.
pub struct TransformEngine;

impl TransformEngine {
    /// Run `value` through every enabled, recognized rule in order.
    ///
    /// Each recognized rule sees the output of the previous one. With no
    /// history a moving average covers only the current input, so it
    /// returns that input.
    pub fn apply(value: f64, rules: &[ProcessingRule]) -> f64 {
        rules
            .iter()
            .filter(|rule| rule.enabled)
            .fold(value, |acc, rule| match &rule.kind {
                RuleKind::MovingAverage(p) => MovingAverageWindow::new(p.window).push(acc),
                RuleKind::OutlierDetection(_) | RuleKind::Unrecognized { .. } => acc,
            })
    }
}

// ── Stateful chain ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Step {
    MovingAverage(MovingAverageWindow),
}

/// A rule list compiled into steps that keep history between samples.
///
/// One chain serves one (agent, sensor type) stream. It remembers the rules
/// it was compiled from so callers can tell when the configuration changed
/// and a fresh chain is needed.
#[derive(Debug, Clone)]
pub struct RuleChain {
    rules: Vec<ProcessingRule>,
    steps: Vec<Step>,
}

impl RuleChain {
    pub fn compile(rules: &[ProcessingRule]) -> Self {
        let steps = rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter_map(|rule| match &rule.kind {
                RuleKind::MovingAverage(p) => {
                    Some(Step::MovingAverage(MovingAverageWindow::new(p.window)))
                }
                RuleKind::OutlierDetection(_) => None,
                RuleKind::Unrecognized { name, .. } => {
                    tracing::debug!(rule = %name, "ignoring unrecognized rule");
                    None
                }
            })
            .collect();
        Self {
            rules: rules.to_vec(),
            steps,
        }
    }

    /// Rules this chain was compiled from.
    pub fn rules(&self) -> &[ProcessingRule] {
        &self.rules
    }

    /// Whether this chain was compiled from exactly `rules`.
    pub fn is_compiled_from(&self, rules: &[ProcessingRule]) -> bool {
        self.rules == rules
    }

    /// True when no step keeps history, so the chain need not be retained.
    pub fn is_stateless(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply(&mut self, value: f64) -> f64 {
        self.steps.iter_mut().fold(value, |acc, step| match step {
            Step::MovingAverage(window) => window.push(acc),
        })
    }

    /// Drop accumulated history, keeping the compiled steps.
    pub fn reset(&mut self) {
        for step in &mut self.steps {
            match step {
                Step::MovingAverage(window) => window.clear(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn window_averages_trailing_values() {
        let mut w = MovingAverageWindow::new(3);
        assert_eq!(w.push(3.0), 3.0);
        assert_eq!(w.push(6.0), 4.5);
        assert_eq!(w.push(9.0), 6.0);
        assert_eq!(w.push(12.0), 9.0);
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn zero_capacity_behaves_as_one() {
        let mut w = MovingAverageWindow::new(0);
        assert_eq!(w.push(4.0), 4.0);
        assert_eq!(w.push(8.0), 8.0);
    }

    #[test]
    fn apply_ignores_disabled_and_unknown_rules() {
        let rules = vec![
            ProcessingRule::moving_average(4).disabled(),
            ProcessingRule::unrecognized("kalman", json!({"gain": 0.2})),
            ProcessingRule::outlier_detection(2.0),
        ];
        assert_eq!(TransformEngine::apply(17.25, &rules), 17.25);
    }

    #[test]
    fn apply_is_identity_for_single_moving_average() {
        let rules = vec![ProcessingRule::moving_average(5)];
        assert_eq!(TransformEngine::apply(42.0, &rules), 42.0);
    }

    #[test]
    fn chain_smooths_across_samples() {
        let mut chain = RuleChain::compile(&[ProcessingRule::moving_average(2)]);
        assert_eq!(chain.apply(10.0), 10.0);
        assert_eq!(chain.apply(20.0), 15.0);
        assert_eq!(chain.apply(40.0), 30.0);
    }

    #[test]
    fn chain_composes_moving_averages() {
        let rules = vec![
            ProcessingRule::moving_average(2),
            ProcessingRule::moving_average(2),
        ];
        let mut chain = RuleChain::compile(&rules);
        assert_eq!(chain.apply(10.0), 10.0);
        // First window: mean(10, 20) = 15; second window: mean(10, 15) = 12.5.
        assert_eq!(chain.apply(20.0), 12.5);
    }

    #[test]
    fn chain_tracks_source_rules_and_resets() {
        let rules = vec![ProcessingRule::moving_average(3)];
        let mut chain = RuleChain::compile(&rules);
        chain.apply(1.0);
        chain.apply(2.0);

        assert!(chain.is_compiled_from(&rules));
        assert!(!chain.is_compiled_from(&[ProcessingRule::moving_average(4)]));

        chain.reset();
        assert_eq!(chain.apply(9.0), 9.0);
    }

    #[test]
    fn empty_chain_is_identity() {
        let mut chain = RuleChain::compile(&[]);
        assert_eq!(chain.apply(-3.5), -3.5);
        assert!(chain.rules().is_empty());
    }
}
