use thiserror::Error;

/// Rule and policy validation failures.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("invalid params for rule '{rule}': {source}")]
    InvalidParams {
        rule: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("rule '{rule}': {reason}")]
    Invalid { rule: String, reason: String },

    #[error("invalid detection policy: {0}")]
    Policy(String),
}
