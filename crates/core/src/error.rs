use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("record decode error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid record: {0}")]
    Invalid(String),
}
