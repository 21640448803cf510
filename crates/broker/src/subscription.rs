use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a subscription distributes messages among its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    /// Consumers compete; each message goes to one of them.
    #[default]
    Shared,
    /// A single consumer; a second one is refused.
    Exclusive,
    /// Consumers queue up; only the first attached receives until it leaves.
    Failover,
    /// Like shared. Key affinity is not enforced.
    KeyShared,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
            Self::Failover => "failover",
            Self::KeyShared => "key_shared",
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "shared" => Ok(Self::Shared),
            "exclusive" => Ok(Self::Exclusive),
            "failover" => Ok(Self::Failover),
            "key_shared" | "keyshared" => Ok(Self::KeyShared),
            other => Err(format!("unknown subscription type: '{other}'")),
        }
    }
}

/// Parameters for attaching a consumer to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub name: String,
    pub kind: SubscriptionType,
    /// Redeliveries allowed after a nack before the message is dead-lettered.
    pub max_redeliveries: u32,
}

impl SubscriptionOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SubscriptionType::default(),
            max_redeliveries: 3,
        }
    }

    pub fn kind(mut self, kind: SubscriptionType) -> Self {
        self.kind = kind;
        self
    }

    pub fn max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }
}
