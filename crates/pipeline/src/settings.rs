//! Agent settings.
//!
//! Loaded from `config/sensorflow.toml`, then overridden by environment
//! variables named `SENSORFLOW_<SECTION>_<KEY>` (nested tables join with
//! `_`, e.g. `SENSORFLOW_BROKER_CONSUMER_SUBSCRIPTION_TYPE`). Setting
//! `SENSORFLOW_PROFILE=prod` makes `PROD_SENSORFLOW_*` variables win over
//! the unprefixed ones.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sensorflow_broker::{BrokerUrl, SubscriptionType};
use sensorflow_core::config::{load_dotenv, EnvSource, ProcessEnv, Profiled};
use sensorflow_rules::{DetectionPolicy, RuleError};

pub const DEFAULT_PATH: &str = "config/sensorflow.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error(transparent)]
    Detection(#[from] RuleError),
}

// ── Top-level settings ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub detection: DetectionPolicy,

    #[serde(default)]
    pub backoff: BackoffSettings,
}

// ── Section settings ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub uuid: String,
    /// Base URL of the configuration and registration service.
    pub server_endpoint: String,
    /// Written into every processing outcome.
    pub processing_type: String,
    pub register_on_start: bool,
    /// Nack samples whose configuration cannot be fetched instead of
    /// processing them against an empty rule list.
    pub fail_closed: bool,
    /// 0 fetches the configuration for every sample.
    pub config_cache_ttl_secs: u64,
    /// 0 disables the system metrics reporter.
    pub metrics_interval_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            server_endpoint: "http://localhost:8080".into(),
            processing_type: "stream".into(),
            register_on_start: true,
            fail_closed: false,
            config_cache_ttl_secs: 0,
            metrics_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// `memory://<name>`, `tcp://host:port` or `ipc://name`.
    pub url: String,
    /// ZeroMQ consumer endpoint. Defaults to the endpoint after `url`.
    pub backend_url: Option<String>,
    pub connection_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub topics: TopicSettings,
    pub consumer: ConsumerSettings,
    pub producer: ProducerSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:5555".into(),
            backend_url: None,
            connection_timeout_secs: 10,
            operation_timeout_secs: 5,
            topics: TopicSettings::default(),
            consumer: ConsumerSettings::default(),
            producer: ProducerSettings::default(),
        }
    }
}

impl BrokerSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    pub input: String,
    pub processed: String,
    pub metrics: String,
    pub alerts: String,
    pub results: String,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            input: "external-sensor-data".into(),
            processed: "processed-sensor-data".into(),
            metrics: "system-metrics".into(),
            alerts: "alert-data".into(),
            results: "processing-results".into(),
        }
    }
}

impl TopicSettings {
    fn named(&self) -> [(&'static str, &str); 5] {
        [
            ("input", &self.input),
            ("processed", &self.processed),
            ("metrics", &self.metrics),
            ("alerts", &self.alerts),
            ("results", &self.results),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub subscription_name: String,
    pub subscription_type: SubscriptionType,
    pub max_redeliveries: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            subscription_name: "agent-processor".into(),
            subscription_type: SubscriptionType::Shared,
            max_redeliveries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    pub send_timeout_secs: u64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            send_timeout_secs: 30,
        }
    }
}

impl ProducerSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

/// Delay between consecutive failed receives: doubles from `initial_ms`
/// up to `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 30_000,
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────

impl Settings {
    /// Parse settings from a TOML string and validate them.
    pub fn from_toml(toml_str: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(toml_str)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load the file (defaults if missing), `.env`, and process overrides.
    ///
    /// Not validated: callers apply their own overrides first, then call
    /// [`Settings::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load_dotenv();
        Self::load_with(path, &ProcessEnv)
    }

    /// [`Settings::load`] with an explicit override source.
    pub fn load_with<E: EnvSource + ?Sized>(
        path: impl AsRef<Path>,
        env: &E,
    ) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "settings file not found, using defaults");
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };
        let profile = env.get("SENSORFLOW_PROFILE").unwrap_or_default();
        settings.apply_env_overrides(&Profiled::new(env, &profile));
        Ok(settings)
    }

    // ── Environment variable overrides ──────────────────────────────

    fn apply_env_overrides<E: EnvSource + ?Sized>(&mut self, env: &Profiled<'_, E>) {
        fn set<E: EnvSource + ?Sized, T: FromStr>(env: &Profiled<'_, E>, key: &str, slot: &mut T) {
            if let Some(v) = env.parse(key) {
                *slot = v;
            }
        }

        let agent = &mut self.agent;
        set(env, "SENSORFLOW_AGENT_UUID", &mut agent.uuid);
        set(env, "SENSORFLOW_AGENT_SERVER_ENDPOINT", &mut agent.server_endpoint);
        set(env, "SENSORFLOW_AGENT_PROCESSING_TYPE", &mut agent.processing_type);
        if let Some(v) = env.flag("SENSORFLOW_AGENT_REGISTER_ON_START") {
            agent.register_on_start = v;
        }
        if let Some(v) = env.flag("SENSORFLOW_AGENT_FAIL_CLOSED") {
            agent.fail_closed = v;
        }
        set(env, "SENSORFLOW_AGENT_CONFIG_CACHE_TTL_SECS", &mut agent.config_cache_ttl_secs);
        set(env, "SENSORFLOW_AGENT_METRICS_INTERVAL_SECS", &mut agent.metrics_interval_secs);

        let broker = &mut self.broker;
        set(env, "SENSORFLOW_BROKER_URL", &mut broker.url);
        if let Some(v) = env.get("SENSORFLOW_BROKER_BACKEND_URL") {
            broker.backend_url = Some(v);
        }
        set(env, "SENSORFLOW_BROKER_CONNECTION_TIMEOUT_SECS", &mut broker.connection_timeout_secs);
        set(env, "SENSORFLOW_BROKER_OPERATION_TIMEOUT_SECS", &mut broker.operation_timeout_secs);
        set(env, "SENSORFLOW_BROKER_TOPICS_INPUT", &mut broker.topics.input);
        set(env, "SENSORFLOW_BROKER_TOPICS_PROCESSED", &mut broker.topics.processed);
        set(env, "SENSORFLOW_BROKER_TOPICS_METRICS", &mut broker.topics.metrics);
        set(env, "SENSORFLOW_BROKER_TOPICS_ALERTS", &mut broker.topics.alerts);
        set(env, "SENSORFLOW_BROKER_TOPICS_RESULTS", &mut broker.topics.results);
        set(
            env,
            "SENSORFLOW_BROKER_CONSUMER_SUBSCRIPTION_NAME",
            &mut broker.consumer.subscription_name,
        );
        set(
            env,
            "SENSORFLOW_BROKER_CONSUMER_SUBSCRIPTION_TYPE",
            &mut broker.consumer.subscription_type,
        );
        set(
            env,
            "SENSORFLOW_BROKER_CONSUMER_MAX_REDELIVERIES",
            &mut broker.consumer.max_redeliveries,
        );
        set(
            env,
            "SENSORFLOW_BROKER_PRODUCER_SEND_TIMEOUT_SECS",
            &mut broker.producer.send_timeout_secs,
        );

        let detection = &mut self.detection;
        set(env, "SENSORFLOW_DETECTION_MIDPOINT", &mut detection.midpoint);
        set(env, "SENSORFLOW_DETECTION_SIGMA_MULTIPLIER", &mut detection.sigma_multiplier);
        set(env, "SENSORFLOW_DETECTION_DEFAULT_LOWER", &mut detection.default_lower);
        set(env, "SENSORFLOW_DETECTION_DEFAULT_UPPER", &mut detection.default_upper);
        set(env, "SENSORFLOW_DETECTION_ANOMALY_CONFIDENCE", &mut detection.anomaly_confidence);
        set(env, "SENSORFLOW_DETECTION_NORMAL_CONFIDENCE", &mut detection.normal_confidence);

        set(env, "SENSORFLOW_BACKOFF_INITIAL_MS", &mut self.backoff.initial_ms);
        set(env, "SENSORFLOW_BACKOFF_MAX_MS", &mut self.backoff.max_ms);
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.validate_agent()?;
        self.validate_broker()?;
        self.validate_backoff()?;
        self.detection.validate()?;
        Ok(())
    }

    fn validate_agent(&self) -> Result<(), SettingsError> {
        if self.agent.uuid.trim().is_empty() {
            return Err(SettingsError::Invalid("agent.uuid must be set".into()));
        }
        let endpoint = &self.agent.server_endpoint;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(SettingsError::Invalid(format!(
                "agent.server_endpoint must be an http(s) URL, got '{endpoint}'"
            )));
        }
        Ok(())
    }

    fn validate_broker(&self) -> Result<(), SettingsError> {
        BrokerUrl::parse(&self.broker.url)
            .map_err(|e| SettingsError::Invalid(format!("broker.url: {e}")))?;
        if let Some(backend) = &self.broker.backend_url {
            match BrokerUrl::parse(backend) {
                Ok(BrokerUrl::Zmq(_)) => {}
                Ok(BrokerUrl::Memory(_)) => {
                    return Err(SettingsError::Invalid(
                        "broker.backend_url must be tcp:// or ipc://".into(),
                    ))
                }
                Err(e) => return Err(SettingsError::Invalid(format!("broker.backend_url: {e}"))),
            }
        }
        for (name, topic) in self.broker.topics.named() {
            if topic.trim().is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "broker.topics.{name} must not be empty"
                )));
            }
        }
        if self.broker.consumer.subscription_name.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "broker.consumer.subscription_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn validate_backoff(&self) -> Result<(), SettingsError> {
        let b = &self.backoff;
        if b.initial_ms == 0 {
            return Err(SettingsError::Invalid("backoff.initial_ms must be positive".into()));
        }
        if b.initial_ms > b.max_ms {
            return Err(SettingsError::Invalid(format!(
                "backoff.initial_ms ({}) exceeds backoff.max_ms ({})",
                b.initial_ms, b.max_ms
            )));
        }
        Ok(())
    }
}
