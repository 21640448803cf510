//! The sensorflow agent pipeline.
//!
//! Consumes raw sensor samples from the broker, applies the agent's
//! processing rules, detects anomalies and publishes processed results,
//! alerts, processing outcomes and periodic host metrics.

pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod observer;
pub mod provider;
pub mod publisher;
pub mod registration;
pub mod settings;

pub use consumer::{Backoff, ConsumerState, IngestionConsumer, SampleHandler};
pub use coordinator::PipelineCoordinator;
pub use error::{ConfigError, PipelineError, PublishError, RegistrationError};
pub use handler::SampleProcessor;
pub use metrics::{HostUsage, MetricsReporter, SysinfoProbe, SystemProbe};
pub use observer::{CompositeObserver, PipelineObserver, PipelineStats, StatsSnapshot, TracingObserver};
pub use provider::{CachedConfigProvider, ConfigProvider, HttpConfigProvider, StaticConfigProvider};
pub use publisher::OutboundPublisher;
pub use registration::{RegisterAgentRequest, RegisterAgentResponse, RegistrationClient};
pub use settings::{Settings, SettingsError};
