//! Sources of per-agent processing configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use sensorflow_rules::AgentProcessingConfig;

use crate::error::ConfigError;

/// Fetches the processing configuration of an agent.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get_config(&self, agent_uuid: &str) -> Result<AgentProcessingConfig, ConfigError>;
}

#[async_trait]
impl<T: ConfigProvider + ?Sized> ConfigProvider for Arc<T> {
    async fn get_config(&self, agent_uuid: &str) -> Result<AgentProcessingConfig, ConfigError> {
        (**self).get_config(agent_uuid).await
    }
}

// ── HTTP ────────────────────────────────────────────────────────────

/// Response body of the configuration service: `{code, message, config}`.
#[derive(Debug, Deserialize)]
struct ConfigEnvelope {
    #[serde(default)]
    message: String,
    #[serde(default)]
    config: Option<AgentProcessingConfig>,
}

/// Reads `GET {base_url}/v1/agent/{uuid}/config`.
pub struct HttpConfigProvider {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpConfigProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    fn config_url(&self, agent_uuid: &str) -> String {
        format!("{}/v1/agent/{}/config", self.base_url, agent_uuid)
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn get_config(&self, agent_uuid: &str) -> Result<AgentProcessingConfig, ConfigError> {
        let url = self.config_url(agent_uuid);
        let resp = self.http.get(&url).timeout(self.timeout).send().await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ConfigError::NotFound(agent_uuid.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ConfigError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        let Some(mut config) = envelope.config else {
            debug!(agent_uuid, message = %envelope.message, "config service has no config");
            return Err(ConfigError::NotFound(agent_uuid.to_string()));
        };
        if config.agent_uuid.is_empty() {
            config.agent_uuid = agent_uuid.to_string();
        }
        debug!(agent_uuid, rules = config.rules.len(), "fetched processing config");
        Ok(config)
    }
}

// ── Caching ─────────────────────────────────────────────────────────

/// TTL cache in front of another provider.
///
/// A zero TTL disables caching. Failed fetches are not cached.
pub struct CachedConfigProvider<P> {
    inner: P,
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, AgentProcessingConfig)>>,
}

impl<P: ConfigProvider> CachedConfigProvider<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn invalidate(&self, agent_uuid: &str) {
        self.entries.lock().await.remove(agent_uuid);
    }

    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }
}

#[async_trait]
impl<P: ConfigProvider> ConfigProvider for CachedConfigProvider<P> {
    async fn get_config(&self, agent_uuid: &str) -> Result<AgentProcessingConfig, ConfigError> {
        if self.ttl.is_zero() {
            return self.inner.get_config(agent_uuid).await;
        }

        if let Some((fetched_at, config)) = self.entries.lock().await.get(agent_uuid) {
            if fetched_at.elapsed() < self.ttl {
                return Ok(config.clone());
            }
        }

        let config = self.inner.get_config(agent_uuid).await?;
        self.entries
            .lock()
            .await
            .insert(agent_uuid.to_string(), (Instant::now(), config.clone()));
        Ok(config)
    }
}

// ── Static ──────────────────────────────────────────────────────────

/// Fixed configurations held in memory. Unknown agents are not found.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    configs: HashMap<String, AgentProcessingConfig>,
}

impl StaticConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, config: AgentProcessingConfig) -> Self {
        self.configs.insert(config.agent_uuid.clone(), config);
        self
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn get_config(&self, agent_uuid: &str) -> Result<AgentProcessingConfig, ConfigError> {
        self.configs
            .get(agent_uuid)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(agent_uuid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use sensorflow_rules::ProcessingRule;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    async fn config_handler(Path(uuid): Path<String>) -> impl IntoResponse {
        match uuid.as_str() {
            "agent-1" => (
                StatusCode::OK,
                Json(json!({
                    "code": 200,
                    "message": "ok",
                    "config": {
                        "sensor_type": "temp",
                        "processing_rules": [
                            {"name": "outlier_detection", "enabled": true, "params": {"threshold_sigma": 2.0}}
                        ],
                        "output_streams": [],
                        "enabled": true
                    }
                })),
            )
                .into_response(),
            "agent-null" => Json(json!({"code": "0", "message": "none", "config": null})).into_response(),
            "agent-bad-rule" => Json(json!({
                "code": 200,
                "message": "ok",
                "config": {
                    "processing_rules": [
                        {"name": "moving_average", "enabled": true, "params": {"window": 0}},
                        {"name": "outlier_detection", "enabled": true, "params": {"threshold_sigma": 1.0}},
                        {"name": "moving_average", "enabled": false, "params": {"window": -1}}
                    ]
                }
            }))
            .into_response(),
            "agent-garbage" => (StatusCode::OK, "<html>").into_response(),
            "agent-broken" => (StatusCode::INTERNAL_SERVER_ERROR, "db down").into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn provider() -> HttpConfigProvider {
        let app = Router::new().route("/v1/agent/{uuid}/config", get(config_handler));
        let base = serve(app).await;
        HttpConfigProvider::new(&format!("{base}/"), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn fetches_and_fills_agent_uuid() {
        let config = provider().await.get_config("agent-1").await.unwrap();
        assert_eq!(config.agent_uuid, "agent-1");
        assert_eq!(config.sensor_type, "temp");
        assert_eq!(config.rules, vec![ProcessingRule::outlier_detection(2.0)]);
    }

    #[tokio::test]
    async fn missing_config_is_not_found() {
        let p = provider().await;
        assert!(matches!(p.get_config("agent-null").await, Err(ConfigError::NotFound(_))));
        assert!(matches!(p.get_config("nobody").await, Err(ConfigError::NotFound(_))));
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_body() {
        match provider().await.get_config("agent-broken").await {
            Err(ConfigError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "db down");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let p = provider().await;
        assert!(matches!(p.get_config("agent-garbage").await, Err(ConfigError::Decode(_))));
    }

    #[tokio::test]
    async fn bad_rules_do_not_discard_the_config() {
        let config = provider().await.get_config("agent-bad-rule").await.unwrap();
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0], ProcessingRule::outlier_detection(1.0));
        assert!(!config.rules[1].enabled);
    }

    #[tokio::test]
    async fn unreachable_server_is_http_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let p = HttpConfigProvider::new(&format!("http://{addr}"), Duration::from_secs(2));
        assert!(matches!(p.get_config("agent-1").await, Err(ConfigError::Http(_))));
    }

    /// Counts fetches and fails for agents named `fail-*`.
    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConfigProvider for Counting {
        async fn get_config(&self, agent_uuid: &str) -> Result<AgentProcessingConfig, ConfigError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if agent_uuid.starts_with("fail") {
                return Err(ConfigError::NotFound(agent_uuid.into()));
            }
            Ok(AgentProcessingConfig::empty(agent_uuid))
        }
    }

    #[tokio::test]
    async fn cache_serves_repeat_fetches_until_invalidated() {
        let inner = Arc::new(Counting::default());
        let cached = CachedConfigProvider::new(inner.clone(), Duration::from_secs(60));

        cached.get_config("a").await.unwrap();
        cached.get_config("a").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        cached.invalidate("a").await;
        cached.get_config("a").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        cached.get_config("b").await.unwrap();
        cached.invalidate_all().await;
        cached.get_config("a").await.unwrap();
        cached.get_config("b").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn cache_does_not_keep_failures() {
        let inner = Arc::new(Counting::default());
        let cached = CachedConfigProvider::new(inner.clone(), Duration::from_secs(60));
        assert!(cached.get_config("fail-1").await.is_err());
        assert!(cached.get_config("fail-1").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_fetches() {
        let inner = Arc::new(Counting::default());
        let cached = CachedConfigProvider::new(inner.clone(), Duration::ZERO);
        cached.get_config("a").await.unwrap();
        cached.get_config("a").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn static_provider_knows_only_its_agents() {
        let p = StaticConfigProvider::new().with(AgentProcessingConfig::empty("agent-1"));
        assert!(p.get_config("agent-1").await.is_ok());
        assert!(matches!(p.get_config("agent-2").await, Err(ConfigError::NotFound(_))));
    }
}
