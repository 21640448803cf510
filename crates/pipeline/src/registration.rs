//! One-shot agent registration with the server.

use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RegistrationError;

/// Body of `POST /agents/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub uuid: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
    pub thread_count: usize,
    pub max_thread_count: usize,
    pub version: String,
    pub capabilities: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl RegisterAgentRequest {
    /// Describe this host. The pipeline runs one processing loop, so
    /// `thread_count` is always 1.
    pub fn for_host(agent_uuid: &str) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let metadata = BTreeMap::from([
            ("os".to_string(), std::env::consts::OS.to_string()),
            ("architecture".to_string(), std::env::consts::ARCH.to_string()),
            ("cpu_count".to_string(), cpus.to_string()),
        ]);
        Self {
            uuid: agent_uuid.to_string(),
            hostname: hostname(),
            ip_address: local_ip(),
            port: 0,
            thread_count: 1,
            max_thread_count: cpus,
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![
                "stream_processing".into(),
                "anomaly_detection".into(),
                "system_monitoring".into(),
            ],
            metadata,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RegisterAgentResponse {
    #[serde(default)]
    pub code: serde_json::Value,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub status: String,
}

fn hostname() -> String {
    sysinfo::System::host_name()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| sensorflow_core::config::env_opt("HOSTNAME"))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Address of the interface that routes outward. No packet is sent.
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("192.0.2.1:9")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub struct RegistrationClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl RegistrationClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Register once. 200 and 201 are accepted; anything else is rejected.
    pub async fn register(
        &self,
        request: &RegisterAgentRequest,
    ) -> Result<RegisterAgentResponse, RegistrationError> {
        let url = format!("{}/agents/register", self.base_url);
        debug!(url = %url, hostname = %request.hostname, "registering agent");
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistrationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        // Servers that answer with an empty or non-JSON body still registered us.
        let body = resp.bytes().await?;
        let response: RegisterAgentResponse = serde_json::from_slice(&body).unwrap_or_default();
        info!(
            agent_id = %response.agent_id,
            status = %response.status,
            hostname = %request.hostname,
            ip_address = %request.ip_address,
            "agent registered"
        );
        Ok(response)
    }
}
