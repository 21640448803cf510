//! Periodic host resource reporting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Disks, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sensorflow_core::MetricsSample;

use crate::consumer::cancelled;
use crate::publisher::OutboundPublisher;

/// Host usage in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

pub trait SystemProbe: Send {
    fn sample(&mut self) -> std::io::Result<HostUsage>;
}

// ── sysinfo ─────────────────────────────────────────────────────────

/// `used` as a percentage of `total`; 0 when `total` is 0.
pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used.min(total) as f64 / total as f64 * 100.0
}

/// Used share of the combined capacity of `(total, available)` disks.
pub fn disk_percent<I>(disks: I) -> f64
where
    I: IntoIterator<Item = (u64, u64)>,
{
    let (total, available) = disks
        .into_iter()
        .fold((0u64, 0u64), |(total, available), (t, a)| {
            (total.saturating_add(t), available.saturating_add(a.min(t)))
        });
    percent(total.saturating_sub(available), total)
}

/// Host CPU, memory and disk usage read through `sysinfo`.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// after construction may read low.
pub struct SysinfoProbe {
    system: System,
    disks: Disks,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&mut self) -> std::io::Result<HostUsage> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "host metrics are not supported on this platform",
            ));
        }
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh_list();

        Ok(HostUsage {
            cpu: f64::from(self.system.global_cpu_usage()).clamp(0.0, 100.0),
            memory: percent(self.system.used_memory(), self.system.total_memory()),
            disk: disk_percent(
                self.disks
                    .list()
                    .iter()
                    .map(|disk| (disk.total_space(), disk.available_space())),
            ),
        })
    }
}

// ── Reporter ────────────────────────────────────────────────────────

pub struct MetricsReporter {
    agent_uuid: String,
    interval: Duration,
    probe: Box<dyn SystemProbe>,
    publisher: Arc<OutboundPublisher>,
}

impl MetricsReporter {
    pub fn new(
        agent_uuid: impl Into<String>,
        interval: Duration,
        probe: Box<dyn SystemProbe>,
        publisher: Arc<OutboundPublisher>,
    ) -> Self {
        Self {
            agent_uuid: agent_uuid.into(),
            interval,
            probe,
            publisher,
        }
    }

    /// Sample and publish once. Failures are logged and yield `None`.
    pub async fn report_once(&mut self) -> Option<MetricsSample> {
        let usage = match self.probe.sample() {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "failed to sample host usage");
                return None;
            }
        };
        let sample = MetricsSample {
            id: Uuid::new_v4(),
            agent_uuid: self.agent_uuid.clone(),
            cpu_usage: usage.cpu,
            memory_usage: usage.memory,
            disk_usage: usage.disk,
            timestamp: Utc::now(),
        };
        match self.publisher.send_metrics(&sample).await {
            Ok(_) => {
                debug!(
                    cpu = sample.cpu_usage,
                    memory = sample.memory_usage,
                    disk = sample.disk_usage,
                    "metrics published"
                );
                Some(sample)
            }
            Err(e) => {
                warn!(error = %e, "failed to publish metrics");
                None
            }
        }
    }

    /// Report every interval until `shutdown`. A zero interval reports nothing.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.interval.is_zero() {
                info!("metrics reporter disabled");
                return;
            }
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = self.interval.as_secs_f64(), "metrics reporter started");
            loop {
                tokio::select! {
                    _ = cancelled(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        self.report_once().await;
                    }
                }
            }
            info!("metrics reporter stopped");
        })
    }
}
