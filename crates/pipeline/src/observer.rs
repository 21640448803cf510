//! Hooks invoked at the consumer loop's transition points.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use sensorflow_broker::{BrokerError, Message};
use sensorflow_core::CoreError;

use crate::error::PipelineError;

/// Every method defaults to doing nothing.
pub trait PipelineObserver: Send + Sync {
    fn on_received(&self, _message: &Message) {}

    fn on_decode_failed(&self, _message: &Message, _error: &CoreError) {}

    fn on_handle_failed(&self, _message: &Message, _error: &PipelineError) {}

    fn on_acked(&self, _message: &Message) {}

    fn on_nacked(&self, _message: &Message) {}

    /// `consecutive` counts failures since the last successful receive.
    fn on_receive_error(&self, _error: &BrokerError, _consecutive: u32) {}

    /// An ack or nack was refused by the broker.
    fn on_settle_failed(&self, _message: &Message, _error: &BrokerError) {}
}

// ── Tracing ─────────────────────────────────────────────────────────

/// Emits a `tracing` event per transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_received(&self, message: &Message) {
        debug!(
            topic = %message.topic,
            message_id = %message.id,
            redelivery = message.redelivery_count,
            bytes = message.payload.len(),
            "message received"
        );
    }

    fn on_decode_failed(&self, message: &Message, error: &CoreError) {
        warn!(message_id = %message.id, error = %error, "failed to decode sample");
    }

    fn on_handle_failed(&self, message: &Message, error: &PipelineError) {
        warn!(message_id = %message.id, error = %error, "failed to handle sample");
    }

    fn on_acked(&self, message: &Message) {
        debug!(message_id = %message.id, "message acknowledged");
    }

    fn on_nacked(&self, message: &Message) {
        debug!(message_id = %message.id, "message negatively acknowledged");
    }

    fn on_receive_error(&self, error: &BrokerError, consecutive: u32) {
        error!(error = %error, consecutive, "receive failed");
    }

    fn on_settle_failed(&self, message: &Message, error: &BrokerError) {
        warn!(message_id = %message.id, error = %error, "failed to settle message");
    }
}

// ── Counters ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    decode_failures: AtomicU64,
    handle_failures: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    receive_errors: AtomicU64,
    settle_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub decode_failures: u64,
    pub handle_failures: u64,
    pub acked: u64,
    pub nacked: u64,
    pub receive_errors: u64,
    pub settle_failures: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handle_failures: self.handle_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineObserver for PipelineStats {
    fn on_received(&self, _message: &Message) {
        bump(&self.received);
    }

    fn on_decode_failed(&self, _message: &Message, _error: &CoreError) {
        bump(&self.decode_failures);
    }

    fn on_handle_failed(&self, _message: &Message, _error: &PipelineError) {
        bump(&self.handle_failures);
    }

    fn on_acked(&self, _message: &Message) {
        bump(&self.acked);
    }

    fn on_nacked(&self, _message: &Message) {
        bump(&self.nacked);
    }

    fn on_receive_error(&self, _error: &BrokerError, _consecutive: u32) {
        bump(&self.receive_errors);
    }

    fn on_settle_failed(&self, _message: &Message, _error: &BrokerError) {
        bump(&self.settle_failures);
    }
}

// ── Fan-out ─────────────────────────────────────────────────────────

/// Forwards every call to each inner observer in order.
#[derive(Default, Clone)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl PipelineObserver for CompositeObserver {
    fn on_received(&self, message: &Message) {
        self.observers.iter().for_each(|o| o.on_received(message));
    }

    fn on_decode_failed(&self, message: &Message, error: &CoreError) {
        self.observers
            .iter()
            .for_each(|o| o.on_decode_failed(message, error));
    }

    fn on_handle_failed(&self, message: &Message, error: &PipelineError) {
        self.observers
            .iter()
            .for_each(|o| o.on_handle_failed(message, error));
    }

    fn on_acked(&self, message: &Message) {
        self.observers.iter().for_each(|o| o.on_acked(message));
    }

    fn on_nacked(&self, message: &Message) {
        self.observers.iter().for_each(|o| o.on_nacked(message));
    }

    fn on_receive_error(&self, error: &BrokerError, consecutive: u32) {
        self.observers
            .iter()
            .for_each(|o| o.on_receive_error(error, consecutive));
    }

    fn on_settle_failed(&self, message: &Message, error: &BrokerError) {
        self.observers
            .iter()
            .for_each(|o| o.on_settle_failed(message, error));
    }
}
