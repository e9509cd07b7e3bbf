//! Prometheus metrics for the gate, the engine and request outcomes.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::gate::AdmissionGate;
use crate::inference::handle::SharedEngine;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
}

impl Metrics {
    /// Build a registry holding the gate and engine collectors plus the
    /// per-endpoint request counter.
    pub fn new(gate: &AdmissionGate, engine: &SharedEngine) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("chat_requests_total", "Chat requests by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(gate.in_use_gauge()))?;
        registry.register(Box::new(gate.rejection_counter()))?;
        registry.register(Box::new(engine.load_counter()))?;

        Ok(Self { registry, requests })
    }

    /// Count one finished request. `outcome` is `ok` or an error code.
    pub fn observe(&self, endpoint: &str, outcome: &str) {
        self.requests.with_label_values(&[endpoint, outcome]).inc();
    }

    pub fn request_count(&self, endpoint: &str, outcome: &str) -> u64 {
        self.requests.with_label_values(&[endpoint, outcome]).get()
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
