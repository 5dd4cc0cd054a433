use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{GatewayError, Result};

/// Prometheus metrics for the gateway core.
pub struct Metrics {
    registry: Registry,

    // Relay metrics
    pub relay_sessions_active: IntGauge,
    pub relay_messages: IntCounterVec,
    pub rate_limit_rejections: IntCounter,

    // Lifecycle metrics
    pub lifecycle_operations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let relay_sessions_active = IntGauge::new(
            "relay_sessions_active",
            "Number of relay sessions currently open",
        )
        .map_err(|e| GatewayError::Server(format!("registering metrics: {}", e)))?;

        let relay_messages = IntCounterVec::new(
            Opts::new("relay_messages_total", "Messages forwarded by the relay"),
            &["direction"],
        )
        .map_err(|e| GatewayError::Server(format!("registering metrics: {}", e)))?;

        let rate_limit_rejections = IntCounter::new(
            "rate_limit_rejections_total",
            "Relay messages dropped by the rate limiter",
        )
        .map_err(|e| GatewayError::Server(format!("registering metrics: {}", e)))?;

        let lifecycle_operations = IntCounterVec::new(
            Opts::new(
                "lifecycle_operations_total",
                "Start/stop operations by outcome",
            ),
            &["operation", "outcome"],
        )
        .map_err(|e| GatewayError::Server(format!("registering metrics: {}", e)))?;

        for collector in [
            Box::new(relay_sessions_active.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(relay_messages.clone()),
            Box::new(rate_limit_rejections.clone()),
            Box::new(lifecycle_operations.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| GatewayError::Server(format!("registering metrics: {}", e)))?;
        }

        Ok(Self {
            registry,
            relay_sessions_active,
            relay_messages,
            rate_limit_rejections,
            lifecycle_operations,
        })
    }

    pub fn record_lifecycle(&self, operation: &str, outcome: &str) {
        self.lifecycle_operations
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| GatewayError::Server(format!("encoding metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| GatewayError::Server(format!("encoding metrics: {}", e)))
    }
}
