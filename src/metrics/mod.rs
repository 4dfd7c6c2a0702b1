// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Counters for:
// - Order creation and status transitions (vendor and overall)
// - Rejected commands by error kind
// - Payment notifications and their outcome
// - Lock contention and retries
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the entire application
pub struct Metrics {
    registry: Registry,

    // Order lifecycle
    pub orders_created: IntCounter,
    pub vendor_status_transitions: IntCounterVec,
    pub order_status_transitions: IntCounterVec,

    // Command outcomes
    pub commands_rejected: IntCounterVec,
    pub command_duration: HistogramVec,

    // Payment notifications
    pub payment_notifications: IntCounterVec,

    // Contention
    pub lock_timeouts: IntCounter,
    pub retry_attempts_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let orders_created = IntCounter::new("orders_created_total", "Total orders created")?;
        registry.register(Box::new(orders_created.clone()))?;

        let vendor_status_transitions = IntCounterVec::new(
            Opts::new("vendor_status_transitions_total", "Vendor status transitions"),
            &["from", "to"],
        )?;
        registry.register(Box::new(vendor_status_transitions.clone()))?;

        let order_status_transitions = IntCounterVec::new(
            Opts::new("order_status_transitions_total", "Overall order status transitions"),
            &["from", "to"],
        )?;
        registry.register(Box::new(order_status_transitions.clone()))?;

        let commands_rejected = IntCounterVec::new(
            Opts::new("commands_rejected_total", "Commands rejected by reason"),
            &["command", "reason"],
        )?;
        registry.register(Box::new(commands_rejected.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new("command_duration_seconds", "Order command duration including lock wait")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["command"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        let payment_notifications = IntCounterVec::new(
            Opts::new("payment_notifications_total", "Payment notifications received"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(payment_notifications.clone()))?;

        let lock_timeouts = IntCounter::new(
            "lock_timeouts_total",
            "Attempts that timed out waiting for an order lock",
        )?;
        registry.register(Box::new(lock_timeouts.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        Ok(Self {
            registry,
            orders_created,
            vendor_status_transitions,
            order_status_transitions,
            commands_rejected,
            command_duration,
            payment_notifications,
            lock_timeouts,
            retry_attempts_total,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_order_created(&self) {
        self.orders_created.inc();
    }

    pub fn record_vendor_transition(&self, from: &str, to: &str) {
        self.vendor_status_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn record_order_transition(&self, from: &str, to: &str) {
        self.order_status_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn record_rejection(&self, command: &str, reason: &str) {
        self.commands_rejected.with_label_values(&[command, reason]).inc();
    }

    pub fn observe_command(&self, command: &str, duration_secs: f64) {
        self.command_duration.with_label_values(&[command]).observe(duration_secs);
    }

    pub fn record_payment_notification(&self, kind: &str, outcome: &str) {
        self.payment_notifications.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.inc();
    }

    /// Helper to record retry attempt
    pub fn record_retry_attempt(&self, operation: &str) {
        self.retry_attempts_total.with_label_values(&[operation]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> Vec<f64> {
        metrics
            .registry()
            .gather()
            .iter()
            .find(|family| family.name() == name)
            .map(|family| family.metric.iter().filter_map(|m| m.counter.value).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_order_created();
        assert!(!metrics.registry.gather().is_empty());
        assert_eq!(counter_value(&metrics, "orders_created_total"), vec![1.0]);
    }

    #[test]
    fn test_transitions_are_labelled_by_status_pair() {
        let metrics = Metrics::new().unwrap();
        metrics.record_vendor_transition("pending", "ready");
        metrics.record_vendor_transition("pending", "ready");
        metrics.record_vendor_transition("ready", "picked_up");

        let mut values = counter_value(&metrics, "vendor_status_transitions_total");
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_rejections_and_lock_timeouts() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejection("mark_vendor_status", "not_implicated");
        metrics.record_lock_timeout();
        metrics.record_lock_timeout();

        assert_eq!(counter_value(&metrics, "commands_rejected_total"), vec![1.0]);
        assert_eq!(counter_value(&metrics, "lock_timeouts_total"), vec![2.0]);
    }
}
