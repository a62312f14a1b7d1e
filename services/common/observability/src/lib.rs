use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters describing how the three order writers (checkout, webhook, cancellation)
/// converge on a single order state.
#[derive(Clone)]
pub struct ReconciliationMetrics {
    pub registry: Registry,
    pub checkout_total: IntCounterVec,
    pub webhook_events_total: IntCounterVec,
    pub refund_attempts_total: IntCounterVec,
    pub cancellations_total: IntCounterVec,
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("static metric definition is valid")
}

impl ReconciliationMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let checkout_total = counter_vec(
            "storefront_checkout_total",
            "Checkout calls by outcome (created, replayed, race_lost)",
            &["outcome"],
        );
        let webhook_events_total = counter_vec(
            "storefront_webhook_events_total",
            "Verified gateway webhook events by type and outcome",
            &["event", "outcome"],
        );
        let refund_attempts_total = counter_vec(
            "storefront_refund_attempts_total",
            "Gateway refund submissions by strategy and result",
            &["strategy", "result"],
        );
        let cancellations_total = counter_vec(
            "storefront_cancellations_total",
            "Completed cancellations by refund outcome",
            &["refund"],
        );
        let _ = registry.register(Box::new(checkout_total.clone()));
        let _ = registry.register(Box::new(webhook_events_total.clone()));
        let _ = registry.register(Box::new(refund_attempts_total.clone()));
        let _ = registry.register(Box::new(cancellations_total.clone()));
        ReconciliationMetrics { registry, checkout_total, webhook_events_total, refund_attempts_total, cancellations_total }
    }

    pub fn checkout(&self, outcome: &str) {
        self.checkout_total.with_label_values(&[outcome]).inc();
    }

    pub fn webhook_event(&self, event: &str, outcome: &str) {
        self.webhook_events_total.with_label_values(&[event, outcome]).inc();
    }

    pub fn refund_attempt(&self, strategy: &str, ok: bool) {
        let result = if ok { "ok" } else { "rejected" };
        self.refund_attempts_total.with_label_values(&[strategy, result]).inc();
    }

    pub fn cancellation(&self, refund: &str) {
        self.cancellations_total.with_label_values(&[refund]).inc();
    }

    /// Render this registry plus any extra registries in the text exposition format.
    pub fn render(&self, extra: &[&Registry]) -> Result<String, prometheus::Error> {
        let mut families = self.registry.gather();
        for registry in extra {
            families.extend(registry.gather());
        }
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Default for ReconciliationMetrics {
    fn default() -> Self { Self::new() }
}
