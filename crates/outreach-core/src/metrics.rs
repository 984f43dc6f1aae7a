//! Prometheus counters for the delivery core

use outreach_common::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Core metrics, registered on a registry owned by this struct
pub struct CoreMetrics {
    registry: Registry,
    events: IntCounterVec,
    transitions: IntCounterVec,
    scheduler: IntCounterVec,
    dispatcher_actions: IntCounterVec,
    dispatcher_errors: IntCounter,
}

impl CoreMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("outreach".to_string()), None)
            .map_err(metrics_err)?;

        let events = IntCounterVec::new(
            Opts::new("events_total", "Inbound events by processing outcome"),
            &["outcome"],
        )
        .map_err(metrics_err)?;
        let transitions = IntCounterVec::new(
            Opts::new("transitions_total", "Message state transitions by resulting state"),
            &["state"],
        )
        .map_err(metrics_err)?;
        let scheduler = IntCounterVec::new(
            Opts::new("scheduler_items_total", "Queue items by scheduler outcome"),
            &["outcome"],
        )
        .map_err(metrics_err)?;
        let dispatcher_actions = IntCounterVec::new(
            Opts::new("dispatcher_actions_total", "Automation actions taken"),
            &["action"],
        )
        .map_err(metrics_err)?;
        let dispatcher_errors = IntCounter::new(
            "dispatcher_errors_total",
            "Automation actions that failed",
        )
        .map_err(metrics_err)?;

        registry.register(Box::new(events.clone())).map_err(metrics_err)?;
        registry.register(Box::new(transitions.clone())).map_err(metrics_err)?;
        registry.register(Box::new(scheduler.clone())).map_err(metrics_err)?;
        registry
            .register(Box::new(dispatcher_actions.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(dispatcher_errors.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            events,
            transitions,
            scheduler,
            dispatcher_actions,
            dispatcher_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Outcome is one of `accepted`, `duplicate`, `unresolved`, `malformed`
    pub fn event(&self, outcome: &str) {
        self.events.with_label_values(&[outcome]).inc();
    }

    pub fn transition(&self, state: &str) {
        self.transitions.with_label_values(&[state]).inc();
    }

    pub fn scheduler(&self, outcome: &str) {
        self.scheduler.with_label_values(&[outcome]).inc();
    }

    pub fn dispatcher_action(&self, action: &str) {
        self.dispatcher_actions.with_label_values(&[action]).inc();
    }

    pub fn dispatcher_error(&self) {
        self.dispatcher_errors.inc();
    }

    pub fn event_count(&self, outcome: &str) -> u64 {
        self.events.with_label_values(&[outcome]).get()
    }

    pub fn scheduler_count(&self, outcome: &str) -> u64 {
        self.scheduler.with_label_values(&[outcome]).get()
    }

    pub fn dispatcher_error_count(&self) -> u64 {
        self.dispatcher_errors.get()
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = CoreMetrics::new().unwrap();
        metrics.event("accepted");
        metrics.event("accepted");
        metrics.scheduler("deferred");

        assert_eq!(metrics.event_count("accepted"), 2);
        let text = metrics.render().unwrap();
        assert!(text.contains("outreach_events_total{outcome=\"accepted\"} 2"));
        assert!(text.contains("outreach_scheduler_items_total{outcome=\"deferred\"} 1"));
    }

    #[test]
    fn test_instances_do_not_share_state() {
        let a = CoreMetrics::new().unwrap();
        let b = CoreMetrics::new().unwrap();
        a.dispatcher_error();
        assert_eq!(a.dispatcher_error_count(), 1);
        assert_eq!(b.dispatcher_error_count(), 0);
    }
}
