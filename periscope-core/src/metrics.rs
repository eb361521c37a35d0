use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static::lazy_static! {
    static ref RECEIVED_MESSAGE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "periscope_receiver_received_message_total",
            "The total number of data groups received from agents"
        ),
        &["type"]
    )
    .unwrap();

    static ref REPORT_TASK_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "periscope_receiver_report_task_total",
            "Report tasks by kind and outcome"
        ),
        &["kind", "outcome"]
    )
    .unwrap();

    static ref CLIENT_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "periscope_client_call_duration_seconds",
            "Latency of client-side external calls extracted from topologies"
        ),
        &["group", "type"]
    )
    .unwrap();
}

pub struct ReceiverMetrics {
    registry: Registry,
}

impl ReceiverMetrics {
    pub fn new() -> ReceiverMetrics {
        let registry = Registry::new();
        registry
            .register(Box::new(RECEIVED_MESSAGE_TOTAL.clone()))
            .unwrap();
        registry
            .register(Box::new(REPORT_TASK_TOTAL.clone()))
            .unwrap();
        registry
            .register(Box::new(CLIENT_CALL_DURATION.clone()))
            .unwrap();
        ReceiverMetrics { registry }
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ReceiverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn inc_received_message(group: &str) {
    RECEIVED_MESSAGE_TOTAL.with_label_values(&[group]).inc();
}

pub fn inc_report_task(kind: &str, outcome: &str) {
    REPORT_TASK_TOTAL.with_label_values(&[kind, outcome]).inc();
}

pub fn observe_client_call(group: &str, client_type: &str, duration_nanos: u64) {
    CLIENT_CALL_DURATION
        .with_label_values(&[group, client_type])
        .observe(duration_nanos as f64 / 1e9);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = ReceiverMetrics::new();
        inc_received_message("span_trace_group");
        inc_report_task("Slow", "success");
        observe_client_call("db", "mysql", 1_000_000);
        let rendered = metrics.render();
        assert!(rendered.contains("periscope_receiver_received_message_total"));
        assert!(rendered.contains("periscope_receiver_report_task_total"));
    }
}
