use serde::Serialize;

use crate::analyzer::error_tree::ErrorTreeNode;
use crate::analyzer::tree::{ClientCall, TraceTreeNode};
use crate::model::Trace;

/// Shared label block of slow and error reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportLabels {
    pub entry_service: String,
    pub entry_instance: String,
    pub mutated_service: String,
    pub mutated_url: String,
    pub mutated_instance: String,
    pub mutated_span: String,
    pub mutated_pod: String,
    pub mutated_pod_ns: String,
    pub mutated_workload_name: String,
    pub mutated_workload_type: String,
    pub content_key: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ThresholdInfo {
    pub threshold_type: String,
    pub threshold_range: String,
    pub threshold_value: f64,
    pub threshold_multiple: f64,
}

/// A slow report row ready for the columnar writer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeReport {
    pub timestamp: u64,
    pub trace_id: String,
    pub is_drop: bool,
    pub duration: u64,
    pub end_time: u64,
    pub drop_reason: String,
    pub cause: String,
    pub labels: ReportLabels,
    pub threshold: ThresholdInfo,
    pub relation_tree: Option<TraceTreeNode>,
    pub otel_client_calls: Vec<ClientCall>,
}

impl NodeReport {
    pub fn new(timestamp: u64, trace_id: &str, duration: u64) -> NodeReport {
        NodeReport {
            timestamp,
            trace_id: trace_id.to_string(),
            duration,
            ..Default::default()
        }
    }

    /// Drop rows are first-class: downstream tooling renders them alongside
    /// successful reports.
    pub fn drop_report(trace: &Trace, reason: &str) -> NodeReport {
        let labels = &trace.labels;
        NodeReport {
            timestamp: labels.start_time,
            trace_id: labels.trace_id.clone(),
            is_drop: true,
            duration: labels.duration,
            end_time: labels.end_time,
            drop_reason: reason.to_string(),
            labels: ReportLabels {
                entry_service: labels.service_name.clone(),
                entry_instance: trace.instance_id(),
                content_key: labels.url.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// An error report row ready for the columnar writer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorReport {
    pub timestamp: u64,
    pub trace_id: String,
    pub is_drop: bool,
    pub duration: u64,
    pub end_time: u64,
    pub drop_reason: String,
    pub cause: String,
    pub cause_message: String,
    pub labels: ReportLabels,
    pub threshold: ThresholdInfo,
    pub relation_tree: Option<ErrorTreeNode>,
}

impl ErrorReport {
    pub fn new(timestamp: u64, trace_id: &str, duration: u64) -> ErrorReport {
        ErrorReport {
            timestamp,
            trace_id: trace_id.to_string(),
            duration,
            ..Default::default()
        }
    }

    pub fn drop_report(trace: &Trace, reason: &str) -> ErrorReport {
        let labels = &trace.labels;
        ErrorReport {
            timestamp: labels.start_time,
            trace_id: labels.trace_id.clone(),
            is_drop: true,
            duration: labels.duration,
            end_time: labels.end_time,
            drop_reason: reason.to_string(),
            labels: ReportLabels {
                entry_service: labels.service_name.clone(),
                entry_instance: trace.instance_id(),
                content_key: labels.url.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Per-minute roll-up of the profile signal counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportCountMetric {
    pub timestamp: i64,
    pub entry_service: String,
    pub entry_url: String,
    pub mutated_service: String,
    pub mutated_url: String,
    pub total: u64,
    pub success: u64,
}
