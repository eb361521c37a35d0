use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Data group names accepted by the ingest RPC.
pub const GROUP_FLAME_GRAPH: &str = "flame_graph";
pub const GROUP_JVM_GC: &str = "jvm_gc";
pub const GROUP_ONOFF_METRIC: &str = "onoff_metric_group";
pub const GROUP_SPAN_TRACE: &str = "span_trace_group";
pub const GROUP_CAMERA_EVENT: &str = "camera_event_group";
pub const GROUP_PROFILING_SIGNAL: &str = "designated_profiling_signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Slow,
    Error,
    Normal,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Slow => write!(f, "Slow"),
            ReportKind::Error => write!(f, "Error"),
            ReportKind::Normal => write!(f, "Normal"),
        }
    }
}

/// Labels captured by the agent for a single span observation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceLabels {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub tid: u32,
    #[serde(default)]
    pub top_span: bool,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub http_url: String,
    #[serde(default)]
    pub is_silent: bool,
    #[serde(default)]
    pub is_sampled: bool,
    #[serde(default)]
    pub is_slow: bool,
    #[serde(default)]
    pub is_server: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_profiled: bool,
    /// A resent span after the agent changed its sampling decision; such
    /// aggregates never build relationships again.
    #[serde(default)]
    pub is_changed_sample: bool,
    #[serde(default)]
    pub report_type: u32,
    #[serde(default)]
    pub threshold_type: String,
    #[serde(default)]
    pub threshold_range: String,
    #[serde(default)]
    pub threshold_value: f64,
    #[serde(default = "default_threshold_multiple")]
    pub threshold_multiple: f64,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub apm_type: String,
    #[serde(default)]
    pub apm_span_id: String,
    #[serde(default)]
    pub attributes: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub start_time: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub end_time: u64,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub node_ip: String,
    #[serde(default)]
    pub offset_ts: i64,
}

fn default_threshold_multiple() -> f64 {
    1.0
}

/// One buffered span observation plus the metadata attached on ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub labels: TraceLabels,
    #[serde(default)]
    pub workload_name: String,
    #[serde(default)]
    pub workload_kind: String,
    #[serde(default)]
    pub pod_ip: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub namespace: String,
    /// Comma-separated 8-slot on/off CPU vector, empty until a metric group
    /// is merged.
    #[serde(default)]
    pub onoff_metrics: String,
    #[serde(default)]
    pub base_onoff_metrics: String,
    #[serde(default)]
    pub base_range: String,
    #[serde(default)]
    pub mutated_type: String,
    /// Set once the span row has been handed to the columnar writer. Shared
    /// across clones of the same observation so concurrent report tasks for
    /// one trace id never double-write the span row.
    #[serde(skip)]
    pub sent: Arc<AtomicBool>,
}

impl Trace {
    pub fn from_json(json: &str) -> Result<Trace, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn instance_id(&self) -> String {
        format!(
            "{}@{}@{}",
            self.labels.service_name, self.labels.node_ip, self.labels.pid
        )
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Relaxed)
    }

    /// True exactly once per observation.
    pub fn mark_sent(&self) -> bool {
        !self.sent.swap(true, Ordering::Relaxed)
    }
}

/// 8-slot on/off CPU metric group reported per (trace, span).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnOffMetricGroup {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub tid: u32,
    /// Comma-separated values in cpu, file, net, futex, idle, other, epoll,
    /// runq order.
    #[serde(default)]
    pub metrics: String,
}

impl OnOffMetricGroup {
    pub fn from_json(json: &str) -> Result<OnOffMetricGroup, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Signal telling an agent to profile a thread for a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSignal {
    pub pid: u32,
    pub tid: u32,
    pub start_time: u64,
    pub end_time: u64,
}

/// Memory-pressure sample pushed by an agent.
#[derive(Debug, Clone, Default)]
pub struct SampleMetric {
    pub node_ip: String,
    pub query_time: i64,
    pub memory: u64,
    pub memory_limit: u64,
    pub cache_second: i64,
}

/// All buffered observations sharing one trace id.
#[derive(Debug, Clone, Default)]
pub struct Traces {
    pub trace_id: String,
    pub traces: Vec<Trace>,
    root_index: Option<usize>,
    pub has_slow: bool,
    pub has_error: bool,
    pub metric_count: usize,
}

impl Traces {
    pub fn new(trace_id: impl Into<String>) -> Traces {
        Traces {
            trace_id: trace_id.into(),
            ..Default::default()
        }
    }

    pub fn add_trace(&mut self, trace: Trace) {
        if trace.labels.top_span && self.root_index.is_none() {
            self.root_index = Some(self.traces.len());
        }
        if trace.labels.is_slow {
            self.has_slow = true;
        }
        if trace.labels.is_error {
            self.has_error = true;
        }
        self.traces.push(trace);
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn root_trace(&self) -> Option<&Trace> {
        self.root_index.map(|i| &self.traces[i])
    }

    /// The span used to query the APM upstream: the root when present,
    /// otherwise the first buffered span.
    pub fn query_trace(&self) -> Option<&Trace> {
        self.root_trace().or_else(|| self.traces.first())
    }

    pub fn find_trace(&self, apm_span_id: &str) -> Option<&Trace> {
        self.traces
            .iter()
            .find(|t| t.labels.apm_span_id == apm_span_id)
    }

    pub fn find_trace_mut(&mut self, apm_span_id: &str) -> Option<&mut Trace> {
        self.traces
            .iter_mut()
            .find(|t| t.labels.apm_span_id == apm_span_id)
    }

    /// Single-service request with no downstream calls: nothing to relate.
    pub fn has_single_trace(&self) -> bool {
        self.traces.len() == 1 && self.root_index.is_some()
    }

    pub fn has_changed_sample(&self) -> bool {
        self.traces.iter().any(|t| t.labels.is_changed_sample)
    }

    pub fn unsent_count(&self) -> usize {
        self.traces.iter().filter(|t| !t.is_sent()).count()
    }

    pub fn span_id_map(&self) -> HashMap<&str, &Trace> {
        self.traces
            .iter()
            .map(|t| (t.labels.apm_span_id.as_str(), t))
            .collect()
    }
}
