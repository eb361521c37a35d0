use clickhouse::Row;
use serde::{Deserialize, Serialize};

use crate::analyzer::error_tree::ErrorPropagation;
use crate::analyzer::relation::Relation;
use crate::analyzer::report::{ErrorReport, NodeReport, ReportCountMetric};
use crate::config::ClickHouseConfig;
use crate::model::{Trace, TraceLabels};

pub const TABLE_SPAN_TRACE: &str = "span_trace";
pub const TABLE_SLOW_REPORT: &str = "slow_report";
pub const TABLE_ERROR_REPORT: &str = "error_report";
pub const TABLE_ERROR_PROPAGATION: &str = "error_propagation";
pub const TABLE_SERVICE_RELATIONSHIP: &str = "service_relationship";
pub const TABLE_SERVICE_CLIENT: &str = "service_client";
pub const TABLE_ONOFF_METRIC: &str = "onoff_metric";
pub const TABLE_PROFILING_EVENT: &str = "profiling_event";
pub const TABLE_FLAME_GRAPH: &str = "flame_graph";
pub const TABLE_JVM_GC: &str = "jvm_gc";
pub const TABLE_REPORT_METRIC: &str = "report_metric";

const CPU_TYPES: [&str; 8] = [
    "cpu", "file", "net", "futex", "idle", "other", "epoll", "runq",
];

#[derive(Debug, Clone, Default, Row, Serialize, Deserialize)]
pub struct SpanTraceRow {
    pub timestamp: u64,
    pub data_version: String,
    pub pid: u32,
    pub tid: u32,
    pub report_type: u32,
    pub threshold_type: String,
    pub threshold_range: String,
    pub threshold_value: f64,
    pub threshold_multiple: f64,
    pub trace_id: String,
    pub apm_span_id: String,
    pub flags: String,
    pub labels: String,
    pub metrics: String,
    pub start_time: u64,
    pub duration: u64,
    pub end_time: u64,
    pub offset_ts: i64,
}

impl SpanTraceRow {
    pub fn from_trace(trace: &Trace) -> SpanTraceRow {
        let labels = &trace.labels;
        let flags = serde_json::json!({
            "top_span": labels.top_span,
            "is_silent": labels.is_silent,
            "is_sampled": labels.is_sampled,
            "is_slow": labels.is_slow,
            "is_server": labels.is_server,
            "is_error": labels.is_error,
            "is_profiled": labels.is_profiled,
        });
        let label_map = serde_json::json!({
            "instance_id": trace.instance_id(),
            "protocol": labels.protocol,
            "service_name": labels.service_name,
            "content_key": labels.url,
            "http_url": labels.http_url,
            "apm_type": labels.apm_type,
            "attributes": labels.attributes,
            "container_id": labels.container_id,
            "container_name": labels.container_name,
            "workload_name": trace.workload_name,
            "workload_kind": trace.workload_kind,
            "pod_ip": trace.pod_ip,
            "pod_name": trace.pod_name,
            "namespace": trace.namespace,
            "node_name": labels.node_name,
            "node_ip": labels.node_ip,
            "onoff_metrics": trace.onoff_metrics,
            "base_onoff_metrics": trace.base_onoff_metrics,
            "base_range": trace.base_range,
            "data_source": trace.source,
            "mutated_type": trace.mutated_type,
        });
        SpanTraceRow {
            timestamp: trace.timestamp,
            data_version: trace.version.clone(),
            pid: labels.pid,
            tid: labels.tid,
            report_type: labels.report_type,
            threshold_type: labels.threshold_type.clone(),
            threshold_range: labels.threshold_range.clone(),
            threshold_value: labels.threshold_value,
            threshold_multiple: labels.threshold_multiple,
            trace_id: labels.trace_id.clone(),
            apm_span_id: labels.apm_span_id.clone(),
            flags: flags.to_string(),
            labels: label_map.to_string(),
            metrics: serde_json::to_string(&calc_mutated_values(
                &trace.onoff_metrics,
                &trace.base_onoff_metrics,
            ))
            .unwrap_or_default(),
            start_time: labels.start_time,
            duration: labels.duration,
            end_time: labels.end_time,
            offset_ts: labels.offset_ts,
        }
    }

    /// Rebuilds the in-memory trace from a stored row; used by the realtime
    /// report endpoints.
    pub fn into_trace(self) -> Trace {
        let flags: serde_json::Value =
            serde_json::from_str(&self.flags).unwrap_or(serde_json::Value::Null);
        let labels: serde_json::Value =
            serde_json::from_str(&self.labels).unwrap_or(serde_json::Value::Null);
        let flag = |key: &str| flags.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        let label =
            |key: &str| labels.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();
        Trace {
            timestamp: self.timestamp,
            version: self.data_version.clone(),
            source: label("data_source"),
            labels: TraceLabels {
                pid: self.pid,
                tid: self.tid,
                top_span: flag("top_span"),
                protocol: label("protocol"),
                service_name: label("service_name"),
                url: label("content_key"),
                http_url: label("http_url"),
                is_silent: flag("is_silent"),
                is_sampled: flag("is_sampled"),
                is_slow: flag("is_slow"),
                is_server: flag("is_server"),
                is_error: flag("is_error"),
                is_profiled: flag("is_profiled"),
                is_changed_sample: false,
                report_type: self.report_type,
                threshold_type: self.threshold_type,
                threshold_range: self.threshold_range,
                threshold_value: self.threshold_value,
                threshold_multiple: self.threshold_multiple,
                trace_id: self.trace_id,
                apm_type: label("apm_type"),
                apm_span_id: self.apm_span_id,
                attributes: label("attributes"),
                container_id: label("container_id"),
                container_name: label("container_name"),
                start_time: self.start_time,
                duration: self.duration,
                end_time: self.end_time,
                node_name: label("node_name"),
                node_ip: label("node_ip"),
                offset_ts: self.offset_ts,
            },
            workload_name: label("workload_name"),
            workload_kind: label("workload_kind"),
            pod_ip: label("pod_ip"),
            pod_name: label("pod_name"),
            namespace: label("namespace"),
            onoff_metrics: label("onoff_metrics"),
            base_onoff_metrics: label("base_onoff_metrics"),
            base_range: label("base_range"),
            mutated_type: label("mutated_type"),
            sent: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }
}

/// Per-slot positive difference between the measured on/off vector and its
/// baseline. The runq slot flags only, its diff is not meaningful.
pub fn calc_mutated_values(
    onoff_metrics: &str,
    base_onoff_metrics: &str,
) -> std::collections::BTreeMap<String, u64> {
    let mut values = std::collections::BTreeMap::new();
    if onoff_metrics.is_empty() {
        return values;
    }
    let metrics: Vec<u64> = onoff_metrics
        .split(',')
        .map(|v| v.trim().parse().unwrap_or(0))
        .collect();
    let base: Vec<u64> = if base_onoff_metrics.is_empty() {
        vec![0; metrics.len()]
    } else {
        base_onoff_metrics
            .split(',')
            .map(|v| v.trim().parse().unwrap_or(0))
            .collect()
    };
    for (i, cpu_type) in CPU_TYPES.iter().enumerate() {
        let metric = metrics.get(i).copied().unwrap_or(0);
        let base_value = base.get(i).copied().unwrap_or(0);
        values.insert((*cpu_type).to_string(), metric.saturating_sub(base_value));
    }
    values
}

#[derive(Debug, Clone, Default, Row, Serialize, Deserialize)]
pub struct SlowReportRow {
    pub timestamp: u64,
    pub is_drop: bool,
    pub trace_id: String,
    pub duration: u64,
    pub end_time: u64,
    pub drop_reason: String,
    pub cause: String,
    pub relation_tree: String,
    pub otel_client_calls: String,
    pub labels: String,
    pub threshold_type: String,
    pub threshold_range: String,
    pub threshold_value: f64,
    pub threshold_multiple: f64,
}

impl SlowReportRow {
    pub fn from_report(report: &NodeReport) -> SlowReportRow {
        SlowReportRow {
            timestamp: report.timestamp,
            is_drop: report.is_drop,
            trace_id: report.trace_id.clone(),
            duration: report.duration,
            end_time: report.end_time,
            drop_reason: report.drop_reason.clone(),
            cause: report.cause.clone(),
            relation_tree: report
                .relation_tree
                .as_ref()
                .and_then(|tree| serde_json::to_string(tree).ok())
                .unwrap_or_default(),
            otel_client_calls: if report.otel_client_calls.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&report.otel_client_calls).unwrap_or_default()
            },
            labels: serde_json::to_string(&report.labels).unwrap_or_default(),
            threshold_type: report.threshold.threshold_type.clone(),
            threshold_range: report.threshold.threshold_range.clone(),
            threshold_value: report.threshold.threshold_value,
            threshold_multiple: report.threshold.threshold_multiple,
        }
    }
}

#[derive(Debug, Clone, Default, Row, Serialize, Deserialize)]
pub struct ErrorReportRow {
    pub timestamp: u64,
    pub is_drop: bool,
    pub trace_id: String,
    pub duration: u64,
    pub end_time: u64,
    pub drop_reason: String,
    pub cause: String,
    pub cause_message: String,
    pub relation_tree: String,
    pub labels: String,
    pub threshold_type: String,
    pub threshold_range: String,
    pub threshold_value: f64,
    pub threshold_multiple: f64,
}

impl ErrorReportRow {
    pub fn from_report(report: &ErrorReport) -> ErrorReportRow {
        ErrorReportRow {
            timestamp: report.timestamp,
            is_drop: report.is_drop,
            trace_id: report.trace_id.clone(),
            duration: report.duration,
            end_time: report.end_time,
            drop_reason: report.drop_reason.clone(),
            cause: report.cause.clone(),
            cause_message: report.cause_message.clone(),
            relation_tree: report
                .relation_tree
                .as_ref()
                .and_then(|tree| serde_json::to_string(tree).ok())
                .unwrap_or_default(),
            labels: serde_json::to_string(&report.labels).unwrap_or_default(),
            threshold_type: report.threshold.threshold_type.clone(),
            threshold_range: report.threshold.threshold_range.clone(),
            threshold_value: report.threshold.threshold_value,
            threshold_multiple: report.threshold.threshold_multiple,
        }
    }
}

#[derive(Debug, Clone, Default, Row, Serialize, Deserialize)]
pub struct ErrorPropagationRow {
    pub timestamp: u64,
    pub trace_id: String,
    pub entry_service: String,
    pub entry_url: String,
    pub services: Vec<String>,
    pub instances: Vec<String>,
    pub urls: Vec<String>,
    pub is_errors: Vec<bool>,
    pub is_traceds: Vec<bool>,
    pub error_types: Vec<Vec<String>>,
    pub error_messages: Vec<Vec<String>>,
    pub depths: Vec<u32>,
    pub paths: Vec<String>,
}

impl ErrorPropagationRow {
    pub fn from_report(report: &ErrorReport) -> Option<ErrorPropagationRow> {
        let tree = report.relation_tree.as_ref()?;
        let propagation = ErrorPropagation::from_tree(tree);
        Some(ErrorPropagationRow {
            timestamp: report.timestamp,
            trace_id: report.trace_id.clone(),
            entry_service: report.labels.entry_service.clone(),
            entry_url: report.labels.content_key.clone(),
            services: propagation.services,
            instances: propagation.instances,
            urls: propagation.urls,
            is_errors: propagation.is_errors,
            is_traceds: propagation.is_traceds,
            error_types: propagation.error_types,
            error_messages: propagation.error_messages,
            depths: propagation.depths,
            paths: propagation.paths,
        })
    }
}

#[derive(Debug, Clone, Default, Row, Serialize, Deserialize)]
pub struct ServiceRelationshipRow {
    pub timestamp: u64,
    pub entry_service: String,
    pub entry_url: String,
    pub miss_top: bool,
    pub trace_id: String,
    pub parent_service: String,
    pub parent_url: String,
    pub service: String,
    pub url: String,
    pub path: String,
    pub labels: String,
    pub flags: String,
}

#[derive(Debug, Clone, Default, Row, Serialize, Deserialize)]
pub struct ServiceClientRow {
    pub timestamp: u64,
    pub trace_id: String,
    pub service: String,
    pub url: String,
    pub client_group: String,
    pub client_type: String,
    pub client_peer: String,
    pub client_key: String,
    pub is_error: bool,
    pub duration: u64,
}

pub fn relation_rows(relation: &Relation) -> Vec<ServiceRelationshipRow> {
    relation
        .relationships
        .iter()
        .map(|relationship| {
            let labels = serde_json::json!({
                "client_group": relationship.client_group,
                "client_type": relationship.client_type,
                "client_peer": relationship.client_peer,
                "client_key": relationship.client_key,
            });
            let flags = serde_json::json!({
                "parent_traced": relationship.parent_traced,
                "is_async": relationship.is_async,
                "is_traced": relationship.is_traced,
            });
            ServiceRelationshipRow {
                timestamp: relation.start_time,
                entry_service: relation.entry_service.clone(),
                entry_url: relation.entry_url.clone(),
                miss_top: relation.miss_top,
                trace_id: relation.trace_id.clone(),
                parent_service: relationship.parent_service.clone(),
                parent_url: relationship.parent_url.clone(),
                service: relationship.service.clone(),
                url: relationship.url.clone(),
                path: relationship.path.clone(),
                labels: labels.to_string(),
                flags: flags.to_string(),
            }
        })
        .collect()
}

pub fn service_client_rows(relation: &Relation) -> Vec<ServiceClientRow> {
    relation
        .client_rows
        .iter()
        .map(|row| ServiceClientRow {
            timestamp: row.start_time,
            trace_id: relation.trace_id.clone(),
            service: row.service.clone(),
            url: row.url.clone(),
            client_group: row.client_group.clone(),
            client_type: row.client_type.clone(),
            client_peer: row.client_peer.clone(),
            client_key: row.client_key.clone(),
            is_error: row.error,
            duration: row.duration,
        })
        .collect()
}

/// Raw passthrough rows (profiling events, flame graphs, GC records, on/off
/// metric groups) keep their agent JSON untouched.
#[derive(Debug, Clone, Default, Row, Serialize, Deserialize)]
pub struct PassthroughRow {
    pub timestamp: u64,
    pub data: String,
}

#[derive(Debug, Clone, Default, Row, Serialize, Deserialize)]
pub struct ReportMetricRow {
    pub timestamp: i64,
    pub entry_service: String,
    pub entry_url: String,
    pub mutated_service: String,
    pub mutated_url: String,
    pub total: u64,
    pub success: u64,
}

impl ReportMetricRow {
    pub fn from_metric(metric: &ReportCountMetric) -> ReportMetricRow {
        ReportMetricRow {
            timestamp: metric.timestamp,
            entry_service: metric.entry_service.clone(),
            entry_url: metric.entry_url.clone(),
            mutated_service: metric.mutated_service.clone(),
            mutated_url: metric.mutated_url.clone(),
            total: metric.total,
            success: metric.success,
        }
    }
}

const PASSTHROUGH_COLUMNS: &str = "timestamp UInt64, data String";

fn table_columns(table: &str) -> &'static str {
    match table {
        TABLE_SPAN_TRACE => {
            "timestamp UInt64, data_version String, pid UInt32, tid UInt32, \
             report_type UInt32, threshold_type String, threshold_range String, \
             threshold_value Float64, threshold_multiple Float64, trace_id String, \
             apm_span_id String, flags String, labels String, metrics String, \
             start_time UInt64, duration UInt64, end_time UInt64, offset_ts Int64"
        }
        TABLE_SLOW_REPORT => {
            "timestamp UInt64, is_drop Bool, trace_id String, duration UInt64, \
             end_time UInt64, drop_reason String, cause String, relation_tree String, \
             otel_client_calls String, labels String, threshold_type String, \
             threshold_range String, threshold_value Float64, threshold_multiple Float64"
        }
        TABLE_ERROR_REPORT => {
            "timestamp UInt64, is_drop Bool, trace_id String, duration UInt64, \
             end_time UInt64, drop_reason String, cause String, cause_message String, \
             relation_tree String, labels String, threshold_type String, \
             threshold_range String, threshold_value Float64, threshold_multiple Float64"
        }
        TABLE_ERROR_PROPAGATION => {
            "timestamp UInt64, trace_id String, entry_service String, entry_url String, \
             services Array(String), instances Array(String), urls Array(String), \
             is_errors Array(Bool), is_traceds Array(Bool), \
             error_types Array(Array(String)), error_messages Array(Array(String)), \
             depths Array(UInt32), paths Array(String)"
        }
        TABLE_SERVICE_RELATIONSHIP => {
            "timestamp UInt64, entry_service String, entry_url String, miss_top Bool, \
             trace_id String, parent_service String, parent_url String, service String, \
             url String, path String, labels String, flags String"
        }
        TABLE_SERVICE_CLIENT => {
            "timestamp UInt64, trace_id String, service String, url String, \
             client_group String, client_type String, client_peer String, \
             client_key String, is_error Bool, duration UInt64"
        }
        TABLE_REPORT_METRIC => {
            "timestamp Int64, entry_service String, entry_url String, \
             mutated_service String, mutated_url String, total UInt64, success UInt64"
        }
        _ => PASSTHROUGH_COLUMNS,
    }
}

fn table_order_by(table: &str) -> &'static str {
    match table {
        TABLE_SPAN_TRACE => "(trace_id, timestamp)",
        TABLE_SLOW_REPORT | TABLE_ERROR_REPORT | TABLE_ERROR_PROPAGATION => {
            "(trace_id, timestamp)"
        }
        TABLE_SERVICE_RELATIONSHIP => "(entry_service, entry_url, timestamp)",
        TABLE_SERVICE_CLIENT => "(service, url, timestamp)",
        _ => "(timestamp)",
    }
}

pub const ALL_TABLES: [&str; 11] = [
    TABLE_SPAN_TRACE,
    TABLE_SLOW_REPORT,
    TABLE_ERROR_REPORT,
    TABLE_ERROR_PROPAGATION,
    TABLE_SERVICE_RELATIONSHIP,
    TABLE_SERVICE_CLIENT,
    TABLE_ONOFF_METRIC,
    TABLE_PROFILING_EVENT,
    TABLE_FLAME_GRAPH,
    TABLE_JVM_GC,
    TABLE_REPORT_METRIC,
];

/// CREATE TABLE statement honoring cluster, replication, per-table TTL and
/// sort-key overrides from the configuration.
pub fn build_create_sql(table: &str, cfg: &ClickHouseConfig) -> String {
    let cluster = if cfg.cluster.is_empty() {
        String::new()
    } else {
        format!(" ON CLUSTER {}", cfg.cluster)
    };
    let engine = if cfg.replication {
        format!(
            "ReplicatedMergeTree('/clickhouse/tables/{{shard}}/{}/{table}', '{{replica}}')",
            cfg.database
        )
    } else {
        "MergeTree()".to_string()
    };
    let order_by = cfg
        .hash_config
        .iter()
        .find(|hash| hash.tables.iter().any(|t| t == table))
        .map(|hash| hash.hash.clone())
        .unwrap_or_else(|| table_order_by(table).to_string());
    let ttl_days = cfg
        .ttl_config
        .iter()
        .find(|ttl| ttl.tables.iter().any(|t| t == table))
        .map(|ttl| ttl.ttl)
        .unwrap_or(cfg.ttl_days);
    let ttl = if ttl_days > 0 {
        format!(
            " TTL toDateTime(timestamp / 1000000000) + toIntervalDay({ttl_days})"
        )
    } else {
        String::new()
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{table}{cluster} ({}) ENGINE = {engine} ORDER BY {order_by}{ttl}",
        cfg.database,
        table_columns(table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_mutated_values() {
        let values = calc_mutated_values("100,50,30,0,0,0,10,5", "40,60,10,0,0,0,0,0");
        assert_eq!(values["cpu"], 60);
        assert_eq!(values["file"], 0);
        assert_eq!(values["net"], 20);
        assert_eq!(values["epoll"], 10);
        assert_eq!(values["runq"], 5);
        assert!(calc_mutated_values("", "").is_empty());
    }

    #[test]
    fn test_span_trace_row_round_trip() {
        let mut trace = Trace::default();
        trace.timestamp = 1;
        trace.labels.trace_id = "t1".to_string();
        trace.labels.apm_span_id = "s1".to_string();
        trace.labels.service_name = "api".to_string();
        trace.labels.url = "GET /a".to_string();
        trace.labels.top_span = true;
        trace.labels.is_sampled = true;
        trace.labels.node_ip = "10.0.0.1".to_string();
        trace.labels.start_time = 100;
        trace.labels.duration = 50;
        trace.pod_name = "pod-1".to_string();

        let row = SpanTraceRow::from_trace(&trace);
        assert_eq!(row.trace_id, "t1");
        let restored = row.into_trace();
        assert_eq!(restored.labels.service_name, "api");
        assert_eq!(restored.labels.url, "GET /a");
        assert!(restored.labels.top_span);
        assert!(restored.labels.is_sampled);
        assert_eq!(restored.pod_name, "pod-1");
        assert_eq!(restored.labels.duration, 50);
    }

    #[test]
    fn test_create_sql_options() {
        let mut cfg = ClickHouseConfig::default();
        cfg.database = "telemetry".to_string();
        cfg.ttl_days = 7;
        let sql = build_create_sql(TABLE_SPAN_TRACE, &cfg);
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS telemetry.span_trace"));
        assert!(sql.contains("ENGINE = MergeTree()"));
        assert!(sql.contains("toIntervalDay(7)"));

        cfg.cluster = "main".to_string();
        cfg.replication = true;
        cfg.ttl_config = vec![crate::config::TtlConfig {
            tables: vec![TABLE_SPAN_TRACE.to_string()],
            ttl: 3,
        }];
        let sql = build_create_sql(TABLE_SPAN_TRACE, &cfg);
        assert!(sql.contains(" ON CLUSTER main"));
        assert!(sql.contains("ReplicatedMergeTree"));
        assert!(sql.contains("toIntervalDay(3)"));
    }
}
