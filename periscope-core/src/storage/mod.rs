use std::sync::Arc;
use std::sync::Mutex;

use clickhouse::Client;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::analyzer::relation::Relation;
use crate::analyzer::report::{ErrorReport, NodeReport, ReportCountMetric};
use crate::config::ClickHouseConfig;
use crate::error::ReceiverError;
use crate::model::{self, Trace, Traces};

pub mod tables;

use tables::{
    build_create_sql, relation_rows, service_client_rows, ErrorPropagationRow, ErrorReportRow,
    PassthroughRow, ReportMetricRow, ServiceClientRow, ServiceRelationshipRow, SlowReportRow,
    SpanTraceRow, ALL_TABLES, TABLE_ERROR_PROPAGATION, TABLE_ERROR_REPORT, TABLE_FLAME_GRAPH,
    TABLE_JVM_GC, TABLE_ONOFF_METRIC, TABLE_PROFILING_EVENT, TABLE_REPORT_METRIC,
    TABLE_SERVICE_CLIENT, TABLE_SERVICE_RELATIONSHIP, TABLE_SLOW_REPORT, TABLE_SPAN_TRACE,
};

async fn init_tables(client: &Client, cfg: &ClickHouseConfig) -> Result<(), ReceiverError> {
    client
        .query(&format!("CREATE DATABASE IF NOT EXISTS {}", cfg.database))
        .execute()
        .await?;
    for table in ALL_TABLES {
        client.query(&build_create_sql(table, cfg)).execute().await?;
    }
    info!(database = cfg.database, "columnar store tables ready");
    Ok(())
}

#[derive(Default)]
struct WriteCache {
    span_traces: Vec<SpanTraceRow>,
    slow_reports: Vec<SlowReportRow>,
    error_reports: Vec<ErrorReportRow>,
    error_propagations: Vec<ErrorPropagationRow>,
    relationships: Vec<ServiceRelationshipRow>,
    service_clients: Vec<ServiceClientRow>,
    report_metrics: Vec<ReportMetricRow>,
    onoff_metrics: Vec<PassthroughRow>,
    profiling_events: Vec<PassthroughRow>,
    flame_graphs: Vec<PassthroughRow>,
    jvm_gcs: Vec<PassthroughRow>,
}

/// Batching writer in front of the columnar store. Producers append typed
/// rows under a short lock; a flush ticker swaps the vectors out and inserts
/// them, so writers never wait on the network.
pub struct ColumnarWriter {
    client: Client,
    cache: Mutex<WriteCache>,
    flush_seconds: u64,
    export_service_client: bool,
}

impl ColumnarWriter {
    pub async fn connect(cfg: &ClickHouseConfig) -> Result<ColumnarWriter, ReceiverError> {
        if cfg.endpoint.is_empty() {
            return Err(ReceiverError::Config(
                "clickhouse endpoint must be specified".to_string(),
            ));
        }
        if !cfg.endpoint.starts_with("http://") && !cfg.endpoint.starts_with("https://") {
            return Err(ReceiverError::Config(format!(
                "clickhouse endpoint must be a url: {}",
                cfg.endpoint
            )));
        }
        let mut base_client = Client::default().with_url(&cfg.endpoint);
        if !cfg.username.is_empty() {
            base_client = base_client.with_user(&cfg.username);
        }
        if !cfg.password.is_empty() {
            base_client = base_client.with_password(&cfg.password);
        }
        // The database may not exist yet, so DDL runs on the unbound client.
        init_tables(&base_client, cfg).await?;

        Ok(ColumnarWriter {
            client: base_client.with_database(&cfg.database),
            cache: Mutex::new(WriteCache::default()),
            flush_seconds: if cfg.flush_seconds == 0 {
                5
            } else {
                cfg.flush_seconds
            },
            export_service_client: cfg.export_service_client,
        })
    }

    /// Routes a raw data group from the ingest RPC to its passthrough table.
    pub fn batch_store(&self, name: &str, datas: Vec<String>) {
        let timestamp = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as u64;
        let rows = datas
            .into_iter()
            .map(|data| PassthroughRow { timestamp, data });
        let mut cache = self.cache.lock().unwrap();
        match name {
            model::GROUP_CAMERA_EVENT => cache.profiling_events.extend(rows),
            model::GROUP_FLAME_GRAPH => cache.flame_graphs.extend(rows),
            model::GROUP_JVM_GC => cache.jvm_gcs.extend(rows),
            model::GROUP_ONOFF_METRIC => cache.onoff_metrics.extend(rows),
            _ => tracing::warn!(name, "unknown data group, skip"),
        }
    }

    pub fn store_trace_group(&self, trace: &Trace) {
        let row = SpanTraceRow::from_trace(trace);
        self.cache.lock().unwrap().span_traces.push(row);
    }

    pub fn store_slow_report(&self, report: &NodeReport) {
        let row = SlowReportRow::from_report(report);
        self.cache.lock().unwrap().slow_reports.push(row);
    }

    pub fn store_error_report(&self, report: &ErrorReport) {
        let row = ErrorReportRow::from_report(report);
        let propagation = ErrorPropagationRow::from_report(report);
        let mut cache = self.cache.lock().unwrap();
        cache.error_reports.push(row);
        if let Some(propagation) = propagation {
            cache.error_propagations.push(propagation);
        }
    }

    pub fn store_report_metric(&self, metric: &ReportCountMetric) {
        let row = ReportMetricRow::from_metric(metric);
        self.cache.lock().unwrap().report_metrics.push(row);
    }

    pub fn store_relation(&self, relation: &Relation) {
        let relationship_rows = relation_rows(relation);
        let client_rows = if self.export_service_client {
            service_client_rows(relation)
        } else {
            Vec::new()
        };
        let mut cache = self.cache.lock().unwrap();
        cache.relationships.extend(relationship_rows);
        cache.service_clients.extend(client_rows);
    }

    pub async fn start(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        let mut stop = shutdown.subscribe();
        let mut ticker = interval(Duration::from_secs(self.flush_seconds));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.flush().await,
                    _ = stop.recv() => {
                        // Final best-effort flush on shutdown.
                        self.flush().await;
                        return;
                    }
                }
            }
        });
    }

    async fn flush(&self) {
        let batch = {
            let mut cache = self.cache.lock().unwrap();
            std::mem::take(&mut *cache)
        };
        self.write(TABLE_SPAN_TRACE, batch.span_traces).await;
        self.write(TABLE_SLOW_REPORT, batch.slow_reports).await;
        self.write(TABLE_ERROR_REPORT, batch.error_reports).await;
        self.write(TABLE_ERROR_PROPAGATION, batch.error_propagations)
            .await;
        self.write(TABLE_SERVICE_RELATIONSHIP, batch.relationships)
            .await;
        self.write(TABLE_SERVICE_CLIENT, batch.service_clients)
            .await;
        self.write(TABLE_REPORT_METRIC, batch.report_metrics).await;
        self.write(TABLE_ONOFF_METRIC, batch.onoff_metrics).await;
        self.write(TABLE_PROFILING_EVENT, batch.profiling_events)
            .await;
        self.write(TABLE_FLAME_GRAPH, batch.flame_graphs).await;
        self.write(TABLE_JVM_GC, batch.jvm_gcs).await;
    }

    async fn write<T>(&self, table: &str, rows: Vec<T>)
    where
        T: clickhouse::Row + serde::Serialize,
    {
        if rows.is_empty() {
            return;
        }
        let result: Result<(), clickhouse::error::Error> = async {
            let mut insert = self.client.insert(table)?;
            for row in &rows {
                insert.write(row).await?;
            }
            insert.end().await
        }
        .await;
        if let Err(err) = result {
            error!(table, rows = rows.len(), %err, "columnar insert failed");
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> ColumnarWriter {
        ColumnarWriter {
            client: Client::default().with_url("http://localhost:8123"),
            cache: Mutex::new(WriteCache::default()),
            flush_seconds: 5,
            export_service_client: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_slow_reports(&self) -> Vec<SlowReportRow> {
        self.cache.lock().unwrap().slow_reports.clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_error_reports(&self) -> Vec<ErrorReportRow> {
        self.cache.lock().unwrap().error_reports.clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_relationships(&self) -> Vec<ServiceRelationshipRow> {
        self.cache.lock().unwrap().relationships.clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_span_traces(&self) -> Vec<SpanTraceRow> {
        self.cache.lock().unwrap().span_traces.clone()
    }

    /// Rebuilds the buffered view of a trace from persisted span rows; used
    /// by the realtime report endpoints.
    pub async fn query_traces(&self, trace_id: &str) -> Result<Traces, ReceiverError> {
        let rows: Vec<SpanTraceRow> = self
            .client
            .query("SELECT ?fields FROM span_trace WHERE trace_id = ?")
            .bind(trace_id)
            .fetch_all()
            .await?;
        let mut traces = Traces::new(trace_id);
        for row in rows {
            traces.add_trace(row.into_trace());
        }
        Ok(traces)
    }
}
