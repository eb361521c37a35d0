use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration};
use tracing::{info, warn};

pub mod error_tree;
pub mod external;
pub mod relation;
pub mod report;
pub mod task;
pub mod topology;
pub mod tree;

use crate::apm::model::OtelServiceNode;
use crate::apm::ApmClient;
use crate::baseline::{BaselineCache, MetricKey};
use crate::cache::{SharedCache, TraceIdSubscriber};
use crate::config::AnalyzerConfig;
use crate::error::{ReceiverError, TaskError};
use crate::k8s::K8sMetadata;
use crate::metrics;
use crate::model::{OnOffMetricGroup, ReportKind, Trace, Traces};
use crate::profile::SignalsCache;
use crate::storage::ColumnarWriter;
use error_tree::{convert_error_tree, find_root_cause_node};
use external::ExternalFactory;
use relation::Relation;
use report::{ErrorReport, NodeReport, ReportLabels, ThresholdInfo};
use task::{TaskPool, TraceTask};
use topology::Topology;
use tree::{build_span_traces, convert_slow_tree, find_mutated_node, MutateMode, NodeSpanTrace};

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

struct MissTopEntry {
    apm_type: String,
    expire_time: i64,
    check_nano_time: i64,
}

/// The trace-lifecycle engine: buffers arrivals behind the delay gate,
/// classifies completed traces, and drives the report workers.
pub struct ReportAnalyzer {
    shared: Arc<dyn SharedCache>,
    writer: Arc<ColumnarWriter>,
    apm: Arc<ApmClient>,
    signals: Arc<SignalsCache>,
    baseline: Arc<BaselineCache>,
    k8s: Arc<K8sMetadata>,
    external_factory: ExternalFactory,
    task_pool: TaskPool,
    wait_map: DashMap<String, i64>,
    miss_top_map: DashMap<String, MissTopEntry>,
    task_txs: Vec<mpsc::Sender<TraceTask>>,
    task_rxs: Mutex<Option<Vec<mpsc::Receiver<TraceTask>>>>,
    delay_duration: i64,
    retry_times: u32,
    miss_top_time: i64,
    ratio_threshold: u64,
    profile_duration: i64,
    mutate_mode: MutateMode,
    topology_period_nanos: u64,
    long_poll_apm_types: Vec<String>,
    generate_client_metric: bool,
}

impl ReportAnalyzer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &AnalyzerConfig,
        shared: Arc<dyn SharedCache>,
        writer: Arc<ColumnarWriter>,
        apm: Arc<ApmClient>,
        signals: Arc<SignalsCache>,
        baseline: Arc<BaselineCache>,
        k8s: Arc<K8sMetadata>,
        generate_client_metric: bool,
    ) -> Result<ReportAnalyzer, ReceiverError> {
        let thread_count = cfg.thread_count.max(1);
        let mut task_txs = Vec::with_capacity(thread_count);
        let mut task_rxs = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            // Rendezvous-style channels: the dispatcher blocks until a
            // worker accepts, bounding in-flight work.
            let (tx, rx) = mpsc::channel(1);
            task_txs.push(tx);
            task_rxs.push(rx);
        }
        let topology_period = if cfg.topology_period == 0 {
            60
        } else {
            cfg.topology_period
        };
        Ok(ReportAnalyzer {
            shared,
            writer,
            apm,
            signals,
            baseline,
            k8s,
            external_factory: ExternalFactory::new(&cfg.http_parser),
            task_pool: TaskPool::new(cfg.retry_duration),
            wait_map: DashMap::new(),
            miss_top_map: DashMap::new(),
            task_txs,
            task_rxs: Mutex::new(Some(task_rxs)),
            delay_duration: cfg.delay_duration,
            retry_times: cfg.retry_times,
            miss_top_time: cfg.miss_top_time,
            ratio_threshold: cfg.ratio_threshold,
            profile_duration: cfg.segment_size / 2,
            mutate_mode: MutateMode::from_str(&cfg.mutate_node_mode)?,
            topology_period_nanos: topology_period * 1_000_000_000,
            long_poll_apm_types: cfg.long_poll_apm_types.clone(),
            generate_client_metric,
        })
    }

    pub fn start(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        let receivers = self
            .task_rxs
            .lock()
            .unwrap()
            .take()
            .expect("analyzer started twice");
        for (index, mut rx) in receivers.into_iter().enumerate() {
            let analyzer = self.clone();
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        task = rx.recv() => {
                            let Some(task) = task else { return };
                            info!(
                                worker = index + 1,
                                trace_id = task.traces.trace_id,
                                trace_count = task.traces.trace_count(),
                                retry = task.retry_count,
                                "analyze trace"
                            );
                            analyzer.process_task(task).await;
                        }
                        _ = stop.recv() => return,
                    }
                }
            });
        }

        let analyzer = self.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            let mut task_index = 0usize;
            let mut minute_task_count = 0u64;
            let mut current_minute = chrono::Utc::now().timestamp() / 60;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let check_time = now_secs();
                        for task in analyzer.task_pool.drain(check_time) {
                            if analyzer.task_txs[task_index].send(task).await.is_err() {
                                return;
                            }
                            task_index = (task_index + 1) % analyzer.task_txs.len();
                            minute_task_count += 1;
                        }
                        let minute = chrono::Utc::now().timestamp() / 60;
                        if minute != current_minute {
                            info!(count = minute_task_count, "minute executed tasks");
                            current_minute = minute;
                            minute_task_count = 0;
                        }
                        analyzer.check_delay_maps(check_time).await;
                    }
                    _ = stop.recv() => return,
                }
            }
        });

        let analyzer = self.clone();
        tokio::spawn(async move {
            let subscriber: Arc<dyn TraceIdSubscriber> = analyzer.clone();
            analyzer
                .shared
                .subscribe_report_ids(subscriber, shutdown)
                .await;
        });
    }

    /// Ingest path for one serialized span observation.
    pub async fn cache_trace(&self, trace_json: &str) {
        let mut trace = match Trace::from_json(trace_json) {
            Ok(trace) => trace,
            Err(err) => {
                warn!(%err, "skip malformed trace payload");
                return;
            }
        };

        if self.k8s.fill_span_trace(&mut trace) {
            // Persist the enriched form so every replica sees pod metadata.
            self.shared.store_trace(&trace, None).await;
        } else {
            self.shared
                .store_trace(&trace, Some(trace_json.to_string()))
                .await;
        }

        let labels = trace.labels;
        if self.miss_top_time > 0 {
            if labels.top_span {
                // A top-holder claims the trace for itself.
                self.shared.record_trace_time(&labels.trace_id, -1).await;
            } else {
                let check_nano_time = now_nanos();
                self.miss_top_map.insert(
                    labels.trace_id.clone(),
                    MissTopEntry {
                        apm_type: labels.apm_type.clone(),
                        expire_time: now_secs() + self.miss_top_time,
                        check_nano_time,
                    },
                );
                if self.shared.get_trace_time(&labels.trace_id).await >= 0 {
                    // Nobody claimed it, race for the right to report.
                    self.shared
                        .record_trace_time(&labels.trace_id, check_nano_time)
                        .await;
                }
            }
        }

        if !labels.top_span {
            return;
        }
        self.wait_map.insert(
            labels.trace_id.clone(),
            now_secs() + self.wait_time(&labels.apm_type),
        );
    }

    pub async fn cache_metric(&self, metric_json: &str) {
        let metric = match OnOffMetricGroup::from_json(metric_json) {
            Ok(metric) => metric,
            Err(err) => {
                warn!(%err, "skip malformed on/off metric payload");
                return;
            }
        };
        self.shared
            .store_metric(&metric, Some(metric_json.to_string()))
            .await;
    }

    fn wait_time(&self, apm_type: &str) -> i64 {
        if self.long_poll_apm_types.iter().any(|t| t == apm_type) {
            // These agents flush on a fixed 60 s period; any earlier look
            // would observe a partial trace.
            return 60;
        }
        self.delay_duration
    }

    /// 1 Hz maintenance of the delay gate and the miss-top race.
    pub async fn check_delay_maps(&self, check_time: i64) {
        let expired: Vec<String> = self
            .wait_map
            .iter()
            .filter(|entry| *entry.value() < check_time)
            .map(|entry| entry.key().clone())
            .collect();
        for trace_id in expired {
            self.shared.notify_report_id(&trace_id).await;
            self.wait_map.remove(&trace_id);
        }

        let expired_miss: Vec<(String, String, i64)> = self
            .miss_top_map
            .iter()
            .filter(|entry| entry.value().expire_time < check_time)
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().apm_type.clone(),
                    entry.value().check_nano_time,
                )
            })
            .collect();
        for (trace_id, apm_type, check_nano_time) in expired_miss {
            if self.shared.get_trace_time(&trace_id).await == check_nano_time {
                // This collector won the race, schedule the report.
                self.wait_map
                    .insert(trace_id.clone(), check_time + self.wait_time(&apm_type));
            }
            self.miss_top_map.remove(&trace_id);
        }
    }

    async fn get_traces_from_cache(&self, trace_id: &str) -> Traces {
        let mut traces = Traces::new(trace_id);
        for trace in self.shared.get_traces(trace_id).await {
            traces.add_trace(trace);
        }

        let metrics = self.shared.get_metrics(trace_id).await;
        for group in &metrics {
            if let Some(matched) = traces.find_trace_mut(&group.span_id) {
                let key = MetricKey {
                    service_name: matched.labels.service_name.clone(),
                    content_key: matched.labels.url.clone(),
                };
                let (mutated_type, base, range) =
                    self.baseline.calc_mutated_type(&key, &group.metrics);
                matched.onoff_metrics = group.metrics.clone();
                matched.base_onoff_metrics = base;
                matched.base_range = range;
                matched.mutated_type = mutated_type;
            }
        }
        traces.metric_count = metrics.len();
        traces
    }

    fn merge_traces(&self, old: &mut Traces, fresh: Traces) {
        let existing: std::collections::HashSet<String> = old
            .traces
            .iter()
            .map(|t| t.labels.apm_span_id.clone())
            .collect();
        for mut trace in fresh.traces {
            if !existing.contains(&trace.labels.apm_span_id) {
                self.send_profiled_span_trace(&mut trace);
                old.add_trace(trace);
            }
        }
        old.metric_count = fresh.metric_count;
    }

    fn send_profiled_span_trace(&self, trace: &mut Trace) {
        if trace.labels.is_profiled {
            if trace.labels.is_slow && trace.mutated_type.is_empty() {
                trace.mutated_type = "unknown".to_string();
            }
            self.store_trace(trace);
        }
    }

    fn store_trace(&self, trace: &Trace) {
        if trace.mark_sent() {
            self.writer.store_trace_group(trace);
        }
    }

    fn store_traces(&self, traces: &Traces) {
        for trace in &traces.traces {
            self.store_trace(trace);
        }
    }

    pub async fn process_task(&self, mut task: TraceTask) {
        if task.retry_count > 0 {
            // Late spans or metrics may have arrived since the last attempt.
            let trace_count = self.shared.get_trace_size(&task.traces.trace_id).await;
            let metric_count = self.shared.get_metric_size(&task.traces.trace_id).await;
            if trace_count > task.traces.trace_count() || metric_count > task.traces.metric_count {
                let fresh = self.get_traces_from_cache(&task.traces.trace_id).await;
                self.merge_traces(&mut task.traces, fresh);
            }
        }

        match self.build_report(&mut task.traces, task.kind).await {
            Ok(()) => metrics::inc_report_task(&task.kind.to_string(), "success"),
            Err(task_error) => {
                if task_error.should_retry() && task.retry_count < self.retry_times {
                    self.task_pool.retry(task);
                } else {
                    self.record_drop_report(&task.traces, &task_error.message(), task.kind);
                }
            }
        }
    }

    async fn build_report(&self, traces: &mut Traces, kind: ReportKind) -> Result<(), TaskError> {
        match kind {
            ReportKind::Error => self.build_error_reports(traces).await,
            ReportKind::Slow => self.build_slow_reports(traces).await,
            ReportKind::Normal => {
                self.build_relations(traces).await.map_err(TaskError::Retry)?;
                Ok(())
            }
        }
    }

    fn record_drop_report(&self, traces: &Traces, reason: &str, kind: ReportKind) {
        warn!(trace_id = traces.trace_id, %kind, reason, "drop report");
        match kind {
            ReportKind::Slow => {
                if let Some(entry) = traces.query_trace() {
                    self.writer
                        .store_slow_report(&NodeReport::drop_report(entry, reason));
                }
            }
            ReportKind::Error => {
                if let Some(entry) = traces.query_trace() {
                    self.writer
                        .store_error_report(&ErrorReport::drop_report(entry, reason));
                }
            }
            // Normal tasks only owe span storage.
            ReportKind::Normal => self.store_traces(traces),
        }
        metrics::inc_report_task(&kind.to_string(), "drop");
    }

    fn relation_key(&self, service: &str, url: &str, start_time: u64, virtual_top: bool) -> String {
        format!(
            "{}-{}-{}-{}",
            service,
            url,
            start_time / self.topology_period_nanos,
            virtual_top
        )
    }

    /// Builds and de-duplicates topology relationships; returns the fetched
    /// service forest so report builders can reuse it.
    async fn build_relations(
        &self,
        traces: &mut Traces,
    ) -> Result<Option<Vec<OtelServiceNode>>, ReceiverError> {
        let Some(entry) = traces.query_trace() else {
            return Ok(None);
        };
        let entry_labels = entry.labels.clone();

        if traces.root_trace().is_some() {
            let key = self.relation_key(
                &entry_labels.service_name,
                &entry_labels.url,
                entry_labels.start_time,
                false,
            );
            if self.shared.get_relation_id(&key).await.is_some() {
                // Another trace already produced this bucket's relationship.
                self.store_traces(traces);
                return Ok(None);
            }
        }

        let services = self
            .apm
            .query_services(
                &entry_labels.apm_type,
                &traces.trace_id,
                entry_labels.start_time / 1_000_000,
            )
            .await?;

        if self.miss_top_time == 0 {
            let found_root = services.iter().any(|service| {
                service
                    .entry_spans
                    .iter()
                    .any(|span| span.p_span_id.is_empty())
            });
            if !found_root {
                return Err(ReceiverError::ApmUpstream(
                    "no matched entry span is found in Apm System".to_string(),
                ));
            }
        }

        let topology = {
            let sampled_map = traces.span_id_map();
            Topology::build(&services, &sampled_map, &self.external_factory)
        };
        for root in &topology.roots {
            let node = topology.node(*root);
            let key =
                self.relation_key(&node.service_name, &node.url, node.start_time, node.top_node);
            if self.shared.get_relation_id(&key).await.is_none() {
                self.shared.store_relation_id(&key, &traces.trace_id).await;
                let relation = Relation::build(&traces.trace_id, &topology, *root);
                if self.generate_client_metric {
                    for row in &relation.client_rows {
                        metrics::observe_client_call(
                            &row.client_group,
                            &row.client_type,
                            row.duration,
                        );
                    }
                }
                self.writer.store_relation(&relation);
                self.store_traces(traces);
            }
        }
        Ok(Some(services))
    }

    async fn build_slow_reports(&self, traces: &mut Traces) -> Result<(), TaskError> {
        let services = self.build_relations(traces).await.map_err(TaskError::Retry)?;
        if traces.root_trace().is_some() {
            self.build_single_slow_report(services, traces).await
        } else {
            self.build_multi_slow_reports(services, traces).await
        }
    }

    async fn build_single_slow_report(
        &self,
        services: Option<Vec<OtelServiceNode>>,
        traces: &mut Traces,
    ) -> Result<(), TaskError> {
        let entry = traces.root_trace().expect("single report without root").labels.clone();
        if entry.threshold_value as u64 >= entry.duration {
            return Err(TaskError::Drop(ReceiverError::SemanticDrop(format!(
                "entry service({}) duration({}) is less than threshold({}({})={})",
                entry.service_name,
                entry.duration,
                entry.threshold_type,
                entry.threshold_range,
                entry.threshold_value
            ))));
        }

        let max_sampled = traces
            .traces
            .iter()
            .filter(|t| t.labels.is_sampled)
            .max_by_key(|t| t.labels.duration)
            .map(|t| t.labels.clone());
        let Some(max_sampled) = max_sampled else {
            return Err(TaskError::Drop(ReceiverError::SemanticDrop(
                "no sampled service is found".to_string(),
            )));
        };
        if max_sampled.duration * 2 < entry.duration {
            let rate = max_sampled.duration * 100 / entry.duration;
            return Err(TaskError::Drop(ReceiverError::SemanticDrop(format!(
                "top Sampled service({}) duration({}) has not enough rate({}) with service({}) duration({})",
                max_sampled.service_name,
                max_sampled.duration,
                rate,
                entry.service_name,
                entry.duration
            ))));
        }

        let services = match services {
            Some(services) => services,
            None => self
                .apm
                .query_services(&entry.apm_type, &traces.trace_id, entry.start_time / 1_000_000)
                .await
                .map_err(TaskError::Retry)?,
        };
        let span_traces = build_span_traces(&services, traces);
        for span_trace in span_traces {
            if span_trace.sampled.labels.apm_span_id == entry.apm_span_id {
                return self
                    .generate_slow_report(&entry.apm_type, traces, span_trace)
                    .await;
            }
        }
        Err(TaskError::Retry(ReceiverError::ApmUpstream(format!(
            "entry[{}-{}] is not collected by the receiver",
            entry.service_name, entry.url
        ))))
    }

    async fn build_multi_slow_reports(
        &self,
        services: Option<Vec<OtelServiceNode>>,
        traces: &mut Traces,
    ) -> Result<(), TaskError> {
        let Some(query) = traces.query_trace() else {
            return Ok(());
        };
        let query = query.labels.clone();
        let services = match services {
            Some(services) => services,
            None => self
                .apm
                .query_services(&query.apm_type, &traces.trace_id, query.start_time / 1_000_000)
                .await
                .map_err(TaskError::Retry)?,
        };
        let span_traces = build_span_traces(&services, traces);
        if span_traces.is_empty() {
            return Err(TaskError::Retry(ReceiverError::ApmUpstream(format!(
                "trace[{}] is not found in Apm System",
                traces.trace_id
            ))));
        }

        for span_trace in span_traces {
            let entry = span_trace.sampled.labels.clone();
            if entry.threshold_value as u64 >= entry.duration {
                info!(
                    service = entry.service_name,
                    duration = entry.duration,
                    threshold = entry.threshold_value,
                    "ignore entry below threshold"
                );
                continue;
            }
            if let Err(err) = self
                .generate_slow_report(&entry.apm_type, traces, span_trace)
                .await
            {
                warn!(trace_id = traces.trace_id, error = err.message(), "skip slow entry");
            }
        }
        Ok(())
    }

    async fn generate_slow_report(
        &self,
        apm_type: &str,
        traces: &mut Traces,
        mut span_trace: NodeSpanTrace,
    ) -> Result<(), TaskError> {
        let mut tree = convert_slow_tree(&span_trace, traces);
        let mutated = find_mutated_node(&mut tree, self.ratio_threshold, self.mutate_mode)
            .map_err(TaskError::Drop)?;

        if self.apm.need_get_detail_span(apm_type) {
            if let Some(node) = span_trace.service_node_mut(&mutated.span_id) {
                self.apm
                    .fill_detail_spans(apm_type, &traces.trace_id, node)
                    .await
                    .map_err(TaskError::Retry)?;
            }
        }

        let entry_service = tree.root.service_name.clone();
        let entry_url = tree.root.url.clone();
        let mut mutated_type = "unknown".to_string();
        let trace_id = traces.trace_id.clone();
        match traces.find_trace_mut(&mutated.span_id) {
            Some(found) => {
                let mut need_profile = false;
                if found.labels.is_sampled
                    && !found.labels.is_silent
                    && !found.labels.is_profiled
                {
                    // Only promote profiling while enough of the capture
                    // segment is still ahead.
                    let elapsed = (now_nanos() - found.labels.start_time as i64) / 1_000_000_000;
                    if elapsed + 2 < self.profile_duration {
                        found.labels.is_profiled = true;
                        need_profile = true;
                    }
                }
                let found = found.clone();
                self.signals
                    .add_signal(&entry_service, &entry_url, &found, need_profile)
                    .await;

                if !found.labels.is_sampled {
                    return Err(TaskError::Drop(ReceiverError::SemanticDrop(format!(
                        "instance({}) is not sampled",
                        found.instance_id()
                    ))));
                }
                if !found.labels.is_profiled {
                    return Err(TaskError::Drop(ReceiverError::SemanticDrop(format!(
                        "instance({}) is not profiled",
                        found.instance_id()
                    ))));
                }
                if !found.mutated_type.is_empty() {
                    mutated_type = found.mutated_type.clone();
                }
                self.store_traces(traces);
            }
            None => {
                return Err(TaskError::Drop(ReceiverError::SemanticDrop(format!(
                    "instance({}) is not monitored",
                    mutated.id
                ))));
            }
        }

        info!(trace_id, "write slow report");
        let mut report = NodeReport::new(tree.root.start_time, &trace_id, tree.root.total_time);
        report.end_time = tree.root.start_time + tree.root.total_time;
        report.cause = mutated_type;
        report.labels = ReportLabels {
            entry_service,
            entry_instance: tree.root.id.clone(),
            mutated_service: mutated.service_name.clone(),
            mutated_url: mutated.url.clone(),
            mutated_instance: mutated.id.clone(),
            mutated_span: mutated.span_id.clone(),
            mutated_pod: mutated.pod.clone(),
            mutated_pod_ns: mutated.pod_ns.clone(),
            mutated_workload_name: mutated.workload.clone(),
            mutated_workload_type: mutated.workload_type.clone(),
            content_key: tree.root.url.clone(),
        };
        report.threshold = ThresholdInfo {
            threshold_type: tree.root.threshold_type.clone(),
            threshold_range: tree.root.threshold_range.clone(),
            threshold_value: tree.root.threshold_value,
            threshold_multiple: tree.root.threshold_multiple,
        };
        report.otel_client_calls = span_trace.client_calls(&mutated.span_id);
        report.relation_tree = Some(tree.root);
        self.writer.store_slow_report(&report);
        Ok(())
    }

    async fn build_error_reports(&self, traces: &mut Traces) -> Result<(), TaskError> {
        let services = self.build_relations(traces).await.map_err(TaskError::Retry)?;
        if traces.root_trace().is_some() {
            self.build_single_error_report(services, traces).await
        } else {
            self.build_multi_error_reports(services, traces).await
        }
    }

    async fn build_single_error_report(
        &self,
        services: Option<Vec<OtelServiceNode>>,
        traces: &mut Traces,
    ) -> Result<(), TaskError> {
        let entry = traces.root_trace().expect("single report without root").labels.clone();
        let services = match services {
            Some(services) => services,
            None => self
                .apm
                .query_services(&entry.apm_type, &traces.trace_id, entry.start_time / 1_000_000)
                .await
                .map_err(TaskError::Retry)?,
        };
        let span_traces = build_span_traces(&services, traces);
        for span_trace in span_traces {
            if span_trace.sampled.labels.apm_span_id == entry.apm_span_id {
                return self
                    .generate_error_report(&entry.apm_type, traces, span_trace)
                    .await;
            }
        }
        Err(TaskError::Retry(ReceiverError::ApmUpstream(format!(
            "entry[{}-{}] is not collected by the receiver",
            entry.service_name, entry.url
        ))))
    }

    async fn build_multi_error_reports(
        &self,
        services: Option<Vec<OtelServiceNode>>,
        traces: &mut Traces,
    ) -> Result<(), TaskError> {
        let Some(query) = traces.query_trace() else {
            return Ok(());
        };
        let query = query.labels.clone();
        let services = match services {
            Some(services) => services,
            None => self
                .apm
                .query_services(&query.apm_type, &traces.trace_id, query.start_time / 1_000_000)
                .await
                .map_err(TaskError::Retry)?,
        };
        let span_traces = build_span_traces(&services, traces);
        if span_traces.is_empty() {
            return Err(TaskError::Retry(ReceiverError::ApmUpstream(format!(
                "trace[{}] is not found in Apm System",
                traces.trace_id
            ))));
        }
        for span_trace in span_traces {
            let apm_type = span_trace.sampled.labels.apm_type.clone();
            if let Err(err) = self.generate_error_report(&apm_type, traces, span_trace).await {
                warn!(trace_id = traces.trace_id, error = err.message(), "skip error entry");
            }
        }
        Ok(())
    }

    async fn generate_error_report(
        &self,
        apm_type: &str,
        traces: &mut Traces,
        mut span_trace: NodeSpanTrace,
    ) -> Result<(), TaskError> {
        if self.apm.need_get_detail_span(apm_type) {
            // Detail spans carry the exception records for these flavors.
            let error_span_ids = collect_error_entry_spans(&span_trace.service, traces);
            for span_id in error_span_ids {
                if let Some(node) = span_trace.service_node_mut(&span_id) {
                    self.apm
                        .fill_detail_spans(apm_type, &traces.trace_id, node)
                        .await
                        .map_err(TaskError::Retry)?;
                }
            }
        }

        let tree = convert_error_tree(&span_trace, traces);
        let mutated = find_root_cause_node(&tree).map_err(TaskError::Drop)?;
        if !mutated.is_profiled {
            return Err(TaskError::Drop(ReceiverError::SemanticDrop(format!(
                "error instance({}) is not profiled",
                mutated.id
            ))));
        }

        self.store_traces(traces);
        info!(trace_id = traces.trace_id, "write error report");

        let root = tree.root;
        let mut report = ErrorReport::new(root.start_time, &traces.trace_id, root.total_time);
        report.end_time = root.start_time + root.total_time;
        report.labels = ReportLabels {
            entry_service: root.service_name.clone(),
            entry_instance: root.id.clone(),
            mutated_service: mutated.service_name.clone(),
            mutated_url: mutated.url.clone(),
            mutated_instance: mutated.id.clone(),
            mutated_span: mutated.span_id.clone(),
            mutated_pod: mutated.pod.clone(),
            mutated_pod_ns: mutated.pod_ns.clone(),
            mutated_workload_name: mutated.workload.clone(),
            mutated_workload_type: mutated.workload_type.clone(),
            content_key: root.url.clone(),
        };
        report.threshold = ThresholdInfo {
            threshold_type: root.threshold_type.clone(),
            threshold_range: root.threshold_range.clone(),
            threshold_value: root.threshold_value,
            threshold_multiple: root.threshold_multiple,
        };
        match mutated.root_cause_error() {
            Some(exception) => {
                report.cause = exception.exception_type.clone();
                report.cause_message = exception.message.clone();
            }
            None => report.cause = "unknown".to_string(),
        }
        report.relation_tree = Some(root);
        self.writer.store_error_report(&report);
        Ok(())
    }
}

fn collect_error_entry_spans(service: &OtelServiceNode, traces: &Traces) -> Vec<String> {
    let mut span_ids = Vec::new();
    collect_error_entry_spans_inner(service, traces, &mut span_ids);
    span_ids
}

fn collect_error_entry_spans_inner(
    service: &OtelServiceNode,
    traces: &Traces,
    span_ids: &mut Vec<String>,
) {
    for span in &service.entry_spans {
        if let Some(matched) = traces.find_trace(&span.span_id) {
            if matched.labels.is_error && matched.labels.is_sampled {
                span_ids.push(span.span_id.clone());
                break;
            }
        }
    }
    for child in &service.children {
        collect_error_entry_spans_inner(child, traces, span_ids);
    }
}

#[async_trait]
impl TraceIdSubscriber for ReportAnalyzer {
    /// Entry point for trace-ready notifications: gather the aggregate,
    /// apply the structural gates, classify into a report task.
    async fn consume(&self, trace_id: String) {
        let mut traces = self.get_traces_from_cache(&trace_id).await;
        if self.miss_top_time <= 0 && traces.root_trace().is_none() {
            warn!(trace_id, "miss root trace");
            return;
        }
        if traces.traces.is_empty() {
            warn!(trace_id, "miss trace");
            return;
        }
        for trace in traces.traces.iter_mut() {
            self.send_profiled_span_trace(trace);
        }
        if traces.has_single_trace() || traces.has_changed_sample() {
            // Nothing to relate.
            return;
        }
        if traces.has_slow {
            self.task_pool.add(TraceTask::new(traces.clone(), ReportKind::Slow));
        }
        if traces.has_error {
            self.task_pool.add(TraceTask::new(traces.clone(), ReportKind::Error));
        }
        if !traces.has_slow && !traces.has_error && traces.unsent_count() > 0 {
            self.task_pool.add(TraceTask::new(traces, ReportKind::Normal));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apm::model::{OtelException, OtelSpan, SpanKind};
    use crate::cache::LocalCache;
    use crate::config::{AnalyzerConfig, K8sConfig};
    use crate::model::TraceLabels;
    use crate::promql::PromClient;

    fn new_analyzer(cfg: AnalyzerConfig, shared: Arc<LocalCache>) -> Arc<ReportAnalyzer> {
        let writer = Arc::new(ColumnarWriter::new_for_test());
        let apm = Arc::new(ApmClient::new("http://127.0.0.1:1", 1, cfg.get_detail_types.clone()).unwrap());
        let signals = Arc::new(SignalsCache::new(shared.clone()));
        let baseline = Arc::new(BaselineCache::new(
            PromClient::new("http://127.0.0.1:1").unwrap(),
            "le",
        ));
        let k8s = Arc::new(K8sMetadata::new(&K8sConfig::default()));
        Arc::new(
            ReportAnalyzer::new(&cfg, shared, writer, apm, signals, baseline, k8s, false).unwrap(),
        )
    }

    fn span_trace(
        trace_id: &str,
        span_id: &str,
        service: &str,
        url: &str,
        duration: u64,
    ) -> Trace {
        Trace {
            labels: TraceLabels {
                trace_id: trace_id.to_string(),
                apm_span_id: span_id.to_string(),
                service_name: service.to_string(),
                url: url.to_string(),
                node_ip: "10.0.0.1".to_string(),
                start_time: 1_000_000_000,
                duration,
                end_time: 1_000_000_000 + duration,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn service_node(service: &str, url: &str, span_id: &str, p_span_id: &str, duration: u64) -> OtelServiceNode {
        OtelServiceNode {
            entry_spans: vec![OtelSpan {
                service_name: service.to_string(),
                name: url.to_string(),
                span_id: span_id.to_string(),
                p_span_id: p_span_id.to_string(),
                duration,
                kind: SpanKind::Server,
                ..Default::default()
            }],
            exit_spans: vec![],
            children: vec![],
        }
    }

    #[tokio::test]
    async fn test_single_service_slow_report() {
        let shared = Arc::new(LocalCache::new(60));
        let analyzer = new_analyzer(AnalyzerConfig::default(), shared);

        let mut t1 = span_trace("trace-1", "s1", "api", "GET /slow", 2_000_000_000);
        t1.labels.top_span = true;
        t1.labels.is_slow = true;
        t1.labels.is_sampled = true;
        t1.labels.is_profiled = true;
        t1.labels.threshold_value = 1_000_000_000.0;
        t1.labels.threshold_type = "LatencyP90".to_string();
        let mut traces = Traces::new("trace-1");
        traces.add_trace(t1);

        let services = vec![service_node("api", "GET /slow", "s1", "", 2_000_000_000)];
        analyzer
            .build_single_slow_report(Some(services), &mut traces)
            .await
            .unwrap();

        let reports = analyzer.writer.pending_slow_reports();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert!(!report.is_drop);
        assert_eq!(report.cause, "unknown");
        assert_eq!(report.trace_id, "trace-1");
        let labels: serde_json::Value = serde_json::from_str(&report.labels).unwrap();
        assert_eq!(labels["entry_service"], "api");
        assert_eq!(labels["mutated_service"], "api");
        assert_eq!(labels["content_key"], "GET /slow");
        // The profiled span was written to span storage too.
        assert_eq!(analyzer.writer.pending_span_traces().len(), 1);
    }

    #[tokio::test]
    async fn test_sampled_rate_too_low_drops() {
        let shared = Arc::new(LocalCache::new(60));
        let analyzer = new_analyzer(AnalyzerConfig::default(), shared);

        let mut root = span_trace("trace-2", "s1", "api", "GET /slow", 1000);
        root.labels.top_span = true;
        root.labels.is_slow = true;
        root.labels.threshold_value = 100.0;
        let mut child = span_trace("trace-2", "s2", "backend", "GET /child", 400);
        child.labels.is_sampled = true;
        let mut traces = Traces::new("trace-2");
        traces.add_trace(root);
        traces.add_trace(child);

        let err = analyzer
            .build_single_slow_report(Some(Vec::new()), &mut traces)
            .await
            .unwrap_err();
        assert!(!err.should_retry());
        assert!(err.message().contains("has not enough rate(40)"), "{}", err.message());

        analyzer.record_drop_report(&traces, &err.message(), ReportKind::Slow);
        let reports = analyzer.writer.pending_slow_reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_drop);
        assert!(reports[0].drop_reason.contains("has not enough rate(40)"));
    }

    #[tokio::test]
    async fn test_error_report_picks_deepest_error_node() {
        let shared = Arc::new(LocalCache::new(60));
        let analyzer = new_analyzer(AnalyzerConfig::default(), shared);

        let mut t1 = span_trace("trace-3", "s1", "gateway", "GET /entry", 900);
        t1.labels.top_span = true;
        t1.labels.is_error = true;
        t1.labels.is_sampled = true;
        t1.labels.is_profiled = true;
        let mut t2 = span_trace("trace-3", "s2", "backend", "GET /child", 500);
        t2.labels.is_error = true;
        t2.labels.is_sampled = true;
        t2.labels.is_profiled = true;
        let mut traces = Traces::new("trace-3");
        traces.add_trace(t1);
        traces.add_trace(t2);

        let mut parent = service_node("gateway", "GET /entry", "s1", "", 900);
        let mut child = service_node("backend", "GET /child", "s2", "x", 500);
        child.entry_spans[0].error = true;
        child.entry_spans[0].exceptions = vec![OtelException {
            exception_type: "java.sql.SQLException".to_string(),
            message: "connection refused".to_string(),
        }];
        parent.children.push(child);

        analyzer
            .build_single_error_report(Some(vec![parent]), &mut traces)
            .await
            .unwrap();

        let reports = analyzer.writer.pending_error_reports();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert!(!report.is_drop);
        assert_eq!(report.cause, "java.sql.SQLException");
        assert_eq!(report.cause_message, "connection refused");
        let labels: serde_json::Value = serde_json::from_str(&report.labels).unwrap();
        assert_eq!(labels["mutated_span"], "s2");
        assert_eq!(labels["entry_service"], "gateway");
    }

    #[tokio::test]
    async fn test_relation_bucket_key_is_pure() {
        let shared = Arc::new(LocalCache::new(60));
        let mut cfg = AnalyzerConfig::default();
        cfg.topology_period = 60;
        let analyzer = new_analyzer(cfg, shared);

        let key = analyzer.relation_key("api", "GET /a", 120_000_000_000, false);
        assert_eq!(key, "api-GET /a-2-false");
        assert_eq!(
            key,
            analyzer.relation_key("api", "GET /a", 179_999_999_999, false)
        );
        assert_ne!(
            key,
            analyzer.relation_key("api", "GET /a", 180_000_000_000, false)
        );
        assert_ne!(key, analyzer.relation_key("api", "GET /a", 120_000_000_000, true));
    }

    #[tokio::test]
    async fn test_relationship_dedup_within_bucket() {
        let shared = Arc::new(LocalCache::new(60));
        let analyzer = new_analyzer(AnalyzerConfig::default(), shared.clone());

        // First trace of the bucket claims the relation id.
        shared.store_relation_id("api-GET /a-0-false", "trace-a").await;

        let mut root = span_trace("trace-b", "s1", "api", "GET /a", 900);
        root.labels.top_span = true;
        let mut child = span_trace("trace-b", "s2", "backend", "GET /b", 500);
        child.labels.is_sampled = true;
        let mut traces = Traces::new("trace-b");
        traces.add_trace(root);
        traces.add_trace(child);

        // Entry start_time 1s falls in bucket 0 for the 60s period.
        let services = analyzer.build_relations(&mut traces).await.unwrap();
        assert!(services.is_none(), "deduped build must not query the apm");
        assert!(analyzer.writer.pending_relationships().is_empty());
        // The second consume still marks every trace as sent.
        assert_eq!(traces.unsent_count(), 0);
        assert_eq!(analyzer.writer.pending_span_traces().len(), 2);
    }

    #[tokio::test]
    async fn test_miss_top_race_single_winner() {
        let shared = Arc::new(LocalCache::new(60));
        let mut cfg = AnalyzerConfig::default();
        cfg.miss_top_time = 1;
        let first = new_analyzer(cfg.clone(), shared.clone());
        let second = new_analyzer(cfg, shared.clone());

        let trace = span_trace("trace-x", "s1", "api", "GET /a", 100);
        let payload = serde_json::to_string(&trace).unwrap();
        first.cache_trace(&payload).await;
        second.cache_trace(&payload).await;

        // Both registered the miss-top entry; the slot holds the second
        // collector's nano time.
        let check_time = now_secs() + 5;
        first.check_delay_maps(check_time).await;
        second.check_delay_maps(check_time).await;

        assert!(first.wait_map.is_empty(), "loser must not schedule");
        assert_eq!(second.wait_map.len(), 1, "winner schedules exactly once");
        assert!(first.miss_top_map.is_empty());
        assert!(second.miss_top_map.is_empty());
    }

    #[tokio::test]
    async fn test_top_span_claims_miss_top_slot() {
        let shared = Arc::new(LocalCache::new(60));
        let mut cfg = AnalyzerConfig::default();
        cfg.miss_top_time = 10;
        let analyzer = new_analyzer(cfg, shared.clone());

        let mut top = span_trace("trace-y", "s1", "api", "GET /a", 100);
        top.labels.top_span = true;
        analyzer
            .cache_trace(&serde_json::to_string(&top).unwrap())
            .await;
        assert_eq!(shared.get_trace_time("trace-y").await, -1);

        // A non-top sibling seen later must not steal the claim.
        let sibling = span_trace("trace-y", "s2", "backend", "GET /b", 50);
        analyzer
            .cache_trace(&serde_json::to_string(&sibling).unwrap())
            .await;
        assert_eq!(shared.get_trace_time("trace-y").await, -1);
    }

    #[tokio::test]
    async fn test_delay_gate_lower_bound() {
        let shared = Arc::new(LocalCache::new(60));
        let mut cfg = AnalyzerConfig::default();
        cfg.delay_duration = 10;
        let analyzer = new_analyzer(cfg, shared);

        let mut top = span_trace("trace-z", "s1", "api", "GET /a", 100);
        top.labels.top_span = true;
        analyzer
            .cache_trace(&serde_json::to_string(&top).unwrap())
            .await;
        let notify_at = *analyzer.wait_map.get("trace-z").unwrap();
        assert!(notify_at >= now_secs() + 10);

        let mut long_poll = span_trace("trace-nbs", "s1", "api", "GET /a", 100);
        long_poll.labels.top_span = true;
        long_poll.labels.apm_type = "nbs3".to_string();
        analyzer
            .cache_trace(&serde_json::to_string(&long_poll).unwrap())
            .await;
        let notify_at = *analyzer.wait_map.get("trace-nbs").unwrap();
        assert!(notify_at >= now_secs() + 60);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_emits_drop() {
        let shared = Arc::new(LocalCache::new(60));
        let mut cfg = AnalyzerConfig::default();
        cfg.retry_times = 2;
        // The apm client points at an unreachable endpoint, every build is a
        // transient failure.
        let analyzer = new_analyzer(cfg, shared);

        let mut root = span_trace("trace-r", "s1", "api", "GET /a", 2000);
        root.labels.top_span = true;
        root.labels.is_slow = true;
        root.labels.threshold_value = 100.0;
        let child = span_trace("trace-r", "s2", "backend", "GET /b", 1500);
        let mut traces = Traces::new("trace-r");
        traces.add_trace(root);
        traces.add_trace(child);

        analyzer
            .process_task(TraceTask::new(traces, ReportKind::Slow))
            .await;
        let (_, retrying) = analyzer.task_pool.pending();
        assert_eq!(retrying, 1, "first failure re-enqueues");

        let mut task = analyzer.task_pool.drain(now_secs() + 100).pop().unwrap();
        assert_eq!(task.retry_count, 1);
        analyzer.process_task(task).await;
        let (_, retrying) = analyzer.task_pool.pending();
        assert_eq!(retrying, 1, "second failure re-enqueues");

        task = analyzer.task_pool.drain(now_secs() + 200).pop().unwrap();
        assert_eq!(task.retry_count, 2);
        analyzer.process_task(task).await;
        let (_, retrying) = analyzer.task_pool.pending();
        assert_eq!(retrying, 0, "budget exhausted");
        let reports = analyzer.writer.pending_slow_reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_drop);
        assert!(!reports[0].drop_reason.is_empty());
    }

    #[tokio::test]
    async fn test_consume_classification() {
        let shared = Arc::new(LocalCache::new(60));
        let analyzer = new_analyzer(AnalyzerConfig::default(), shared.clone());

        // Slow + error trace enqueues one task per kind.
        let mut root = span_trace("trace-c", "s1", "api", "GET /a", 900);
        root.labels.top_span = true;
        root.labels.is_slow = true;
        let mut child = span_trace("trace-c", "s2", "backend", "GET /b", 500);
        child.labels.is_error = true;
        shared.store_trace(&root, None).await;
        shared.store_trace(&child, None).await;
        analyzer.consume("trace-c".to_string()).await;
        let (ready, _) = analyzer.task_pool.pending();
        assert_eq!(ready, 2);

        // Single-service aggregates only forward profiled spans.
        let mut single = span_trace("trace-s", "s9", "api", "GET /x", 100);
        single.labels.top_span = true;
        single.labels.is_profiled = true;
        shared.store_trace(&single, None).await;
        analyzer.consume("trace-s".to_string()).await;
        let (ready, _) = analyzer.task_pool.pending();
        assert_eq!(ready, 2, "single trace adds no task");
        assert_eq!(analyzer.writer.pending_span_traces().len(), 1);

        // A root-less aggregate is dropped while miss-top is disabled.
        let stray = span_trace("trace-m", "s5", "api", "GET /y", 100);
        shared.store_trace(&stray, None).await;
        analyzer.consume("trace-m".to_string()).await;
        let (ready, _) = analyzer.task_pool.pending();
        assert_eq!(ready, 2);
    }

    #[tokio::test]
    async fn test_metric_merge_attaches_onoff_vector() {
        let shared = Arc::new(LocalCache::new(60));
        let analyzer = new_analyzer(AnalyzerConfig::default(), shared.clone());

        let trace = span_trace("trace-m2", "s1", "api", "GET /a", 500);
        shared.store_trace(&trace, None).await;
        let metric = OnOffMetricGroup {
            trace_id: "trace-m2".to_string(),
            span_id: "s1".to_string(),
            metrics: "100,0,0,0,0,0,0,0".to_string(),
            ..Default::default()
        };
        shared.store_metric(&metric, None).await;

        let traces = analyzer.get_traces_from_cache("trace-m2").await;
        assert_eq!(traces.metric_count, 1);
        let merged = traces.find_trace("s1").unwrap();
        assert_eq!(merged.onoff_metrics, "100,0,0,0,0,0,0,0");
        assert_eq!(merged.mutated_type, "cpu");
    }
}
