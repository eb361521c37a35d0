use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

use crate::cache::{SharedCache, TraceIdSubscriber, RELATION_EXPIRE_SECS};
use crate::model::{OnOffMetricGroup, Trace};

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

struct ExpirableList {
    expire_time: i64,
    traces: Vec<Trace>,
    metrics: Vec<OnOffMetricGroup>,
}

impl ExpirableList {
    fn new() -> Self {
        Self {
            expire_time: 0,
            traces: Vec::new(),
            metrics: Vec::new(),
        }
    }
}

struct Expirable<T> {
    expire_time: i64,
    data: T,
}

impl<T> Expirable<T> {
    fn new(expire_secs: i64, data: T) -> Self {
        Self {
            expire_time: now_secs() + expire_secs,
            data,
        }
    }
}

/// In-process back-end of the shared trace cache. The report-id queue is a
/// single buffered queue drained by one subscriber; sampled ids are buffered
/// per window and fanned out on a 1 Hz tick.
pub struct LocalCache {
    expire_time: i64,
    trace_map: DashMap<String, ExpirableList>,
    trace_time_map: DashMap<String, Expirable<i64>>,
    signal_map: DashMap<String, Vec<String>>,
    relation_map: DashMap<String, Expirable<String>>,
    sample_value: AtomicI64,
    sample_time: AtomicI64,
    report_ids: Mutex<Vec<String>>,
    normal_ids: Mutex<Vec<String>>,
    slow_ids: Mutex<Vec<String>>,
    error_ids: Mutex<Vec<String>>,
}

impl LocalCache {
    pub fn new(expire_time: i64) -> LocalCache {
        let expire_time = if expire_time <= 0 { 60 } else { expire_time };
        LocalCache {
            expire_time,
            trace_map: DashMap::new(),
            trace_time_map: DashMap::new(),
            signal_map: DashMap::new(),
            relation_map: DashMap::new(),
            sample_value: AtomicI64::new(0),
            sample_time: AtomicI64::new(0),
            report_ids: Mutex::new(Vec::new()),
            normal_ids: Mutex::new(Vec::new()),
            slow_ids: Mutex::new(Vec::new()),
            error_ids: Mutex::new(Vec::new()),
        }
    }

    fn sweep_expired(&self) {
        let check_time = now_secs();
        self.trace_map.retain(|_, list| list.expire_time >= check_time);
        self.trace_time_map
            .retain(|_, entry| entry.expire_time >= check_time);
        self.relation_map
            .retain(|_, entry| entry.expire_time >= check_time);
    }
}

#[async_trait]
impl SharedCache for LocalCache {
    fn is_local(&self) -> bool {
        true
    }

    async fn store_trace(&self, trace: &Trace, _json: Option<String>) {
        let mut entry = self
            .trace_map
            .entry(trace.labels.trace_id.clone())
            .or_insert_with(ExpirableList::new);
        entry.expire_time = now_secs() + self.expire_time;
        entry.traces.push(trace.clone());
    }

    async fn get_traces(&self, trace_id: &str) -> Vec<Trace> {
        self.trace_map
            .get(trace_id)
            .map(|list| list.traces.clone())
            .unwrap_or_default()
    }

    async fn get_trace_size(&self, trace_id: &str) -> usize {
        self.trace_map
            .get(trace_id)
            .map(|list| list.traces.len())
            .unwrap_or(0)
    }

    async fn store_metric(&self, metric: &OnOffMetricGroup, _json: Option<String>) {
        let mut entry = self
            .trace_map
            .entry(metric.trace_id.clone())
            .or_insert_with(ExpirableList::new);
        entry.expire_time = now_secs() + self.expire_time;
        entry.metrics.push(metric.clone());
    }

    async fn get_metrics(&self, trace_id: &str) -> Vec<OnOffMetricGroup> {
        self.trace_map
            .get(trace_id)
            .map(|list| list.metrics.clone())
            .unwrap_or_default()
    }

    async fn get_metric_size(&self, trace_id: &str) -> usize {
        self.trace_map
            .get(trace_id)
            .map(|list| list.metrics.len())
            .unwrap_or(0)
    }

    async fn record_trace_time(&self, trace_id: &str, nanos: i64) {
        self.trace_time_map.insert(
            trace_id.to_string(),
            Expirable::new(self.expire_time, nanos),
        );
    }

    async fn get_trace_time(&self, trace_id: &str) -> i64 {
        self.trace_time_map
            .get(trace_id)
            .map(|entry| entry.data)
            .unwrap_or(0)
    }

    async fn incr_trace_index(&self) -> i64 {
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
    }

    async fn get_trace_index(&self) -> i64 {
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
    }

    async fn notify_report_id(&self, trace_id: &str) {
        self.report_ids.lock().await.push(trace_id.to_string());
    }

    async fn subscribe_report_ids(
        &self,
        subscriber: Arc<dyn TraceIdSubscriber>,
        shutdown: broadcast::Sender<()>,
    ) {
        let mut stop = shutdown.subscribe();
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let drained: Vec<String> = {
                        let mut ids = self.report_ids.lock().await;
                        std::mem::take(&mut *ids)
                    };
                    for trace_id in drained {
                        subscriber.consume(trace_id).await;
                    }
                }
                _ = stop.recv() => return,
            }
        }
    }

    async fn notify_sampled_ids(
        &self,
        normal: Vec<String>,
        slow: Vec<String>,
        error: Vec<String>,
    ) {
        if !normal.is_empty() {
            self.normal_ids.lock().await.extend(normal);
        }
        if !slow.is_empty() {
            self.slow_ids.lock().await.extend(slow);
        }
        if !error.is_empty() {
            self.error_ids.lock().await.extend(error);
        }
    }

    async fn subscribe_sampled_ids(
        &self,
        normal: Arc<dyn TraceIdSubscriber>,
        slow: Arc<dyn TraceIdSubscriber>,
        error: Arc<dyn TraceIdSubscriber>,
        shutdown: broadcast::Sender<()>,
    ) {
        let mut stop = shutdown.subscribe();
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let drained: Vec<String> =
                        std::mem::take(&mut *self.normal_ids.lock().await);
                    for trace_id in drained {
                        normal.consume(trace_id).await;
                    }
                    let drained: Vec<String> =
                        std::mem::take(&mut *self.slow_ids.lock().await);
                    for trace_id in drained {
                        slow.consume(trace_id).await;
                    }
                    let drained: Vec<String> =
                        std::mem::take(&mut *self.error_ids.lock().await);
                    for trace_id in drained {
                        error.consume(trace_id).await;
                    }
                }
                _ = stop.recv() => return,
            }
        }
    }

    async fn store_signal(&self, node_ip: &str, payload: String) {
        self.signal_map
            .entry(node_ip.to_string())
            .or_default()
            .push(payload);
    }

    async fn drain_signals(&self, node_ip: &str) -> Vec<String> {
        self.signal_map
            .get_mut(node_ip)
            .map(|mut signals| std::mem::take(&mut *signals))
            .unwrap_or_default()
    }

    async fn store_relation_id(&self, key: &str, trace_id: &str) {
        self.relation_map
            .entry(key.to_string())
            .or_insert_with(|| Expirable::new(RELATION_EXPIRE_SECS, trace_id.to_string()));
    }

    async fn get_relation_id(&self, key: &str) -> Option<String> {
        self.relation_map.get(key).map(|entry| entry.data.clone())
    }

    async fn get_sample_value(&self) -> i64 {
        self.sample_value.load(Ordering::Relaxed)
    }

    async fn init_sample_value(&self, value: i64, expire_secs: i64) {
        self.sample_value.store(value, Ordering::Relaxed);
        self.sample_time
            .store(now_secs() + expire_secs, Ordering::Relaxed);
    }

    async fn set_sample_value(&self, value: i64, expire_secs: i64) {
        self.sample_value.store(value, Ordering::Relaxed);
        self.sample_time
            .store(now_secs() + expire_secs, Ordering::Relaxed);
    }

    async fn sample_time_expired(&self) -> bool {
        now_secs() > self.sample_time.load(Ordering::Relaxed)
    }

    async fn start(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep_expired(),
                    _ = stop.recv() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TraceLabels;

    fn trace(trace_id: &str, span_id: &str) -> Trace {
        Trace {
            labels: TraceLabels {
                trace_id: trace_id.to_string(),
                apm_span_id: span_id.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_store_then_get_round_trip() {
        let cache = LocalCache::new(60);
        cache.store_trace(&trace("t1", "a"), None).await;
        cache.store_trace(&trace("t1", "b"), None).await;
        cache.store_trace(&trace("t2", "c"), None).await;

        let traces = cache.get_traces("t1").await;
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].labels.apm_span_id, "a");
        assert_eq!(traces[1].labels.apm_span_id, "b");
        assert_eq!(cache.get_trace_size("t1").await, 2);
        assert_eq!(cache.get_trace_size("missing").await, 0);
        assert!(cache.get_traces("missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_share_trace_expiry() {
        let cache = LocalCache::new(60);
        let metric = OnOffMetricGroup {
            trace_id: "t1".to_string(),
            span_id: "a".to_string(),
            metrics: "1,2,3,4,5,6,7,8".to_string(),
            ..Default::default()
        };
        cache.store_metric(&metric, None).await;
        assert_eq!(cache.get_metric_size("t1").await, 1);
        assert_eq!(cache.get_metrics("t1").await[0].span_id, "a");
    }

    #[tokio::test]
    async fn test_trace_time_slot() {
        let cache = LocalCache::new(60);
        assert_eq!(cache.get_trace_time("t1").await, 0);
        cache.record_trace_time("t1", -1).await;
        assert_eq!(cache.get_trace_time("t1").await, -1);
        cache.record_trace_time("t1", 12345).await;
        assert_eq!(cache.get_trace_time("t1").await, 12345);
    }

    #[tokio::test]
    async fn test_relation_id_set_once() {
        let cache = LocalCache::new(60);
        assert!(cache.get_relation_id("k").await.is_none());
        cache.store_relation_id("k", "t1").await;
        cache.store_relation_id("k", "t2").await;
        assert_eq!(cache.get_relation_id("k").await.unwrap(), "t1");
    }

    #[tokio::test]
    async fn test_signal_drain_clears() {
        let cache = LocalCache::new(60);
        cache.store_signal("10.0.0.1", "{}".to_string()).await;
        cache.store_signal("10.0.0.1", "{}".to_string()).await;
        assert_eq!(cache.drain_signals("10.0.0.1").await.len(), 2);
        assert!(cache.drain_signals("10.0.0.1").await.is_empty());
        assert!(cache.drain_signals("10.0.0.2").await.is_empty());
    }

    #[tokio::test]
    async fn test_sample_value_window() {
        let cache = LocalCache::new(60);
        cache.init_sample_value(4, 300).await;
        assert_eq!(cache.get_sample_value().await, 4);
        assert!(!cache.sample_time_expired().await);
        cache.set_sample_value(5, -10).await;
        assert_eq!(cache.get_sample_value().await, 5);
        assert!(cache.sample_time_expired().await);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let cache = LocalCache::new(-1);
        // expire_time <= 0 falls back to 60s, so force an expired entry.
        cache.store_trace(&trace("t1", "a"), None).await;
        cache.trace_map.get_mut("t1").unwrap().expire_time = now_secs() - 1;
        cache.sweep_expired();
        assert_eq!(cache.get_trace_size("t1").await, 0);
    }
}
