use async_trait::async_trait;

use crate::model::{OnOffMetricGroup, Trace};

pub mod local;
pub mod redis;

pub use self::local::LocalCache;
pub use self::redis::RedisCache;

/// Consumer of trace-id notifications.
#[async_trait]
pub trait TraceIdSubscriber: Send + Sync {
    async fn consume(&self, trace_id: String);
}

/// Keyed, TTL-bounded buffer shared by every collector replica.
///
/// Two back-ends exist: [`LocalCache`] for single-node deployments and
/// [`RedisCache`] for fan-out across replicas. All operations are
/// best-effort: a failed write is logged and dropped, the delay gate will
/// re-surface the trace id anyway.
///
/// Two notification semantics are deliberately distinct and must not be
/// collapsed: report ids ride a durable queue consumed by exactly one
/// replica (stream + consumer group on the shared back-end), sampled ids are
/// broadcast to every replica (pub/sub).
#[async_trait]
pub trait SharedCache: Send + Sync {
    fn is_local(&self) -> bool;

    async fn store_trace(&self, trace: &Trace, json: Option<String>);
    async fn get_traces(&self, trace_id: &str) -> Vec<Trace>;
    async fn get_trace_size(&self, trace_id: &str) -> usize;

    async fn store_metric(&self, metric: &OnOffMetricGroup, json: Option<String>);
    async fn get_metrics(&self, trace_id: &str) -> Vec<OnOffMetricGroup>;
    async fn get_metric_size(&self, trace_id: &str) -> usize;

    /// Miss-top coordination slot. `-1` marks a top-holder claim; any
    /// non-negative value is the nano timestamp of the latest racer.
    async fn record_trace_time(&self, trace_id: &str, nanos: i64);
    /// Returns 0 when no collector has touched the slot yet.
    async fn get_trace_time(&self, trace_id: &str) -> i64;

    /// Monotonic index used by the profiling trace-id window.
    async fn incr_trace_index(&self) -> i64;
    async fn get_trace_index(&self) -> i64;

    async fn notify_report_id(&self, trace_id: &str);
    /// Blocks until shutdown, delivering each report id exactly once.
    async fn subscribe_report_ids(
        &self,
        subscriber: std::sync::Arc<dyn TraceIdSubscriber>,
        shutdown: tokio::sync::broadcast::Sender<()>,
    );

    async fn notify_sampled_ids(&self, normal: Vec<String>, slow: Vec<String>, error: Vec<String>);
    /// Blocks until shutdown, fanning sampled ids out to the three windows.
    async fn subscribe_sampled_ids(
        &self,
        normal: std::sync::Arc<dyn TraceIdSubscriber>,
        slow: std::sync::Arc<dyn TraceIdSubscriber>,
        error: std::sync::Arc<dyn TraceIdSubscriber>,
        shutdown: tokio::sync::broadcast::Sender<()>,
    );

    async fn store_signal(&self, node_ip: &str, payload: String);
    async fn drain_signals(&self, node_ip: &str) -> Vec<String>;

    /// Compare-and-set with TTL backing relationship de-duplication.
    async fn store_relation_id(&self, key: &str, trace_id: &str);
    async fn get_relation_id(&self, key: &str) -> Option<String>;

    async fn get_sample_value(&self) -> i64;
    async fn init_sample_value(&self, value: i64, expire_secs: i64);
    async fn set_sample_value(&self, value: i64, expire_secs: i64);
    /// True when the recovery window elapsed and this replica won the right
    /// to decay the sample value.
    async fn sample_time_expired(&self) -> bool;

    /// Spawns the back-end's housekeeping (expiry sweep, consumer group
    /// creation).
    async fn start(self: std::sync::Arc<Self>, shutdown: tokio::sync::broadcast::Sender<()>);
}

/// Relationship de-dup entries outlive the trace buffer.
pub const RELATION_EXPIRE_SECS: i64 = 3600;
