use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{interval, Duration};

use crate::cache::SharedCache;
use crate::config::ProfileConfig;
use crate::model::ProfileSignal;
use crate::storage::ColumnarWriter;

pub mod signals;
pub mod traceid;

pub use signals::SignalsCache;
pub use traceid::TraceIdCache;

/// Everything the agent poll RPC needs: the three sampled-id windows, the
/// signal cache with its silent switch, and the window-sample settings.
pub struct ProfileCenter {
    pub normal_ids: Arc<TraceIdCache>,
    pub slow_ids: Arc<TraceIdCache>,
    pub error_ids: Arc<TraceIdCache>,
    pub signals: Arc<SignalsCache>,
    shared: Arc<dyn SharedCache>,
    open_window_sample: bool,
    window_sample_num: u32,
}

/// Answer for one agent poll.
#[derive(Debug, Default)]
pub struct ProfileAnswer {
    pub query_time: i64,
    pub sample_count: u32,
    pub normal_trace_ids: Vec<String>,
    pub slow_trace_ids: Vec<String>,
    pub error_trace_ids: Vec<String>,
    pub close_pid_urls: Vec<String>,
    pub recover_pid_urls: Vec<String>,
    pub signals: Vec<ProfileSignal>,
}

impl ProfileCenter {
    pub fn new(cfg: &ProfileConfig, shared: Arc<dyn SharedCache>) -> ProfileCenter {
        ProfileCenter {
            normal_ids: Arc::new(TraceIdCache::new(
                "Normal",
                cfg.traceid_cache_time,
                shared.clone(),
            )),
            slow_ids: Arc::new(TraceIdCache::new(
                "Slow",
                cfg.traceid_cache_time,
                shared.clone(),
            )),
            error_ids: Arc::new(TraceIdCache::new(
                "Error",
                cfg.traceid_cache_time,
                shared.clone(),
            )),
            signals: Arc::new(SignalsCache::new(shared.clone())),
            shared,
            open_window_sample: cfg.open_window_sample,
            window_sample_num: cfg.window_sample_num,
        }
    }

    pub fn start(&self, writer: Arc<ColumnarWriter>, shutdown: broadcast::Sender<()>) {
        self.signals.clone().start(writer, shutdown.clone());

        let shared = self.shared.clone();
        let normal = self.normal_ids.clone();
        let slow = self.slow_ids.clone();
        let error = self.error_ids.clone();
        let sampled_shutdown = shutdown.clone();
        tokio::spawn(async move {
            shared
                .subscribe_sampled_ids(normal, slow, error, sampled_shutdown)
                .await;
        });

        let normal = self.normal_ids.clone();
        let slow = self.slow_ids.clone();
        let error = self.error_ids.clone();
        tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
                        normal.clean_expired(now);
                        slow.clean_expired(now);
                        error.clean_expired(now);
                    }
                    _ = stop.recv() => return,
                }
            }
        });
    }

    /// The ids in the request are acknowledgements and broadcast to every
    /// replica so all windows drop them.
    pub async fn query_profiles(
        &self,
        node_ip: &str,
        query_time: i64,
        normal_acks: Vec<String>,
        slow_acks: Vec<String>,
        error_acks: Vec<String>,
    ) -> ProfileAnswer {
        let normal_ignore: HashSet<String> = normal_acks.iter().cloned().collect();
        let slow_ignore: HashSet<String> = slow_acks.iter().cloned().collect();
        let error_ignore: HashSet<String> = error_acks.iter().cloned().collect();
        self.shared
            .notify_sampled_ids(normal_acks, slow_acks, error_acks)
            .await;

        let end_index = self.shared.get_trace_index().await;
        let (close_pid_urls, recover_pid_urls) = if self.open_window_sample {
            self.signals.query_silent_switches(node_ip)
        } else {
            (Vec::new(), Vec::new())
        };
        let signals = self
            .shared
            .drain_signals(node_ip)
            .await
            .iter()
            .filter_map(|payload| serde_json::from_str::<ProfileSignal>(payload).ok())
            .collect();

        ProfileAnswer {
            query_time: end_index,
            sample_count: self.window_sample_num,
            normal_trace_ids: self.normal_ids.get_trace_ids(&normal_ignore, query_time, end_index),
            slow_trace_ids: self.slow_ids.get_trace_ids(&slow_ignore, query_time, end_index),
            error_trace_ids: self.error_ids.get_trace_ids(&error_ignore, query_time, end_index),
            close_pid_urls,
            recover_pid_urls,
            signals,
        }
    }
}
