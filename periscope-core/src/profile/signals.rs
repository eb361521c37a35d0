use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::info;

use crate::analyzer::report::ReportCountMetric;
use crate::cache::SharedCache;
use crate::model::{ProfileSignal, Trace};
use crate::storage::ColumnarWriter;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlowReportTuple {
    entry_service: String,
    entry_url: String,
    mutated_service: String,
    mutated_pid: u32,
    mutated_url: String,
}

impl SlowReportTuple {
    fn pid_url(&self) -> String {
        format!("{}-{}", self.mutated_pid, self.mutated_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SilentStatus {
    Init,
    Closing,
    Finished,
}

struct SlowReportMetric {
    total: u64,
    success: u64,
    status: SilentStatus,
}

impl SlowReportMetric {
    fn new() -> SlowReportMetric {
        SlowReportMetric {
            total: 0,
            success: 0,
            status: SilentStatus::Init,
        }
    }

    fn add(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.success += 1;
        }
    }

    /// Advances the silent-switch state machine and reports the edge
    /// transitions observed on this call.
    fn check_status(&mut self) -> (bool, bool, bool) {
        let mut to_close = false;
        let mut to_recover = false;
        match self.status {
            SilentStatus::Init => {
                if self.total > 0 {
                    if self.success == 0 {
                        self.status = SilentStatus::Closing;
                        to_close = true;
                    } else {
                        self.status = SilentStatus::Finished;
                    }
                }
            }
            SilentStatus::Closing => {
                if self.success > 0 {
                    to_recover = true;
                    self.status = SilentStatus::Finished;
                }
            }
            SilentStatus::Finished => {}
        }
        let silent = self.status == SilentStatus::Closing;
        (to_close, to_recover, silent)
    }
}

/// Per-host profiling counters feeding the silent switch.
struct SignalCache {
    metrics: Mutex<HashMap<SlowReportTuple, SlowReportMetric>>,
}

impl SignalCache {
    fn new() -> SignalCache {
        SignalCache {
            metrics: Mutex::new(HashMap::new()),
        }
    }

    fn add_signal(&self, tuple: SlowReportTuple, profiled: bool) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics
            .entry(tuple)
            .or_insert_with(SlowReportMetric::new)
            .add(profiled);
    }

    fn query_silent_switches(&self) -> (Vec<String>, Vec<String>) {
        let mut to_closes: HashMap<String, bool> = HashMap::new();
        let mut to_recovers: HashMap<String, bool> = HashMap::new();
        let mut ignores: HashMap<String, bool> = HashMap::new();

        let mut metrics = self.metrics.lock().unwrap();
        for (tuple, metric) in metrics.iter_mut() {
            let pid_url = tuple.pid_url();
            let (to_close, to_recover, silent) = metric.check_status();
            if to_close {
                to_closes.insert(pid_url.clone(), true);
            }
            if to_recover {
                to_recovers.insert(pid_url.clone(), true);
            }
            if silent {
                ignores.insert(pid_url, true);
            }
        }

        // Never recover a pid-url another tuple still holds closed.
        for key in ignores.keys() {
            to_recovers.remove(key);
        }
        let mut close_pid_urls: Vec<String> = to_closes.into_keys().collect();
        let mut recover_pid_urls: Vec<String> = to_recovers.into_keys().collect();
        close_pid_urls.sort();
        recover_pid_urls.sort();
        (close_pid_urls, recover_pid_urls)
    }

    fn collect_count_metrics(&self) -> Vec<ReportCountMetric> {
        let now = chrono::Utc::now().timestamp_millis() * 1_000_000;
        let mut metrics = self.metrics.lock().unwrap();
        let result = metrics
            .iter()
            .filter(|(_, metric)| metric.total > 0)
            .map(|(tuple, metric)| ReportCountMetric {
                timestamp: now,
                entry_service: tuple.entry_service.clone(),
                entry_url: tuple.entry_url.clone(),
                mutated_service: tuple.mutated_service.clone(),
                mutated_url: tuple.mutated_url.clone(),
                total: metric.total,
                success: metric.success,
            })
            .collect();
        metrics.clear();
        result
    }
}

/// Host-keyed registry of profiling signal counters, plus the pipe that
/// carries designated-profiling signals toward the owning agent.
pub struct SignalsCache {
    cache: DashMap<String, Arc<SignalCache>>,
    shared: Arc<dyn SharedCache>,
}

impl SignalsCache {
    pub fn new(shared: Arc<dyn SharedCache>) -> SignalsCache {
        SignalsCache {
            cache: DashMap::new(),
            shared,
        }
    }

    fn host_cache(&self, node_ip: &str) -> Arc<SignalCache> {
        self.cache
            .entry(node_ip.to_string())
            .or_insert_with(|| Arc::new(SignalCache::new()))
            .clone()
    }

    pub async fn add_signal(
        &self,
        entry_service: &str,
        entry_url: &str,
        trace: &Trace,
        need_profile: bool,
    ) {
        let tuple = SlowReportTuple {
            entry_service: entry_service.to_string(),
            entry_url: entry_url.to_string(),
            mutated_service: trace.instance_id(),
            mutated_pid: trace.labels.pid,
            mutated_url: trace.labels.url.clone(),
        };
        self.host_cache(&trace.labels.node_ip)
            .add_signal(tuple, trace.labels.is_profiled);

        if need_profile {
            let signal = ProfileSignal {
                pid: trace.labels.pid,
                tid: trace.labels.tid,
                start_time: trace.labels.start_time,
                end_time: trace.labels.end_time,
            };
            if let Ok(payload) = serde_json::to_string(&signal) {
                self.shared
                    .store_signal(&trace.labels.node_ip, payload)
                    .await;
            }
        }
    }

    /// Called from the agent poll: (pid-urls to close, pid-urls to recover).
    pub fn query_silent_switches(&self, node_ip: &str) -> (Vec<String>, Vec<String>) {
        match self.cache.get(node_ip) {
            Some(cache) => cache.query_silent_switches(),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Rolls the per-tuple counters into report_metric rows every minute.
    pub fn start(self: Arc<Self>, writer: Arc<ColumnarWriter>, shutdown: broadcast::Sender<()>) {
        tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for entry in self.cache.iter() {
                            let metrics = entry.value().collect_count_metrics();
                            if !metrics.is_empty() {
                                info!(count = metrics.len(), "write slow report metrics");
                                for metric in &metrics {
                                    writer.store_report_metric(metric);
                                }
                            }
                        }
                    }
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

    fn trace(pid: u32, url: &str, profiled: bool) -> Trace {
        Trace {
            labels: TraceLabels {
                pid,
                url: url.to_string(),
                service_name: "T".to_string(),
                node_ip: "10.0.0.1".to_string(),
                is_profiled: profiled,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn tuple(entry_service: &str, entry_url: &str, trace: &Trace) -> SlowReportTuple {
        SlowReportTuple {
            entry_service: entry_service.to_string(),
            entry_url: entry_url.to_string(),
            mutated_service: trace.instance_id(),
            mutated_pid: trace.labels.pid,
            mutated_url: trace.labels.url.clone(),
        }
    }

    fn check(cache: &SignalCache, close: &[&str], recover: &[&str]) {
        let (got_close, got_recover) = cache.query_silent_switches();
        assert_eq!(got_close, close, "unexpected close switches");
        assert_eq!(got_recover, recover, "unexpected recover switches");
    }

    #[test]
    fn test_silent_switch_transitions() {
        let cache = SignalCache::new();
        let one_profiled = trace(1, "/t", true);
        let one_not = trace(1, "/t", false);
        let two_profiled = trace(2, "/s", true);
        let two_not = trace(2, "/s", false);

        cache.add_signal(tuple("A", "/a", &one_profiled), true);
        check(&cache, &[], &[]);

        cache.add_signal(tuple("A", "/a", &one_not), false);
        check(&cache, &[], &[]);

        cache.add_signal(tuple("A", "/a", &two_not), false);
        cache.add_signal(tuple("B", "/b", &one_not), false);
        check(&cache, &["1-/t", "2-/s"], &[]);

        cache.add_signal(tuple("C", "/c", &one_not), false);
        check(&cache, &["1-/t"], &[]);

        cache.add_signal(tuple("C", "/c", &one_profiled), true);
        check(&cache, &[], &[]);

        cache.add_signal(tuple("B", "/b", &one_profiled), true);
        check(&cache, &[], &["1-/t"]);

        cache.add_signal(tuple("A", "/a", &two_profiled), true);
        check(&cache, &[], &["2-/s"]);
    }

    #[test]
    fn test_recover_suppressed_while_still_closing() {
        let cache = SignalCache::new();
        let not_profiled = trace(1, "/t", false);
        let profiled = trace(1, "/t", true);

        // Two distinct entries track the same pid-url.
        cache.add_signal(tuple("A", "/a", &not_profiled), false);
        cache.add_signal(tuple("B", "/b", &not_profiled), false);
        check(&cache, &["1-/t"], &[]);

        // Only one of them recovers; the other still holds the switch.
        cache.add_signal(tuple("A", "/a", &profiled), false);
        check(&cache, &[], &[]);
    }

    #[test]
    fn test_collect_count_metrics_clears() {
        let cache = SignalCache::new();
        cache.add_signal(tuple("A", "/a", &trace(1, "/t", true)), false);
        cache.add_signal(tuple("A", "/a", &trace(1, "/t", false)), false);

        let metrics = cache.collect_count_metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].total, 2);
        assert_eq!(metrics[0].success, 1);
        assert_eq!(metrics[0].entry_service, "A");
        assert!(cache.collect_count_metrics().is_empty());
    }

    #[tokio::test]
    async fn test_need_profile_pushes_signal() {
        let shared = Arc::new(crate::cache::LocalCache::new(60));
        let signals = SignalsCache::new(shared.clone());
        let mut sampled = trace(7, "/slow", false);
        sampled.labels.tid = 77;
        sampled.labels.start_time = 1000;
        sampled.labels.end_time = 2000;

        signals.add_signal("gw", "/entry", &sampled, true).await;
        let stored = crate::cache::SharedCache::drain_signals(&*shared, "10.0.0.1").await;
        assert_eq!(stored.len(), 1);
        let signal: ProfileSignal = serde_json::from_str(&stored[0]).unwrap();
        assert_eq!(signal.pid, 7);
        assert_eq!(signal.tid, 77);
    }
}
