use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::info;

use crate::cache::SharedCache;
use crate::config::SampleConfig;
use crate::model::SampleMetric;

struct NodeMemory {
    timestamp: i64,
    memory: u64,
    memory_limit: u64,
    cache_second: i64,
}

/// Ring of the last five memory-pressure samples of one host, plus the vote
/// counters of the feedback loop.
struct NodeMemories {
    size: usize,
    memories: Vec<NodeMemory>,
    check_time: i64,
    check_count: u32,
    sample_count: u32,
}

impl NodeMemories {
    fn new(size: usize) -> NodeMemories {
        NodeMemories {
            size,
            memories: Vec::new(),
            check_time: 0,
            check_count: 0,
            sample_count: 0,
        }
    }

    fn cache_memory(&mut self, metric: &SampleMetric) {
        self.memories.push(NodeMemory {
            timestamp: metric.query_time,
            memory: metric.memory,
            memory_limit: metric.memory_limit,
            cache_second: metric.cache_second,
        });
        if self.memories.len() > self.size {
            self.memories.remove(0);
        }
    }

    /// True when the host has seen five qualifying pressure ticks and votes
    /// to sample harder.
    fn evaluate(&mut self) -> bool {
        if self.memories.len() < 2 {
            return false;
        }
        let last = self.memories.last().unwrap();
        // Below 0.8 * limit there is no pressure at all.
        if self.check_time == last.timestamp || last.memory * 5 < last.memory_limit * 4 {
            return false;
        }
        self.check_time = last.timestamp;

        let pre = &self.memories[self.memories.len() - 2];
        let first = &self.memories[0];
        let last_growth = (last.memory as i64 - pre.memory as i64)
            / (last.timestamp - pre.timestamp).max(1);
        let window_growth = (last.memory as i64 - first.memory as i64)
            / (last.timestamp - first.timestamp).max(1);
        let avg_budget = last.memory_limit as i64 / last.cache_second.max(1);
        if last_growth > avg_budget || window_growth > avg_budget {
            self.sample_count += 1;
        }
        self.check_count += 1;

        let sampled = self.sample_count >= 5;
        if sampled || self.check_count > 10 {
            self.sample_count = 0;
            self.check_count = 0;
        }
        sampled
    }

    fn reset(&mut self) {
        self.sample_count = 0;
        self.check_count = 0;
    }
}

/// Feedback loop between agent memory pressure and the global sampling
/// divisor. The published value always stays within [min_sample,
/// max_sample]; decay is driven by the shared sample-time key expiring.
pub struct MemorySampler {
    min_sample: i64,
    init_sample: i64,
    max_sample: i64,
    reset_period: i64,
    sample_value: AtomicI64,
    node_memories: DashMap<String, Arc<Mutex<NodeMemories>>>,
    shared: Arc<dyn SharedCache>,
}

impl MemorySampler {
    pub async fn new(cfg: &SampleConfig, shared: Arc<dyn SharedCache>) -> MemorySampler {
        shared
            .init_sample_value(cfg.min_sample, cfg.reset_sample_period)
            .await;
        MemorySampler {
            min_sample: cfg.min_sample,
            init_sample: cfg.init_sample,
            max_sample: cfg.max_sample,
            reset_period: cfg.reset_sample_period,
            sample_value: AtomicI64::new(cfg.min_sample),
            node_memories: DashMap::new(),
            shared,
        }
    }

    /// Records the host's sample and answers with the current divisor.
    pub fn record_metric(&self, metric: &SampleMetric) -> i64 {
        let memories = self
            .node_memories
            .entry(metric.node_ip.clone())
            .or_insert_with(|| Arc::new(Mutex::new(NodeMemories::new(5))))
            .clone();
        memories.lock().unwrap().cache_memory(metric);
        self.sample_value.load(Ordering::Relaxed)
    }

    pub fn current_value(&self) -> i64 {
        self.sample_value.load(Ordering::Relaxed)
    }

    pub async fn check_sample_value(&self) {
        let mut sample_changed = false;

        let mut sample_value = self.shared.get_sample_value().await;
        let local_value = self.sample_value.load(Ordering::Relaxed);
        if sample_value != local_value {
            // Another replica adjusted the shared value, adopt it.
            sample_changed = true;
            self.sample_value.store(sample_value, Ordering::Relaxed);
            info!(from = local_value, to = sample_value, "update sample value");
        } else if sample_value < self.max_sample {
            let mut voted = false;
            for entry in self.node_memories.iter() {
                if entry.value().lock().unwrap().evaluate() {
                    voted = true;
                }
            }

            if voted {
                sample_changed = true;
                if sample_value < self.init_sample {
                    sample_value = self.init_sample;
                } else {
                    sample_value += 1;
                }
            }

            if sample_changed {
                self.sample_value.store(sample_value, Ordering::Relaxed);
                self.shared
                    .set_sample_value(sample_value, self.reset_period)
                    .await;
                info!(from = local_value, to = sample_value, "set sample value");
            }
        }

        if self.shared.sample_time_expired().await {
            if sample_value > self.min_sample {
                sample_value -= 1;
                sample_changed = true;
            }
            self.sample_value.store(sample_value, Ordering::Relaxed);
            self.shared
                .set_sample_value(sample_value, self.reset_period)
                .await;
            info!(from = local_value, to = sample_value, "recover sample value");
        }

        if sample_changed {
            for entry in self.node_memories.iter() {
                entry.value().lock().unwrap().reset();
            }
        }
    }

    pub fn start(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            let mut ticker = interval(Duration::from_secs(2));
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check_sample_value().await,
                    _ = stop.recv() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::config::SampleConfig;

    fn config() -> SampleConfig {
        SampleConfig {
            enable: true,
            min_sample: 1,
            init_sample: 16,
            max_sample: 20,
            reset_sample_period: 300,
        }
    }

    fn metric(node_ip: &str, ts: i64, memory: u64, limit: u64) -> SampleMetric {
        SampleMetric {
            node_ip: node_ip.to_string(),
            query_time: ts,
            memory,
            memory_limit: limit,
            cache_second: 100,
        }
    }

    #[tokio::test]
    async fn test_pressure_jumps_to_init_sample() {
        let shared = Arc::new(LocalCache::new(60));
        let sampler = MemorySampler::new(&config(), shared.clone()).await;
        assert_eq!(sampler.current_value(), 1);

        // Growing memory above the 0.8 line on every tick.
        for i in 0..6 {
            sampler.record_metric(&metric("n1", i + 1, 900 + (i as u64) * 30, 1000));
            sampler.check_sample_value().await;
        }
        // The first qualifying vote burst jumps straight to init_sample.
        assert_eq!(sampler.current_value(), 16);
        assert_eq!(shared.get_sample_value().await, 16);
    }

    #[tokio::test]
    async fn test_adopts_shared_value() {
        let shared = Arc::new(LocalCache::new(60));
        let sampler = MemorySampler::new(&config(), shared.clone()).await;
        shared.set_sample_value(7, 300).await;
        sampler.check_sample_value().await;
        assert_eq!(sampler.current_value(), 7);
    }

    #[tokio::test]
    async fn test_decay_respects_min_bound() {
        let shared = Arc::new(LocalCache::new(60));
        let sampler = MemorySampler::new(&config(), shared.clone()).await;
        // Expired recovery window decays toward min but never below it.
        shared.set_sample_value(1, -10).await;
        for _ in 0..3 {
            sampler.check_sample_value().await;
            assert!(sampler.current_value() >= 1);
            shared.set_sample_value(sampler.current_value(), -10).await;
        }
        assert_eq!(sampler.current_value(), 1);
    }

    #[tokio::test]
    async fn test_value_never_exceeds_max() {
        let shared = Arc::new(LocalCache::new(60));
        let sampler = MemorySampler::new(&config(), shared.clone()).await;
        shared.set_sample_value(20, 300).await;
        sampler.check_sample_value().await;
        assert_eq!(sampler.current_value(), 20);

        // At max_sample the growth path is disabled entirely.
        for i in 0..10 {
            sampler.record_metric(&metric("n1", i + 1, 990, 1000));
            sampler.check_sample_value().await;
            assert!(sampler.current_value() <= 20);
        }
    }
}
