use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{SharedCache, TraceIdSubscriber};

struct TraceIdTime {
    index: i64,
    expire_time: i64,
}

/// Windowed cache of recently sampled trace ids for one report class.
/// Agents poll with their last seen index; ids inside `(start, end]` that
/// the agent has not acknowledged are handed back.
pub struct TraceIdCache {
    name: &'static str,
    timeout_nanos: i64,
    trace_ids: DashMap<String, TraceIdTime>,
    shared: Arc<dyn SharedCache>,
}

impl TraceIdCache {
    pub fn new(name: &'static str, timeout_secs: i64, shared: Arc<dyn SharedCache>) -> TraceIdCache {
        TraceIdCache {
            name,
            timeout_nanos: timeout_secs * 1_000_000_000,
            trace_ids: DashMap::new(),
            shared,
        }
    }

    pub fn clean_expired(&self, now_nanos: i64) {
        self.trace_ids
            .retain(|_, time| now_nanos <= time.expire_time);
    }

    pub fn get_trace_ids(
        &self,
        ignore: &HashSet<String>,
        start_index: i64,
        end_index: i64,
    ) -> Vec<String> {
        if end_index == -1 || start_index == end_index {
            return Vec::new();
        }
        self.trace_ids
            .iter()
            .filter(|entry| {
                let time = entry.value();
                time.index > start_index
                    && time.index <= end_index
                    && !ignore.contains(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.trace_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace_ids.is_empty()
    }
}

#[async_trait]
impl TraceIdSubscriber for TraceIdCache {
    async fn consume(&self, trace_id: String) {
        if self.trace_ids.contains_key(&trace_id) {
            return;
        }
        let index = self.shared.incr_trace_index().await;
        if index > 0 {
            tracing::debug!(name = self.name, trace_id, "window sampled trace id");
            self.trace_ids.insert(
                trace_id,
                TraceIdTime {
                    index,
                    expire_time: chrono::Utc::now()
                        .timestamp_nanos_opt()
                        .unwrap_or(i64::MAX)
                        .saturating_add(self.timeout_nanos),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;

    #[tokio::test]
    async fn test_window_and_ack() {
        let shared = Arc::new(LocalCache::new(60));
        let cache = TraceIdCache::new("Slow", 30, shared.clone());

        let start = shared.get_trace_index().await;
        cache.consume("t1".to_string()).await;
        cache.consume("t2".to_string()).await;
        cache.consume("t2".to_string()).await;
        assert_eq!(cache.len(), 2);

        let end = shared.get_trace_index().await;
        let mut ignore = HashSet::new();
        ignore.insert("t1".to_string());
        let ids = cache.get_trace_ids(&ignore, start, end);
        assert_eq!(ids, vec!["t2".to_string()]);

        // A closed or unknown window returns nothing.
        assert!(cache.get_trace_ids(&HashSet::new(), end, end).is_empty());
        assert!(cache.get_trace_ids(&HashSet::new(), start, -1).is_empty());
    }

    #[tokio::test]
    async fn test_clean_expired() {
        let shared = Arc::new(LocalCache::new(60));
        let cache = TraceIdCache::new("Error", 30, shared);
        cache.consume("t1".to_string()).await;
        assert!(!cache.is_empty());
        let far_future = chrono::Utc::now().timestamp_nanos_opt().unwrap() + 60_000_000_000;
        cache.clean_expired(far_future);
        assert!(cache.is_empty());
    }
}
