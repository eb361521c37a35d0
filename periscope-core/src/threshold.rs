use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::promql::PromClient;

pub const THRESHOLD_TYPE_P90: &str = "LatencyP90";
pub const THRESHOLD_RANGE_YESTERDAY: &str = "yesterday";
pub const THRESHOLD_RANGE_LAST_1H: &str = "last1h";
pub const THRESHOLD_RANGE_DEFAULT: &str = "default";

const DEFAULT_LATENCY_MULTIPLE: f64 = 1.1;
/// Fallback when a content key carries no latency objective at all.
const DEFAULT_THRESHOLD_NANOS: f64 = 500e6;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlowThreshold {
    pub url: String,
    /// Nanoseconds; already multiplied by the configured multiple.
    pub value: f64,
    pub threshold_type: String,
    pub range: String,
    pub multiple: f64,
    pub service_name: String,
    pub container_id: String,
}

/// One latency/availability objective pushed through the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SloConfig {
    #[serde(rename = "type")]
    pub slo_type: String,
    /// Milliseconds.
    pub expected_value: f64,
    #[serde(default = "default_multiple")]
    pub multiple: f64,
    #[serde(default)]
    pub source: String,
}

fn default_multiple() -> f64 {
    1.0
}

/// Lowest latency objective wins; availability objectives are skipped.
pub fn slow_threshold_from_slos(uri: &str, configs: &[SloConfig]) -> SlowThreshold {
    let mut threshold = SlowThreshold {
        url: uri.to_string(),
        value: f64::MAX,
        ..Default::default()
    };
    for config in configs {
        if !matches!(
            config.slo_type.as_str(),
            "LatencyP90" | "LatencyP95" | "LatencyP99"
        ) {
            continue;
        }
        if threshold.value > config.expected_value {
            threshold.value = config.expected_value;
            threshold.threshold_type = config.slo_type.clone();
            threshold.range = config.source.clone();
            threshold.multiple = config.multiple;
        }
    }
    if threshold.value == f64::MAX {
        threshold.value = DEFAULT_THRESHOLD_NANOS;
        threshold.threshold_type = THRESHOLD_TYPE_P90.to_string();
        threshold.range = THRESHOLD_RANGE_DEFAULT.to_string();
        threshold.multiple = 1.0;
    } else {
        // Objectives arrive in milliseconds.
        threshold.value *= 1e6;
    }
    threshold
}

/// Content-key keyed slow thresholds. The backing map is rebuilt from
/// Prometheus on a 5-minute cadence and swapped atomically; pushed SLO
/// configs override the computed values.
pub struct ThresholdCache {
    prom: PromClient,
    range_label: &'static str,
    snapshot: RwLock<Arc<HashMap<String, SlowThreshold>>>,
    overrides: DashMap<String, SlowThreshold>,
}

impl ThresholdCache {
    pub fn new(prom: PromClient, range_label: &'static str) -> ThresholdCache {
        ThresholdCache {
            prom,
            range_label,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            overrides: DashMap::new(),
        }
    }

    pub fn get(&self, content_key: &str) -> Option<SlowThreshold> {
        if let Some(threshold) = self.overrides.get(content_key) {
            return Some(threshold.clone());
        }
        self.snapshot.read().unwrap().get(content_key).cloned()
    }

    /// Everything currently served, overrides included.
    pub fn all(&self) -> Vec<SlowThreshold> {
        let snapshot = self.snapshot.read().unwrap().clone();
        let mut merged: HashMap<String, SlowThreshold> = (*snapshot).clone();
        for entry in self.overrides.iter() {
            merged.insert(entry.key().clone(), entry.value().clone());
        }
        merged.into_values().collect()
    }

    pub fn update_config(&self, threshold: SlowThreshold) {
        self.overrides.insert(threshold.url.clone(), threshold);
    }

    fn percentile_query(&self, duration: &str) -> String {
        format!(
            "histogram_quantile(0.9, sum by (content_key, {}) (rate(periscope_span_trace_duration_nanoseconds_bucket{{}}[{}])))",
            self.range_label, duration
        )
    }

    async fn query_thresholds(
        &self,
        duration: &str,
        range: &str,
        time: i64,
    ) -> HashMap<String, SlowThreshold> {
        let mut result = HashMap::new();
        match self.prom.query(&self.percentile_query(duration), time).await {
            Ok(samples) => {
                for sample in samples {
                    let Some(content_key) = sample.labels.get("content_key") else {
                        continue;
                    };
                    if sample.value > 0.0 {
                        result.insert(
                            content_key.clone(),
                            SlowThreshold {
                                url: content_key.clone(),
                                value: sample.value * DEFAULT_LATENCY_MULTIPLE,
                                threshold_type: THRESHOLD_TYPE_P90.to_string(),
                                range: range.to_string(),
                                multiple: DEFAULT_LATENCY_MULTIPLE,
                                ..Default::default()
                            },
                        );
                    }
                }
            }
            Err(err) => warn!(duration, %err, "threshold query failed"),
        }
        result
    }

    /// Builds a fresh map (yesterday's P90 first, the last hour filling the
    /// gaps) and swaps it in one assignment so readers always observe a
    /// consistent snapshot.
    pub async fn rebuild(&self) {
        let now = Utc::now();
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().timestamp())
            .unwrap_or_else(|| now.timestamp());

        let mut fresh = self
            .query_thresholds("24h", THRESHOLD_RANGE_YESTERDAY, midnight)
            .await;
        let last_hour = self
            .query_thresholds("1h", THRESHOLD_RANGE_LAST_1H, now.timestamp())
            .await;
        for (key, threshold) in last_hour {
            fresh.entry(key).or_insert(threshold);
        }
        let size = fresh.len();
        *self.snapshot.write().unwrap() = Arc::new(fresh);
        info!(size, "slow threshold map rebuilt");
    }

    pub fn start(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            self.rebuild().await;
            let mut ticker = interval(Duration::from_secs(300));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.rebuild().await,
                    _ = stop.recv() => return,
                }
            }
        });
    }
}
