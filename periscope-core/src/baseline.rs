use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{Datelike, Utc};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::promql::PromClient;

pub const CPU_TYPES: [&str; 8] = [
    "cpu", "file", "net", "futex", "idle", "other", "epoll", "runq",
];

const RUNQ_SLOT: usize = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaselineValues(pub [u64; 8]);

impl BaselineValues {
    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub service_name: String,
    pub content_key: String,
}

type BaselineMap = HashMap<MetricKey, BaselineValues>;

/// P90 baselines of the 8-slot on/off vector per (service, content key),
/// one map for yesterday and one for the trailing hour. A trace's measured
/// vector is diffed against the baseline to derive its dominant wait type.
pub struct BaselineCache {
    prom: PromClient,
    range_label: &'static str,
    yesterday: RwLock<Arc<BaselineMap>>,
    last_hour: RwLock<Arc<BaselineMap>>,
}

impl BaselineCache {
    pub fn new(prom: PromClient, range_label: &'static str) -> BaselineCache {
        BaselineCache {
            prom,
            range_label,
            yesterday: RwLock::new(Arc::new(HashMap::new())),
            last_hour: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: &MetricKey) -> Option<(BaselineValues, &'static str)> {
        let yesterday = self.yesterday.read().unwrap().clone();
        let last_hour = self.last_hour.read().unwrap().clone();
        if let Some(values) = yesterday.get(key) {
            return Some((*values, "24h"));
        }
        if let Some(values) = last_hour.get(key) {
            return Some((*values, "1h"));
        }
        // Content keys shared by several services fall back to the
        // service-less aggregation.
        let fallback = MetricKey {
            service_name: String::new(),
            content_key: key.content_key.clone(),
        };
        if let Some(values) = yesterday.get(&fallback) {
            return Some((*values, "24h"));
        }
        last_hour.get(&fallback).map(|values| (*values, "1h"))
    }

    /// (mutated cpu type, baseline csv, baseline range) for a measured
    /// vector; the dominant slot is the one furthest above its baseline,
    /// runq only flips the type without competing on magnitude.
    pub fn calc_mutated_type(&self, key: &MetricKey, values_csv: &str) -> (String, String, String) {
        let baseline = self.get(key);
        let (base_values, range) = match baseline {
            Some((values, range)) => (values, range),
            None => (BaselineValues::default(), "unknown"),
        };
        let measured: Vec<u64> = values_csv
            .split(',')
            .map(|v| v.trim().parse().unwrap_or(0))
            .collect();

        let mut mutated_index: isize = -1;
        let mut mutated_value: u64 = 0;
        for i in 0..RUNQ_SLOT {
            let value = measured.get(i).copied().unwrap_or(0);
            if value == 0 {
                continue;
            }
            let base = base_values.0[i];
            if value > base && (mutated_value == 0 || mutated_value < value - base) {
                mutated_value = value - base;
                mutated_index = i as isize;
            }
        }
        let runq = measured.get(RUNQ_SLOT).copied().unwrap_or(0);
        if runq > 0 {
            let base = base_values.0[RUNQ_SLOT];
            if runq > base && (mutated_value == 0 || mutated_value < runq - base) {
                mutated_index = RUNQ_SLOT as isize;
            }
        }

        let mutated_type = if mutated_index >= 0 {
            CPU_TYPES[mutated_index as usize].to_string()
        } else {
            "unknown".to_string()
        };
        let base_csv = if baseline.is_some() {
            base_values.to_csv()
        } else {
            String::new()
        };
        (mutated_type, base_csv, range.to_string())
    }

    fn baseline_query(&self, cpu_type: &str, duration: &str) -> String {
        format!(
            "histogram_quantile(0.9, sum by (content_key, service_name, {}) (rate(periscope_onoff_metric_duration_nanoseconds_bucket{{cpu_type=\"{}\"}}[{}])))",
            self.range_label, cpu_type, duration
        )
    }

    async fn query_baselines(&self, duration: &str, time: i64) -> BaselineMap {
        let mut result: BaselineMap = HashMap::new();
        for (slot, cpu_type) in CPU_TYPES.iter().enumerate() {
            match self
                .prom
                .query(&self.baseline_query(cpu_type, duration), time)
                .await
            {
                Ok(samples) => {
                    for sample in samples {
                        let Some(content_key) = sample.labels.get("content_key") else {
                            continue;
                        };
                        let key = MetricKey {
                            service_name: sample
                                .labels
                                .get("service_name")
                                .cloned()
                                .unwrap_or_default(),
                            content_key: content_key.clone(),
                        };
                        if sample.value > 0.0 {
                            result.entry(key).or_default().0[slot] = sample.value as u64;
                        }
                    }
                }
                Err(err) => warn!(cpu_type, duration, %err, "baseline query failed"),
            }
        }
        result
    }

    pub async fn rebuild_yesterday(&self) {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().timestamp())
            .unwrap_or_else(|| Utc::now().timestamp());
        let fresh = self.query_baselines("24h", midnight).await;
        info!(size = fresh.len(), "daily on/off baselines rebuilt");
        *self.yesterday.write().unwrap() = Arc::new(fresh);
    }

    pub async fn rebuild_last_hour(&self) {
        let fresh = self.query_baselines("1h", Utc::now().timestamp()).await;
        info!(size = fresh.len(), "hourly on/off baselines rebuilt");
        *self.last_hour.write().unwrap() = Arc::new(fresh);
    }

    pub fn start(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            self.rebuild_yesterday().await;
            self.rebuild_last_hour().await;
            let mut current_day = Utc::now().day();
            let mut ticker = interval(Duration::from_secs(3600));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let day = Utc::now().day();
                        if day != current_day {
                            current_day = day;
                            self.rebuild_yesterday().await;
                        }
                        self.rebuild_last_hour().await;
                    }
                    _ = stop.recv() => return,
                }
            }
        });
    }

    #[cfg(test)]
    fn set_yesterday(&self, map: BaselineMap) {
        *self.yesterday.write().unwrap() = Arc::new(map);
    }
}
