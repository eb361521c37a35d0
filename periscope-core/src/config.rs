use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level YAML configuration. Every section is optional in the file and
/// falls back to its `Default` impl.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub sample: SampleConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub k8s: K8sConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub center_api_server: String,
    #[serde(default)]
    pub portal_address: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            grpc_port: default_grpc_port(),
            http_port: default_http_port(),
            center_api_server: String::new(),
            portal_address: String::new(),
        }
    }
}

fn default_grpc_port() -> u16 {
    29090
}

fn default_http_port() -> u16 {
    29091
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_min_sample")]
    pub min_sample: i64,
    #[serde(default = "default_init_sample")]
    pub init_sample: i64,
    #[serde(default = "default_max_sample")]
    pub max_sample: i64,
    /// Seconds without pressure reports before the sample value decays.
    #[serde(default = "default_reset_sample_period")]
    pub reset_sample_period: i64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            enable: false,
            min_sample: default_min_sample(),
            init_sample: default_init_sample(),
            max_sample: default_max_sample(),
            reset_sample_period: default_reset_sample_period(),
        }
    }
}

fn default_min_sample() -> i64 {
    1
}

fn default_init_sample() -> i64 {
    16
}

fn default_max_sample() -> i64 {
    100
}

fn default_reset_sample_period() -> i64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default = "default_traceid_cache_time")]
    pub traceid_cache_time: i64,
    #[serde(default)]
    pub open_window_sample: bool,
    #[serde(default = "default_window_sample_num")]
    pub window_sample_num: u32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            traceid_cache_time: default_traceid_cache_time(),
            open_window_sample: false,
            window_sample_num: default_window_sample_num(),
        }
    }
}

fn default_traceid_cache_time() -> i64 {
    30
}

fn default_window_sample_num() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub address: String,
    /// "prom" or "vm", decides the histogram range label.
    #[serde(default = "default_prom_storage")]
    pub storage: String,
    #[serde(default = "default_prom_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub latency_histogram_buckets: Vec<f64>,
    #[serde(default)]
    pub send_api: String,
    #[serde(default)]
    pub send_interval: u64,
    #[serde(default)]
    pub generate_client_metric: bool,
    #[serde(default)]
    pub client_metric_with_url: bool,
    #[serde(default)]
    pub open_api_metrics: bool,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            storage: default_prom_storage(),
            cache_size: default_prom_cache_size(),
            latency_histogram_buckets: Vec::new(),
            send_api: String::new(),
            send_interval: 0,
            generate_client_metric: false,
            client_metric_with_url: false,
            open_api_metrics: false,
        }
    }
}

impl PrometheusConfig {
    pub fn range_label(&self) -> &'static str {
        if self.storage == "prom" {
            "le"
        } else {
            "vmrange"
        }
    }
}

fn default_prom_storage() -> String {
    "prom".to_string()
}

fn default_prom_cache_size() -> usize {
    10000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub replication: bool,
    #[serde(default)]
    pub cluster: String,
    /// Data time-to-live in days, 0 means no TTL.
    #[serde(default)]
    pub ttl_days: u32,
    #[serde(default)]
    pub ttl_config: Vec<TtlConfig>,
    #[serde(default)]
    pub hash_config: Vec<HashConfig>,
    #[serde(default = "default_flush_seconds")]
    pub flush_seconds: u64,
    #[serde(default)]
    pub export_service_client: bool,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            database: default_database(),
            replication: false,
            cluster: String::new(),
            ttl_days: 0,
            ttl_config: Vec::new(),
            hash_config: Vec::new(),
            flush_seconds: default_flush_seconds(),
            export_service_client: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    pub tables: Vec<String>,
    pub ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    pub tables: Vec<String>,
    pub hash: String,
}

fn default_database() -> String {
    "periscope".to_string()
}

fn default_flush_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// Seconds to wait after the top span before a trace is notified ready.
    #[serde(default = "default_delay_duration")]
    pub delay_duration: i64,
    #[serde(default = "default_retry_duration")]
    pub retry_duration: i64,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    /// Secondary gate for traces whose top span was never collected.
    /// 0 disables miss-top handling entirely.
    #[serde(default)]
    pub miss_top_time: i64,
    /// Bucket width (seconds) for relationship de-duplication.
    #[serde(default = "default_topology_period")]
    pub topology_period: u64,
    /// Integer percent: minimum self/total ratio for a mutated candidate.
    #[serde(default = "default_ratio_threshold")]
    pub ratio_threshold: u64,
    #[serde(default = "default_segment_size")]
    pub segment_size: i64,
    #[serde(default = "default_mutate_node_mode")]
    pub mutate_node_mode: String,
    /// Base URL of the APM topology service. The wire key keeps the
    /// historical `trace_adress` spelling agents and charts already use.
    #[serde(default, alias = "trace_adress")]
    pub trace_address: String,
    #[serde(default = "default_apm_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub get_detail_types: Vec<String>,
    /// "" or "topUrl".
    #[serde(default)]
    pub http_parser: String,
    /// APM flavors whose agents flush on a long fixed period; their traces
    /// wait 60 s regardless of delay_duration.
    #[serde(default = "default_long_poll_apm_types")]
    pub long_poll_apm_types: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            delay_duration: default_delay_duration(),
            retry_duration: default_retry_duration(),
            retry_times: default_retry_times(),
            miss_top_time: 0,
            topology_period: default_topology_period(),
            ratio_threshold: default_ratio_threshold(),
            segment_size: default_segment_size(),
            mutate_node_mode: default_mutate_node_mode(),
            trace_address: String::new(),
            timeout: default_apm_timeout(),
            get_detail_types: Vec::new(),
            http_parser: String::new(),
            long_poll_apm_types: default_long_poll_apm_types(),
        }
    }
}

fn default_thread_count() -> usize {
    5
}

fn default_delay_duration() -> i64 {
    10
}

fn default_retry_duration() -> i64 {
    5
}

fn default_retry_times() -> u32 {
    3
}

fn default_topology_period() -> u64 {
    60
}

fn default_ratio_threshold() -> u64 {
    90
}

fn default_segment_size() -> i64 {
    40
}

fn default_mutate_node_mode() -> String {
    "leaf".to_string()
}

fn default_apm_timeout() -> u64 {
    30
}

fn default_long_poll_apm_types() -> Vec<String> {
    vec!["nbs3".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_expire_time")]
    pub expire_time: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: String::new(),
            password: String::new(),
            expire_time: default_expire_time(),
        }
    }
}

fn default_expire_time() -> i64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct K8sConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub api_type: String,
    /// Meta-server base URL. Deployments configure this under the
    /// historical `meta_server_config` key.
    #[serde(default, alias = "meta_server_config")]
    pub meta_server_address: String,
    #[serde(default = "default_k8s_fetch_interval")]
    pub fetch_interval: u64,
}

fn default_k8s_fetch_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file_content() {
        let config: Config = serde_yaml::from_str("receiver:\n  grpc_port: 19090\n").unwrap();
        assert_eq!(config.receiver.grpc_port, 19090);
        assert_eq!(config.receiver.http_port, 29091);
        assert_eq!(config.analyzer.thread_count, 5);
        assert_eq!(config.analyzer.retry_times, 3);
        assert_eq!(config.clickhouse.flush_seconds, 5);
        assert_eq!(config.redis.expire_time, 60);
        assert_eq!(config.analyzer.long_poll_apm_types, vec!["nbs3"]);
    }

    #[test]
    fn test_historical_wire_keys() {
        let yaml = r#"
analyzer:
  trace_adress: http://apm:8080
k8s:
  enable: true
  meta_server_config: http://meta-server:8081
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.analyzer.trace_address, "http://apm:8080");
        assert_eq!(config.k8s.meta_server_address, "http://meta-server:8081");

        // The corrected spellings stay accepted too.
        let yaml = r#"
analyzer:
  trace_address: http://apm:8080
k8s:
  meta_server_address: http://meta-server:8081
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.analyzer.trace_address, "http://apm:8080");
        assert_eq!(config.k8s.meta_server_address, "http://meta-server:8081");
    }

    #[test]
    fn test_full_sections() {
        let yaml = r#"
sample:
  enable: true
  min_sample: 2
  init_sample: 8
  max_sample: 64
  reset_sample_period: 120
analyzer:
  thread_count: 3
  delay_duration: 5
  miss_top_time: 10
  mutate_node_mode: chain
  http_parser: topUrl
clickhouse:
  endpoint: http://localhost:8123
  database: telemetry
  ttl_config:
    - tables: [span_trace]
      ttl: 3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.sample.enable);
        assert_eq!(config.sample.max_sample, 64);
        assert_eq!(config.analyzer.mutate_node_mode, "chain");
        assert_eq!(config.analyzer.http_parser, "topUrl");
        assert_eq!(config.clickhouse.ttl_config[0].tables, vec!["span_trace"]);
    }
}
