use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::broadcast;

pub mod analyzer;
pub mod apm;
pub mod baseline;
pub mod cache;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod grpc;
pub mod http;
pub mod k8s;
pub mod metrics;
pub mod model;
pub mod profile;
pub mod promql;
pub mod sampler;
pub mod storage;
pub mod threshold;

pub use config::Config;
pub use error::ReceiverError;

pub const PERISCOPE_VERSION: &str = "0.1.0";

/// Default root of the on-disk eBPF object cache.
pub const EBPF_OBJECT_ROOT: &str = "/opt";

/// All process-wide components wired together. Nothing here is a global:
/// every consumer receives the handles it needs explicitly.
pub struct ServiceContext {
    pub config: Config,
    pub shared: Arc<dyn cache::SharedCache>,
    pub writer: Arc<storage::ColumnarWriter>,
    pub apm: Arc<apm::ApmClient>,
    pub thresholds: Arc<threshold::ThresholdCache>,
    pub baseline: Arc<baseline::BaselineCache>,
    pub k8s: Arc<k8s::K8sMetadata>,
    pub profile: Arc<profile::ProfileCenter>,
    pub sampler: Arc<sampler::MemorySampler>,
    pub analyzer: Arc<analyzer::ReportAnalyzer>,
    pub metrics: Arc<metrics::ReceiverMetrics>,
    pub ebpf: Arc<ebpf::EbpfFileServer>,
    pub shutdown: broadcast::Sender<()>,
}

impl ServiceContext {
    pub async fn build(config: Config) -> anyhow::Result<ServiceContext> {
        if config.prometheus.generate_client_metric
            && config.prometheus.storage == "prom"
            && config.prometheus.latency_histogram_buckets.is_empty()
        {
            anyhow::bail!("missing latency_histogram_buckets for prometheus client metrics");
        }

        let (shutdown, _) = broadcast::channel(1);

        let shared: Arc<dyn cache::SharedCache> = if config.redis.enable {
            Arc::new(
                cache::RedisCache::connect(
                    &config.redis.address,
                    &config.redis.password,
                    config.redis.expire_time,
                )
                .await?,
            )
        } else {
            Arc::new(cache::LocalCache::new(config.redis.expire_time))
        };

        let writer = Arc::new(storage::ColumnarWriter::connect(&config.clickhouse).await?);
        let apm = Arc::new(apm::ApmClient::new(
            &config.analyzer.trace_address,
            config.analyzer.timeout,
            config.analyzer.get_detail_types.clone(),
        )?);

        let range_label = config.prometheus.range_label();
        let thresholds = Arc::new(threshold::ThresholdCache::new(
            promql::PromClient::new(&config.prometheus.address)?,
            range_label,
        ));
        let baseline = Arc::new(baseline::BaselineCache::new(
            promql::PromClient::new(&config.prometheus.address)?,
            range_label,
        ));
        let k8s = Arc::new(k8s::K8sMetadata::new(&config.k8s));
        let profile = Arc::new(profile::ProfileCenter::new(&config.profile, shared.clone()));
        let sampler = Arc::new(sampler::MemorySampler::new(&config.sample, shared.clone()).await);
        let analyzer = Arc::new(analyzer::ReportAnalyzer::new(
            &config.analyzer,
            shared.clone(),
            writer.clone(),
            apm.clone(),
            profile.signals.clone(),
            baseline.clone(),
            k8s.clone(),
            config.prometheus.generate_client_metric,
        )?);
        let ebpf = Arc::new(ebpf::EbpfFileServer::new(
            &config.receiver.center_api_server,
            EBPF_OBJECT_ROOT,
        ));

        Ok(ServiceContext {
            config,
            shared,
            writer,
            apm,
            thresholds,
            baseline,
            k8s,
            profile,
            sampler,
            analyzer,
            metrics: Arc::new(metrics::ReceiverMetrics::new()),
            ebpf,
            shutdown,
        })
    }

    /// Spawns every background component. The servers are started separately
    /// by the binary so it can wait on them.
    pub async fn start(&self) {
        self.shared.clone().start(self.shutdown.clone()).await;
        self.writer.clone().start(self.shutdown.clone()).await;
        self.thresholds.clone().start(self.shutdown.clone());
        self.baseline.clone().start(self.shutdown.clone());
        self.k8s.clone().start(self.shutdown.clone());
        self.profile.start(self.writer.clone(), self.shutdown.clone());
        if self.config.sample.enable {
            self.sampler.clone().start(self.shutdown.clone());
        }
        self.analyzer.clone().start(self.shutdown.clone());
        tracing::info!("periscope receiver components started");
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn grpc_services(&self) -> grpc::GrpcServices {
        grpc::GrpcServices {
            analyzer: self.analyzer.clone(),
            writer: self.writer.clone(),
            profile: self.profile.clone(),
            sampler: self.sampler.clone(),
            sample_enable: self.config.sample.enable,
            thresholds: self.thresholds.clone(),
            ebpf: self.ebpf.clone(),
        }
    }

    pub fn http_state(&self) -> anyhow::Result<http::HttpState> {
        Ok(http::HttpState {
            writer: self.writer.clone(),
            apm: self.apm.clone(),
            thresholds: self.thresholds.clone(),
            metrics: self.metrics.clone(),
            open_api_metrics: self.config.prometheus.open_api_metrics,
            ratio_threshold: self.config.analyzer.ratio_threshold,
            mutate_mode: analyzer::tree::MutateMode::from_str(
                &self.config.analyzer.mutate_node_mode,
            )?,
        })
    }
}
