use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::config::K8sConfig;
use crate::model::Trace;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodMeta {
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub pod_ip: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub workload_name: String,
    #[serde(default)]
    pub workload_kind: String,
    #[serde(default)]
    pub container_ids: Vec<String>,
}

/// Container-id index over the pod metadata snapshot pulled from the meta
/// server. Lookups are local; the snapshot refreshes in the background.
pub struct K8sMetadata {
    enable: bool,
    meta_server_address: String,
    fetch_interval: u64,
    containers: DashMap<String, PodMeta>,
    client: reqwest::Client,
}

impl K8sMetadata {
    pub fn new(cfg: &K8sConfig) -> K8sMetadata {
        K8sMetadata {
            enable: cfg.enable && !cfg.meta_server_address.is_empty(),
            meta_server_address: cfg.meta_server_address.trim_end_matches('/').to_string(),
            fetch_interval: cfg.fetch_interval.max(5),
            containers: DashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn get_pod_by_container_id(&self, container_id: &str) -> Option<PodMeta> {
        self.containers.get(container_id).map(|meta| meta.clone())
    }

    /// Fills pod metadata on a freshly ingested trace. Returns true when the
    /// trace was rewritten and its serialization must be regenerated.
    pub fn fill_span_trace(&self, trace: &mut Trace) -> bool {
        if trace.labels.container_id.is_empty() || !trace.pod_name.is_empty() {
            return false;
        }
        let Some(pod) = self.get_pod_by_container_id(&trace.labels.container_id) else {
            return false;
        };
        trace.pod_name = pod.pod_name;
        trace.pod_ip = pod.pod_ip;
        trace.namespace = pod.namespace;
        trace.workload_name = pod.workload_name;
        trace.workload_kind = pod.workload_kind;
        true
    }

    async fn refresh(&self) {
        let url = format!("{}/api/v1/pods", self.meta_server_address);
        let pods: Vec<PodMeta> = match self.client.get(&url).send().await {
            Ok(response) => match response.json().await {
                Ok(pods) => pods,
                Err(err) => {
                    warn!(%err, "parse pod metadata failed");
                    return;
                }
            },
            Err(err) => {
                warn!(%err, "fetch pod metadata failed");
                return;
            }
        };
        self.containers.clear();
        for pod in pods {
            for container_id in &pod.container_ids {
                self.containers.insert(container_id.clone(), pod.clone());
            }
        }
        debug!(containers = self.containers.len(), "pod metadata refreshed");
    }

    pub fn start(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        if !self.enable {
            return;
        }
        tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            let mut ticker = interval(Duration::from_secs(self.fetch_interval));
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.refresh().await,
                    _ = stop.recv() => return,
                }
            }
        });
    }

    #[cfg(test)]
    pub fn insert_for_test(&self, container_id: &str, pod: PodMeta) {
        self.containers.insert(container_id.to_string(), pod);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TraceLabels;

    #[test]
    fn test_fill_span_trace() {
        let meta = K8sMetadata::new(&K8sConfig::default());
        meta.insert_for_test(
            "c-1",
            PodMeta {
                pod_name: "api-6d9c".to_string(),
                pod_ip: "10.1.2.3".to_string(),
                namespace: "prod".to_string(),
                workload_name: "api".to_string(),
                workload_kind: "Deployment".to_string(),
                container_ids: vec!["c-1".to_string()],
            },
        );

        let mut trace = Trace {
            labels: TraceLabels {
                container_id: "c-1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(meta.fill_span_trace(&mut trace));
        assert_eq!(trace.pod_name, "api-6d9c");
        assert_eq!(trace.workload_kind, "Deployment");

        // Already filled or unknown containers pass through untouched.
        assert!(!meta.fill_span_trace(&mut trace));
        let mut unknown = Trace::default();
        unknown.labels.container_id = "c-2".to_string();
        assert!(!meta.fill_span_trace(&mut unknown));
    }
}
