use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::apm::model::{OtelServiceNode, OtelSpan};
use crate::error::ReceiverError;

/// Client for the APM upstream topology service. Failures here are always
/// transient from the analyzer's point of view and map to retryable errors.
pub struct ApmClient {
    client: reqwest::Client,
    base_url: String,
    get_detail_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ServicesResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<OtelServiceNode>,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct DetailSpansResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<OtelSpan>,
    #[serde(default)]
    error_msg: String,
}

impl ApmClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout_secs: u64,
        get_detail_types: Vec<String>,
    ) -> Result<ApmClient, ReceiverError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()?;
        Ok(ApmClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            get_detail_types,
        })
    }

    /// Fetch the service-node forest for a trace. `start_time_ms` narrows the
    /// upstream index scan to the right time slice.
    pub async fn query_services(
        &self,
        apm_type: &str,
        trace_id: &str,
        start_time_ms: u64,
    ) -> Result<Vec<OtelServiceNode>, ReceiverError> {
        let url = format!(
            "{}/trace/services?apmType={}&traceId={}&startTime={}",
            self.base_url, apm_type, trace_id, start_time_ms
        );
        debug!(trace_id, apm_type, "query apm services");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ReceiverError::ApmUpstream(e.to_string()))?;
        let body: ServicesResponse = response
            .json()
            .await
            .map_err(|e| ReceiverError::ApmUpstream(e.to_string()))?;
        if !body.success {
            return Err(ReceiverError::ApmUpstream(body.error_msg));
        }
        Ok(body.data)
    }

    /// APM flavors that index span details separately need a second fetch to
    /// attach client calls and exceptions.
    pub fn need_get_detail_span(&self, apm_type: &str) -> bool {
        self.get_detail_types.iter().any(|t| t == apm_type)
    }

    /// Pull the detail spans of one service node and merge them in place.
    pub async fn fill_detail_spans(
        &self,
        apm_type: &str,
        trace_id: &str,
        node: &mut OtelServiceNode,
    ) -> Result<(), ReceiverError> {
        let Some(entry) = node.entry_span() else {
            return Ok(());
        };
        let url = format!(
            "{}/trace/spans?apmType={}&traceId={}&spanId={}",
            self.base_url, apm_type, trace_id, entry.span_id
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ReceiverError::ApmUpstream(e.to_string()))?;
        let body: DetailSpansResponse = response
            .json()
            .await
            .map_err(|e| ReceiverError::ApmUpstream(e.to_string()))?;
        if !body.success {
            return Err(ReceiverError::ApmUpstream(body.error_msg));
        }
        for span in body.data {
            match span.kind {
                crate::apm::model::SpanKind::Server => node.entry_spans.push(span),
                _ => node.exit_spans.push(span),
            }
        }
        Ok(())
    }
}
