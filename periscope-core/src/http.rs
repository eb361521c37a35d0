use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::analyzer::tree::{build_span_traces, convert_slow_tree, find_mutated_node, MutateMode};
use crate::analyzer::error_tree::convert_error_tree;
use crate::apm::ApmClient;
use crate::metrics::ReceiverMetrics;
use crate::storage::ColumnarWriter;
use crate::threshold::{slow_threshold_from_slos, SloConfig, ThresholdCache};

#[derive(Clone)]
pub struct HttpState {
    pub writer: Arc<ColumnarWriter>,
    pub apm: Arc<ApmClient>,
    pub thresholds: Arc<ThresholdCache>,
    pub metrics: Arc<ReceiverMetrics>,
    pub open_api_metrics: bool,
    pub ratio_threshold: u64,
    pub mutate_mode: MutateMode,
}

#[derive(Debug, Serialize)]
struct BasicResponse<T: Serialize> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> BasicResponse<T> {
    fn success(data: Option<T>) -> BasicResponse<T> {
        BasicResponse {
            status: "success",
            message: None,
            data,
        }
    }

    fn failure(message: String) -> BasicResponse<T> {
        BasicResponse {
            status: "failure",
            message: Some(message),
            data: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SloConfigRequest {
    #[serde(rename = "entryUri")]
    entry_uri: String,
    #[serde(rename = "sloConfigs", default)]
    slo_configs: Vec<SloConfig>,
}

pub fn router(state: HttpState) -> Router {
    let mut router = Router::new()
        .route("/config/slo", post(set_slo_config))
        .route("/debug/thresholds", get(get_thresholds))
        .route("/realtimereport/slow/:trace_id", get(realtime_slow_report))
        .route("/realtimereport/error/:trace_id", get(realtime_error_report));
    if state.open_api_metrics {
        router = router.route("/metrics", get(get_prom_metrics));
    }
    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

pub async fn serve_http(
    port: u16,
    state: HttpState,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut stop = shutdown.subscribe();
    info!(%addr, "start http server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
            info!("shutting down http server");
        })
        .await?;
    Ok(())
}

async fn set_slo_config(
    State(state): State<HttpState>,
    Json(request): Json<SloConfigRequest>,
) -> Json<BasicResponse<()>> {
    info!(entry_uri = request.entry_uri, "update slo config");
    let threshold = slow_threshold_from_slos(&request.entry_uri, &request.slo_configs);
    state.thresholds.update_config(threshold);
    Json(BasicResponse::success(None))
}

async fn get_thresholds(
    State(state): State<HttpState>,
) -> Json<BasicResponse<Vec<crate::threshold::SlowThreshold>>> {
    Json(BasicResponse::success(Some(state.thresholds.all())))
}

async fn realtime_slow_report(
    State(state): State<HttpState>,
    Path(trace_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match build_realtime_slow(&state, &trace_id).await {
        Ok(data) => (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "data": data})),
        ),
        Err(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "errorMsg": message})),
        ),
    }
}

async fn build_realtime_slow(
    state: &HttpState,
    trace_id: &str,
) -> Result<serde_json::Value, String> {
    let traces = state
        .writer
        .query_traces(trace_id)
        .await
        .map_err(|err| err.to_string())?;
    let entry = traces
        .query_trace()
        .ok_or_else(|| format!("trace {trace_id} is not found in span storage"))?;
    let services = state
        .apm
        .query_services(
            &entry.labels.apm_type,
            trace_id,
            entry.labels.start_time / 1_000_000,
        )
        .await
        .map_err(|err| err.to_string())?;
    let trees: Vec<serde_json::Value> = build_span_traces(&services, &traces)
        .iter()
        .map(|span_trace| {
            let mut tree = convert_slow_tree(span_trace, &traces);
            // Best effort: an unmutated tree is still worth rendering.
            let _ = find_mutated_node(&mut tree, state.ratio_threshold, state.mutate_mode);
            serde_json::to_value(&tree.root).unwrap_or(serde_json::Value::Null)
        })
        .collect();
    Ok(serde_json::Value::Array(trees))
}

async fn realtime_error_report(
    State(state): State<HttpState>,
    Path(trace_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match build_realtime_error(&state, &trace_id).await {
        Ok(data) => (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "data": data})),
        ),
        Err(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "errorMsg": message})),
        ),
    }
}

async fn build_realtime_error(
    state: &HttpState,
    trace_id: &str,
) -> Result<serde_json::Value, String> {
    let traces = state
        .writer
        .query_traces(trace_id)
        .await
        .map_err(|err| err.to_string())?;
    let entry = traces
        .query_trace()
        .ok_or_else(|| format!("trace {trace_id} is not found in span storage"))?;
    let services = state
        .apm
        .query_services(
            &entry.labels.apm_type,
            trace_id,
            entry.labels.start_time / 1_000_000,
        )
        .await
        .map_err(|err| err.to_string())?;
    let trees: Vec<serde_json::Value> = build_span_traces(&services, &traces)
        .iter()
        .map(|span_trace| {
            let tree = convert_error_tree(span_trace, &traces);
            serde_json::to_value(&tree.root).unwrap_or(serde_json::Value::Null)
        })
        .collect();
    Ok(serde_json::Value::Array(trees))
}

async fn get_prom_metrics(State(state): State<HttpState>) -> String {
    state.metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slo_request_shape() {
        let body = r#"{
            "entryUri": "/api/orders",
            "sloConfigs": [
                {"type": "LatencyP90", "expected_value": 250.0, "multiple": 1.2, "source": "constant"}
            ]
        }"#;
        let request: SloConfigRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.entry_uri, "/api/orders");
        assert_eq!(request.slo_configs.len(), 1);
        let threshold = slow_threshold_from_slos(&request.entry_uri, &request.slo_configs);
        assert_eq!(threshold.value, 250.0 * 1e6);
    }
}
