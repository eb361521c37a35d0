use std::collections::HashMap;

use serde::Deserialize;

use crate::error::ReceiverError;

/// Minimal Prometheus instant-query client; both the slow-threshold cache
/// and the on/off baseline cache build their snapshots from it.
pub struct PromClient {
    client: reqwest::Client,
    address: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: QueryData,
}

#[derive(Debug, Default, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySample>,
}

#[derive(Debug, Deserialize)]
struct QuerySample {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    value: (f64, String),
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl PromClient {
    pub fn new(address: impl Into<String>) -> Result<PromClient, ReceiverError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(PromClient {
            client,
            address: address.into().trim_end_matches('/').to_string(),
        })
    }

    /// Instant query evaluated at `time` (unix seconds).
    pub async fn query(&self, query: &str, time: i64) -> Result<Vec<Sample>, ReceiverError> {
        let url = format!("{}/api/v1/query", self.address);
        let response = self
            .client
            .get(&url)
            .query(&[("query", query), ("time", &time.to_string())])
            .send()
            .await?;
        let body: QueryResponse = response.json().await?;
        if body.status != "success" {
            return Err(ReceiverError::Other(format!(
                "prometheus query failed: {}",
                body.status
            )));
        }
        Ok(body
            .data
            .result
            .into_iter()
            .filter_map(|sample| {
                let value: f64 = sample.value.1.parse().ok()?;
                Some(Sample {
                    labels: sample.metric,
                    value,
                })
            })
            .collect())
    }
}
