// Liveness probing of custodian nodes via `GET {base}/health`.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Body a custodian returns from its health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(default = "default_accepting")]
    pub accepting_blobs: bool,
}

fn default_accepting() -> bool {
    true
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Returns Ok only when the node at `base_url` answered its health check.
    async fn check(&self, base_url: &str) -> Result<HealthResponse>;
}

pub struct HttpLivenessProbe {
    client: Client,
}

impl HttpLivenessProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn check(&self, base_url: &str) -> Result<HealthResponse> {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            debug!("health probe url={} status={}", url, status.as_u16());
            return Err(anyhow!("health check failed: HTTP {}", status.as_u16()));
        }
        // A node that answers 2xx without a JSON body is still accepting.
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body).unwrap_or(HealthResponse {
            accepting_blobs: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_defaults_to_accepting() {
        let parsed: HealthResponse = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert!(parsed.accepting_blobs);
        let parsed: HealthResponse =
            serde_json::from_str(r#"{"accepting_blobs":false}"#).unwrap();
        assert!(!parsed.accepting_blobs);
    }
}
