//! HTTP health probe for vector stores and external APIs.

use super::probe::{ProbeError, ProbeReport, ResourceProbe};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECONDS: f64 = 5.0;

#[derive(Debug, Deserialize)]
struct HttpProbeConfig {
    url: String,
    #[serde(default)]
    health_path: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<f64>,
}

impl HttpProbeConfig {
    fn endpoint(&self) -> String {
        match &self.health_path {
            Some(path) => format!(
                "{}/{}",
                self.url.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            None => self.url.clone(),
        }
    }

    fn timeout(&self) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        Duration::from_secs_f64(seconds.max(0.001))
    }
}

/// Probes a resource with an HTTP `GET`.
///
/// A 2xx response is healthy. Any other response, or a timeout, is degraded.
/// A connection failure is unavailable. Reads `url`, `health_path` and
/// `timeout_seconds` from the resource config.
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Creates a probe with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a probe sharing an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceProbe for HttpProbe {
    async fn check(&self, config: &serde_json::Value) -> Result<ProbeReport, ProbeError> {
        let config = HttpProbeConfig::deserialize(config)
            .map_err(|e| ProbeError::InvalidConfig(e.to_string()))?;
        let endpoint = config.endpoint();

        match self.client.get(&endpoint).timeout(config.timeout()).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(endpoint = %endpoint, "Health check passed");
                Ok(ProbeReport::healthy().with_details(serde_json::json!({
                    "endpoint": endpoint,
                    "status_code": response.status().as_u16(),
                })))
            }
            Ok(response) => {
                warn!(endpoint = %endpoint, status = %response.status(), "Health check failed");
                Ok(ProbeReport::degraded(format!("HTTP {}", response.status())))
            }
            Err(e) if e.is_timeout() => Ok(ProbeReport::degraded(format!(
                "timed out after {:?}",
                config.timeout()
            ))),
            Err(e) => Ok(ProbeReport::unavailable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceStatus;
    use serde_json::json;

    #[test]
    fn test_endpoint_joins_health_path() {
        let config: HttpProbeConfig =
            serde_json::from_value(json!({"url": "http://localhost:6333/", "health_path": "/healthz"}))
                .unwrap();
        assert_eq!(config.endpoint(), "http://localhost:6333/healthz");
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_url_is_invalid_config() {
        let err = HttpProbe::new().check(&json!({})).await.unwrap_err();
        assert!(matches!(err, ProbeError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_not_healthy() {
        let report = HttpProbe::new()
            .check(&json!({"url": "http://127.0.0.1:9", "timeout_seconds": 1}))
            .await
            .unwrap();
        assert!(report.status.needs_recovery());
        assert_ne!(report.status, ResourceStatus::Healthy);
    }
}
