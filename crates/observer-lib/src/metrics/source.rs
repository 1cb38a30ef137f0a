//! Where scrape bodies come from

use crate::error::CollectorError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Default per-request scrape timeout
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies raw text-exposition bodies
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch(&self) -> Result<String, CollectorError>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Scrapes an HTTP(S) metrics endpoint
pub struct HttpMetricsSource {
    client: Client,
    url: Url,
}

impl HttpMetricsSource {
    /// Validate the endpoint and build the HTTP client
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CollectorError> {
        let url = Url::parse(endpoint)
            .map_err(|e| CollectorError::Config(format!("invalid metrics endpoint {}: {}", endpoint, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(CollectorError::Config(format!(
                "metrics endpoint must use http or https, got {}",
                url.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectorError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch(&self) -> Result<String, CollectorError> {
        let response = self
            .client
            .get(self.url.clone())
            .header("Accept", "text/plain; version=0.0.4")
            .send()
            .await?
            .error_for_status()?;

        Ok(response.text().await?)
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_endpoints() {
        assert!(matches!(
            HttpMetricsSource::new("not a url", DEFAULT_SCRAPE_TIMEOUT),
            Err(CollectorError::Config(_))
        ));
        assert!(matches!(
            HttpMetricsSource::new("ftp://metrics.local/metrics", DEFAULT_SCRAPE_TIMEOUT),
            Err(CollectorError::Config(_))
        ));
    }

    #[test]
    fn test_accepts_http_endpoint() {
        let source =
            HttpMetricsSource::new("http://controller.tekton-pipelines:9090/metrics", DEFAULT_SCRAPE_TIMEOUT)
                .unwrap();
        assert_eq!(source.describe(), "http://controller.tekton-pipelines:9090/metrics");
    }
}
