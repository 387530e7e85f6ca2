//! Upstream range fetching

use crate::error::{RelayError, Result};
use crate::models::{ByteRange, SourceDescriptor};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client for the upstream audio host
#[derive(Clone)]
pub struct UpstreamClient {
    http_client: Client,
}

impl UpstreamClient {
    /// Create a client with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RelayError::InternalError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(UpstreamClient { http_client })
    }

    /// Build a Range request carrying the descriptor's required headers
    fn build_range_request(
        &self,
        descriptor: &SourceDescriptor,
        range: &ByteRange,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http_client.get(&descriptor.source_url);
        for (name, value) in &descriptor.upstream_headers {
            // The Range header is always ours
            if name.eq_ignore_ascii_case("range") {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        request.header("Range", range.to_header())
    }

    /// Fetch `range` of the resource
    ///
    /// # Returns
    /// * `Ok(Response)` for 200 or 206; the body has not been read yet
    /// * `Err(UpstreamForbidden)` for 401/403 (expired link)
    /// * `Err(UpstreamStatus)` for any other status
    /// * `Err(UpstreamTransport)` if the request could not be sent
    pub async fn fetch_range(
        &self,
        descriptor: &SourceDescriptor,
        range: &ByteRange,
    ) -> Result<reqwest::Response> {
        debug!("Upstream fetch: range={}-{}", range.start, range.end);

        let response = self
            .build_range_request(descriptor, range)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    "Upstream request failed: range={}-{} error={}",
                    range.start, range.end, e
                );
                RelayError::UpstreamTransport(e.to_string())
            })?;

        let status = response.status().as_u16();
        match status {
            200 | 206 => Ok(response),
            _ => {
                warn!(
                    "Upstream returned status={} for range={}-{}",
                    status, range.start, range.end
                );
                Err(RelayError::from_upstream_status(status))
            }
        }
    }
}
