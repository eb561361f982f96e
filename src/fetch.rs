//! Remote dependency fetching with an origin allowlist.
//!
//! Security model:
//! - Only URLs matching allowed origins can be fetched
//! - Redirects only followed if they stay within the same origin
//! - Every request is bounded by the configured timeout

use std::time::Duration;

use anyhow::{anyhow, Error};
use reqwest::Client;
use url::Url;

/// Upper bound on same-origin redirect hops.
const MAX_REDIRECTS: usize = 10;

/// Configuration for the fetch allowlist
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://cdn.example.com")
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
    /// Per-request timeout in milliseconds (None = unlimited)
    pub timeout_ms: Option<u64>,
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.allowed_origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| {
            // Exact origin match
            origin == *allowed
        })
    }
}

/// Fetches http(s) dependencies as text.
pub struct RemoteFetcher {
    config: FetchConfig,
    client: Client,
}

impl RemoteFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let mut builder = Client::builder()
            // Don't follow redirects automatically - we'll handle them manually
            .redirect(reqwest::redirect::Policy::none());
        if let Some(ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let client = builder
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { config, client })
    }

    /// Fetch `url`, following same-origin redirects.
    pub async fn fetch(&self, url: &Url) -> Result<String, Error> {
        if !self.config.is_origin_allowed(url) {
            tracing::debug!(%url, "remote fetch blocked by allowlist");
            return Err(anyhow!(
                "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
                url.origin().ascii_serialization(),
                self.config.allowed_origins
            ));
        }

        let mut current = url.clone();
        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| anyhow!("Fetch failed: {}", e))?;

            let status = response.status();

            // Handle redirects manually - only allow same-origin
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get("location")
                    .ok_or_else(|| anyhow!("Redirect without location from {}", current))?
                    .to_str()
                    .map_err(|_| anyhow!("Invalid redirect location"))?;
                let redirect_url = current
                    .join(location)
                    .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

                if redirect_url.origin() != url.origin() {
                    return Err(anyhow!(
                        "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                        redirect_url.origin().ascii_serialization(),
                        url.origin().ascii_serialization()
                    ));
                }

                current = redirect_url;
                continue;
            }

            if !status.is_success() {
                return Err(anyhow!(
                    "Fetch of {} failed with status {} {}",
                    current,
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ));
            }

            return response
                .text()
                .await
                .map_err(|e| anyhow!("Failed to read response body: {}", e));
        }

        Err(anyhow!("Too many redirects fetching {}", url))
    }
}
