//! Origin backed by a shared `reqwest` client.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, warn};

use super::{Origin, OriginError, OriginResponse, origin_url};
use crate::config::UpstreamConfig;

/// Fetches depot content over HTTP(S).
///
/// Holds one long-lived client so that connections (and HTTP/2 sessions) are
/// reused across requests.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
    scheme: String,
}

impl HttpOrigin {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            client,
            scheme: config.scheme.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, host: &str, path: &str) -> Result<OriginResponse, OriginError> {
        let url = origin_url(&self.scheme, host, path);
        debug!(%url, "fetching from upstream");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OriginError::Unreachable(Box::new(e)))?;

        let status = resp.status();
        if !status.is_success() {
            // Drain so the connection can go back to the pool.
            if let Err(e) = resp.bytes().await {
                debug!(error = %e, "failed to drain rejected upstream body");
            }
            warn!(%status, %url, "upstream server rejected request");
            return Err(OriginError::Rejected(status));
        }

        let content_length = resp.content_length();
        let body = resp.bytes_stream().map_err(std::io::Error::other).boxed();

        Ok(OriginResponse {
            content_length,
            body,
        })
    }
}
