//! Upstream content origin.
//!
//! The request orchestrator only sees the [`Origin`] trait, so the real
//! HTTP-backed origin ([`http::HttpOrigin`]) can be swapped for an in-memory
//! one in tests.

pub mod http;

use std::fmt;

use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use self::http::HttpOrigin;

/// Response body as delivered by an origin.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// A successful (2xx) origin response.
pub struct OriginResponse {
    /// Declared `Content-Length`, if the origin sent one.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginResponse")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    /// DNS, connect, TLS, or any other transport failure.
    #[error("upstream server unreachable: {0}")]
    Unreachable(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The origin answered with a non-2xx status.
    #[error("upstream server returned {}", .0.as_u16())]
    Rejected(StatusCode),
}

impl OriginError {
    /// Status code reported to the client for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unreachable(_) => StatusCode::BAD_GATEWAY,
            Self::Rejected(status) => *status,
        }
    }
}

/// Source of depot content on a cache miss.
#[async_trait::async_trait]
pub trait Origin: Send + Sync {
    /// Fetch `path` from `host`.
    async fn fetch(&self, host: &str, path: &str) -> Result<OriginResponse, OriginError>;
}

/// Absolute origin URL for a request, also used as the skip redirect target.
pub fn origin_url(scheme: &str, host: &str, path: &str) -> String {
    format!("{scheme}://{host}{path}")
}
