//! Depot content handler.
//!
//! Each request walks one linear path:
//!
//! 1. Policy check.  Uncached depots are redirected to the origin (`303`).
//! 2. Cache lookup.  Present objects are served from disk, honouring range
//!    and conditional request headers.
//! 3. Miss.  The object is fetched from the origin and streamed to the client
//!    while being written to a staging file, which is published by rename
//!    once the origin body is complete.
//!
//! Once the miss response has started there is no way to change its status,
//! so failures after that point are logged and the body is aborted.
//! Concurrent misses for the same path are not coalesced; each fetches and
//! stages independently.

use std::io;
use std::path::Path as FsPath;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::handler::AppError;
use crate::AppState;
use crate::cache::{CachedObject, StagingFile, StoreError};
use crate::metrics::{RequestObserver, RequestOutcome};
use crate::origin::{ByteStream, OriginResponse, origin_url};

/// Chunks buffered between the origin/disk side and the client.
const TEE_CHANNEL_CAPACITY: usize = 32;

const OCTET_STREAM: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// `GET /depot/{depot}/{*path}`
pub async fn handle_depot(
    State(state): State<Arc<AppState>>,
    Path((depot, _rest)): Path<(String, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    state.observer.request_received();

    let Some(host) = request_host(&headers, &uri) else {
        warn!(%depot, "request without a host");
        return AppError::BadRequest("missing Host header").into_response();
    };
    let path = uri.path().to_owned();

    let span = info_span!("depot", %depot, %host, %path);
    serve_depot(state, depot, host, path, headers)
        .instrument(span)
        .await
}

async fn serve_depot(
    state: Arc<AppState>,
    depot: String,
    host: String,
    path: String,
    headers: HeaderMap,
) -> Response {
    let request = InFlight::start(Arc::clone(&state.observer), depot);

    // Do we care about caching this file?
    if !state.policy.should_cache(&request.depot, (state.bypass)()) {
        info!("skip");
        let location = origin_url(&state.config.upstream.scheme, &host, &path);
        request.finish(RequestOutcome::Skip);
        return (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response();
    }

    let cache_path = state.store.resolve(&path);

    match state.store.lookup(&cache_path).await {
        Ok(Some(object)) => {
            info!("hit");
            return serve_hit(request, object, headers).await;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, path = %cache_path.display(), "cache lookup failed, fetching upstream");
        }
    }

    info!("miss");
    state.observer.cache_miss(&request.depot);
    match start_miss(&state, &request.depot, &host, &path, &cache_path).await {
        Ok((upstream, staging)) => stream_miss(request, upstream, staging),
        Err(err) => {
            request.finish(RequestOutcome::MissError);
            err.into_response()
        }
    }
}

/// Host the client asked for: the `Host` header, or the URI authority for
/// absolute-form and HTTP/2 requests.
fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_owned)
        .or_else(|| uri.authority().map(|a| a.as_str().to_owned()))
}

// ---------------------------------------------------------------------------
// Request bookkeeping
// ---------------------------------------------------------------------------

/// A depot request that has not reported its outcome yet.
///
/// `finish` consumes the value, so every request reports exactly one
/// outcome together with its duration.
struct InFlight {
    observer: Arc<dyn RequestObserver>,
    depot: String,
    started: Instant,
}

impl InFlight {
    fn start(observer: Arc<dyn RequestObserver>, depot: String) -> Self {
        Self {
            observer,
            depot,
            started: Instant::now(),
        }
    }

    fn finish(self, outcome: RequestOutcome) {
        self.observer
            .request_finished(&self.depot, &outcome, self.started.elapsed());
    }
}

/// Response body that reports the request outcome once the body has been
/// sent, or once it is dropped unfinished.
struct FinishOnEnd<S> {
    inner: S,
    pending: Option<(InFlight, RequestOutcome)>,
}

impl<S> FinishOnEnd<S> {
    fn new(inner: S, request: InFlight, outcome: RequestOutcome) -> Self {
        Self {
            inner,
            pending: Some((request, outcome)),
        }
    }

    fn finish(&mut self) {
        if let Some((request, outcome)) = self.pending.take() {
            request.finish(outcome);
        }
    }
}

impl<S: Stream + Unpin> Stream for FinishOnEnd<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        if item.is_none() {
            this.finish();
        }
        Poll::Ready(item)
    }
}

impl<S> Drop for FinishOnEnd<S> {
    fn drop(&mut self) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// Hit
// ---------------------------------------------------------------------------

/// Serve a cached object.  `Range`, `If-Modified-Since` and friends are
/// handled by [`ServeFile`]; the outcome is recorded when the body ends.
async fn serve_hit(request: InFlight, object: CachedObject, headers: HeaderMap) -> Response {
    let CachedObject { path, size } = object;

    let mut req = Request::new(Body::empty());
    *req.headers_mut() = headers;
    let response = match ServeFile::new(&path).oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let (mut parts, body) = response.into_parts();
    if parts.status.is_success() {
        parts
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    }

    let body = FinishOnEnd::new(
        Body::new(body).into_data_stream(),
        request,
        RequestOutcome::Hit { bytes: size },
    );
    Response::from_parts(parts, Body::from_stream(body))
}

// ---------------------------------------------------------------------------
// Miss
// ---------------------------------------------------------------------------

/// Everything that can still fail with a proper status code: directory
/// preparation, staging file creation, and the origin request itself.
async fn start_miss(
    state: &AppState,
    depot: &str,
    host: &str,
    path: &str,
    cache_path: &FsPath,
) -> Result<(OriginResponse, StagingFile), AppError> {
    state.store.prepare_parent(cache_path).await?;
    let staging = state.store.stage(cache_path).await?;
    debug!(
        staging = %staging.path().display(),
        target = %staging.target().display(),
        "staging upstream body"
    );

    let upstream = match state.origin.fetch(host, path).await {
        Ok(upstream) => upstream,
        Err(err) => {
            staging.discard().await;
            return Err(err.into());
        }
    };
    if let Some(len) = upstream.content_length {
        state.observer.upstream_bytes(depot, len);
    }

    Ok((upstream, staging))
}

/// Respond immediately and hand the origin body to a tee task that feeds
/// both the staging file and the client.
fn stream_miss(request: InFlight, upstream: OriginResponse, mut staging: StagingFile) -> Response {
    let OriginResponse {
        content_length,
        body,
    } = upstream;
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_CAPACITY);

    tokio::spawn(
        async move {
            let copied = tee(body, &mut staging, content_length, &tx).await;
            let result = match copied {
                Ok(()) => staging.commit().await.map_err(TeeError::Commit),
                Err(err) => {
                    staging.discard().await;
                    Err(err)
                }
            };

            match result {
                Ok(bytes) => request.finish(RequestOutcome::MissSuccess { bytes }),
                Err(err) => {
                    match &err {
                        TeeError::ClientGone { bytes } => {
                            debug!(bytes, "client went away, discarded staging file")
                        }
                        other => error!(error = %other, "while caching upstream"),
                    }
                    request.finish(RequestOutcome::MissError);
                    // The staging file is already gone; now abort the client body.
                    if err.aborts_client() {
                        let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
                    }
                }
            }
        }
        .in_current_span(),
    );

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    let headers = response.headers_mut();
    if let Some(len) = content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    response
}

#[derive(Debug, thiserror::Error)]
enum TeeError {
    #[error("while copying response: {0}")]
    Upstream(#[source] io::Error),
    #[error("while copying response: {0}")]
    Write(#[source] StoreError),
    #[error("client disconnected after {bytes} bytes")]
    ClientGone { bytes: u64 },
    #[error("{0}")]
    Commit(#[source] StoreError),
}

impl TeeError {
    /// Whether the client body should end with an error.  A failed commit
    /// happens after every byte was delivered, so the client keeps its copy.
    fn aborts_client(&self) -> bool {
        matches!(self, TeeError::Upstream(_) | TeeError::Write(_))
    }
}

/// Copy `body` into `staging` and `tx` until the origin signals end of
/// stream.  Each chunk reaches disk before it is forwarded.
///
/// Once every declared byte has been handed to the client, the server may
/// drop the response body before the origin's end of stream arrives.  From
/// then on a closed channel is not a disconnect and the origin is drained
/// so the object can still be published.
async fn tee(
    mut body: ByteStream,
    staging: &mut StagingFile,
    content_length: Option<u64>,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> Result<(), TeeError> {
    let delivered = |staging: &StagingFile| {
        content_length.is_some_and(|len| staging.bytes_written() >= len)
    };

    loop {
        let next = if delivered(&*staging) {
            body.next().await
        } else {
            tokio::select! {
                next = body.next() => next,
                () = tx.closed() => {
                    return Err(TeeError::ClientGone { bytes: staging.bytes_written() });
                }
            }
        };
        let Some(chunk) = next else { return Ok(()) };
        let chunk = chunk.map_err(TeeError::Upstream)?;

        staging.write_chunk(&chunk).await.map_err(TeeError::Write)?;
        if tx.send(Ok(chunk)).await.is_err() && !delivered(&*staging) {
            return Err(TeeError::ClientGone { bytes: staging.bytes_written() });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
