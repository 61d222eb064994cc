//! Page cache middleware.
//!
//! Decodes pretty URLs into canonical ones, serves fresh cached pages and
//! captures successful origin renders into the store. Must wrap the whole
//! router (`from_fn_with_state(..).layer(router)`) so the rewritten URI is the
//! one that gets routed.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderValue, Method, Request, StatusCode, Uri,
        header::{CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE},
        uri::PathAndQuery,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, future, stream};
use http_body_util::BodyExt;
use metrics::{counter, histogram};
use tracing::{Instrument, Span, debug, error, instrument, warn};

use super::{
    CacheConfig, METRIC_BYPASS, METRIC_HIT, METRIC_MISS, METRIC_STALE, METRIC_WRITE_ERROR,
    METRIC_WRITE_MS,
    keys::CacheKey,
    store::{Freshness, PageStore},
};
use crate::{
    codec::{self, Linker, UrlTranslator, XsTranslator},
    error::HttpError,
};

const SOURCE: &str = "cache::middleware";
const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Shared state of the page cache middleware.
#[derive(Clone)]
pub struct PageCache {
    config: Arc<CacheConfig>,
    store: Option<Arc<dyn PageStore>>,
    translator: Arc<dyn UrlTranslator>,
}

impl PageCache {
    pub fn new(config: CacheConfig, store: Arc<dyn PageStore>) -> Self {
        Self {
            config: Arc::new(config),
            store: Some(store),
            translator: Arc::new(XsTranslator),
        }
    }

    /// URL decoding and link injection only; nothing is cached.
    pub fn decode_only() -> Self {
        Self {
            config: Arc::new(CacheConfig {
                enabled: false,
                ..Default::default()
            }),
            store: None,
            translator: Arc::new(XsTranslator),
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn UrlTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&Arc<dyn PageStore>> {
        self.store.as_ref()
    }

    pub fn linker(&self) -> Linker {
        Linker::new(Arc::clone(&self.translator))
    }

    /// Store to consult for `request`, or `None` when it must go straight to
    /// the origin.
    fn store_for(&self, request: &Request<Body>, canonical: &str) -> Option<&Arc<dyn PageStore>> {
        if !self.config.enabled || request.method() != Method::GET {
            return None;
        }
        if self.is_passthrough(request.uri().path()) {
            return None;
        }
        if !self.config.admits(canonical) {
            debug!(target: SOURCE, canonical, outcome = "excluded", "no cache rule matched");
            return None;
        }
        self.store.as_ref()
    }

    fn is_passthrough(&self, path: &str) -> bool {
        self.config.static_prefix.as_deref().is_some_and(|prefix| {
            path.strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Middleware implementing decode → rule check → lookup → hit or capture.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCache>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    request.extensions_mut().insert(cache.linker());

    let received = path_and_query(request.uri()).to_string();
    let decoded = cache.translator.to_canonical(&received);
    if decoded != received {
        match replace_path_and_query(request.uri(), &decoded) {
            Some(uri) => {
                debug!(target: SOURCE, from = %received, to = %decoded, "decoded pretty URL");
                *request.uri_mut() = uri;
            }
            None => {
                warn!(
                    target: SOURCE,
                    from = %received,
                    to = %decoded,
                    "decoded URL is not a valid URI; routing as received"
                );
            }
        }
    }

    let canonical = path_and_query(request.uri()).to_string();
    let Some(store) = cache.store_for(&request, &canonical).cloned() else {
        counter!(METRIC_BYPASS).increment(1);
        return next.run(request).await;
    };

    let key = CacheKey::for_url(&codec::normalize(&canonical));
    match store.check(&key).await {
        Ok(Freshness::Fresh { .. }) => match store.read(&key).await {
            Ok(body) => {
                counter!(METRIC_HIT).increment(1);
                let delegated = cache.config.static_prefix.as_deref().and_then(|prefix| {
                    let target = format!("{prefix}/{}", key.file_name());
                    replace_path_and_query(request.uri(), &target)
                });
                if let Some(uri) = delegated {
                    debug!(
                        target: SOURCE,
                        cache_key = %key,
                        outcome = "hit",
                        "delegating to passthrough route"
                    );
                    *request.uri_mut() = uri;
                    return next.run(request).await;
                }
                debug!(target: SOURCE, cache_key = %key, outcome = "hit", "serving cached page");
                return cached_page_response(body);
            }
            Err(err) => {
                counter!(METRIC_MISS).increment(1);
                warn!(
                    target: SOURCE,
                    cache_key = %key,
                    error = %err,
                    "failed to read fresh cache entry; regenerating"
                );
            }
        },
        Ok(Freshness::Stale { .. }) => {
            counter!(METRIC_STALE).increment(1);
            debug!(target: SOURCE, cache_key = %key, outcome = "stale", "cache entry expired");
        }
        Ok(Freshness::Absent) => {
            counter!(METRIC_MISS).increment(1);
            debug!(target: SOURCE, cache_key = %key, outcome = "miss", "cache entry absent");
        }
        Err(err) => {
            counter!(METRIC_MISS).increment(1);
            warn!(
                target: SOURCE,
                cache_key = %key,
                error = %err,
                "cache lookup failed; treating as miss"
            );
        }
    }

    let response = next.run(request).await;
    capture_response(store, key, response, cache.config.max_body_bytes).await
}

/// Tee a successful origin response into the store.
///
/// Responses rejected by [`should_store_response`] are returned untouched. The store write runs in the
/// background and its outcome never affects the response. A body that fails
/// mid-collection is answered with `500`.
async fn capture_response(
    store: Arc<dyn PageStore>,
    key: CacheKey,
    response: Response,
    limit: usize,
) -> Response {
    if !should_store_response(&response) {
        debug!(
            target: SOURCE,
            cache_key = %key,
            status = response.status().as_u16(),
            "origin response not cacheable"
        );
        return response;
    }

    if declared_length(&response).is_some_and(|len| len > limit) {
        debug!(target: SOURCE, cache_key = %key, limit, "origin body exceeds capture limit");
        return response;
    }

    let (parts, body) = response.into_parts();
    match collect_bounded(body, limit).await {
        Collected::Complete(bytes) => {
            spawn_store_write(store, key, bytes.clone());
            Response::from_parts(parts, Body::from(bytes))
        }
        Collected::Overflow(body) => {
            debug!(target: SOURCE, cache_key = %key, limit, "origin body exceeds capture limit");
            Response::from_parts(parts, body)
        }
        Collected::Failed(err) => {
            error!(
                target: SOURCE,
                cache_key = %key,
                error = %err,
                "origin body failed; not caching"
            );
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &err,
            )
            .into_response()
        }
    }
}

enum Collected {
    Complete(Bytes),
    /// Buffered prefix followed by the unread rest of the body.
    Overflow(Body),
    Failed(axum::Error),
}

async fn collect_bounded(mut body: Body, limit: usize) -> Collected {
    let mut buffer = BytesMut::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                buffer.extend_from_slice(&data);
                if buffer.len() > limit {
                    let head =
                        stream::once(future::ready(Ok::<_, axum::Error>(buffer.freeze())));
                    return Collected::Overflow(Body::from_stream(
                        head.chain(body.into_data_stream()),
                    ));
                }
            }
            Err(err) => return Collected::Failed(err),
        }
    }
    Collected::Complete(buffer.freeze())
}

fn spawn_store_write(store: Arc<dyn PageStore>, key: CacheKey, body: Bytes) {
    let task = async move {
        let started_at = Instant::now();
        match store.write(&key, body).await {
            Ok(()) => {
                histogram!(METRIC_WRITE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
                debug!(target: SOURCE, cache_key = %key, "cached origin response");
            }
            Err(err) => {
                counter!(METRIC_WRITE_ERROR).increment(1);
                warn!(
                    target: SOURCE,
                    cache_key = %key,
                    error = %err,
                    hint = "check that the cache directory exists and is writable",
                    "failed to write cache entry"
                );
            }
        }
    };
    tokio::spawn(task.instrument(Span::current()));
}

pub(crate) fn cached_page_response(body: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE))
        .header(CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Only rendered pages are stored: a `200 OK` HTML body that sets no cookie.
/// Everything else, including streamed `text/event-stream` bodies, passes
/// through without being buffered.
fn should_store_response(response: &Response) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }

    if response.headers().contains_key(SET_COOKIE) {
        return false;
    }

    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
}

fn declared_length(response: &Response) -> Option<usize> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(PathAndQuery::as_str).unwrap_or("/")
}

fn replace_path_and_query(uri: &Uri, path_and_query: &str) -> Option<Uri> {
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().ok()?);
    Uri::from_parts(parts).ok()
}
