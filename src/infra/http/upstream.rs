//! Reverse-proxy origin.
//!
//! Everything the page cache does not answer itself is forwarded to the
//! configured upstream, relative to its base URL.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{
        HeaderMap, Method, StatusCode, Uri,
        header::{self, HeaderName},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::{error::HttpError, infra::error::InfraError};

const SOURCE: &str = "infra::http::upstream";

/// Headers that describe a single connection and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

#[derive(Clone)]
pub struct UpstreamOrigin {
    client: reqwest::Client,
    base: Url,
}

impl UpstreamOrigin {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::configuration(format!("upstream client: {err}")))?;
        Ok(Self {
            client,
            base: with_trailing_slash(base),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Router forwarding every request it receives to the upstream.
    ///
    /// Request bodies are forwarded whatever their size.
    pub fn router(self) -> Router {
        Router::new()
            .fallback(forward)
            .layer(DefaultBodyLimit::disable())
            .with_state(self)
    }

    fn target(&self, uri: &Uri) -> Result<Url, url::ParseError> {
        let path_and_query = uri
            .path_and_query()
            .map(|value| value.as_str())
            .unwrap_or("/");
        self.base.join(path_and_query.trim_start_matches('/'))
    }
}

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

async fn forward(
    State(origin): State<UpstreamOrigin>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = match origin.target(&uri) {
        Ok(target) => target,
        Err(err) => {
            return HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Bad request", &err)
                .into_response();
        }
    };

    let mut forwarded = headers;
    for name in &HOP_BY_HOP {
        forwarded.remove(name);
    }
    // Captured bodies are stored and replayed without a content encoding.
    forwarded.remove(header::ACCEPT_ENCODING);

    debug!(target: SOURCE, %method, url = %target, "forwarding to upstream");
    let upstream = match origin
        .client
        .request(method, target)
        .headers(forwarded)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream unavailable",
                &err,
            )
            .into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    for name in &HOP_BY_HOP {
        response_headers.remove(name);
    }

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Upstream unavailable",
                &err,
            )
            .into_response();
        }
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}
