//! Static route serving cache files by name.
//!
//! The page cache rewrites fresh hits to `<prefix>/<file>`; this router is what
//! answers them. Only names shaped like a cache key are served, so nothing else
//! under the cache directory is reachable.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::debug;

use crate::{
    cache::{CacheKey, PageStore, cached_page_response},
    error::HttpError,
};

const SOURCE: &str = "infra::http::passthrough";

pub fn passthrough_router(prefix: &str, store: Arc<dyn PageStore>) -> Router {
    Router::new()
        .route(&format!("{prefix}/{{file}}"), get(serve_cached_file))
        .with_state(store)
}

async fn serve_cached_file(
    State(store): State<Arc<dyn PageStore>>,
    Path(file): Path<String>,
) -> Response {
    let Some(key) = CacheKey::parse(&file) else {
        return HttpError::not_found(SOURCE, format!("`{file}` is not a cache file name"))
            .into_response();
    };

    match store.read(&key).await {
        Ok(body) => {
            debug!(target: SOURCE, cache_key = %key, bytes = body.len(), "served cache file");
            cached_page_response(body)
        }
        Err(err) => HttpError::from_store(SOURCE, err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use bytes::Bytes;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::FsPageStore;

    async fn get_status(router: Router, uri: &str) -> (StatusCode, Bytes) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, body)
    }

    #[tokio::test]
    async fn serves_stored_page_by_file_name() {
        let dir = tempdir().expect("tempdir");
        let store = FsPageStore::open(dir.path(), Duration::from_secs(60)).expect("store");
        let key = CacheKey::for_url("/a?x=1");
        store
            .write(&key, Bytes::from_static(b"<h1>a</h1>"))
            .await
            .expect("write");

        let router = passthrough_router("/__VirtualCache", Arc::new(store));
        let (status, body) =
            get_status(router, &format!("/__VirtualCache/{}", key.file_name())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"<h1>a</h1>"));
    }

    #[tokio::test]
    async fn rejects_names_that_are_not_keys() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("secret.txt"), "nope").expect("seed");
        let store = FsPageStore::open(dir.path(), Duration::from_secs(60)).expect("store");

        let router = passthrough_router("/__VirtualCache", Arc::new(store));
        let (status, _) = get_status(router, "/__VirtualCache/secret.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FsPageStore::open(dir.path(), Duration::from_secs(60)).expect("store");
        let key = CacheKey::for_url("/missing");

        let router = passthrough_router("/__VirtualCache", Arc::new(store));
        let (status, _) =
            get_status(router, &format!("/__VirtualCache/{}", key.file_name())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
