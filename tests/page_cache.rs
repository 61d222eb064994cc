use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::{
    Extension, Router,
    body::{Body, to_bytes},
    extract::{Query, State},
    http::{
        Method, Request, StatusCode,
        header::{CONTENT_TYPE, SET_COOKIE},
    },
    response::{Html, IntoResponse},
    routing::get,
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use tempfile::{TempDir, tempdir};
use tower::ServiceExt;
use xscache::cache::{
    CacheConfig, CacheKey, CacheRules, Freshness, FsPageStore, PageCache, PageStore, StoreError,
};
use xscache::codec::Linker;
use xscache::infra::http::build_router;

type Calls = Arc<AtomicUsize>;

async fn list(
    State(calls): State<Calls>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Html<String> {
    calls.fetch_add(1, Ordering::SeqCst);
    let rendered: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    Html(format!("<p>{}</p>", rendered.join(" ")))
}

async fn missing(State(calls): State<Calls>) -> (StatusCode, &'static str) {
    calls.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, "nope")
}

async fn form(State(calls): State<Calls>) -> &'static str {
    calls.fetch_add(1, Ordering::SeqCst);
    "form"
}

async fn stylesheet(State(calls): State<Calls>) -> impl IntoResponse {
    calls.fetch_add(1, Ordering::SeqCst);
    ([(CONTENT_TYPE, "text/css")], "body { margin: 0 }")
}

async fn session(State(calls): State<Calls>) -> impl IntoResponse {
    calls.fetch_add(1, Ordering::SeqCst);
    ([(SET_COOKIE, "session=abc")], Html("<p>welcome</p>"))
}

/// One event, then the stream stays open.
async fn events() -> impl IntoResponse {
    let first = Ok::<_, Infallible>(Bytes::from_static(b"data: 1\n\n"));
    let stream = stream::once(async move { first }).chain(stream::pending());
    ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(stream))
}

async fn links(Extension(linker): Extension<Linker>) -> String {
    linker.href("/list?tag=rust&page=2")
}

fn origin(calls: &Calls) -> Router {
    Router::new()
        .route("/list", get(list))
        .route("/missing", get(missing))
        .route("/form", get(form).post(form))
        .route("/links", get(links))
        .route("/app.css", get(stylesheet))
        .route("/session", get(session))
        .route("/events", get(events))
        .with_state(Arc::clone(calls))
}

fn fs_store(dir: &TempDir, expire: Duration) -> Arc<dyn PageStore> {
    Arc::new(FsPageStore::open(dir.path(), expire).expect("cache directory should open"))
}

fn direct_config() -> CacheConfig {
    CacheConfig {
        static_prefix: None,
        ..Default::default()
    }
}

async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Option<String>, Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect");
    (status, content_type, body)
}

async fn fetch(app: &Router, uri: &str) -> (StatusCode, Bytes) {
    let (status, _, body) = send(app, Method::GET, uri).await;
    (status, body)
}

fn entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("cache directory should be readable")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| CacheKey::parse(name).is_some())
        .collect()
}

/// Background writes finish shortly after the response; poll for them.
async fn wait_for_entries(dir: &Path, count: usize) {
    for _ in 0..100 {
        if entries(dir).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} cache entries in {}", dir.display());
}

/// Give any stray background write a chance to land before asserting absence.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn pretty_url_is_routed_as_canonical() {
    let calls = Calls::default();
    let app = build_router(PageCache::decode_only(), origin(&calls));

    let (status, body) = fetch(&app, "/list-page-2-tag-rust_xs.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"<p>page=2 tag=rust</p>"));

    let (status, body) = fetch(&app, "/list?tag=rust&page=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"<p>page=2 tag=rust</p>"));
}

#[tokio::test]
async fn linker_is_available_to_handlers() {
    let calls = Calls::default();
    let app = build_router(PageCache::decode_only(), origin(&calls));

    let (status, body) = fetch(&app, "/links").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"/list-page-2-tag-rust_xs.html"));
}

#[tokio::test]
async fn miss_is_stored_then_served_without_origin() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(direct_config(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    let (status, first) = fetch(&app, "/list?page=1").await;
    assert_eq!(status, StatusCode::OK);
    wait_for_entries(dir.path(), 1).await;

    let (status, content_type, second) = send(&app, Method::GET, "/list?page=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, first);
    assert_eq!(content_type.as_deref(), Some("text/html; charset=utf-8"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fresh_hit_goes_through_passthrough_route() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(CacheConfig::default(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    let (_, first) = fetch(&app, "/list?page=3").await;
    wait_for_entries(dir.path(), 1).await;

    let (status, content_type, second) = send(&app, Method::GET, "/list?page=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, first);
    assert_eq!(content_type.as_deref(), Some("text/html; charset=utf-8"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pretty_and_reordered_urls_share_an_entry() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(direct_config(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    let (_, first) = fetch(&app, "/list?tag=rust&page=2").await;
    wait_for_entries(dir.path(), 1).await;

    let (_, pretty) = fetch(&app, "/list-page-2-tag-rust_xs.html").await;
    let (_, reordered) = fetch(&app, "/list?page=2&tag=rust").await;
    assert_eq!(pretty, first);
    assert_eq!(reordered, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(entries(dir.path()).len(), 1);
}

#[tokio::test]
async fn stale_entry_is_regenerated() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(direct_config(), fs_store(&dir, Duration::from_millis(1)));
    let app = build_router(cache, origin(&calls));

    fetch(&app, "/list?page=4").await;
    wait_for_entries(dir.path(), 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (status, body) = fetch(&app, "/list?page=4").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"<p>page=4</p>"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_cache_matches_origin_and_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let config = CacheConfig {
        enabled: false,
        ..direct_config()
    };
    let app = build_router(
        PageCache::new(config, fs_store(&dir, Duration::from_secs(60))),
        origin(&calls),
    );
    let bare = origin(&calls);

    let (status, body) = fetch(&app, "/list?page=5").await;
    let (bare_status, bare_body) = fetch(&bare, "/list?page=5").await;
    assert_eq!(status, bare_status);
    assert_eq!(body, bare_body);

    fetch(&app, "/list?page=5").await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(entries(dir.path()).is_empty());
}

#[tokio::test]
async fn urls_outside_rules_are_never_stored() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let config = CacheConfig {
        rules: Some(CacheRules::compile(&["^/links"]).expect("rules compile")),
        ..direct_config()
    };
    let app = build_router(
        PageCache::new(config, fs_store(&dir, Duration::from_secs(60))),
        origin(&calls),
    );

    fetch(&app, "/list?page=6").await;
    fetch(&app, "/list?page=6").await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(entries(dir.path()).is_empty());
}

#[tokio::test]
async fn error_responses_are_not_stored() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(direct_config(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    let (status, body) = fetch(&app, "/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, Bytes::from_static(b"nope"));
    fetch(&app, "/missing").await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(entries(dir.path()).is_empty());
}

#[tokio::test]
async fn non_get_requests_bypass_the_cache() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(direct_config(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    let (status, _, body) = send(&app, Method::POST, "/form").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"form"));
    send(&app, Method::POST, "/form").await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(entries(dir.path()).is_empty());
}

#[tokio::test]
async fn bodies_over_the_limit_are_served_but_not_stored() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let config = CacheConfig {
        max_body_bytes: 4,
        ..direct_config()
    };
    let app = build_router(
        PageCache::new(config, fs_store(&dir, Duration::from_secs(60))),
        origin(&calls),
    );

    let (status, body) = fetch(&app, "/list?page=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"<p>page=7</p>"));
    settle().await;
    assert!(entries(dir.path()).is_empty());
}

#[tokio::test]
async fn passthrough_route_only_serves_cache_file_names() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("notes.txt"), "private").expect("seed file");
    let calls = Calls::default();
    let cache = PageCache::new(CacheConfig::default(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    let (status, _) = fetch(&app, "/__VirtualCache/notes.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Store whose every operation fails, as if the directory were unusable.
struct BrokenStore;

#[async_trait]
impl PageStore for BrokenStore {
    async fn check_at(&self, _key: &CacheKey, _now: SystemTime) -> Result<Freshness, StoreError> {
        Err(StoreError::Io(std::io::Error::other("lookup failed")))
    }

    async fn read(&self, _key: &CacheKey) -> Result<Bytes, StoreError> {
        Err(StoreError::Io(std::io::Error::other("read failed")))
    }

    async fn write(&self, _key: &CacheKey, _body: Bytes) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::other("write failed")))
    }
}

#[tokio::test]
async fn store_failures_never_change_the_response() {
    let calls = Calls::default();
    let app = build_router(
        PageCache::new(direct_config(), Arc::new(BrokenStore)),
        origin(&calls),
    );

    for _ in 0..2 {
        let (status, body) = fetch(&app, "/list-page-8_xs.html").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"<p>page=8</p>"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn vanished_directory_degrades_to_origin() {
    let dir = tempdir().expect("tempdir");
    let store = fs_store(&dir, Duration::from_secs(60));
    let calls = Calls::default();
    let app = build_router(PageCache::new(direct_config(), store), origin(&calls));
    let path = dir.path().to_path_buf();
    drop(dir);

    let (status, body) = fetch(&app, "/list?page=9").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"<p>page=9</p>"));
    settle().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn non_html_responses_keep_their_type_and_are_not_stored() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(CacheConfig::default(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    for _ in 0..2 {
        let (status, content_type, body) = send(&app, Method::GET, "/app.css").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/css"));
        assert_eq!(body, Bytes::from_static(b"body { margin: 0 }"));
    }
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(entries(dir.path()).is_empty());
}

#[tokio::test]
async fn pages_setting_cookies_are_not_stored() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(CacheConfig::default(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    for _ in 0..2 {
        let request = Request::get("/session")
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.headers()[SET_COOKIE], "session=abc");
    }
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(entries(dir.path()).is_empty());
}

#[tokio::test]
async fn event_streams_are_delivered_without_buffering() {
    let dir = tempdir().expect("tempdir");
    let calls = Calls::default();
    let cache = PageCache::new(CacheConfig::default(), fs_store(&dir, Duration::from_secs(60)));
    let app = build_router(cache, origin(&calls));

    let request = Request::get("/events")
        .body(Body::empty())
        .expect("request should build");
    let response = tokio::time::timeout(Duration::from_secs(1), app.oneshot(request))
        .await
        .expect("response head should arrive")
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
        .await
        .expect("first event should arrive")
        .expect("stream should yield a frame")
        .expect("frame should be readable");
    assert_eq!(
        frame.into_data().expect("data frame"),
        Bytes::from_static(b"data: 1\n\n")
    );
}

/// Store that reports every entry as fresh but cannot read any of them.
struct UnreadableStore;

#[async_trait]
impl PageStore for UnreadableStore {
    async fn check_at(&self, _key: &CacheKey, now: SystemTime) -> Result<Freshness, StoreError> {
        Ok(Freshness::Fresh { modified: now })
    }

    async fn read(&self, _key: &CacheKey) -> Result<Bytes, StoreError> {
        Err(StoreError::Io(std::io::Error::other("read failed")))
    }

    async fn write(&self, _key: &CacheKey, _body: Bytes) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn unreadable_fresh_entry_falls_back_to_origin() {
    for config in [CacheConfig::default(), direct_config()] {
        let calls = Calls::default();
        let app = build_router(
            PageCache::new(config, Arc::new(UnreadableStore)),
            origin(&calls),
        );

        let (status, body) = fetch(&app, "/list?page=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"<p>page=10</p>"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
