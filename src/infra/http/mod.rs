mod middleware;
mod passthrough;
mod upstream;

pub use middleware::{RequestContext, log_responses, set_request_context};
pub use passthrough::passthrough_router;
pub use upstream::UpstreamOrigin;

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware};
use tower::Layer;

use crate::cache::{PageCache, page_cache_layer};

/// Assemble the served application around `origin`.
///
/// The page cache wraps the whole inner router so decoded URLs and passthrough
/// rewrites are routed after rewriting; the outer router only carries
/// request-scoped layers.
pub fn build_router(cache: PageCache, origin: Router) -> Router {
    let mut inner = origin;
    if let (Some(prefix), Some(store)) = (cache.config().static_prefix.clone(), cache.store()) {
        inner = inner.merge(passthrough_router(&prefix, Arc::clone(store)));
    }
    let inner = inner.layer(axum_middleware::from_fn(log_responses));

    let cached = axum_middleware::from_fn_with_state(cache, page_cache_layer).layer(inner);

    Router::new()
        .fallback_service(cached)
        .layer(axum_middleware::from_fn(set_request_context))
}
