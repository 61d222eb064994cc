//! Rendered page cache.
//!
//! Pages are stored as flat files keyed by their canonical URL and served
//! until they are older than the configured freshness window:
//!
//! ```toml
//! [cache]
//! enabled = true
//! directory = "/var/cache/xscache"
//! expire_seconds = 86400
//! rules = ["^/$", "^/posts/"]
//! static_prefix = "/__VirtualCache"
//! ```

mod config;
mod keys;
mod middleware;
mod store;

pub use config::{CacheConfig, CacheConfigError, CacheRules, validate_static_prefix};
pub use keys::CacheKey;
pub use middleware::{PageCache, page_cache_layer};
pub(crate) use middleware::cached_page_response;
pub use store::{Freshness, FsPageStore, PageStore, StoreError};

pub(crate) const METRIC_HIT: &str = "xscache_hit_total";
pub(crate) const METRIC_MISS: &str = "xscache_miss_total";
pub(crate) const METRIC_STALE: &str = "xscache_stale_total";
pub(crate) const METRIC_BYPASS: &str = "xscache_bypass_total";
pub(crate) const METRIC_WRITE_ERROR: &str = "xscache_write_error_total";
pub(crate) const METRIC_WRITE_MS: &str = "xscache_write_ms";
