//! Pretty URL codec.
//!
//! Converts between canonical URLs (`/list?tag=rust&page=2`) and their
//! path-only pretty form (`/list-page-2-tag-rust_xs.html`). The pretty form is
//! public and consumed by crawlers, so the encoding rules must stay stable.

use std::{fmt, sync::Arc};

/// Marker suffix closing every pretty URL.
pub const PRETTY_SUFFIX: &str = "_xs.html";

/// Pluggable translation between canonical and pretty URLs.
pub trait UrlTranslator: Send + Sync {
    /// Pretty (or already canonical) URL to canonical URL.
    fn to_canonical(&self, url: &str) -> String;

    /// Canonical URL to pretty URL.
    fn to_pretty(&self, url: &str) -> String;
}

/// Default translator backed by [`decode`] and [`encode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct XsTranslator;

impl UrlTranslator for XsTranslator {
    fn to_canonical(&self, url: &str) -> String {
        decode(url)
    }

    fn to_pretty(&self, url: &str) -> String {
        encode(url)
    }
}

/// Link builder handed to downstream handlers through request extensions.
#[derive(Clone)]
pub struct Linker {
    translator: Arc<dyn UrlTranslator>,
}

impl Linker {
    pub fn new(translator: Arc<dyn UrlTranslator>) -> Self {
        Self { translator }
    }

    /// Render a canonical URL as the link clients should see.
    pub fn href(&self, canonical: &str) -> String {
        self.translator.to_pretty(canonical)
    }
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker").finish_non_exhaustive()
    }
}

/// Decode a pretty URL into its canonical form.
///
/// Input that does not look like `<base>-<params>_xs.html` (with no `-` in
/// `base` and no `/` in `params`) is returned unchanged, so static assets and
/// canonical URLs pass through losslessly.
pub fn decode(url: &str) -> String {
    let Some(stem) = url.strip_suffix(PRETTY_SUFFIX) else {
        return url.to_string();
    };
    let Some((base, params)) = stem.split_once('-') else {
        return url.to_string();
    };
    if params.contains('/') {
        return url.to_string();
    }

    let mut pairs = Vec::new();
    let mut parts = params.split('-');
    while let Some(key) = parts.next() {
        let value = parts.next().unwrap_or("");
        if key.is_empty() {
            continue;
        }
        pairs.push(format!("{key}={value}"));
    }

    if pairs.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", pairs.join("&"))
    }
}

/// Encode a canonical URL into its pretty form.
///
/// Parameters are sorted as whole `key=value` strings so that URLs differing
/// only in parameter order share one pretty form. A URL without `?` is
/// returned unchanged.
pub fn encode(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };

    let mut block = String::new();
    for param in sorted_params(query) {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        if key.is_empty() {
            continue;
        }
        block.push('-');
        block.push_str(key);
        block.push('-');
        block.push_str(value);
    }

    format!("{base}{block}{PRETTY_SUFFIX}")
}

/// Reorder the query of a canonical URL the same way [`encode`] does.
///
/// Used to derive cache keys that do not depend on the order in which a
/// client happened to send its parameters.
pub fn normalize(url: &str) -> String {
    match url.split_once('?') {
        Some((base, query)) => format!("{base}?{}", sorted_params(query).join("&")),
        None => url.to_string(),
    }
}

fn sorted_params(query: &str) -> Vec<&str> {
    let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    params.sort_unstable();
    params
}
