//! Page cache configuration.
//!
//! Built once from the loaded settings and shared read-only by every request.

use regex::Regex;
use thiserror::Error;

const DEFAULT_STATIC_PREFIX: &str = "/__VirtualCache";
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CacheConfigError {
    #[error("invalid cache rule `{pattern}`: {source}")]
    Rule {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("static prefix `{0}` must start with `/` and must not end with `/`")]
    StaticPrefix(String),
}

/// Ordered list of patterns a canonical URL must match to be cached.
#[derive(Debug, Clone, Default)]
pub struct CacheRules {
    patterns: Vec<Regex>,
}

impl CacheRules {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, CacheConfigError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(pattern).map_err(|source| CacheConfigError::Rule {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Index of the first rule matching `url`.
    pub fn first_match(&self, url: &str) -> Option<usize> {
        self.patterns.iter().position(|rule| rule.is_match(url))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Runtime page cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch. When off, requests are only decoded.
    pub enabled: bool,
    /// `None` caches every eligible request.
    pub rules: Option<CacheRules>,
    /// Route prefix fresh hits are delegated to. `None` streams hits directly.
    pub static_prefix: Option<String>,
    /// Largest origin body that will be captured.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: None,
            static_prefix: Some(DEFAULT_STATIC_PREFIX.to_string()),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl TryFrom<&crate::config::CacheSettings> for CacheConfig {
    type Error = CacheConfigError;

    fn try_from(settings: &crate::config::CacheSettings) -> Result<Self, Self::Error> {
        let rules = settings
            .rules
            .as_deref()
            .map(CacheRules::compile)
            .transpose()?;
        let static_prefix = settings
            .static_prefix
            .as_deref()
            .map(validate_static_prefix)
            .transpose()?;

        Ok(Self {
            enabled: settings.enabled,
            rules,
            static_prefix,
            max_body_bytes: settings.max_body_bytes,
        })
    }
}

impl CacheConfig {
    /// Whether `url` may be cached under the configured rules.
    pub fn admits(&self, url: &str) -> bool {
        match &self.rules {
            Some(rules) => rules.first_match(url).is_some(),
            None => true,
        }
    }
}

/// Check the shape of a passthrough route prefix.
pub fn validate_static_prefix(prefix: &str) -> Result<String, CacheConfigError> {
    if !prefix.starts_with('/') || prefix.ends_with('/') {
        return Err(CacheConfigError::StaticPrefix(prefix.to_string()));
    }
    Ok(prefix.to_string())
}
