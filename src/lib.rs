//! Pretty-URL rewriting and rendered-page file cache for axum applications.
//!
//! [`codec`] translates between canonical query URLs and their crawler-friendly
//! `_xs.html` form; [`cache`] decodes incoming pretty URLs and keeps rendered
//! pages as flat files in front of any origin router.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod infra;
