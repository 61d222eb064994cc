use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the xscache binary.
#[derive(Debug, Parser)]
#[command(
    name = "xscache",
    version,
    about = "Pretty-URL rewriting page cache in front of an HTTP origin"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "XSCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy in front of the configured upstream.
    Serve(Box<ServeArgs>),
    /// Print the pretty form of a canonical URL.
    Encode(UrlArgs),
    /// Print the canonical form of a pretty URL.
    Decode(UrlArgs),
    /// Print the cache file name a canonical or pretty URL is stored under.
    Key(UrlArgs),
    /// Report the cache entry and freshness for a URL.
    Inspect(InspectArgs),
}

#[derive(Debug, Args, Clone)]
pub struct UrlArgs {
    /// Path with optional query, e.g. `/list?page=2`.
    #[arg(value_name = "URL")]
    pub url: String,
}

#[derive(Debug, Args, Clone)]
pub struct InspectArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Path with optional query, canonical or pretty.
    #[arg(value_name = "URL")]
    pub url: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the cache directory. It must already exist.
    #[arg(long = "cache-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_directory: Option<PathBuf>,

    /// Override the freshness window of cached pages.
    #[arg(long = "cache-expire-seconds", value_name = "SECONDS")]
    pub cache_expire_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle page caching; URLs are still decoded when disabled.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the passthrough route prefix; an empty value streams hits directly.
    #[arg(long = "cache-static-prefix", value_name = "PREFIX")]
    pub cache_static_prefix: Option<String>,

    /// Override the upstream origin base URL.
    #[arg(long = "upstream-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub upstream_url: Option<String>,
}
