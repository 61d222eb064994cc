use std::{process, sync::Arc, time::Duration};

use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use xscache::{
    cache::{CacheConfig, CacheKey, Freshness, FsPageStore, PageCache, PageStore},
    codec, config,
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, UpstreamOrigin},
        telemetry,
    },
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::Encode(args) => {
            println!("{}", codec::encode(&args.url));
            Ok(())
        }
        config::Command::Decode(args) => {
            println!("{}", codec::decode(&args.url));
            Ok(())
        }
        config::Command::Key(args) => {
            println!("{}", cache_key_for(&args.url));
            Ok(())
        }
        config::Command::Inspect(args) => run_inspect(settings, &args.url).await,
    }
}

/// Key of the entry a request for `url` (canonical or pretty) would use.
fn cache_key_for(url: &str) -> CacheKey {
    CacheKey::for_url(&codec::normalize(&codec::decode(url)))
}

fn open_store(settings: &config::CacheSettings) -> Result<FsPageStore, AppError> {
    let directory = settings.directory.as_ref().ok_or_else(|| {
        AppError::validation("cache.directory must be set when caching is enabled")
    })?;
    Ok(FsPageStore::open(directory, settings.expire)?)
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let upstream = settings
        .upstream
        .url
        .clone()
        .ok_or_else(|| AppError::validation("upstream.url must be set to serve"))?;
    let origin = UpstreamOrigin::new(upstream, settings.upstream.timeout)?;

    let cache = if settings.cache.enabled {
        let store = open_store(&settings.cache)?;
        let cache_config = CacheConfig::try_from(&settings.cache)
            .map_err(|err| AppError::validation(err.to_string()))?;
        info!(
            target: "xscache::serve",
            directory = %store.root().display(),
            expire_secs = store.expire().as_secs(),
            rules = cache_config.rules.as_ref().map_or(0, |rules| rules.len()),
            static_prefix = cache_config.static_prefix.as_deref().unwrap_or(""),
            "page cache enabled"
        );
        match cache_config.rules.as_ref() {
            None => warn!(
                target: "xscache::serve",
                "no cache rules configured; every GET page is cacheable"
            ),
            Some(rules) if rules.is_empty() => warn!(
                target: "xscache::serve",
                "cache rule list is empty; nothing will be cached"
            ),
            Some(_) => {}
        }
        PageCache::new(cache_config, Arc::new(store))
    } else {
        info!(target: "xscache::serve", "page cache disabled; decoding URLs only");
        PageCache::decode_only()
    };

    let app = http::build_router(cache, origin.router());
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        target: "xscache::serve",
        addr = %settings.server.addr,
        upstream = %settings.upstream.url.as_ref().map(|url| url.as_str()).unwrap_or(""),
        "listening"
    );

    let grace = settings.server.graceful_shutdown;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(grace))
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

/// Resolves on Ctrl-C and arms a hard exit if draining outlasts `grace`.
async fn shutdown_signal(grace: Duration) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target: "xscache::serve", error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!(
        target: "xscache::serve",
        grace_secs = grace.as_secs(),
        "shutdown requested; draining connections"
    );
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!(target: "xscache::serve", "graceful shutdown timed out");
        process::exit(1);
    });
}

async fn run_inspect(settings: config::Settings, url: &str) -> Result<(), AppError> {
    let store = open_store(&settings.cache)?;
    let key = cache_key_for(url);

    println!("key:   {key}");
    println!("path:  {}", store.path_for(&key).display());
    let freshness = store.check(&key).await?;
    let state = match freshness {
        Freshness::Fresh { .. } => "fresh",
        Freshness::Stale { .. } => "stale",
        Freshness::Absent => "absent",
    };
    println!("state: {state}");
    if let Some(age) = freshness
        .modified()
        .and_then(|modified| modified.elapsed().ok())
    {
        println!("age:   {}s", age.as_secs());
    }
    Ok(())
}
