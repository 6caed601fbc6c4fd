//! ttlproxy binary: parse configuration, open the cache, serve until Ctrl-C.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ttlproxy::{Config, FileCache, HttpUpstream, Relay, Server};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ttlproxy failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let target = config.target()?;

    let cache = FileCache::open(&config.cache_dir).await?;
    let upstream = Arc::new(HttpUpstream::new(config.upstream_timeout())?);
    let relay = Arc::new(Relay::new(cache, upstream, target).with_ttl(config.ttl()));

    let server = Server::bind(config.listen_addr().to_string()).await?;
    info!(
        upstream = %relay.target(),
        cache_dir = %config.cache_dir.display(),
        ttl_secs = config.ttl_secs,
        "relay ready"
    );

    tokio::select! {
        result = server.run(move |req| {
            let relay = Arc::clone(&relay);
            async move { relay.handle(req).await }
        }) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received, shutting down");
        }
    }

    Ok(())
}
