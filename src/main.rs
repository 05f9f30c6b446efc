//! metafetch - Fetch metadata from TMDB, Trakt and Fanart
//!
//! Runs each requested path through the coalescing, caching and rate-limiting
//! client and prints the response bodies to stdout.

use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use log::{error, info};

use metafetch::api::ApiRegistry;
use metafetch::cache::{CacheStore, FileEngine};
use metafetch::cli::Cli;
use metafetch::config::Settings;
use metafetch::request::Client;
use metafetch::transport::ReqwestTransport;

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

/// Wires the client from settings
fn build_client(settings: &Settings) -> Result<Client, Box<dyn std::error::Error>> {
    let engine = match &settings.cache_dir {
        Some(dir) => FileEngine::with_dir(dir.clone()),
        None => FileEngine::new().ok_or("Could not determine a cache directory, use --cache-dir")?,
    };
    info!("Using cache directory {}", engine.dir().display());

    let registry = match &settings.registry {
        Some(path) => ApiRegistry::from_file(path)?,
        None => ApiRegistry::with_defaults(),
    };
    let transport = ReqwestTransport::new(settings.proxy_url.as_deref())?;
    let cache = CacheStore::new(Arc::new(engine), settings.cache.clone());

    Ok(Client::new(Arc::new(registry), Arc::new(cache), Arc::new(transport))
        .with_request_tracing(settings.request_tracing))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logger();

    let requests = cli.requests()?;
    let client = build_client(&cli.settings())?;

    let results = join_all(requests.into_iter().map(|request| {
        let client = client.clone();
        async move {
            let url = request.url.clone();
            (url, client.execute(request).await)
        }
    }))
    .await;

    let mut failed = 0;
    {
        let mut stdout = io::stdout().lock();
        for (url, result) in results {
            match result {
                Ok(response) => {
                    stdout.write_all(&response.body)?;
                    writeln!(stdout)?;
                }
                Err(err) => {
                    error!("Request for {} failed: {}", url, err);
                    failed += 1;
                }
            }
        }
        stdout.flush()?;
    }

    client.shutdown().await;

    if failed > 0 {
        return Err(format!("{} request(s) failed", failed).into());
    }
    Ok(())
}
