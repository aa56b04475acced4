//! pixcache command-line entry point.
//!
//! Results go to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use pixcache_client::{ImageLoader, ImageRequest};
use pixcache_core::{AppConfig, DiskStore};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Args, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(dir) = args.cache_dir {
        config.cache_dir = dir;
    }

    match args.command {
        Commands::Fetch { url, output, no_server_policy } => {
            if no_server_policy {
                config.use_server_cache_policy = false;
            }
            let loader = ImageLoader::new(config).await?;
            let cached = loader.cache_image(ImageRequest::get(url)).wait().await?;

            if let Some(output) = &output {
                match &cached.path {
                    Some(path) => {
                        tokio::fs::copy(path, output).await.with_context(|| format!("copying to {}", output.display()))?;
                    }
                    None => cached.image.image().save(output).with_context(|| format!("writing {}", output.display()))?,
                }
            }

            let report = serde_json::json!({
                "url": cached.url,
                "source": cached.source,
                "width": cached.image.width(),
                "height": cached.image.height(),
                "path": cached.path,
            });
            println!("{report}");
        }
        Commands::Purge(purge) => {
            let max_age = purge.max_age();
            let store = DiskStore::open(&config.cache_dir).await?;
            let removed = store.purge_older_than(max_age).await?;
            println!("{}", serde_json::json!({ "removed": removed, "max_age_secs": max_age.as_secs() }));
        }
        Commands::Config => {
            if config.auth_password.is_some() {
                config.auth_password = Some("********".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
