use std::time::Instant;

use anyhow::{Context, Result};
use linkcache_service::backend::create_backend;
use linkcache_service::caching::{CacheOptions, LoadingCache};
use linkcache_service::config::Config;
use linkcache_service::{logging, metrics};
use linkcache_sources::{Address, GroupKey};
use tokio::runtime::Handle;

use settings::{Command, Settings};

mod output;
mod settings;

fn main() {
    match execute_cli() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute_cli() -> Result<()> {
    let Settings { config, command } = Settings::get()?;

    // SAFETY: We are in the main function and the runtime is not started yet.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("linkcli-worker")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(run(&config, command))
}

async fn run(config: &Config, command: Command) -> Result<()> {
    let backend = create_backend(config)?;
    let cache = LoadingCache::new(backend, CacheOptions::from_config(config), Handle::current());

    let result = execute(&cache, command).await;
    cache.dispose();
    result
}

async fn execute(cache: &LoadingCache, command: Command) -> Result<()> {
    match command {
        Command::Preload { group } => {
            let group = GroupKey::new(group);
            let start = Instant::now();
            cache
                .preload_all(&group)
                .await
                .with_context(|| format!("failed to preload group `{group}`"))?;

            let addresses = cache.group_addresses(&group).unwrap_or_default();
            output::print_group(cache, &group, &addresses, start.elapsed());
        }
        Command::Load { address } => {
            let address = Address::new(address);
            let content = cache
                .load_address(&address)
                .await
                .with_context(|| format!("failed to load `{address}`"))?;
            output::print_content(&address, &content)?;
        }
        Command::CheckUpdates => {
            let updates = cache
                .check_for_updates()
                .await
                .context("failed to check for updates")?;
            output::print_updates(&updates);
        }
        Command::Download {
            addresses,
            if_needed,
        } => {
            let mut progress = output::ProgressPrinter::new();
            if if_needed {
                cache
                    .download_updates_if_needed(|downloaded, total| {
                        progress.update(downloaded, total)
                    })
                    .await?;
            } else {
                let items = if addresses.is_empty() {
                    cache.check_for_updates().await?.items
                } else {
                    addresses.into_iter().map(Address::new).collect()
                };
                cache
                    .download_updates(items, |downloaded, total| {
                        progress.update(downloaded, total)
                    })
                    .await?;
            }
            progress.finish();
        }
        Command::Size { addresses } => {
            let items = addresses.into_iter().map(Address::new).collect();
            let size = cache.get_download_size(items).await?;
            println!("{size}");
        }
    }

    Ok(())
}
