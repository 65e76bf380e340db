use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use picshift::config::Config;
use picshift::constants::{LOCK_SWEEP_INTERVAL_SECS, SAMPLE_CONFIG};
use picshift::eviction::EvictionScheduler;
use picshift::prefetch::PrefetchEngine;
use picshift::service::ImageService;

/// Picshift - serves images as WebP/AVIF/JXL to clients that take them
#[derive(Parser, Debug)]
#[command(name = "picshift")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Convert every image under the image root before serving
    #[arg(long)]
    prefetch: bool,

    /// Concurrent conversions during prefetch (default: CPU count)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Print a sample configuration and exit
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_config {
        print!("{}", SAMPLE_CONFIG);
        return Ok(());
    }

    let config = Config::load(&args.config)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    picshift::logging::init_subscriber(&config.log)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        config_file = %args.config.display(),
        image_path = %config.image_path.display(),
        exhaust_path = %config.exhaust_path.display(),
        convert_types = ?config.convert_types,
        proxy = config.proxy.as_deref().unwrap_or("-"),
        img_map_entries = config.img_map.len(),
        max_cache_size_mb = config.max_cache_size,
        "Configuration loaded successfully"
    );

    let service = ImageService::from_config(&config)?;

    let locks = service.locks();
    let _sweeper = locks.spawn_sweeper(std::time::Duration::from_secs(LOCK_SWEEP_INTERVAL_SECS));

    let _eviction = config.max_cache_size_bytes().map(|max_bytes| {
        let scheduler = Arc::new(EvictionScheduler::new(
            config.exhaust_path.clone(),
            config.remote_raw_path.clone(),
            service.metadata(),
            service.backend(),
            service.locks(),
            max_bytes,
            config.eviction_order,
        ));
        tracing::info!(
            budget_bytes = max_bytes,
            interval_secs = config.eviction_interval_secs,
            order = ?config.eviction_order,
            "Cache eviction enabled"
        );
        scheduler.spawn(config.eviction_interval())
    });

    if args.prefetch {
        let jobs = args.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let engine = PrefetchEngine::new(service.clone(), jobs);
        tokio::spawn(async move {
            engine.run().await;
        });
    }

    let listen_addr = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    tracing::info!(address = %listen_addr, "Starting Picshift");

    tokio::select! {
        _ = picshift::server::serve(listener, service) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
