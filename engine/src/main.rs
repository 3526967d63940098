//! Engine
//!
//! Consumes analyze and enroll requests from the bus, dispatches to the
//! pipeline pool, matches against the gallery (plaintext locally,
//! encrypted via the key service), persists enrollments through the
//! write-through cache and hosts the single batch drainer.

mod analyze;
mod config;
mod enroll;
mod handlers;
mod registry;
mod service;

use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;

use analysis::{EncoderPipeline, Gallery, PipelinePool};
use analysis::pipeline::EncoderConfig;
use store::{BatchDrain, DrainConfig, WriteThroughCache};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wire::{subjects, BusClient};

use config::EngineConfig;
use registry::DatasetRegistry;
use service::{reload_gallery, serve, start_work_loops, EngineService, HeState};

async fn connect_bus(url: &str) -> Option<BusClient> {
    let mut backoff = Duration::from_millis(500);
    for attempt in 1..=5 {
        match BusClient::connect(url).await {
            Ok(bus) => {
                info!("bus connected: {url}");
                return Some(bus);
            }
            Err(e) => {
                warn!("bus connect attempt {attempt}/5 failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }
    }
    None
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EYED_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = EngineConfig::from_env();
    info!(
        "engine starting: bus={} pool={} he={} runtime={}",
        cfg.nats_url, cfg.pool_size, cfg.he_enabled, cfg.runtime
    );

    let Some(bus) = connect_bus(&cfg.nats_url).await else {
        error!("bus unreachable after retries, exiting");
        std::process::exit(1);
    };

    // Pipeline pool: a pool that cannot initialize is fatal.
    if cfg.runtime != "builtin" {
        error!("unknown pipeline runtime {:?}", cfg.runtime);
        std::process::exit(1);
    }
    let pool = match PipelinePool::new(cfg.pool_size, |_| {
        Ok(Box::new(EncoderPipeline::new(EncoderConfig::default())) as _)
    }) {
        Ok(pool) => pool,
        Err(e) => {
            error!("pipeline pool initialization failed: {e}");
            std::process::exit(1);
        }
    };

    // Homomorphic public material: required when HE is on.
    let he = if cfg.he_enabled {
        match he::load_public(&cfg.he_key_dir) {
            Ok((context, public)) => {
                info!(
                    "encrypted matching enabled (ring dimension {})",
                    context.ring_dim
                );
                Some(HeState { context, public })
            }
            Err(e) => {
                error!("cannot load public key material: {e}");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    // Database: pool construction is lazy; schema bootstrap retries in the
    // background so a late database does not kill the engine.
    let db = match store::connect(&cfg.db_url) {
        Ok(pool) => pool,
        Err(e) => {
            error!("bad database configuration: {e}");
            std::process::exit(1);
        }
    };
    {
        let db = db.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match store::db::bootstrap(&db).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!("schema bootstrap failed: {e}, retrying in {backoff:?}");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }
        });
    }

    let cache = WriteThroughCache::connect(&cfg.redis_url, db.clone()).await;

    let svc = Arc::new(EngineService {
        bus,
        db: db.clone(),
        pool,
        gallery: Gallery::new(),
        registry: DatasetRegistry::new(&cfg.dataset_paths),
        he,
        pending: AtomicUsize::new(0),
        key_failures: AtomicU64::new(0),
        cache,
        cfg: cfg.clone(),
    });

    match reload_gallery(&svc).await {
        Ok(count) => info!("gallery loaded with {count} templates"),
        Err(e) => warn!("gallery load failed ({e}), starting empty"),
    }

    // The single process-wide drainer.
    let (drain_shutdown_tx, drain_shutdown_rx) = tokio::sync::watch::channel(false);
    let drainer = svc.cache.redis().map(|redis| {
        let drain = BatchDrain::new(
            redis,
            db,
            DrainConfig {
                batch_size: cfg.batch_db_size,
                interval: cfg.batch_db_interval,
                ..DrainConfig::default()
            },
        );
        tokio::spawn(drain.run(drain_shutdown_rx))
    });
    if drainer.is_none() {
        warn!("cache unreachable at startup, running without drainer (direct DB writes)");
    }

    // Heavy subjects through the bounded work channel.
    start_work_loops(svc.clone());

    // Light request/reply subjects.
    tokio::spawn(serve(svc.clone(), subjects::ENROLL_BATCH, enroll::handle_enroll_batch));
    tokio::spawn(serve(svc.clone(), subjects::GALLERY_LIST, handlers::gallery_list));
    tokio::spawn(serve(svc.clone(), subjects::GALLERY_DELETE, handlers::gallery_delete));
    tokio::spawn(serve(svc.clone(), subjects::TEMPLATE_GET, handlers::template_get));
    tokio::spawn(serve(svc.clone(), subjects::DATASETS_LIST, handlers::datasets_list));
    tokio::spawn(serve(svc.clone(), subjects::DATASETS_SUBJECTS, handlers::datasets_subjects));
    tokio::spawn(serve(svc.clone(), subjects::DATASETS_IMAGES, handlers::datasets_images));
    tokio::spawn(serve(svc.clone(), subjects::DATASETS_REGISTER, handlers::datasets_register));
    tokio::spawn(serve(svc.clone(), subjects::DB_SCHEMA, handlers::db_schema));
    tokio::spawn(serve(svc.clone(), subjects::DB_ROWS, handlers::db_rows));
    tokio::spawn(serve(svc.clone(), subjects::DB_ROW, handlers::db_row));
    tokio::spawn(serve(svc.clone(), subjects::DB_STATS, handlers::db_stats));
    tokio::spawn(serve(svc.clone(), subjects::ENGINE_HEALTH, handlers::engine_health));

    info!("engine ready");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("signal handler failed: {e}"),
    }

    // Bounded final flush in the drainer, then out.
    let _ = drain_shutdown_tx.send(true);
    if let Some(handle) = drainer {
        if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
            warn!("drainer did not finish its final flush in time");
        }
    }
    svc.bus.flush().await;
    info!("engine stopped");
}
