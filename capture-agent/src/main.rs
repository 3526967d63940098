//! Capture Agent
//!
//! Edge half of frame ingestion. Two workers share a lock-free SPSC ring:
//! a producer thread reads frames from the source, scores sharpness and
//! drops anything below the quality gate; a streamer task pops frames and
//! drives the persistent gRPC stream to the gateway.
//!
//! Usage: capture-agent (configuration via CAPTURE_CONFIG + EYED_* env)

mod config;
mod quality;
mod ring;
mod source;
mod stream;

pub mod capture {
    tonic::include_proto!("eyed.capture");
}

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use capture::CaptureFrame;
use config::{CaptureConfig, SourceKind};
use quality::sobel_sharpness;
use ring::FrameRing;
use source::{DirectorySource, FrameSource, TestPatternSource};
use stream::{run_streamer, StreamStats};

#[derive(Default)]
struct ProducerStats {
    produced: AtomicU64,
    quality_rejected: AtomicU64,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Producer thread: read, score, gate, push. Runs until shutdown or the
/// source is exhausted.
fn run_producer(
    mut source: Box<dyn FrameSource>,
    ring: Arc<FrameRing<CaptureFrame>>,
    cfg: CaptureConfig,
    stats: Arc<ProducerStats>,
    shutdown: Arc<AtomicBool>,
) {
    let frame_interval = Duration::from_secs_f64(1.0 / cfg.fps);
    let mut frame_id: u64 = 0;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("source exhausted after {frame_id} frames");
                break;
            }
            Err(e) => {
                error!("source error: {e}");
                std::thread::sleep(frame_interval);
                continue;
            }
        };

        let score = sobel_sharpness(&frame.gray);
        if score < cfg.quality_threshold {
            stats.quality_rejected.fetch_add(1, Ordering::Relaxed);
            debug!("frame below quality gate ({score:.3} < {})", cfg.quality_threshold);
            std::thread::sleep(frame_interval);
            continue;
        }

        frame_id += 1;
        let pushed = ring.try_push(CaptureFrame {
            jpeg_data: frame.jpeg,
            quality_score: score,
            timestamp_us: now_us(),
            frame_id,
            device_id: cfg.device_id.clone(),
            eye_side: cfg.eye_side.clone(),
            is_nir: cfg.is_nir,
        });
        if pushed {
            stats.produced.fetch_add(1, Ordering::Relaxed);
        }
        // A refused push is already counted by the ring.

        std::thread::sleep(frame_interval);
    }
    info!("producer stopped");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EYED_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match CaptureConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "capture agent starting: device={} gateway={} source={:?}",
        cfg.device_id, cfg.gateway_addr, cfg.source.kind
    );

    let source: Box<dyn FrameSource> = match cfg.source.kind {
        SourceKind::Directory => {
            let dir = cfg.source.image_dir.clone().expect("validated");
            match DirectorySource::new(&dir, cfg.source.loop_images, cfg.jpeg_quality) {
                Ok(src) => Box::new(src),
                Err(e) => {
                    error!("cannot open image source: {e}");
                    std::process::exit(1);
                }
            }
        }
        SourceKind::TestPattern => Box::new(TestPatternSource::new(cfg.jpeg_quality)),
    };

    let ring: Arc<FrameRing<CaptureFrame>> = Arc::new(FrameRing::new(cfg.ring_capacity));
    let producer_stats = Arc::new(ProducerStats::default());
    let stream_stats = Arc::new(StreamStats::default());
    let producer_shutdown = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let producer = {
        let ring = ring.clone();
        let cfg = cfg.clone();
        let stats = producer_stats.clone();
        let shutdown = producer_shutdown.clone();
        std::thread::spawn(move || run_producer(source, ring, cfg, stats, shutdown))
    };

    let streamer = tokio::spawn(run_streamer(
        ring.clone(),
        cfg.clone(),
        stream_stats.clone(),
        shutdown_rx,
    ));

    // Periodic status line.
    let status = {
        let ring = ring.clone();
        let producer_stats = producer_stats.clone();
        let stream_stats = stream_stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.tick().await;
            loop {
                interval.tick().await;
                info!(
                    "produced={} sent={} accepted={} rejected={} dropped={} gated={} ring={}",
                    producer_stats.produced.load(Ordering::Relaxed),
                    stream_stats.sent.load(Ordering::Relaxed),
                    stream_stats.accepted.load(Ordering::Relaxed),
                    stream_stats.rejected.load(Ordering::Relaxed),
                    ring.dropped(),
                    producer_stats.quality_rejected.load(Ordering::Relaxed),
                    ring.len(),
                );
            }
        })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("signal handler failed: {e}"),
    }

    producer_shutdown.store(true, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);
    status.abort();

    if let Err(e) = streamer.await {
        error!("streamer task failed: {e}");
    }
    let _ = tokio::task::spawn_blocking(move || producer.join()).await;

    info!("capture agent stopped");
}
