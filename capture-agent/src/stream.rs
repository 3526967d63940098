//! Frame streamer.
//!
//! Pops frames from the ring and sends them over a persistent
//! bidirectional gRPC stream, awaiting one ack per frame. Transport
//! failure tears the stream down and reconnects with exponential backoff;
//! accepted=false is rate-limiting, answered with a throttle sleep
//! proportional to the reported queue depth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Request;
use tracing::{debug, info, warn};

use crate::capture::capture_service_client::CaptureServiceClient;
use crate::capture::{CaptureFrame, FrameAck};
use crate::config::CaptureConfig;
use crate::ring::FrameRing;

#[derive(Default)]
pub struct StreamStats {
    pub sent: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub reconnects: AtomicU64,
}

pub async fn run_streamer(
    ring: Arc<FrameRing<CaptureFrame>>,
    cfg: CaptureConfig,
    stats: Arc<StreamStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let base = Duration::from_millis(cfg.reconnect.base_ms);
    let cap = Duration::from_millis(cfg.reconnect.max_ms);
    let mut backoff = base;

    'reconnect: loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::time::timeout(
            Duration::from_millis(cfg.connect_timeout_ms),
            CaptureServiceClient::connect(cfg.gateway_addr.clone()),
        )
        .await;
        let mut client = match connected {
            Ok(Ok(client)) => {
                backoff = base;
                client
            }
            Ok(Err(e)) => {
                warn!("gateway connect failed: {e}, retrying in {backoff:?}");
                if wait_or_shutdown(backoff, &mut shutdown).await {
                    break;
                }
                backoff = (backoff * 2).min(cap);
                continue;
            }
            Err(_) => {
                warn!("gateway connect timed out, retrying in {backoff:?}");
                if wait_or_shutdown(backoff, &mut shutdown).await {
                    break;
                }
                backoff = (backoff * 2).min(cap);
                continue;
            }
        };

        // Lockstep stream: one outbound frame, one inbound ack.
        let (tx, rx) = mpsc::channel::<CaptureFrame>(1);
        let mut inbound = match client.stream_frames(Request::new(ReceiverStream::new(rx))).await {
            Ok(response) => response.into_inner(),
            Err(e) => {
                warn!("stream open failed: {e}");
                if wait_or_shutdown(backoff, &mut shutdown).await {
                    break;
                }
                backoff = (backoff * 2).min(cap);
                continue;
            }
        };
        info!("frame stream established to {}", cfg.gateway_addr);
        stats.reconnects.fetch_add(1, Ordering::Relaxed);

        loop {
            let frame = tokio::select! {
                frame = ring.pop() => frame,
                _ = shutdown.changed() => {
                    flush_stream(&ring, tx, &mut inbound, &stats, &cfg).await;
                    break 'reconnect;
                }
            };

            if tx.send(frame).await.is_err() {
                warn!("outbound stream closed, reconnecting");
                break;
            }
            match await_ack(&mut inbound, &stats, &cfg).await {
                AckOutcome::Ok => {}
                AckOutcome::Lost => break,
            }
        }

        if wait_or_shutdown(backoff, &mut shutdown).await {
            break;
        }
        backoff = (backoff * 2).min(cap);
    }
    info!("streamer stopped");
}

enum AckOutcome {
    Ok,
    Lost,
}

async fn await_ack(
    inbound: &mut tonic::Streaming<FrameAck>,
    stats: &StreamStats,
    cfg: &CaptureConfig,
) -> AckOutcome {
    stats.sent.fetch_add(1, Ordering::Relaxed);
    match inbound.message().await {
        Ok(Some(ack)) => {
            if ack.accepted {
                stats.accepted.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                // Rate-limited, not an error: back off proportionally to
                // the reported queue depth.
                let pause = Duration::from_millis(
                    cfg.throttle_ms_per_queued * u64::from(ack.queue_depth.max(1)),
                );
                debug!(
                    "frame {} rejected (queue depth {}), throttling {pause:?}",
                    ack.frame_id, ack.queue_depth
                );
                tokio::time::sleep(pause).await;
            }
            AckOutcome::Ok
        }
        Ok(None) => {
            warn!("gateway closed the ack stream");
            AckOutcome::Lost
        }
        Err(e) => {
            warn!("ack stream error: {e}");
            AckOutcome::Lost
        }
    }
}

/// Clean shutdown: send what is still in the ring, close the outbound
/// side (WritesDone), then drain acks until the server finishes.
async fn flush_stream(
    ring: &FrameRing<CaptureFrame>,
    tx: mpsc::Sender<CaptureFrame>,
    inbound: &mut tonic::Streaming<FrameAck>,
    stats: &StreamStats,
    cfg: &CaptureConfig,
) {
    let mut flushed = 0u32;
    while let Some(frame) = ring.try_pop() {
        if tx.send(frame).await.is_err() {
            break;
        }
        if matches!(await_ack(inbound, stats, cfg).await, AckOutcome::Lost) {
            return;
        }
        flushed += 1;
    }
    info!("flushed {flushed} buffered frames, closing stream");
    // Dropping the only sender half signals WritesDone; then await Finish.
    drop(tx);
    while let Ok(Some(_)) = inbound.message().await {}
}

/// Returns true if shutdown fired during the wait.
async fn wait_or_shutdown(pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}
