//! Analyze request handling.
//!
//! received -> decoding -> pipeline -> matching -> publishing. Every
//! error path still publishes a terminal result; the pool guard rides
//! into the blocking pipeline stage and is released on drop whatever
//! happens there.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use analysis::{matcher, AnalyzeOptions, ProbeTemplate};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use image::GrayImage;
use tracing::{debug, warn};
use wire::{
    subjects, AnalyzeAck, AnalyzeIntermediates, AnalyzeRequest, AnalyzeResult, MatchDecision,
    MatchInfo, Trace,
};

use crate::service::EngineService;

pub async fn handle(svc: Arc<EngineService>, msg: async_nats::Message) {
    let req: AnalyzeRequest = match serde_json::from_slice(&msg.payload) {
        Ok(req) => req,
        Err(e) => {
            warn!("bad analyze request: {e}");
            let ack = AnalyzeAck {
                accepted: false,
                queue_depth: svc.queue_depth(),
                result: None,
            };
            let _ = svc.bus.reply_json(msg.reply, &ack).await;
            return;
        }
    };
    let ack = process(&svc, req).await;
    if let Err(e) = svc.bus.reply_json(msg.reply, &ack).await {
        warn!("analyze reply failed: {e}");
    }
}

pub async fn process(svc: &Arc<EngineService>, req: AnalyzeRequest) -> AnalyzeAck {
    let started = Instant::now();

    let gray = match decode_image(&req.jpeg_b64) {
        Ok(gray) => gray,
        Err(reason) => {
            debug!("{}: {reason}", Trace(&req.device_id, req.frame_id));
            return finish_with_error(svc, &req, started, reason).await;
        }
    };

    let guard = match svc.pool.acquire(svc.cfg.pool_acquire_timeout).await {
        Ok(guard) => guard,
        Err(_) => {
            // Admission refusal, not a frame failure: nothing is published.
            return AnalyzeAck {
                accepted: false,
                queue_depth: svc.queue_depth(),
                result: None,
            };
        }
    };

    let opts = AnalyzeOptions {
        detailed: req.detailed,
    };
    let pipeline_outcome = tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        guard.worker().pipeline.analyze(&gray, &opts)
        // guard drops here: worker returned, permit released
    })
    .await;

    let probe = match pipeline_outcome {
        Ok(Ok(probe)) => probe,
        Ok(Err(e)) => return finish_with_error(svc, &req, started, e.to_string()).await,
        Err(e) => {
            warn!("pipeline task panicked: {e}");
            return finish_with_error(svc, &req, started, "pipeline worker failed".to_string())
                .await;
        }
    };

    let match_info = compute_match(svc, &probe).await;
    let result = AnalyzeResult {
        frame_id: req.frame_id,
        device_id: req.device_id.clone(),
        match_info,
        latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
        error: None,
        intermediates: probe.intermediates.as_ref().map(|images| AnalyzeIntermediates {
            segmented_b64: Some(B64.encode(&images.segmented_png)),
            normalized_b64: Some(B64.encode(&images.normalized_png)),
            quality_score: probe.quality_score,
        }),
    };

    publish_result(svc, &result).await;
    log_match(svc, &result);

    AnalyzeAck {
        accepted: true,
        queue_depth: svc.queue_depth(),
        result: req.wait.then_some(result),
    }
}

fn decode_image(jpeg_b64: &str) -> Result<GrayImage, String> {
    let bytes = B64
        .decode(jpeg_b64)
        .map_err(|e| format!("invalid base64 image: {e}"))?;
    let decoded =
        image::load_from_memory(&bytes).map_err(|e| format!("invalid image: {e}"))?;
    Ok(decoded.to_luma8())
}

/// Match the probe against the current snapshot. Plaintext candidates are
/// scored locally; encrypted candidates go to the key service in one
/// batch. A key service failure fails closed.
async fn compute_match(svc: &Arc<EngineService>, probe: &ProbeTemplate) -> Option<MatchInfo> {
    let snapshot = svc.gallery.snapshot();
    if snapshot.is_empty() {
        return None;
    }

    // Plaintext side: overall best, threshold applied afterwards.
    let plain = matcher::best_match(&probe.codes, &snapshot, 1.0, svc.cfg.rotation_shift).map(
        |best| MatchInfo {
            hamming_distance: best.distance,
            is_match: best.distance <= svc.cfg.match_threshold,
            matched_identity_id: (best.distance <= svc.cfg.match_threshold)
                .then_some(best.identity_id),
            matched_identity_name: (best.distance <= svc.cfg.match_threshold)
                .then(|| best.identity_name.clone()),
            best_rotation: best.rotation,
        },
    );

    // Encrypted side: one decrypt_batch per analyze, decision only.
    let encrypted = if svc.he.is_some() {
        let batch = analysis::encrypted::build_decrypt_batch(
            &probe.codes,
            &snapshot,
            svc.cfg.match_threshold,
        );
        if batch.entries.is_empty() {
            None
        } else {
            match svc
                .bus
                .request_json::<_, MatchDecision>(
                    subjects::KEY_DECRYPT_BATCH,
                    &batch,
                    svc.cfg.key_request_timeout,
                )
                .await
            {
                Ok(decision) => Some(MatchInfo {
                    hamming_distance: decision.hamming_distance,
                    is_match: decision.is_match,
                    matched_identity_id: decision.matched_identity_id,
                    matched_identity_name: decision.matched_identity_name,
                    best_rotation: 0,
                }),
                Err(e) => {
                    svc.key_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("key service unavailable, failing closed: {e}");
                    Some(MatchInfo {
                        hamming_distance: 1.0,
                        is_match: false,
                        matched_identity_id: None,
                        matched_identity_name: None,
                        best_rotation: 0,
                    })
                }
            }
        }
    } else {
        None
    };

    match (plain, encrypted) {
        (Some(p), Some(e)) => Some(if e.hamming_distance <= p.hamming_distance { e } else { p }),
        (Some(p), None) => Some(p),
        (None, Some(e)) => Some(e),
        (None, None) => None,
    }
}

async fn finish_with_error(
    svc: &Arc<EngineService>,
    req: &AnalyzeRequest,
    started: Instant,
    error: String,
) -> AnalyzeAck {
    let result = AnalyzeResult {
        frame_id: req.frame_id,
        device_id: req.device_id.clone(),
        match_info: None,
        latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
        error: Some(error),
        intermediates: None,
    };
    publish_result(svc, &result).await;
    AnalyzeAck {
        accepted: true,
        queue_depth: svc.queue_depth(),
        result: req.wait.then_some(result),
    }
}

async fn publish_result(svc: &Arc<EngineService>, result: &AnalyzeResult) {
    if let Err(e) = svc.bus.publish_json(subjects::RESULT, result).await {
        warn!(
            "result publish failed for {}: {e}",
            Trace(&result.device_id, result.frame_id)
        );
    }
}

/// Best-effort audit row; never blocks the request path.
fn log_match(svc: &Arc<EngineService>, result: &AnalyzeResult) {
    let db = svc.db.clone();
    let frame_id = result.frame_id;
    let device_id = result.device_id.clone();
    let (hd, is_match, identity) = match &result.match_info {
        Some(m) => (Some(m.hamming_distance), m.is_match, m.matched_identity_id),
        None => (None, false, None),
    };
    let latency_ms = result.latency_ms;
    tokio::spawn(async move {
        if let Err(e) =
            store::db::record_match(&db, frame_id, &device_id, hd, is_match, identity, latency_ms)
                .await
        {
            debug!("match log write failed: {e}");
        }
    });
}
