//! Enrollment: single requests and bulk dataset jobs.
//!
//! Dedup runs against the current gallery snapshot with the stricter
//! threshold. Accepted templates go to the write-through cache and the
//! gallery snapshot is extended in place; database durability follows
//! asynchronously through the drainer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use analysis::gallery::EncryptedCandidate;
use analysis::{matcher, GalleryCodes, GalleryEntry, ProbeTemplate};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::StreamExt;
use image::GrayImage;
use store::template::{encode_plain_blob, PackedScale};
use store::{IrisTemplate, TemplateFormat};
use tracing::{info, warn};
use uuid::Uuid;
use wire::{
    subjects, BulkEnrollAck, BulkEnrollEvent, BulkEnrollRequest, BulkEnrollResult,
    BulkEnrollSummary, EnrollRequest, EnrollResponse, EyeSide, MatchDecision,
};

use crate::service::EngineService;

fn error_response(error: impl Into<String>) -> EnrollResponse {
    EnrollResponse {
        enrolled: false,
        identity_id: None,
        template_id: None,
        is_duplicate: false,
        duplicate_identity_id: None,
        duplicate_identity_name: None,
        error: Some(error.into()),
    }
}

pub async fn handle(svc: Arc<EngineService>, msg: async_nats::Message) {
    let req: EnrollRequest = match serde_json::from_slice(&msg.payload) {
        Ok(req) => req,
        Err(e) => {
            warn!("bad enroll request: {e}");
            let _ = svc
                .bus
                .reply_json(msg.reply, &error_response(format!("bad request: {e}")))
                .await;
            return;
        }
    };
    let resp = process(&svc, req).await;
    if let Err(e) = svc.bus.reply_json(msg.reply, &resp).await {
        warn!("enroll reply failed: {e}");
    }
}

async fn process(svc: &Arc<EngineService>, req: EnrollRequest) -> EnrollResponse {
    let bytes = match B64.decode(&req.jpeg_b64) {
        Ok(bytes) => bytes,
        Err(e) => return error_response(format!("invalid base64 image: {e}")),
    };
    let gray = match image::load_from_memory(&bytes) {
        Ok(img) => img.to_luma8(),
        Err(e) => return error_response(format!("invalid image: {e}")),
    };
    enroll_image(
        svc,
        gray,
        req.eye_side,
        req.identity_id,
        req.name,
        req.device_id,
    )
    .await
}

/// Pipeline + dedup + persist for one decoded image.
pub async fn enroll_image(
    svc: &Arc<EngineService>,
    gray: GrayImage,
    eye_side: EyeSide,
    identity_id: Option<Uuid>,
    name: Option<String>,
    device_id: Option<String>,
) -> EnrollResponse {
    let guard = match svc.pool.acquire(svc.cfg.pool_acquire_timeout).await {
        Ok(guard) => guard,
        Err(_) => return error_response("engine busy, pipeline pool exhausted"),
    };
    let outcome = tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        guard
            .worker()
            .pipeline
            .analyze(&gray, &analysis::AnalyzeOptions::default())
    })
    .await;
    let probe = match outcome {
        Ok(Ok(probe)) => probe,
        Ok(Err(e)) => return error_response(e.to_string()),
        Err(e) => {
            warn!("enroll pipeline task panicked: {e}");
            return error_response("pipeline worker failed");
        }
    };

    if let Some((dup_id, dup_name)) = dedup_hit(svc, &probe).await {
        return EnrollResponse {
            enrolled: false,
            identity_id: None,
            template_id: None,
            is_duplicate: true,
            duplicate_identity_id: Some(dup_id),
            duplicate_identity_name: Some(dup_name),
            error: None,
        };
    }

    let identity_id = identity_id.unwrap_or_else(Uuid::new_v4);
    let template_id = Uuid::new_v4();
    let identity_name = name.unwrap_or_else(|| {
        format!("identity-{}", &identity_id.to_string()[..8])
    });

    let (template, gallery_codes) = match build_template(
        svc,
        &probe,
        template_id,
        identity_id,
        identity_name.clone(),
        eye_side,
        device_id,
    ) {
        Ok(pair) => pair,
        Err(e) => return error_response(e),
    };

    if let Err(e) = svc.cache.put(&template).await {
        warn!("enrollment persist failed for {template_id}: {e}");
        return error_response(format!("persistence unavailable: {e}"));
    }

    let version = svc.gallery.append(GalleryEntry {
        template_id,
        identity_id,
        identity_name,
        eye_side,
        codes: gallery_codes,
    });
    info!("enrolled template {template_id} for identity {identity_id} (gallery v{version})");

    EnrollResponse {
        enrolled: true,
        identity_id: Some(identity_id),
        template_id: Some(template_id),
        is_duplicate: false,
        duplicate_identity_id: None,
        duplicate_identity_name: None,
        error: None,
    }
}

/// Does this probe collide with an already-enrolled template under the
/// dedup threshold?
async fn dedup_hit(svc: &Arc<EngineService>, probe: &ProbeTemplate) -> Option<(Uuid, String)> {
    let snapshot = svc.gallery.snapshot();
    if snapshot.is_empty() {
        return None;
    }

    if let Some(best) = matcher::best_match(
        &probe.codes,
        &snapshot,
        svc.cfg.dedup_threshold,
        svc.cfg.rotation_shift,
    ) {
        return Some((best.identity_id, best.identity_name));
    }

    if svc.he.is_some() {
        let batch = analysis::encrypted::build_decrypt_batch(
            &probe.codes,
            &snapshot,
            svc.cfg.dedup_threshold,
        );
        if !batch.entries.is_empty() {
            match svc
                .bus
                .request_json::<_, MatchDecision>(
                    subjects::KEY_DECRYPT_BATCH,
                    &batch,
                    svc.cfg.key_request_timeout,
                )
                .await
            {
                Ok(decision) if decision.is_match => {
                    let id = decision.matched_identity_id?;
                    return Some((
                        id,
                        decision.matched_identity_name.unwrap_or_default(),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    svc.key_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("dedup check against key service failed: {e}");
                }
            }
        }
    }
    None
}

fn build_template(
    svc: &Arc<EngineService>,
    probe: &ProbeTemplate,
    template_id: Uuid,
    identity_id: Uuid,
    identity_name: String,
    eye_side: EyeSide,
    device_id: Option<String>,
) -> Result<(IrisTemplate, GalleryCodes), String> {
    let mask_scales: Vec<PackedScale> = probe
        .codes
        .masks
        .iter()
        .map(|m| PackedScale {
            width: m.width,
            height: m.height,
            data: m.to_bytes(),
        })
        .collect();
    let mask_blob = encode_plain_blob(&mask_scales).map_err(|e| e.to_string())?;

    let (iris_blob, format, gallery_codes) = match &svc.he {
        Some(he_state) => {
            let blob = {
                let mut rng = rand::thread_rng();
                analysis::encrypted::encrypt_template(&he_state.public, &probe.codes, &mut rng)
            };
            let total_bits = blob.scales.iter().map(|s| s.bits()).sum();
            let bytes = blob.encode();
            (
                bytes,
                TemplateFormat::EncryptedV1,
                GalleryCodes::Encrypted(EncryptedCandidate { blob, total_bits }),
            )
        }
        None => {
            let iris_scales: Vec<PackedScale> = probe
                .codes
                .scales
                .iter()
                .map(|c| PackedScale {
                    width: c.width,
                    height: c.height,
                    data: c.to_bytes(),
                })
                .collect();
            (
                encode_plain_blob(&iris_scales).map_err(|e| e.to_string())?,
                TemplateFormat::Plain,
                GalleryCodes::Plain(probe.codes.clone()),
            )
        }
    };

    Ok((
        IrisTemplate {
            template_id,
            identity_id,
            identity_name,
            eye_side,
            width: probe.width,
            height: probe.height,
            n_scales: probe.n_scales,
            quality_score: probe.quality_score,
            device_id,
            iris_codes: iris_blob,
            mask_codes: mask_blob,
            format,
        },
        gallery_codes,
    ))
}

// ============================================================================
// Bulk enrollment
// ============================================================================

pub async fn handle_enroll_batch(
    svc: Arc<EngineService>,
    req: BulkEnrollRequest,
) -> BulkEnrollAck {
    let job_id = req.job_id.unwrap_or_else(Uuid::new_v4);
    let progress_subject = subjects::enroll_progress(job_id);

    let items = match svc.registry.walk(&req.dataset, None) {
        Ok(items) => items,
        Err(e) => {
            return BulkEnrollAck {
                job_id,
                progress_subject,
                error: Some(format!("unknown dataset {:?}", e.0)),
            };
        }
    };
    let items = match req.limit {
        Some(limit) => items.into_iter().take(limit).collect(),
        None => items,
    };

    info!(
        "bulk enroll job {job_id}: dataset {} with {} images",
        req.dataset,
        items.len()
    );
    tokio::spawn(run_bulk_job(svc, job_id, progress_subject.clone(), items));
    BulkEnrollAck {
        job_id,
        progress_subject,
        error: None,
    }
}

async fn run_bulk_job(
    svc: Arc<EngineService>,
    job_id: Uuid,
    progress_subject: String,
    items: Vec<(String, std::path::PathBuf)>,
) {
    // Client disconnect publishes on the cancel subject; the walk stops
    // after the in-flight item (bounded drain).
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancel_task = {
        let svc = svc.clone();
        let cancelled = cancelled.clone();
        let subject = subjects::enroll_cancel(job_id);
        tokio::spawn(async move {
            if let Ok(mut sub) = svc.bus.subscribe(&subject).await {
                if sub.next().await.is_some() {
                    cancelled.store(true, Ordering::Relaxed);
                }
            }
        })
    };

    let mut summary = BulkEnrollSummary {
        total: 0,
        enrolled: 0,
        duplicates: 0,
        errors: 0,
    };

    let mut work = futures_util::stream::iter(items.into_iter().map(|(subject, path)| {
        let svc = svc.clone();
        async move { enroll_bulk_item(&svc, subject, path).await }
    }))
    .buffered(svc.cfg.batch_workers);

    while let Some(result) = work.next().await {
        summary.total += 1;
        if result.enrolled {
            summary.enrolled += 1;
        } else if result.duplicate {
            summary.duplicates += 1;
        } else {
            summary.errors += 1;
        }
        let _ = svc
            .bus
            .publish_json(&progress_subject, &BulkEnrollEvent::Result(result))
            .await;

        if cancelled.load(Ordering::Relaxed) {
            info!("bulk enroll job {job_id} cancelled after {} items", summary.total);
            break;
        }
    }

    let _ = svc
        .bus
        .publish_json(&progress_subject, &BulkEnrollEvent::Done(summary.clone()))
        .await;
    cancel_task.abort();
    info!(
        "bulk enroll job {job_id} done: {} total, {} enrolled, {} duplicates, {} errors",
        summary.total, summary.enrolled, summary.duplicates, summary.errors
    );
}

async fn enroll_bulk_item(
    svc: &Arc<EngineService>,
    subject: String,
    path: std::path::PathBuf,
) -> BulkEnrollResult {
    let image_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("?")
        .to_string();

    let failure = |error: String| BulkEnrollResult {
        subject: subject.clone(),
        image: image_name.clone(),
        enrolled: false,
        duplicate: false,
        identity_id: None,
        error: Some(error),
    };

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => return failure(format!("read failed: {e}")),
    };
    let gray = match image::load_from_memory(&bytes) {
        Ok(img) => img.to_luma8(),
        Err(e) => return failure(format!("invalid image: {e}")),
    };

    // Reuse the subject's identity when it is already enrolled.
    let existing = svc
        .gallery
        .snapshot()
        .entries
        .iter()
        .find(|e| e.identity_name == subject)
        .map(|e| e.identity_id);

    let response = enroll_image(
        svc,
        gray,
        EyeSide::Left,
        existing,
        Some(subject.clone()),
        None,
    )
    .await;

    BulkEnrollResult {
        subject,
        image: image_name,
        enrolled: response.enrolled,
        duplicate: response.is_duplicate,
        identity_id: response.identity_id.or(response.duplicate_identity_id),
        error: response.error,
    }
}
