//! Engine service state and bus consumption.
//!
//! Heavy subjects (analyze, enroll) feed a bounded channel drained by a
//! fixed set of consumer tasks, so the subscriber itself never does more
//! than a hand-off. When the channel is full the request is shed
//! immediately with accepted=false and the current queue depth.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use analysis::{Gallery, GalleryCodes, GalleryEntry, PipelinePool};
use analysis::code::CodeArray;
use analysis::gallery::EncryptedCandidate;
use analysis::TemplateCodes;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use store::{IrisTemplate, TemplateFormat, WriteThroughCache};
use tokio::sync::mpsc;
use tracing::{info, warn};
use wire::{
    subjects, AnalyzeAck, BusClient, EngineHealthResponse, EnrollResponse, PoolStatus,
};

use crate::config::EngineConfig;
use crate::registry::DatasetRegistry;

/// Public-side homomorphic material. The engine never holds the secret.
pub struct HeState {
    pub context: he::HeContext,
    pub public: he::PublicKey,
}

pub struct EngineService {
    pub cfg: EngineConfig,
    pub bus: BusClient,
    pub db: store::Pool,
    pub cache: WriteThroughCache,
    pub pool: PipelinePool,
    pub gallery: Gallery,
    pub registry: DatasetRegistry,
    pub he: Option<HeState>,
    /// Requests queued behind the pool.
    pub pending: AtomicUsize,
    /// Key service failures (fail-closed matches).
    pub key_failures: AtomicU64,
}

impl EngineService {
    pub fn queue_depth(&self) -> u32 {
        self.pending.load(Ordering::Relaxed) as u32
    }

    pub async fn health(&self) -> EngineHealthResponse {
        let db_connected = store::db::ping(&self.db).await;
        let cache_connected = self.cache.is_connected().await;
        let stats = self.pool.stats();
        EngineHealthResponse {
            alive: true,
            ready: db_connected,
            pipeline_loaded: true,
            gallery_size: self.gallery.snapshot().len() as u64,
            db_connected,
            cache_connected,
            he_enabled: self.he.is_some(),
            pool: PoolStatus {
                size: stats.size,
                available: stats.available,
            },
        }
    }
}

// ============================================================================
// Gallery loading
// ============================================================================

/// Decode one stored template into a gallery entry. Undecodable rows are
/// logged and skipped rather than taking the gallery down.
pub fn entry_from_template(t: &IrisTemplate) -> Option<GalleryEntry> {
    let codes = match t.format {
        TemplateFormat::Plain => {
            let iris = store::template::decode_plain_blob(&t.iris_codes).ok()?;
            let masks = store::template::decode_plain_blob(&t.mask_codes).ok()?;
            if iris.len() != masks.len() {
                return None;
            }
            let scales: Option<Vec<CodeArray>> = iris
                .iter()
                .map(|s| CodeArray::from_bytes(s.width, s.height, &s.data))
                .collect();
            let mask_arrays: Option<Vec<CodeArray>> = masks
                .iter()
                .map(|s| CodeArray::from_bytes(s.width, s.height, &s.data))
                .collect();
            GalleryCodes::Plain(TemplateCodes {
                scales: scales?,
                masks: mask_arrays?,
            })
        }
        TemplateFormat::EncryptedV1 => {
            let blob = he::EncryptedBlob::decode(&t.iris_codes).ok()?;
            let total_bits = blob.scales.iter().map(|s| s.bits()).sum();
            GalleryCodes::Encrypted(EncryptedCandidate { blob, total_bits })
        }
    };
    Some(GalleryEntry {
        template_id: t.template_id,
        identity_id: t.identity_id,
        identity_name: t.identity_name.clone(),
        eye_side: t.eye_side,
        codes,
    })
}

/// Full reload from the database (startup and after deletions).
pub async fn reload_gallery(svc: &EngineService) -> Result<u64, store::StoreError> {
    let templates = store::db::load_gallery(&svc.db).await?;
    let total = templates.len();
    let entries: Vec<Arc<GalleryEntry>> = templates
        .iter()
        .filter_map(|t| match entry_from_template(t) {
            Some(entry) => Some(Arc::new(entry)),
            None => {
                warn!("template {} is undecodable, skipping", t.template_id);
                None
            }
        })
        .collect();
    let loaded = entries.len();
    let version = svc.gallery.replace(entries);
    info!("gallery v{version}: {loaded}/{total} templates loaded");
    Ok(loaded as u64)
}

// ============================================================================
// Request/reply subscriber loop
// ============================================================================

/// Subscribe to `subject`, decode each request, answer with the handler's
/// response. Resubscribes forever; malformed requests are dropped.
pub async fn serve<Req, Resp, F, Fut>(svc: Arc<EngineService>, subject: &'static str, handler: F)
where
    Req: DeserializeOwned + Send,
    Resp: Serialize,
    F: Fn(Arc<EngineService>, Req) -> Fut,
    Fut: std::future::Future<Output = Resp>,
{
    loop {
        let mut sub = match svc.bus.subscribe(subject).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("subscribe {subject} failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        info!("serving {subject}");
        while let Some(msg) = sub.next().await {
            let req: Req = match serde_json::from_slice(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    warn!("bad request on {subject}: {e}");
                    continue;
                }
            };
            let resp = handler(svc.clone(), req).await;
            if let Err(e) = svc.bus.reply_json(msg.reply, &resp).await {
                warn!("reply on {subject} failed: {e}");
            }
        }
        warn!("{subject} subscription ended, resubscribing");
    }
}

// ============================================================================
// Heavy work loop (analyze + enroll)
// ============================================================================

pub enum WorkItem {
    Analyze(async_nats::Message),
    Enroll(async_nats::Message),
}

/// Start the feeders and the consumer set. Consumers are sized to the
/// pipeline pool; the channel adds a small waiting room beyond that.
pub fn start_work_loops(svc: Arc<EngineService>) {
    let (tx, rx) = mpsc::channel::<WorkItem>(svc.cfg.pool_size * 4);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    for worker_id in 0..svc.cfg.pool_size {
        let svc = svc.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let item = { rx.lock().await.recv().await };
                let Some(item) = item else {
                    info!("work consumer {worker_id} stopping");
                    return;
                };
                svc.pending.fetch_sub(1, Ordering::Relaxed);
                match item {
                    WorkItem::Analyze(msg) => crate::analyze::handle(svc.clone(), msg).await,
                    WorkItem::Enroll(msg) => crate::enroll::handle(svc.clone(), msg).await,
                }
            }
        });
    }

    tokio::spawn(feed(svc.clone(), subjects::ANALYZE, tx.clone(), WorkItem::Analyze));
    tokio::spawn(feed(svc, subjects::ENROLL, tx, WorkItem::Enroll));
}

async fn feed(
    svc: Arc<EngineService>,
    subject: &'static str,
    tx: mpsc::Sender<WorkItem>,
    wrap: fn(async_nats::Message) -> WorkItem,
) {
    loop {
        let mut sub = match svc.bus.subscribe(subject).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("subscribe {subject} failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        info!("consuming {subject}");
        while let Some(msg) = sub.next().await {
            match tx.try_send(wrap(msg)) {
                Ok(()) => {
                    svc.pending.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(item)) => shed(&svc, item).await,
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
        warn!("{subject} subscription ended, resubscribing");
    }
}

/// Immediate admission refusal when the waiting room is full.
async fn shed(svc: &EngineService, item: WorkItem) {
    let depth = svc.queue_depth();
    match item {
        WorkItem::Analyze(msg) => {
            let ack = AnalyzeAck {
                accepted: false,
                queue_depth: depth,
                result: None,
            };
            let _ = svc.bus.reply_json(msg.reply, &ack).await;
        }
        WorkItem::Enroll(msg) => {
            let resp = EnrollResponse {
                enrolled: false,
                identity_id: None,
                template_id: None,
                is_duplicate: false,
                duplicate_identity_id: None,
                duplicate_identity_name: None,
                error: Some(format!("engine busy ({depth} queued)")),
            };
            let _ = svc.bus.reply_json(msg.reply, &resp).await;
        }
    }
}
