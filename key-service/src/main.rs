//! Key Service
//!
//! Single-process holder of the homomorphic secret key. Loads (or
//! generates) key material from the key directory, then answers three
//! bus subjects: decrypt_batch, decrypt_template and health. The crypto
//! context is not thread-safe, so decryption is serialized behind one
//! mutex and batches are handled one at a time.

mod service;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use he::{HeContext, SecretKey, DEFAULT_RING_DIM};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wire::{subjects, BusClient, DecryptBatchRequest, DecryptTemplateRequest, KeyHealthResponse};

struct KeyServiceState {
    context: HeContext,
    secret: Mutex<SecretKey>,
    bus: BusClient,
}

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

async fn run_decrypt_batch(state: Arc<KeyServiceState>) {
    loop {
        let mut sub = match state.bus.subscribe(subjects::KEY_DECRYPT_BATCH).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("subscribe failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        info!("serving {}", subjects::KEY_DECRYPT_BATCH);
        while let Some(msg) = sub.next().await {
            let req: DecryptBatchRequest = match serde_json::from_slice(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    warn!("bad decrypt_batch request: {e}");
                    continue;
                }
            };
            let entries = req.entries.len();
            let state_for_block = state.clone();
            // Decryption is CPU work holding the context lock; keep it off
            // the subscriber task.
            let decision = tokio::task::spawn_blocking(move || {
                let secret = state_for_block.secret.lock();
                service::decide(&secret, state_for_block.context.ring_dim, &req)
            })
            .await;
            match decision {
                Ok(decision) => {
                    info!(
                        "decided batch of {entries}: is_match={} hd={:.4}",
                        decision.is_match, decision.hamming_distance
                    );
                    let _ = state.bus.reply_json(msg.reply, &decision).await;
                }
                Err(e) => warn!("decrypt task failed: {e}"),
            }
        }
        warn!("decrypt_batch subscription ended, resubscribing");
    }
}

async fn run_decrypt_template(state: Arc<KeyServiceState>) {
    loop {
        let mut sub = match state.bus.subscribe(subjects::KEY_DECRYPT_TEMPLATE).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("subscribe failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        info!("serving {}", subjects::KEY_DECRYPT_TEMPLATE);
        while let Some(msg) = sub.next().await {
            let req: DecryptTemplateRequest = match serde_json::from_slice(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    warn!("bad decrypt_template request: {e}");
                    continue;
                }
            };
            info!("decrypting template {} for inspection", req.template_id);
            let state_for_block = state.clone();
            let response = tokio::task::spawn_blocking(move || {
                let secret = state_for_block.secret.lock();
                service::decrypt_template(&secret, &req)
            })
            .await;
            match response {
                Ok(response) => {
                    let _ = state.bus.reply_json(msg.reply, &response).await;
                }
                Err(e) => warn!("decrypt task failed: {e}"),
            }
        }
        warn!("decrypt_template subscription ended, resubscribing");
    }
}

async fn run_health(state: Arc<KeyServiceState>) {
    loop {
        let mut sub = match state.bus.subscribe(subjects::KEY_HEALTH).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("subscribe failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        info!("serving {}", subjects::KEY_HEALTH);
        while let Some(msg) = sub.next().await {
            let response = KeyHealthResponse {
                status: "ok".to_string(),
                ring_dimension: state.context.ring_dim as u32,
            };
            let _ = state.bus.reply_json(msg.reply, &response).await;
        }
        warn!("health subscription ended, resubscribing");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EYED_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let nats_url =
        std::env::var("EYED_NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());
    let key_dir = PathBuf::from(
        std::env::var("EYED_HE_KEY_DIR").unwrap_or_else(|_| "/var/lib/eyed/keys".to_string()),
    );

    // Corrupt or partial key material is fatal: no partial service.
    let (context, secret, _public) = match he::load_or_generate(&key_dir, DEFAULT_RING_DIM) {
        Ok(material) => material,
        Err(e) => {
            error!("key material unusable: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "key service starting: ring dimension {} (keys in {})",
        context.ring_dim,
        key_dir.display()
    );

    let Some(bus) = connect_bus(&nats_url).await else {
        error!("bus unreachable after retries, exiting");
        std::process::exit(1);
    };

    let state = Arc::new(KeyServiceState {
        context,
        secret: Mutex::new(secret),
        bus,
    });

    let batch = tokio::spawn(run_decrypt_batch(state.clone()));
    let template = tokio::spawn(run_decrypt_template(state.clone()));
    let health = tokio::spawn(run_health(state.clone()));

    info!("key service ready");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("signal handler failed: {e}"),
    }

    batch.abort();
    template.abort();
    health.abort();
    state.bus.flush().await;
    info!("key service stopped");
}
