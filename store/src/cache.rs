//! Write-through enrollment cache.
//!
//! `put` LPUSHes the serialized template onto the enrollment queue and
//! returns as soon as Redis acknowledges. When Redis is unreachable the
//! same call falls through to a direct database insert; the caller waits
//! a little longer but sees identical semantics.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::db::{self, Pool};
use crate::template::{IrisTemplate, QueueEnvelope, QueuedTemplate};
use crate::{StoreError, ENROLL_QUEUE_KEY};

/// How an accepted template entered the durability path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// On the cache queue; the drainer will persist it.
    Queued,
    /// Cache was down; the row is already in the database.
    DirectDb,
}

pub struct WriteThroughCache {
    redis: Option<ConnectionManager>,
    db: Pool,
    queue_key: String,
}

impl WriteThroughCache {
    /// Connect to Redis, tolerating an unreachable server: the cache then
    /// starts in degraded (direct-DB) mode.
    pub async fn connect(redis_url: &str, db: Pool) -> Self {
        let redis = match redis::Client::open(redis_url) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(mgr) => {
                    info!("enrollment cache connected: {redis_url}");
                    Some(mgr)
                }
                Err(e) => {
                    warn!("enrollment cache unreachable, running degraded: {e}");
                    None
                }
            },
            Err(e) => {
                warn!("bad redis url {redis_url}: {e}");
                None
            }
        };
        Self {
            redis,
            db,
            queue_key: ENROLL_QUEUE_KEY.to_string(),
        }
    }

    /// Build a cache for tests or degraded deployments with no Redis at all.
    pub fn degraded(db: Pool) -> Self {
        Self {
            redis: None,
            db,
            queue_key: ENROLL_QUEUE_KEY.to_string(),
        }
    }

    pub fn redis(&self) -> Option<ConnectionManager> {
        self.redis.clone()
    }

    /// Accept a template into the durability path.
    pub async fn put(&self, template: &IrisTemplate) -> Result<PutOutcome, StoreError> {
        if let Some(mgr) = &self.redis {
            let envelope = QueueEnvelope {
                attempts: 0,
                template: QueuedTemplate::from(template),
            };
            let body = serde_json::to_string(&envelope)?;
            let mut conn = mgr.clone();
            match conn.lpush::<_, _, ()>(&self.queue_key, body).await {
                Ok(()) => return Ok(PutOutcome::Queued),
                Err(e) => {
                    warn!(
                        "cache LPUSH failed for template {}, falling back to direct insert: {e}",
                        template.template_id
                    );
                }
            }
        }

        // Degraded path: synchronous insert on the caller's task.
        db::insert_templates(&self.db, std::slice::from_ref(template))
            .await
            .map_err(|e| StoreError::DegradedWriteFailed(e.to_string()))?;
        Ok(PutOutcome::DirectDb)
    }

    /// Current queue depth, if the cache is reachable.
    pub async fn queue_len(&self) -> Option<u64> {
        let mgr = self.redis.as_ref()?;
        let mut conn = mgr.clone();
        conn.llen::<_, u64>(&self.queue_key).await.ok()
    }

    pub async fn is_connected(&self) -> bool {
        self.queue_len().await.is_some()
    }
}
