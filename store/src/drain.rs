//! Batch drainer.
//!
//! A single process-wide task pops up to `batch_size` items or waits up
//! to `interval`, whichever comes first, then commits the batch in one
//! transaction. Transient database failures re-queue the batch at the
//! head of the list in order; items that keep failing on their own move
//! to the dead-letter list after `max_attempts`.

use std::num::NonZeroUsize;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::db::{self, Pool};
use crate::template::QueueEnvelope;
use crate::{StoreError, ENROLL_DLQ_KEY, ENROLL_QUEUE_KEY};

#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Max items per database transaction (B).
    pub batch_size: usize,
    /// Max time to accumulate a batch (T).
    pub interval: Duration,
    /// Per-item attempts before dead-lettering (K).
    pub max_attempts: u32,
    /// Deadline for the shutdown flush.
    pub final_flush: Duration,
    pub queue_key: String,
    pub dlq_key: String,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            interval: Duration::from_secs(2),
            max_attempts: 5,
            final_flush: Duration::from_secs(5),
            queue_key: ENROLL_QUEUE_KEY.to_string(),
            dlq_key: ENROLL_DLQ_KEY.to_string(),
        }
    }
}

enum FlushOutcome {
    Committed(u64),
    /// Database unreachable; items were re-queued at the head.
    Transient,
}

pub struct BatchDrain {
    redis: ConnectionManager,
    db: Pool,
    cfg: DrainConfig,
}

impl BatchDrain {
    pub fn new(redis: ConnectionManager, db: Pool, cfg: DrainConfig) -> Self {
        Self { redis, db, cfg }
    }

    /// Drain until shutdown, then attempt one bounded final flush.
    /// Items left on the list survive restart.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "drainer started: batch={} interval={:?} max_attempts={}",
            self.cfg.batch_size, self.cfg.interval, self.cfg.max_attempts
        );
        let mut backoff = Duration::from_millis(250);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = self.collect_batch(&mut shutdown).await;
            if batch.is_empty() {
                continue;
            }
            match self.flush_batch(&batch).await {
                FlushOutcome::Committed(n) => {
                    debug!("drained {} items ({} new rows)", batch.len(), n);
                    backoff = Duration::from_millis(250);
                }
                FlushOutcome::Transient => {
                    warn!(
                        "database unavailable, re-queued {} items, backing off {:?}",
                        batch.len(),
                        backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        }

        self.final_flush().await;
        info!("drainer stopped");
    }

    /// Accumulate up to `batch_size` items or until `interval` elapses.
    async fn collect_batch(&mut self, shutdown: &mut watch::Receiver<bool>) -> Vec<String> {
        let deadline = Instant::now() + self.cfg.interval;
        let mut batch: Vec<String> = Vec::new();

        loop {
            if batch.len() >= self.cfg.batch_size || *shutdown.borrow() {
                break;
            }
            let want = self.cfg.batch_size - batch.len();
            match self
                .redis
                .rpop::<_, Vec<String>>(&self.cfg.queue_key, NonZeroUsize::new(want))
                .await
            {
                Ok(items) if !items.is_empty() => {
                    batch.extend(items);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("queue pop failed: {e}");
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let nap = (deadline - now).min(Duration::from_millis(100));
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = shutdown.changed() => break,
            }
        }
        batch
    }

    /// Try to commit a batch. Poison items are isolated and dead-lettered;
    /// a transport-level database failure re-queues everything in order.
    async fn flush_batch(&mut self, raw_batch: &[String]) -> FlushOutcome {
        // Parse first: items that are not even valid envelopes go straight
        // to the dead-letter list.
        let mut envelopes: Vec<QueueEnvelope> = Vec::with_capacity(raw_batch.len());
        let mut parsed_raw: Vec<&String> = Vec::with_capacity(raw_batch.len());
        for raw in raw_batch {
            match serde_json::from_str::<QueueEnvelope>(raw) {
                Ok(env) => {
                    envelopes.push(env);
                    parsed_raw.push(raw);
                }
                Err(e) => {
                    error!("unparseable queue item moved to dead-letter list: {e}");
                    self.dead_letter_raw(raw).await;
                }
            }
        }
        if envelopes.is_empty() {
            return FlushOutcome::Committed(0);
        }

        let mut templates = Vec::with_capacity(envelopes.len());
        let mut decode_failed = Vec::new();
        for (idx, env) in envelopes.iter().enumerate() {
            match env.template.clone().into_template() {
                Ok(t) => templates.push(t),
                Err(e) => {
                    error!(
                        "template {} failed blob decode, dead-lettering: {e}",
                        env.template.template_id
                    );
                    decode_failed.push(idx);
                }
            }
        }
        for idx in decode_failed.iter().rev() {
            self.dead_letter_raw(parsed_raw[*idx]).await;
            envelopes.remove(*idx);
            parsed_raw.remove(*idx);
        }
        if templates.is_empty() {
            return FlushOutcome::Committed(0);
        }

        match db::insert_templates(&self.db, &templates).await {
            Ok(n) => FlushOutcome::Committed(n),
            Err(e) if is_transient(&e) => {
                self.requeue_head(parsed_raw.iter().map(|s| s.as_str())).await;
                FlushOutcome::Transient
            }
            Err(e) => {
                warn!("batch insert failed ({e}), isolating items");
                self.flush_individually(&envelopes, &parsed_raw).await
            }
        }
    }

    /// Per-item pass after a non-transient batch failure: commits the good
    /// items, counts attempts on the bad ones.
    async fn flush_individually(
        &mut self,
        envelopes: &[QueueEnvelope],
        raw: &[&String],
    ) -> FlushOutcome {
        let mut committed = 0u64;
        for (idx, env) in envelopes.iter().enumerate() {
            let template = match env.template.clone().into_template() {
                Ok(t) => t,
                Err(_) => continue, // already filtered above
            };
            match db::insert_templates(&self.db, std::slice::from_ref(&template)).await {
                Ok(n) => committed += n,
                Err(e) if is_transient(&e) => {
                    // Connection dropped mid-pass: everything from here on
                    // goes back in order.
                    self.requeue_head(raw[idx..].iter().map(|s| s.as_str())).await;
                    return FlushOutcome::Transient;
                }
                Err(e) => {
                    let attempts = env.attempts + 1;
                    if attempts >= self.cfg.max_attempts {
                        error!(
                            "template {} dead-lettered after {} attempts: {e}",
                            env.template.template_id, attempts
                        );
                        self.dead_letter_raw(raw[idx]).await;
                    } else {
                        let retry = QueueEnvelope {
                            attempts,
                            template: env.template.clone(),
                        };
                        if let Ok(body) = serde_json::to_string(&retry) {
                            self.requeue_head(std::iter::once(body.as_str())).await;
                        }
                    }
                }
            }
        }
        FlushOutcome::Committed(committed)
    }

    /// Push items back so the next pop returns them in the given order.
    async fn requeue_head<'a>(&mut self, items: impl DoubleEndedIterator<Item = &'a str>) {
        for item in items.rev() {
            if let Err(e) = self
                .redis
                .rpush::<_, _, ()>(&self.cfg.queue_key, item)
                .await
            {
                error!("re-queue failed, item may be delayed until restart: {e}");
            }
        }
    }

    async fn dead_letter_raw(&mut self, raw: &str) {
        if let Err(e) = self.redis.lpush::<_, _, ()>(&self.cfg.dlq_key, raw).await {
            error!("dead-letter push failed: {e}");
        }
    }

    /// Bounded last pass on shutdown; whatever remains on the list is
    /// externally durable and survives restart.
    async fn final_flush(&mut self) {
        let deadline = Instant::now() + self.cfg.final_flush;
        loop {
            if Instant::now() >= deadline {
                warn!("final flush deadline reached, remaining items stay queued");
                break;
            }
            let items = match self
                .redis
                .rpop::<_, Vec<String>>(&self.cfg.queue_key, NonZeroUsize::new(self.cfg.batch_size))
                .await
            {
                Ok(items) if !items.is_empty() => items,
                _ => break,
            };
            if let FlushOutcome::Transient = self.flush_batch(&items).await {
                break;
            }
        }
    }
}

/// Connection-level failures carry no SQLSTATE; anything with a code is a
/// statement-level (possibly poison) failure. A missing table counts as
/// transient too: it means the schema bootstrap has not caught up after a
/// database restart.
fn is_transient(e: &StoreError) -> bool {
    use tokio_postgres::error::SqlState;
    match e {
        StoreError::Pool(_) => true,
        StoreError::Db(db_err) => match db_err.code() {
            None => true,
            Some(code) => *code == SqlState::UNDEFINED_TABLE,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_reversal_restores_pop_order() {
        // RPUSH appends to the tail, RPOP takes from the tail, so restoring
        // pop order [a, b, c] means pushing c, b, a.
        let batch = ["a", "b", "c"];
        let pushed: Vec<&str> = batch.iter().rev().copied().collect();
        assert_eq!(pushed, vec!["c", "b", "a"]);
        let mut list = vec!["x"]; // pre-existing tail content
        list.extend(&pushed);
        // RPOP sequence:
        let popped: Vec<&str> = list.iter().rev().take(3).copied().collect();
        assert_eq!(popped, vec!["a", "b", "c"]);
    }

    #[test]
    fn envelope_attempts_default_to_zero() {
        let raw = r#"{"template":{"template_id":"00000000-0000-0000-0000-000000000001",
            "identity_id":"00000000-0000-0000-0000-000000000002",
            "identity_name":"n","eye_side":"left","width":4,"height":2,"n_scales":1,
            "quality_score":0.5,"iris_codes_b64":"","mask_codes_b64":"","format":"plain"}}"#;
        let env: QueueEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.attempts, 0);
    }
}
