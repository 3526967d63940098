//! Template Store
//!
//! Durability path for enrollments: a Redis list takes writes at sub-ms
//! latency, a single drainer moves them into Postgres in batches. Blobs
//! are opaque here; only the magic prefix is ever inspected.

pub mod cache;
pub mod db;
pub mod drain;
pub mod template;

pub use cache::{PutOutcome, WriteThroughCache};
pub use db::{connect, Pool};
pub use drain::{BatchDrain, DrainConfig};
pub use template::{IrisTemplate, PackedScale, TemplateFormat};

use thiserror::Error;

/// Well-known cache list keys.
pub const ENROLL_QUEUE_KEY: &str = "eyed:enroll:queue";
pub const ENROLL_DLQ_KEY: &str = "eyed:enroll:dlq";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("database pool could not be created: {0}")]
    CreatePool(String),

    #[error("cache error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache unavailable and direct insert failed: {0}")]
    DegradedWriteFailed(String),

    #[error("bad template blob: {0}")]
    BadBlob(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
