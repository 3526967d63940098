//! Postgres repository.
//!
//! Connection pooling via deadpool; the pool limits concurrent writers.
//! All inserts are idempotent on template_id so drainer retries are
//! no-ops at the database layer.

use std::collections::BTreeMap;

use deadpool_postgres::{Manager, ManagerConfig, RecyclingMethod};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{NoTls, Row};
use tracing::info;
use uuid::Uuid;
use wire::{ColumnInfo, DbSchemaResponse, EyeSide, GalleryIdentity, TableSchema, TableStats};

use crate::template::{IrisTemplate, TemplateFormat};
use crate::StoreError;

pub type Pool = deadpool_postgres::Pool;

/// Browsable tables with their primary key columns.
const TABLES: &[(&str, &str, PkKind)] = &[
    ("identities", "identity_id", PkKind::Uuid),
    ("templates", "template_id", PkKind::Uuid),
    ("match_log", "id", PkKind::BigInt),
];

#[derive(Clone, Copy)]
enum PkKind {
    Uuid,
    BigInt,
}

/// Create a connection pool from a `postgres://` URL.
pub fn connect(db_url: &str) -> Result<Pool, StoreError> {
    let pg_config: tokio_postgres::Config = db_url
        .parse()
        .map_err(|e| StoreError::CreatePool(format!("bad database url: {e}")))?;
    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(manager)
        .max_size(10)
        .build()
        .map_err(|e| StoreError::CreatePool(e.to_string()))
}

/// Create tables if missing.
pub async fn bootstrap(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await?;
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS identities (
                 identity_id UUID PRIMARY KEY,
                 name        TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS templates (
                 template_id   UUID PRIMARY KEY,
                 identity_id   UUID NOT NULL REFERENCES identities(identity_id) ON DELETE CASCADE,
                 eye_side      TEXT NOT NULL,
                 width         INT NOT NULL,
                 height        INT NOT NULL,
                 n_scales      INT NOT NULL,
                 quality_score DOUBLE PRECISION NOT NULL,
                 device_id     TEXT,
                 iris_codes    BYTEA NOT NULL,
                 mask_codes    BYTEA NOT NULL,
                 format        TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS match_log (
                 id                  BIGSERIAL PRIMARY KEY,
                 ts                  TIMESTAMPTZ NOT NULL DEFAULT now(),
                 frame_id            BIGINT NOT NULL,
                 device_id           TEXT NOT NULL,
                 hamming_distance    DOUBLE PRECISION,
                 is_match            BOOLEAN NOT NULL,
                 matched_identity_id UUID,
                 latency_ms          DOUBLE PRECISION NOT NULL
             );",
        )
        .await?;
    info!("database schema ready");
    Ok(())
}

/// Cheap connectivity probe for readiness reporting.
pub async fn ping(pool: &Pool) -> bool {
    match pool.get().await {
        Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
        Err(_) => false,
    }
}

// ============================================================================
// Template writes
// ============================================================================

/// Insert a batch of templates in one transaction: identity upserts first,
/// then a single multi-row insert with ON CONFLICT DO NOTHING.
/// Returns the number of template rows actually inserted.
pub async fn insert_templates(pool: &Pool, batch: &[IrisTemplate]) -> Result<u64, StoreError> {
    if batch.is_empty() {
        return Ok(0);
    }
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    // Distinct identities first so the FK holds even when the identity row
    // was never durably written (DB was down at enroll time).
    let mut identities: BTreeMap<Uuid, &str> = BTreeMap::new();
    for t in batch {
        identities.entry(t.identity_id).or_insert(&t.identity_name);
    }
    for (identity_id, name) in &identities {
        tx.execute(
            "INSERT INTO identities (identity_id, name) VALUES ($1, $2)
             ON CONFLICT (identity_id) DO NOTHING",
            &[identity_id, name],
        )
        .await?;
    }

    let (sql, params) = build_template_insert(batch);
    let param_refs: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect();
    let inserted = tx.execute(sql.as_str(), &param_refs).await?;

    tx.commit().await?;
    Ok(inserted)
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Build the multi-row insert statement and its parameter list.
fn build_template_insert(batch: &[IrisTemplate]) -> (String, Vec<BoxedParam>) {
    const COLS: usize = 11;
    let mut sql = String::from(
        "INSERT INTO templates (template_id, identity_id, eye_side, width, height, \
         n_scales, quality_score, device_id, iris_codes, mask_codes, format) VALUES ",
    );
    let mut params: Vec<BoxedParam> = Vec::with_capacity(batch.len() * COLS);
    for (row, t) in batch.iter().enumerate() {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..COLS {
            if col > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("${}", row * COLS + col + 1));
        }
        sql.push(')');

        params.push(Box::new(t.template_id));
        params.push(Box::new(t.identity_id));
        params.push(Box::new(t.eye_side.as_str()));
        params.push(Box::new(t.width as i32));
        params.push(Box::new(t.height as i32));
        params.push(Box::new(t.n_scales as i32));
        params.push(Box::new(t.quality_score));
        params.push(Box::new(t.device_id.clone()));
        params.push(Box::new(t.iris_codes.clone()));
        params.push(Box::new(t.mask_codes.clone()));
        params.push(Box::new(t.format.as_str()));
    }
    sql.push_str(" ON CONFLICT (template_id) DO NOTHING");
    (sql, params)
}

// ============================================================================
// Template reads
// ============================================================================

fn template_from_row(row: &Row) -> Result<IrisTemplate, StoreError> {
    let eye_side: String = row.try_get("eye_side")?;
    let format: String = row.try_get("format")?;
    Ok(IrisTemplate {
        template_id: row.try_get("template_id")?,
        identity_id: row.try_get("identity_id")?,
        identity_name: row.try_get("name")?,
        eye_side: EyeSide::parse(&eye_side).unwrap_or(EyeSide::Left),
        width: row.try_get::<_, i32>("width")? as u32,
        height: row.try_get::<_, i32>("height")? as u32,
        n_scales: row.try_get::<_, i32>("n_scales")? as u32,
        quality_score: row.try_get("quality_score")?,
        device_id: row.try_get("device_id")?,
        iris_codes: row.try_get("iris_codes")?,
        mask_codes: row.try_get("mask_codes")?,
        format: TemplateFormat::parse(&format).unwrap_or(TemplateFormat::Plain),
    })
}

const TEMPLATE_SELECT: &str =
    "SELECT t.template_id, t.identity_id, i.name, t.eye_side, t.width, t.height, \
     t.n_scales, t.quality_score, t.device_id, t.iris_codes, t.mask_codes, t.format \
     FROM templates t JOIN identities i ON i.identity_id = t.identity_id";

/// Load every template with its identity name (gallery reload).
pub async fn load_gallery(pool: &Pool) -> Result<Vec<IrisTemplate>, StoreError> {
    let client = pool.get().await?;
    let rows = client
        .query(&format!("{TEMPLATE_SELECT} ORDER BY i.name, t.template_id"), &[])
        .await?;
    rows.iter().map(template_from_row).collect()
}

pub async fn get_template(pool: &Pool, template_id: Uuid) -> Result<IrisTemplate, StoreError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            &format!("{TEMPLATE_SELECT} WHERE t.template_id = $1"),
            &[&template_id],
        )
        .await?
        .ok_or(StoreError::NotFound)?;
    template_from_row(&row)
}

/// Gallery listing grouped by identity.
pub async fn list_gallery(pool: &Pool) -> Result<Vec<GalleryIdentity>, StoreError> {
    let templates = load_gallery(pool).await?;
    let mut grouped: BTreeMap<Uuid, GalleryIdentity> = BTreeMap::new();
    for t in templates {
        grouped
            .entry(t.identity_id)
            .or_insert_with(|| GalleryIdentity {
                identity_id: t.identity_id,
                name: t.identity_name.clone(),
                templates: Vec::new(),
            })
            .templates
            .push(t.meta());
    }
    Ok(grouped.into_values().collect())
}

/// Delete an identity; templates cascade. Returns (deleted, templates_removed).
pub async fn delete_identity(pool: &Pool, identity_id: Uuid) -> Result<(bool, u64), StoreError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;
    let templates: i64 = tx
        .query_one(
            "SELECT count(*) FROM templates WHERE identity_id = $1",
            &[&identity_id],
        )
        .await?
        .get(0);
    let deleted = tx
        .execute("DELETE FROM identities WHERE identity_id = $1", &[&identity_id])
        .await?;
    tx.commit().await?;
    Ok((deleted > 0, templates as u64))
}

/// Append a match decision to the audit log. Best effort at call sites.
pub async fn record_match(
    pool: &Pool,
    frame_id: u64,
    device_id: &str,
    hamming_distance: Option<f64>,
    is_match: bool,
    matched_identity_id: Option<Uuid>,
    latency_ms: f64,
) -> Result<(), StoreError> {
    let client = pool.get().await?;
    client
        .execute(
            "INSERT INTO match_log (frame_id, device_id, hamming_distance, is_match, \
             matched_identity_id, latency_ms) VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &(frame_id as i64),
                &device_id,
                &hamming_distance,
                &is_match,
                &matched_identity_id,
                &latency_ms,
            ],
        )
        .await?;
    Ok(())
}

// ============================================================================
// Database browsing (relayed /db/* endpoints)
// ============================================================================

fn table_entry(table: &str) -> Result<(&'static str, &'static str, PkKind), StoreError> {
    TABLES
        .iter()
        .find(|(name, _, _)| *name == table)
        .copied()
        .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

pub async fn schema(pool: &Pool) -> Result<DbSchemaResponse, StoreError> {
    let client = pool.get().await?;
    let mut tables = Vec::new();
    for (name, _, _) in TABLES {
        let rows = client
            .query(
                "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position",
                &[name],
            )
            .await?;
        let columns = rows
            .iter()
            .map(|r| ColumnInfo {
                name: r.get(0),
                data_type: r.get(1),
                nullable: r.get::<_, String>(2) == "YES",
            })
            .collect();
        tables.push(TableSchema {
            name: name.to_string(),
            columns,
        });
    }
    Ok(DbSchemaResponse { tables })
}

pub async fn table_rows(
    pool: &Pool,
    table: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<serde_json::Value>, StoreError> {
    let (name, pk, _) = table_entry(table)?;
    let client = pool.get().await?;
    let rows = client
        .query(
            &format!("SELECT * FROM {name} ORDER BY {pk} LIMIT $1 OFFSET $2"),
            &[&i64::from(limit.min(1000)), &i64::from(offset)],
        )
        .await?;
    Ok(rows.iter().map(row_to_json).collect())
}

pub async fn row_by_pk(
    pool: &Pool,
    table: &str,
    pk_value: &str,
) -> Result<Option<serde_json::Value>, StoreError> {
    let (name, pk, kind) = table_entry(table)?;
    let client = pool.get().await?;
    let row = match kind {
        PkKind::Uuid => {
            let id: Uuid = pk_value
                .parse()
                .map_err(|_| StoreError::BadRequest(format!("bad uuid key: {pk_value}")))?;
            client
                .query_opt(&format!("SELECT * FROM {name} WHERE {pk} = $1"), &[&id])
                .await?
        }
        PkKind::BigInt => {
            let id: i64 = pk_value
                .parse()
                .map_err(|_| StoreError::BadRequest(format!("bad integer key: {pk_value}")))?;
            client
                .query_opt(&format!("SELECT * FROM {name} WHERE {pk} = $1"), &[&id])
                .await?
        }
    };
    Ok(row.as_ref().map(row_to_json))
}

pub async fn stats(pool: &Pool) -> Result<Vec<TableStats>, StoreError> {
    let client = pool.get().await?;
    let mut out = Vec::new();
    for (name, _, _) in TABLES {
        let count: i64 = client
            .query_one(&format!("SELECT count(*) FROM {name}"), &[])
            .await?
            .get(0);
        out.push(TableStats {
            name: name.to_string(),
            rows: count as u64,
        });
    }
    Ok(out)
}

/// Render a row as JSON. Blobs stay opaque: only their length and magic
/// are reported.
fn row_to_json(row: &Row) -> serde_json::Value {
    use serde_json::{json, Map, Value};

    let mut obj = Map::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value = match *col.type_() {
            Type::UUID => row
                .try_get::<_, Option<Uuid>>(i)
                .ok()
                .flatten()
                .map(|u| Value::String(u.to_string())),
            Type::TEXT | Type::VARCHAR => row
                .try_get::<_, Option<String>>(i)
                .ok()
                .flatten()
                .map(Value::String),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(i)
                .ok()
                .flatten()
                .map(|v| json!(v)),
            Type::BOOL => row
                .try_get::<_, Option<bool>>(i)
                .ok()
                .flatten()
                .map(Value::Bool),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_rfc3339())),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(i)
                .ok()
                .flatten()
                .map(|bytes| {
                    json!({
                        "bytes": bytes.len(),
                        "format": TemplateFormat::detect(&bytes)
                            .map(|f| f.as_str())
                            .unwrap_or("unknown"),
                    })
                }),
            _ => None,
        };
        obj.insert(col.name().to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{encode_plain_blob, PackedScale};

    fn template(n: usize) -> IrisTemplate {
        IrisTemplate {
            template_id: Uuid::new_v4(),
            identity_id: Uuid::new_v4(),
            identity_name: format!("subject-{n}"),
            eye_side: EyeSide::Right,
            width: 64,
            height: 8,
            n_scales: 1,
            quality_score: 0.8,
            device_id: None,
            iris_codes: encode_plain_blob(&[PackedScale {
                width: 64,
                height: 8,
                data: vec![0; 64],
            }])
            .unwrap(),
            mask_codes: vec![0x1f, 0x8b, 0x08, 0x00],
            format: TemplateFormat::Plain,
        }
    }

    #[test]
    fn insert_statement_numbers_parameters() {
        let batch = vec![template(1), template(2), template(3)];
        let (sql, params) = build_template_insert(&batch);
        assert_eq!(params.len(), 33);
        assert!(sql.starts_with("INSERT INTO templates"));
        assert!(sql.contains("($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"));
        assert!(sql.contains("($23, $24, $25, $26, $27, $28, $29, $30, $31, $32, $33)"));
        assert!(sql.ends_with("ON CONFLICT (template_id) DO NOTHING"));
    }

    #[test]
    fn unknown_table_is_refused() {
        assert!(matches!(
            table_entry("pg_shadow"),
            Err(StoreError::UnknownTable(_))
        ));
        assert!(table_entry("templates").is_ok());
    }
}
