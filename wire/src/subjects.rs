//! Bus subject names.
//!
//! Request/reply subjects use NATS reply inboxes; progress streams get a
//! per-job subject so SSE relays can subscribe and drop independently.

use uuid::Uuid;

/// Analyze a single frame (request/reply, reply = [`crate::AnalyzeAck`]).
pub const ANALYZE: &str = "eyed.analyze";

/// Enroll a single image (request/reply).
pub const ENROLL: &str = "eyed.enroll";

/// Start a bulk enrollment job (request/reply, reply = [`crate::BulkEnrollAck`]).
pub const ENROLL_BATCH: &str = "eyed.enroll.batch";

/// Published analysis results, fanned out to UI clients by the gateway.
pub const RESULT: &str = "eyed.result";

/// Key service: decrypt a batch of encrypted inner products into a decision.
pub const KEY_DECRYPT_BATCH: &str = "eyed.key.decrypt_batch";

/// Key service: decrypt a template's code arrays for admin inspection.
pub const KEY_DECRYPT_TEMPLATE: &str = "eyed.key.decrypt_template";

/// Key service liveness + ring parameters.
pub const KEY_HEALTH: &str = "eyed.key.health";

/// Engine readiness snapshot.
pub const ENGINE_HEALTH: &str = "eyed.engine.health";

/// Gallery listing / deletion / template fetch (relayed REST).
pub const GALLERY_LIST: &str = "eyed.gallery.list";
pub const GALLERY_DELETE: &str = "eyed.gallery.delete";
pub const TEMPLATE_GET: &str = "eyed.template.get";

/// Dataset registry (relayed REST).
pub const DATASETS_LIST: &str = "eyed.datasets.list";
pub const DATASETS_SUBJECTS: &str = "eyed.datasets.subjects";
pub const DATASETS_IMAGES: &str = "eyed.datasets.images";
pub const DATASETS_REGISTER: &str = "eyed.datasets.register";

/// Database browsing (relayed REST).
pub const DB_SCHEMA: &str = "eyed.db.schema";
pub const DB_ROWS: &str = "eyed.db.rows";
pub const DB_ROW: &str = "eyed.db.row";
pub const DB_STATS: &str = "eyed.db.stats";

/// Per-job bulk enrollment progress stream.
pub fn enroll_progress(job_id: Uuid) -> String {
    format!("eyed.enroll.progress.{job_id}")
}

/// Per-job bulk enrollment cancellation signal.
pub fn enroll_cancel(job_id: Uuid) -> String {
    format!("eyed.enroll.cancel.{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_subject_embeds_job_id() {
        let job = Uuid::nil();
        assert_eq!(
            enroll_progress(job),
            "eyed.enroll.progress.00000000-0000-0000-0000-000000000000"
        );
        assert!(enroll_cancel(job).starts_with("eyed.enroll.cancel."));
    }
}
