//! Bus message bodies.
//!
//! One closed type per subject. Results travel as data: a frame that the
//! pipeline rejects still produces an `AnalyzeResult` with `error` set, it
//! is never an HTTP-level failure.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Common
// ============================================================================

/// Which eye a frame or template belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EyeSide {
    Left,
    Right,
}

impl EyeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            EyeSide::Left => "left",
            EyeSide::Right => "right",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "left" => Some(EyeSide::Left),
            "right" => Some(EyeSide::Right),
            _ => None,
        }
    }
}

/// Stable error taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Admission,
    InvalidInput,
    PipelineFailure,
    Duplicate,
    Persistence,
    KeyService,
    Fatal,
}

/// Structured error body for relayed REST responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub error: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            error: error.into(),
        }
    }
}

// ============================================================================
// Analyze
// ============================================================================

/// A frame (or uploaded image) to run through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub frame_id: u64,
    pub device_id: String,
    pub jpeg_b64: String,
    pub eye_side: EyeSide,
    #[serde(default)]
    pub is_nir: bool,
    pub timestamp_us: u64,
    /// Include intermediate pipeline images in the result (`/analyze/detailed`).
    #[serde(default)]
    pub detailed: bool,
    /// When true the reply carries the full result inline (REST path).
    /// Frame-stream requests leave this false and get the result on
    /// `eyed.result` only.
    #[serde(default)]
    pub wait: bool,
}

/// Admission reply on `eyed.analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeAck {
    pub accepted: bool,
    pub queue_depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalyzeResult>,
}

/// Match details carried in a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchInfo {
    pub hamming_distance: f64,
    pub is_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_identity_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_identity_name: Option<String>,
    pub best_rotation: i32,
}

/// Terminal result for one frame, published on `eyed.result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResult {
    pub frame_id: u64,
    pub device_id: String,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_info: Option<MatchInfo>,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Pipeline intermediates (detailed mode only), PNG bytes base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediates: Option<AnalyzeIntermediates>,
}

/// Normalized / segmented views for `/analyze/detailed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeIntermediates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmented_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_b64: Option<String>,
    pub quality_score: f64,
}

// ============================================================================
// Enroll
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub jpeg_b64: String,
    pub eye_side: EyeSide,
    /// Enroll into an existing identity, or mint a fresh one when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub is_nir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub enrolled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub is_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_identity_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_identity_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkEnrollRequest {
    /// Dataset name from the registry.
    pub dataset: String,
    /// Optional cap on the number of images to walk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Caller-minted job id, so the caller can subscribe to the progress
    /// subject before the job starts publishing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

/// Reply to `eyed.enroll.batch`: where to listen for progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkEnrollAck {
    pub job_id: Uuid,
    pub progress_subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One per-image outcome inside a bulk job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkEnrollResult {
    pub subject: String,
    pub image: String,
    pub enrolled: bool,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkEnrollSummary {
    pub total: u64,
    pub enrolled: u64,
    pub duplicates: u64,
    pub errors: u64,
}

/// Event stream on the per-job progress subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkEnrollEvent {
    Result(BulkEnrollResult),
    Done(BulkEnrollSummary),
}

// ============================================================================
// Gallery / templates
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMeta {
    pub template_id: Uuid,
    pub eye_side: EyeSide,
    pub width: u32,
    pub height: u32,
    pub n_scales: u32,
    pub quality_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// "plain" | "encrypted_v1"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryIdentity {
    pub identity_id: Uuid,
    pub name: String,
    pub templates: Vec<TemplateMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryResponse {
    pub identities: Vec<GalleryIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteIdentityRequest {
    pub identity_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteIdentityResponse {
    pub deleted: bool,
    pub templates_removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateGetRequest {
    pub template_id: Uuid,
}

/// Template metadata plus decoded code arrays for visualization.
/// Encrypted templates are decoded by the key service on the engine's
/// behalf; plain templates decode locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateGetResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateMeta>,
    pub identity_id: Option<Uuid>,
    /// Bit-packed iris code per scale, base64.
    #[serde(default)]
    pub iris_codes_b64: Vec<String>,
    /// Bit-packed mask code per scale, base64.
    #[serde(default)]
    pub mask_codes_b64: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

// ============================================================================
// Key service
// ============================================================================

/// One gallery candidate inside a decrypt batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptBatchEntry {
    pub template_id: Uuid,
    pub identity_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_name: Option<String>,
    /// One encrypted inner product per code array, base64 ciphertext.
    pub enc_inner_products_b64: Vec<String>,
    /// Per-scale popcount of the (masked) probe code.
    pub probe_iris_popcount: Vec<u64>,
    /// Per-scale popcount of the (masked) gallery code.
    pub gallery_iris_popcount: Vec<u64>,
    /// Total comparable bits across scales.
    pub total_bits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptBatchRequest {
    pub threshold: f64,
    pub entries: Vec<DecryptBatchEntry>,
}

/// The only thing the key service reveals about a batch: a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDecision {
    pub is_match: bool,
    pub hamming_distance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_identity_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_identity_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptTemplateRequest {
    pub template_id: Uuid,
    /// HEv1 iris blob, base64.
    pub iris_blob_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptTemplateResponse {
    /// Bit-packed decrypted iris code per scale, base64.
    pub iris_codes_b64: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub n_scales: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyHealthResponse {
    pub status: String,
    pub ring_dimension: u32,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealthResponse {
    pub alive: bool,
    pub ready: bool,
    pub pipeline_loaded: bool,
    pub gallery_size: u64,
    pub db_connected: bool,
    pub cache_connected: bool,
    pub he_enabled: bool,
    pub pool: PoolStatus,
}

// ============================================================================
// Datasets
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub path: String,
    pub subjects: u64,
    pub images: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetListResponse {
    pub datasets: Vec<DatasetInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSubjectsRequest {
    pub dataset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSubjectsResponse {
    pub subjects: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetImagesRequest {
    pub dataset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetImagesResponse {
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPathsRequest {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPathsResponse {
    pub registered: u64,
    pub datasets: Vec<DatasetInfo>,
}

// ============================================================================
// DB browsing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSchemaResponse {
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRowsRequest {
    pub table: String,
    #[serde(default = "default_rows_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_rows_limit() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRowsResponse {
    pub rows: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRowRequest {
    pub table: String,
    pub pk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRowResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStats {
    pub name: String,
    pub rows: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStatsResponse {
    pub tables: Vec<TableStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_result_renames_match_field() {
        let result = AnalyzeResult {
            frame_id: 42,
            device_id: "capture-01".into(),
            match_info: Some(MatchInfo {
                hamming_distance: 0.21,
                is_match: true,
                matched_identity_id: Some(Uuid::nil()),
                matched_identity_name: Some("Alice".into()),
                best_rotation: -3,
            }),
            latency_ms: 12.5,
            error: None,
            intermediates: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("match").is_some());
        assert!(json.get("match_info").is_none());
        assert_eq!(json["match"]["is_match"], true);
    }

    #[test]
    fn eye_side_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&EyeSide::Left).unwrap(), "\"left\"");
        assert_eq!(EyeSide::parse("right"), Some(EyeSide::Right));
        assert_eq!(EyeSide::parse("both"), None);
    }

    #[test]
    fn bulk_event_tagging_round_trips() {
        let done = BulkEnrollEvent::Done(BulkEnrollSummary {
            total: 7,
            enrolled: 6,
            duplicates: 1,
            errors: 0,
        });
        let json = serde_json::to_string(&done).unwrap();
        assert!(json.contains("\"type\":\"done\""));
        match serde_json::from_str::<BulkEnrollEvent>(&json).unwrap() {
            BulkEnrollEvent::Done(s) => assert_eq!(s.enrolled, 6),
            _ => panic!("expected done event"),
        }
    }

    #[test]
    fn error_result_omits_match() {
        let result = AnalyzeResult {
            frame_id: 1,
            device_id: "d".into(),
            match_info: None,
            latency_ms: 3.0,
            error: Some("segmentation could not locate iris".into()),
            intermediates: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("match").is_none());
        assert_eq!(json["error"], "segmentation could not locate iris");
    }
}
