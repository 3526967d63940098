//! Analysis Core
//!
//! Everything between a decoded frame and a match decision: the bounded
//! pipeline pool, iris code representation, fractional Hamming matching
//! with rotational search, immutable gallery snapshots and the
//! encrypted-match coordinator.

pub mod code;
pub mod encrypted;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod pool;

pub use code::{CodeArray, TemplateCodes};
pub use gallery::{Gallery, GalleryCodes, GalleryEntry, GallerySnapshot};
pub use matcher::{best_match, fractional_hd, BestMatch, MatchParams};
pub use pipeline::{
    AnalysisPipeline, AnalyzeOptions, EncoderPipeline, PipelineError, ProbeTemplate,
};
pub use pool::{PipelinePool, PoolGuard, PoolStats};
