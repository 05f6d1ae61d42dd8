//! Core data model for scoring generated plots.
//!
//! The kernel owns three concerns: a deterministic identity for loosely-shaped plot
//! records (with de-duplicating ingestion), construction of annotation rows from
//! operator judgments, and per-annotator normalization of overall scores against
//! calibration ("gold") plots. Everything is synchronous and operates on an explicit
//! [`Session`] value.

pub mod annotation;
pub mod ingest;
pub mod normalize;
pub mod record;
pub mod rubric;
pub mod selection;
pub mod session;
pub mod table;

pub use annotation::{
    pair_preference, AnnotationRow, Confidence, DimensionScores, PairJudgment, PairPreference,
    Score, SingleJudgment, Submission,
};
pub use ingest::{ingest, parse_source, IngestReport, ParsedSource, Source};
pub use normalize::{annotator_baselines, normalize, AnnotatorBaseline, OVERALL_Z};
pub use record::{
    identity, Attribute, FieldChain, GraphShape, PlotRecord, PlotSummary, Presence, FIELD_CHAINS,
};
pub use rubric::{Dimension, Rubric, RubricError, RESERVED_DIMENSION_KEYS};
pub use selection::{pick_pair, pick_single, PairSelection};
pub use session::{Session, SessionStats};
pub use table::{columns, project, to_csv, to_ndjson, NORMALIZED_PREVIEW_COLUMNS};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AnnotationError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("annotator_id MUST be set before submitting an annotation")]
    MissingAnnotator,
    #[error("at least {required} plots are required, {loaded} loaded")]
    NotEnoughPlots { required: usize, loaded: usize },
    #[error("plot index {index} is out of range for {len} loaded plots")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("unknown plot id: {0}")]
    UnknownPlot(String),
    #[error("unknown dimension: {0}")]
    UnknownDimension(String),
    #[error("missing score for dimension: {0}")]
    MissingDimension(String),
}
