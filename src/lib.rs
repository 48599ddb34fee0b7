pub mod config;
pub mod db;
pub mod llm;
pub mod pipeline;
pub mod schema;
pub mod util;
pub mod validate;

pub use pipeline::{FailureKind, PipelineOutcome, PipelineRequest, QueryPipeline};
pub use validate::{ReasonCode, ValidatedSql, ValidationVerdict, validate};
