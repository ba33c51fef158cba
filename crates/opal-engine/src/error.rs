//! Engine-level error type

use thiserror::Error;

/// Errors surfaced by the engine's fallible entry points.
///
/// Semantic passes accumulate per-line diagnostics internally; the error
/// returned here only records which pass failed and how many errors it
/// found. The diagnostics themselves are carried by the pipeline result.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("{pass} failed with {errors} error(s)")]
    AnalysisFailed { pass: &'static str, errors: usize },
}
