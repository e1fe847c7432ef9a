use thiserror::Error;

/// Errors the pipeline can surface to callers.
///
/// Only `Configuration` aborts a whole run. `InsufficientData` and
/// `AmbiguousBinSpec` are local to one entity, period, or column; callers
/// relax thresholds, skip the item, or collect the failure into diagnostics
/// and keep going.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Invalid column names, unparseable timestamps or labels, unknown
    /// granularity/family values. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Too few rows to compute the requested operation. Recoverable: the
    /// caller may relax thresholds or skip the entity.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// A numeric bin specification that is neither a valid edge list nor a
    /// positive bin count. Fatal for that column only.
    #[error("ambiguous bin spec for '{column}': {reason}")]
    AmbiguousBinSpec { column: String, reason: String },
}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Non-fatal record of a period whose score fit did not converge cleanly.
/// Collected into run metadata; never raised as an error.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelFitWarning {
    pub period: String,
    pub messages: Vec<String>,
}
