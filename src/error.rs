//! Error taxonomy for the detection/quantitation engine.
//!
//! Only the unit-aborting failure modes are represented as `EngineError`.
//! `NumericFailure` and `Uncalibrated` are *not* errors at this boundary —
//! see `Warning` in `crate::types` and `Quantified::uncalibrated`.

use thiserror::Error;

/// Failures that abort the current (sample, isotope) unit of work.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Trace empty, dwell <= 0, or a DetectionParams field out of its
    /// documented range.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// An internal invariant (e.g. `left_idx > right_idx`) was violated.
    /// Never silently corrected.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Cooperative cancellation observed between work units.
    #[error("cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;
