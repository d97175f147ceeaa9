//! Progress reporting collaborator interface (§5, §9 design notes).
//!
//! Workers call a sink at well-defined boundaries; they never know whether
//! a UI, a log line, or nothing at all consumes the signal. Cadence is not
//! contractual, but counts must be monotonically non-decreasing.

use crate::types::{IsotopeKey, SampleId};

/// Implemented by a collaborator that wants visibility into engine
/// progress. All methods have no-op defaults so callers can implement only
/// what they need.
pub trait ProgressSink: Send + Sync {
    fn isotope_started(&self, _sample_id: &SampleId, _isotope: &IsotopeKey) {}
    fn isotope_finished(&self, _sample_id: &SampleId, _isotope: &IsotopeKey) {}
    fn window_started(&self, _sample_id: &SampleId, _isotope: &IsotopeKey, _window_index: usize) {}
}

/// A sink that discards every signal — the default when no collaborator is
/// attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {}
