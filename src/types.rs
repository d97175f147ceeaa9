//! Shared data model: traces, detection parameters, particles, calibration.
//!
//! Every type here derives `Serialize`/`Deserialize` so a collaborator can
//! round-trip the engine's visible state (see `tests/roundtrip.rs`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque sample identifier. The core treats it as an owned key, never
/// parses or validates it.
pub type SampleId = String;

/// A pair (element symbol, isotope mass in amu), compared to four decimal
/// places as required by the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsotopeKey {
    pub element: String,
    pub mass: f64,
}

impl IsotopeKey {
    pub fn new(element: impl Into<String>, mass: f64) -> Self {
        Self { element: element.into(), mass }
    }

    fn rounded_mass(&self) -> i64 {
        (self.mass * 10_000.0).round() as i64
    }
}

impl PartialEq for IsotopeKey {
    fn eq(&self, other: &Self) -> bool {
        self.element == other.element && self.rounded_mass() == other.rounded_mass()
    }
}
impl Eq for IsotopeKey {}

impl std::hash::Hash for IsotopeKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.element.hash(state);
        self.rounded_mass().hash(state);
    }
}

impl std::fmt::Display for IsotopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:.4}", self.element, self.mass)
    }
}

impl Ord for IsotopeKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rounded_mass()
            .cmp(&other.rounded_mass())
            .then_with(|| self.element.cmp(&other.element))
    }
}
impl PartialOrd for IsotopeKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// An immutable, uniformly-dwelled count trace for one (sample, isotope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub sample_id: SampleId,
    pub isotope: IsotopeKey,
    pub dwell_s: f64,
    pub counts: Vec<u32>,
}

impl Trace {
    pub fn new(sample_id: impl Into<String>, isotope: IsotopeKey, dwell_s: f64, counts: Vec<u32>) -> Self {
        Self { sample_id: sample_id.into(), isotope, dwell_s, counts }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Time of sample `i`: `t0 + i * dwell`. `t0` is always 0 for the core —
    /// absolute acquisition start is a collaborator concern.
    pub fn time_at(&self, i: usize) -> f64 {
        i as f64 * self.dwell_s
    }
}

/// Four alternative threshold detectors (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMethod {
    Currie,
    FormulaC,
    CompoundPoissonLognormal,
    Manual,
}

/// Per (sample, isotope) detection parameters (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionParams {
    pub include: bool,
    pub method: DetectionMethod,
    pub alpha: f64,
    pub manual_threshold: f64,
    pub apply_smoothing: bool,
    pub smooth_window: usize,
    pub smooth_iterations: usize,
    pub min_continuous: usize,
    pub iterative: bool,
    pub max_iterations: usize,
    pub use_window_size: bool,
    pub window_size: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            include: true,
            method: DetectionMethod::Currie,
            alpha: 0.05,
            manual_threshold: 10.0,
            apply_smoothing: false,
            smooth_window: 3,
            smooth_iterations: 1,
            min_continuous: 1,
            iterative: true,
            max_iterations: 4,
            use_window_size: false,
            window_size: 5_000,
        }
    }
}

/// Whether a (sample, isotope)'s particle list is stale with respect to
/// its current `DetectionParams` + the process-wide sigma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionState {
    Changed,
    Computed,
}

/// A single detected particle on one isotope's trace (§3, Invariants 1-3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub left_idx: usize,
    pub peak_idx: usize,
    pub right_idx: usize,
    pub total_counts: f64,
    pub max_height: u32,
    pub threshold: f64,
    pub background: f64,
}

impl Particle {
    pub fn snr(&self) -> f64 {
        self.max_height as f64 / self.threshold
    }

    pub fn start_time(&self, trace: &Trace) -> f64 {
        trace.time_at(self.left_idx)
    }

    pub fn end_time(&self, trace: &Trace) -> f64 {
        trace.time_at(self.right_idx)
    }
}

/// A cluster of temporally coincident particles from distinct isotopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiElementParticle {
    pub start_time: f64,
    pub end_time: f64,
    pub elements: HashMap<IsotopeKey, f64>,
}

/// One ionic-calibration variant's fitted parameters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IonicVariant {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub bec: f64,
    pub lod: f64,
    pub loq: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariantName {
    Zero,
    Simple,
    Weighted,
    Manual,
}

/// Per-isotope ionic calibration: the four variants plus physical constants
/// needed for quantitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IonicCalibration {
    pub zero: Option<IonicVariant>,
    pub simple: Option<IonicVariant>,
    pub weighted: Option<IonicVariant>,
    pub manual: Option<IonicVariant>,
    /// Element or compound density (g/cm^3).
    pub density: f64,
    /// Compound molecular weight, or 0.0 if unset (pure-element fallback).
    pub molecular_weight: f64,
    /// Mass fraction of this element within its compound, in (0, 1].
    pub mass_fraction: f64,
    /// Atomic mass of the isotope (amu), used for the elemental mole
    /// fallback when no compound molecular weight is configured.
    pub atomic_mass: f64,
}

impl IonicCalibration {
    pub fn variant(&self, name: VariantName) -> Option<IonicVariant> {
        match name {
            VariantName::Zero => self.zero,
            VariantName::Simple => self.simple,
            VariantName::Weighted => self.weighted,
            VariantName::Manual => self.manual,
        }
    }
}

/// Process-wide calibration state (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Transport rate in µL/s per named method; effective rate is the mean
    /// of the selected subset. An empty map or all-zero subset means
    /// uncalibrated.
    pub transport_rate_methods: HashMap<String, f64>,
    pub selected_transport_methods: Vec<String>,
    pub ionic: HashMap<IsotopeKey, IonicCalibration>,
    pub method_preference: HashMap<IsotopeKey, VariantName>,
}

impl CalibrationState {
    /// Mean transport rate in µL/s over the selected method subset. `0.0`
    /// (uncalibrated) if the subset is empty.
    pub fn transport_rate(&self) -> f64 {
        let mut sum = 0.0;
        let mut n = 0usize;
        for name in &self.selected_transport_methods {
            if let Some(&rate) = self.transport_rate_methods.get(name) {
                sum += rate;
                n += 1;
            }
        }
        if n == 0 { 0.0 } else { sum / n as f64 }
    }
}

/// Result of converting a particle's integrated counts to physical
/// quantities (§4.6). `uncalibrated = true` means every numeric field is
/// `NaN` and no error was raised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quantified {
    pub uncalibrated: bool,
    pub element_mass_fg: f64,
    pub compound_mass_fg: f64,
    pub moles_fmol: f64,
    pub diameter_nm: f64,
}

impl Quantified {
    pub fn uncalibrated() -> Self {
        Self {
            uncalibrated: true,
            element_mass_fg: f64::NAN,
            compound_mass_fg: f64::NAN,
            moles_fmol: f64::NAN,
            diameter_nm: f64::NAN,
        }
    }
}

/// A piecewise-constant (lambda, threshold) profile with window boundaries
/// (global mode has exactly one window spanning the whole trace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdProfile {
    /// `(start_idx, end_idx_exclusive, background, threshold, iterations_used)`
    pub windows: Vec<ThresholdWindow>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdWindow {
    pub start: usize,
    pub end: usize,
    pub background: f64,
    pub threshold: f64,
    pub iterations_used: usize,
}

impl ThresholdProfile {
    /// The `(background, threshold)` in effect at index `i`.
    pub fn at(&self, i: usize) -> (f64, f64) {
        for w in &self.windows {
            if i >= w.start && i < w.end {
                return (w.background, w.threshold);
            }
        }
        // Fallback for an index outside every window (shouldn't happen for
        // in-bounds traces, but never panics here).
        self.windows
            .last()
            .map(|w| (w.background, w.threshold))
            .unwrap_or((0.0, 0.0))
    }

    /// `LOD_counts`/`LOD_MDL` per window, per §4.3.
    pub fn lod_counts(&self, w: &ThresholdWindow) -> f64 {
        if w.background > 0.0 {
            w.threshold - w.background
        } else {
            w.threshold.max(0.0)
        }
    }
}

/// Aggregate statistics for a detected particle list (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub particle_count: usize,
    pub total_counts: f64,
    pub mean_counts: f64,
    pub median_counts: f64,
    /// Fixed-width SNR histogram: [0,1), [1,2), ..., [9, inf).
    pub snr_histogram: [u32; 10],
}

/// Non-fatal degraded outcomes surfaced to a collaborator (§6, §7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Warning {
    ThresholdNan { sample_id: SampleId, isotope: IsotopeKey },
    BackgroundNonConvergence { sample_id: SampleId, isotope: IsotopeKey, iterations: usize },
    Uncalibrated { sample_id: SampleId, isotope: IsotopeKey },
    MissingDensity { isotope: IsotopeKey },
    MissingMolecularWeight { isotope: IsotopeKey },
}

/// Commands the core accepts from a collaborator (§6).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Detect(SampleId),
    DetectIncremental,
    RecomputeQuantitation,
    Cancel,
}
