//! C7: Orchestrator — owns keyed caches, drives C1-C6, handles commands,
//! caching, and cooperative cancellation (§4.7, §5).

use crate::background;
use crate::cache::{CacheKey, Fingerprint};
use crate::coincidence::{self, IsotopeParticles};
use crate::error::{EngineError, EngineResult};
use crate::peak_finder;
use crate::progress::{NullProgressSink, ProgressSink};
use crate::quantitation;
use crate::smoother;
use crate::types::{
    CalibrationState, Command, DetectionParams, DetectionState, DetectionSummary, IsotopeKey, MultiElementParticle, Particle, Quantified, SampleId, Trace, Warning,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;

/// Per-key cached state: the trace itself, its parameters, the detection
/// state (`Changed`/`Computed`), and the fingerprint that state was
/// computed against.
struct Unit {
    trace: Trace,
    params: DetectionParams,
    state: DetectionState,
    fingerprint: Option<Fingerprint>,
    particles: Vec<Particle>,
    profile: Option<crate::types::ThresholdProfile>,
}

/// The detection/quantitation engine. Owns every keyed cache explicitly;
/// no hidden process-wide globals (§9 design notes).
pub struct Engine {
    sigma: f64,
    overlap_threshold_percentage: f64,
    units: HashMap<CacheKey, Unit>,
    multi_particles: HashMap<SampleId, Vec<MultiElementParticle>>,
    quantitation_cache: HashMap<(SampleId, IsotopeKey, usize), Quantified>,
    calibration: CalibrationState,
    warnings: Mutex<Vec<Warning>>,
    cancel: Arc<AtomicBool>,
    progress: Arc<dyn ProgressSink>,
}

impl Engine {
    pub fn new(sigma: f64, overlap_threshold_percentage: f64) -> Self {
        Self {
            sigma,
            overlap_threshold_percentage,
            units: HashMap::new(),
            multi_particles: HashMap::new(),
            quantitation_cache: HashMap::new(),
            calibration: CalibrationState::default(),
            warnings: Mutex::new(Vec::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(NullProgressSink),
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Register (or replace) a trace and its detection parameters for a
    /// (sample, isotope) key. Marks the key `Changed`.
    pub fn load_trace(&mut self, trace: Trace, params: DetectionParams) {
        let key = CacheKey::new(trace.sample_id.clone(), trace.isotope.clone());
        self.units.insert(
            key,
            Unit { trace, params, state: DetectionState::Changed, fingerprint: None, particles: Vec::new(), profile: None },
        );
    }

    /// Update a key's `DetectionParams`, flipping its state to `Changed`
    /// (§4.7 cache invalidation rule 1). Also drops any cached quantitation
    /// for this key: its particle indices are about to be recomputed and a
    /// stale `Quantified` keyed by the old index would otherwise survive.
    pub fn set_params(&mut self, sample_id: &str, isotope: &IsotopeKey, params: DetectionParams) -> EngineResult<()> {
        let key = CacheKey::new(sample_id.to_string(), isotope.clone());
        let unit = self.units.get_mut(&key).ok_or_else(|| EngineError::InputInvalid(format!("no trace loaded for {sample_id}/{isotope}")))?;
        unit.params = params;
        unit.state = DetectionState::Changed;
        self.quantitation_cache.retain(|(s, iso, _), _| !(s == sample_id && iso == isotope));
        Ok(())
    }

    /// Replace the process-wide sigma, flipping *every* key's state to
    /// `Changed` (§4.7 cache invalidation rule 2) and clearing all cached
    /// quantitation, since every key's particle list is about to be
    /// recomputed.
    pub fn set_sigma(&mut self, sigma: f64) {
        self.sigma = sigma;
        for unit in self.units.values_mut() {
            unit.state = DetectionState::Changed;
        }
        self.quantitation_cache.clear();
    }

    /// Replace the calibration state. Invalidates only quantitation
    /// outputs, not particle lists or threshold profiles (§4.7 cache
    /// invalidation rule 3).
    pub fn set_calibration(&mut self, calibration: CalibrationState) {
        self.calibration = calibration;
        self.quantitation_cache.clear();
    }

    /// Shared cancellation flag a collaborator can flip from another
    /// thread to request cooperative cancellation.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn apply(&mut self, command: Command) -> EngineResult<()> {
        match command {
            Command::Detect(sample_id) => self.detect_sample(&sample_id),
            Command::DetectIncremental => self.detect_all_changed(),
            Command::RecomputeQuantitation => {
                self.quantitation_cache.clear();
                Ok(())
            }
            Command::Cancel => {
                self.cancel.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn detect_sample(&mut self, sample_id: &str) -> EngineResult<()> {
        let mut keys: Vec<CacheKey> = self
            .units
            .iter()
            .filter(|(k, u)| k.sample_id == sample_id && u.state == DetectionState::Changed)
            .map(|(k, _)| k.clone())
            .collect();
        sort_keys(&mut keys);
        self.run_units(&keys)?;
        self.merge_coincidence(sample_id);
        Ok(())
    }

    fn detect_all_changed(&mut self) -> EngineResult<()> {
        let mut keys: Vec<CacheKey> = self.units.iter().filter(|(_, u)| u.state == DetectionState::Changed).map(|(k, _)| k.clone()).collect();
        sort_keys(&mut keys);
        self.run_units(&keys)?;

        let sample_ids: Vec<SampleId> = {
            let mut ids: Vec<SampleId> = self.units.keys().map(|k| k.sample_id.clone()).collect();
            ids.sort();
            ids.dedup();
            ids
        };
        for sample_id in sample_ids {
            self.merge_coincidence(&sample_id);
        }
        Ok(())
    }

    /// Run C1->C3->C2->C4 for each key in parallel (rayon), checking the
    /// cancellation flag between units. Cancellation leaves untouched
    /// units exactly as they were: no half-written particle lists.
    ///
    /// Workers only ever see an immutable snapshot of each unit's trace and
    /// params (§5: "Immutable shared state: traces, DetectionParams
    /// snapshots passed to workers") — the engine's own cache is never
    /// touched until every worker has returned.
    fn run_units(&mut self, keys: &[CacheKey]) -> EngineResult<()> {
        let sigma = self.sigma;
        let cancel = self.cancel.clone();
        let progress = self.progress.clone();

        let snapshot: Vec<(CacheKey, Trace, DetectionParams)> =
            keys.iter().map(|key| { let unit = &self.units[key]; (key.clone(), unit.trace.clone(), unit.params.clone()) }).collect();

        let results: Vec<(CacheKey, EngineResult<(crate::types::ThresholdProfile, Vec<Particle>, Option<Warning>)>)> = snapshot
            .par_iter()
            .map(|(key, trace, params)| {
                if cancel.load(Ordering::SeqCst) {
                    return (key.clone(), Err(EngineError::Cancelled));
                }
                progress.isotope_started(&trace.sample_id, &trace.isotope);
                let outcome = process_unit(trace, params, sigma);
                progress.isotope_finished(&trace.sample_id, &trace.isotope);
                (key.clone(), outcome)
            })
            .collect();

        let mut cancelled = false;
        for (key, outcome) in results {
            match outcome {
                Ok((profile, particles, warning)) => {
                    if let Some(w) = warning {
                        self.warnings.lock().unwrap().push(w);
                    }
                    let fingerprint = Fingerprint::compute(&self.units[&key].params, self.sigma);
                    let unit = self.units.get_mut(&key).expect("key present");
                    unit.particles = particles;
                    unit.profile = Some(profile);
                    unit.state = DetectionState::Computed;
                    unit.fingerprint = Some(fingerprint);
                }
                Err(EngineError::Cancelled) => cancelled = true,
                Err(e) => return Err(e),
            }
        }

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn merge_coincidence(&mut self, sample_id: &str) {
        let groups: Vec<(IsotopeKey, Trace, Vec<Particle>)> = self
            .units
            .iter()
            .filter(|(k, _)| k.sample_id == sample_id)
            .map(|(k, u)| (k.isotope.clone(), u.trace.clone(), u.particles.clone()))
            .collect();

        let refs: Vec<IsotopeParticles> = groups.iter().map(|(isotope, trace, particles)| IsotopeParticles { isotope, trace, particles }).collect();

        let merged = coincidence::merge(&refs, self.overlap_threshold_percentage / 100.0);
        self.multi_particles.insert(sample_id.to_string(), merged);
    }

    pub fn particle_list(&self, sample_id: &str, isotope: &IsotopeKey) -> &[Particle] {
        let key = CacheKey::new(sample_id.to_string(), isotope.clone());
        self.units.get(&key).map(|u| u.particles.as_slice()).unwrap_or(&[])
    }

    pub fn threshold_profile(&self, sample_id: &str, isotope: &IsotopeKey) -> Option<&crate::types::ThresholdProfile> {
        let key = CacheKey::new(sample_id.to_string(), isotope.clone());
        self.units.get(&key).and_then(|u| u.profile.as_ref())
    }

    pub fn multi_element_particles(&self, sample_id: &str) -> &[MultiElementParticle] {
        self.multi_particles.get(sample_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Quantify the `index`-th particle of `(sample_id, isotope)`, caching
    /// the result keyed by particle identity. Pushes the matching §6
    /// warning whenever the result degrades to uncalibrated, and pinpoints
    /// a missing density or missing molecular-weight/atomic-mass input when
    /// that is specifically why.
    pub fn quantify(&mut self, sample_id: &str, isotope: &IsotopeKey, index: usize) -> Quantified {
        let cache_key = (sample_id.to_string(), isotope.clone(), index);
        if let Some(q) = self.quantitation_cache.get(&cache_key) {
            return *q;
        }
        let key = CacheKey::new(sample_id.to_string(), isotope.clone());
        let q = match self.units.get(&key).and_then(|u| u.particles.get(index)) {
            Some(particle) => quantitation::quantify(particle.total_counts, isotope, &self.calibration),
            None => Quantified::uncalibrated(),
        };

        {
            let mut warnings = self.warnings.lock().unwrap();
            if let Some(cal) = self.calibration.ionic.get(isotope) {
                if cal.density <= 0.0 {
                    warnings.push(Warning::MissingDensity { isotope: isotope.clone() });
                }
                if cal.molecular_weight <= 0.0 && cal.atomic_mass <= 0.0 {
                    warnings.push(Warning::MissingMolecularWeight { isotope: isotope.clone() });
                }
            }
            if q.uncalibrated {
                warnings.push(Warning::Uncalibrated { sample_id: sample_id.to_string(), isotope: isotope.clone() });
            }
        }

        self.quantitation_cache.insert(cache_key, q);
        q
    }

    pub fn detection_summary(&self, sample_id: &str, isotope: &IsotopeKey) -> DetectionSummary {
        let particles = self.particle_list(sample_id, isotope);
        summarize(particles)
    }

    pub fn drain_warnings(&self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings.lock().unwrap())
    }
}

/// Sort work-unit keys into a fixed order so that per-unit side effects
/// (warnings pushed during `run_units`) are deterministic regardless of
/// `HashMap` iteration order (§5, §8 property 7).
fn sort_keys(keys: &mut [CacheKey]) {
    keys.sort_by(|a, b| a.sample_id.cmp(&b.sample_id).then_with(|| a.isotope.cmp(&b.isotope)));
}

/// Run C1 (smoothing) -> C3 (background, which internally loops C2) -> C4
/// (peak finding) for one (sample, isotope) unit.
fn process_unit(trace: &Trace, params: &DetectionParams, sigma: f64) -> EngineResult<(crate::types::ThresholdProfile, Vec<Particle>, Option<Warning>)> {
    if trace.is_empty() {
        return Err(EngineError::InputInvalid("trace has no samples".to_string()));
    }
    if trace.dwell_s <= 0.0 {
        return Err(EngineError::InputInvalid("dwell_s must be positive".to_string()));
    }
    if !(f64::MIN_POSITIVE..=0.1).contains(&params.alpha) {
        return Err(EngineError::InputInvalid("alpha must be in (0, 0.1]".to_string()));
    }

    let raw: Vec<f64> = trace.counts.iter().map(|&c| c as f64).collect();
    let smoothed = smoother::smooth(&raw, params.smooth_window, params.smooth_iterations, params.apply_smoothing);
    let (profile, any_nan, any_non_convergent) = background::estimate_profile(&smoothed, params, sigma);

    let mut warning = None;
    if any_nan {
        warning = Some(Warning::ThresholdNan { sample_id: trace.sample_id.clone(), isotope: trace.isotope.clone() });
    } else if any_non_convergent {
        warning = Some(Warning::BackgroundNonConvergence { sample_id: trace.sample_id.clone(), isotope: trace.isotope.clone(), iterations: params.max_iterations });
    }

    let particles = if any_nan {
        Vec::new()
    } else {
        peak_finder::find_particles(&smoothed, &trace.counts, &profile, params.min_continuous)
    };

    for p in &particles {
        if p.left_idx > p.peak_idx || p.peak_idx > p.right_idx {
            return Err(EngineError::Invariant(format!("particle indices out of order: {}..{}..{}", p.left_idx, p.peak_idx, p.right_idx)));
        }
    }

    Ok((profile, particles, warning))
}

fn summarize(particles: &[Particle]) -> DetectionSummary {
    let particle_count = particles.len();
    let total_counts: f64 = particles.iter().map(|p| p.total_counts).sum();
    let mean_counts = if particle_count > 0 { total_counts / particle_count as f64 } else { 0.0 };

    let mut sorted_counts: Vec<f64> = particles.iter().map(|p| p.total_counts).collect();
    sorted_counts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median_counts = if sorted_counts.is_empty() {
        0.0
    } else if sorted_counts.len() % 2 == 1 {
        sorted_counts[sorted_counts.len() / 2]
    } else {
        let mid = sorted_counts.len() / 2;
        (sorted_counts[mid - 1] + sorted_counts[mid]) / 2.0
    };

    let mut snr_histogram = [0u32; 10];
    for p in particles {
        let bucket = p.snr().floor().clamp(0.0, 9.0) as usize;
        snr_histogram[bucket] += 1;
    }

    DetectionSummary { particle_count, total_counts, mean_counts, median_counts, snr_histogram }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionMethod;

    fn s2_trace() -> Trace {
        let mut counts = vec![0u32; 1000];
        counts[500] = 200;
        counts[501] = 180;
        counts[502] = 50;
        Trace::new("sample-1", IsotopeKey::new("Ag", 107.0), 0.01, counts)
    }

    fn manual_params() -> DetectionParams {
        DetectionParams { method: DetectionMethod::Manual, manual_threshold: 10.0, min_continuous: 1, iterative: true, ..Default::default() }
    }

    #[test]
    fn detect_runs_pipeline_and_caches_result() {
        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(s2_trace(), manual_params());
        engine.apply(Command::Detect("sample-1".to_string())).unwrap();

        let isotope = IsotopeKey::new("Ag", 107.0);
        let particles = engine.particle_list("sample-1", &isotope);
        assert_eq!(particles.len(), 1);
        assert_eq!(particles[0].total_counts, 430.0);
    }

    #[test]
    fn sigma_change_invalidates_every_key() {
        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(s2_trace(), manual_params());
        engine.apply(Command::Detect("sample-1".to_string())).unwrap();

        let key = CacheKey::new("sample-1".to_string(), IsotopeKey::new("Ag", 107.0));
        assert_eq!(engine.units[&key].state, DetectionState::Computed);

        engine.set_sigma(0.9);
        assert_eq!(engine.units[&key].state, DetectionState::Changed);
    }

    #[test]
    fn calibration_change_preserves_particles_but_clears_quantitation_cache() {
        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(s2_trace(), manual_params());
        engine.apply(Command::Detect("sample-1".to_string())).unwrap();

        let isotope = IsotopeKey::new("Ag", 107.0);
        let _ = engine.quantify("sample-1", &isotope, 0);
        assert!(!engine.quantitation_cache.is_empty());

        engine.set_calibration(CalibrationState::default());
        assert!(engine.quantitation_cache.is_empty());
        assert_eq!(engine.particle_list("sample-1", &isotope).len(), 1);
    }

    #[test]
    fn set_params_clears_quantitation_cache_for_that_key() {
        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(s2_trace(), manual_params());
        engine.apply(Command::Detect("sample-1".to_string())).unwrap();

        let isotope = IsotopeKey::new("Ag", 107.0);
        let _ = engine.quantify("sample-1", &isotope, 0);
        assert!(!engine.quantitation_cache.is_empty());

        engine.set_params("sample-1", &isotope, manual_params()).unwrap();
        assert!(engine.quantitation_cache.is_empty());
    }

    #[test]
    fn set_sigma_clears_quantitation_cache() {
        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(s2_trace(), manual_params());
        engine.apply(Command::Detect("sample-1".to_string())).unwrap();

        let isotope = IsotopeKey::new("Ag", 107.0);
        let _ = engine.quantify("sample-1", &isotope, 0);
        assert!(!engine.quantitation_cache.is_empty());

        engine.set_sigma(0.9);
        assert!(engine.quantitation_cache.is_empty());
    }

    #[test]
    fn empty_trace_is_input_invalid() {
        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(Trace::new("sample-1", IsotopeKey::new("Ag", 107.0), 0.01, vec![]), manual_params());
        let result = engine.apply(Command::Detect("sample-1".to_string()));
        assert!(matches!(result, Err(EngineError::InputInvalid(_))));
    }

    #[test]
    fn alpha_zero_is_input_invalid() {
        let mut engine = Engine::new(0.47, 50.0);
        let mut params = manual_params();
        params.method = DetectionMethod::Currie;
        params.alpha = 0.0;
        engine.load_trace(s2_trace(), params);
        let result = engine.apply(Command::Detect("sample-1".to_string()));
        assert!(matches!(result, Err(EngineError::InputInvalid(_))));
    }

    #[test]
    fn quantify_with_no_calibration_emits_uncalibrated_warning() {
        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(s2_trace(), manual_params());
        engine.apply(Command::Detect("sample-1".to_string())).unwrap();

        let isotope = IsotopeKey::new("Ag", 107.0);
        let q = engine.quantify("sample-1", &isotope, 0);
        assert!(q.uncalibrated);

        let warnings = engine.drain_warnings();
        assert!(warnings.iter().any(|w| matches!(w, Warning::Uncalibrated { isotope: i, .. } if *i == isotope)));
    }

    #[test]
    fn quantify_with_missing_density_and_molecular_weight_emits_both_warnings() {
        use crate::types::{IonicCalibration, IonicVariant};

        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(s2_trace(), manual_params());
        engine.apply(Command::Detect("sample-1".to_string())).unwrap();

        let isotope = IsotopeKey::new("Ag", 107.0);
        let mut cal = CalibrationState::default();
        cal.transport_rate_methods.insert("gravimetric".into(), 10.0);
        cal.selected_transport_methods = vec!["gravimetric".into()];
        cal.ionic.insert(
            isotope.clone(),
            IonicCalibration {
                zero: None,
                simple: None,
                weighted: Some(IonicVariant { slope: 1.0, intercept: 0.0, r_squared: 0.9, bec: 0.0, lod: 0.0, loq: 0.0 }),
                manual: None,
                density: 0.0,
                molecular_weight: 0.0,
                mass_fraction: 1.0,
                atomic_mass: 0.0,
            },
        );
        engine.set_calibration(cal);

        let q = engine.quantify("sample-1", &isotope, 0);
        assert!(q.uncalibrated);

        let warnings = engine.drain_warnings();
        assert!(warnings.iter().any(|w| matches!(w, Warning::MissingDensity { isotope: i } if *i == isotope)));
        assert!(warnings.iter().any(|w| matches!(w, Warning::MissingMolecularWeight { isotope: i } if *i == isotope)));
    }

    #[test]
    fn run_units_processes_keys_in_sorted_order() {
        let mut keys = vec![
            CacheKey::new("b".to_string(), IsotopeKey::new("Au", 197.0)),
            CacheKey::new("a".to_string(), IsotopeKey::new("Zn", 64.0)),
            CacheKey::new("a".to_string(), IsotopeKey::new("Ag", 107.0)),
        ];
        sort_keys(&mut keys);
        // Within sample "a", IsotopeKey orders by mass ascending first: Zn
        // (64.0) sorts before Ag (107.0).
        assert_eq!(keys[0].sample_id, "a");
        assert_eq!(keys[0].isotope, IsotopeKey::new("Zn", 64.0));
        assert_eq!(keys[1].sample_id, "a");
        assert_eq!(keys[1].isotope, IsotopeKey::new("Ag", 107.0));
        assert_eq!(keys[2].sample_id, "b");
    }

    #[test]
    fn cancel_before_run_aborts_without_partial_writes() {
        let mut engine = Engine::new(0.47, 50.0);
        engine.load_trace(s2_trace(), manual_params());
        engine.cancel.store(true, Ordering::SeqCst);
        let result = engine.apply(Command::Detect("sample-1".to_string()));
        assert!(matches!(result, Err(EngineError::Cancelled)));

        let key = CacheKey::new("sample-1".to_string(), IsotopeKey::new("Ag", 107.0));
        assert_eq!(engine.units[&key].state, DetectionState::Changed);
        assert!(engine.units[&key].particles.is_empty());
    }
}
