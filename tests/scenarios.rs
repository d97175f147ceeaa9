//! End-to-end scenarios and cross-module invariants that don't fit neatly
//! in a single module's unit tests.

use spicms_particles::{
    background, coincidence, engine::Engine, peak_finder, quantitation, smoother, CalibrationState, Command, DetectionMethod, DetectionParams, IonicCalibration, IonicVariant,
    IsotopeKey, Trace, VariantName,
};

fn manual_params(min_continuous: usize, threshold: f64) -> DetectionParams {
    DetectionParams { method: DetectionMethod::Manual, manual_threshold: threshold, min_continuous, iterative: true, ..Default::default() }
}

/// S5 — two-isotope coincidence, overlap percentage right at the edge of
/// the default 50% threshold.
#[test]
fn s5_two_isotope_coincidence_overlap_threshold() {
    let trace_a = Trace::new("sample-1", IsotopeKey::new("A", 10.0), 0.001, vec![0u32; 200]);
    let trace_b = Trace::new("sample-1", IsotopeKey::new("B", 20.0), 0.001, vec![0u32; 200]);

    // A: [0.100s, 0.105s] -> indices [100, 105]; B: [0.102s, 0.108s] -> [102, 108].
    let particle_a = spicms_particles::Particle { left_idx: 100, peak_idx: 102, right_idx: 105, total_counts: 50.0, max_height: 80, threshold: 10.0, background: 0.0 };
    let particle_b = spicms_particles::Particle { left_idx: 102, peak_idx: 105, right_idx: 108, total_counts: 40.0, max_height: 70, threshold: 10.0, background: 0.0 };

    let isotope_a = IsotopeKey::new("A", 10.0);
    let isotope_b = IsotopeKey::new("B", 20.0);
    let a_particles = vec![particle_a];
    let b_particles = vec![particle_b];

    let groups = vec![
        coincidence::IsotopeParticles { isotope: &isotope_a, trace: &trace_a, particles: &a_particles },
        coincidence::IsotopeParticles { isotope: &isotope_b, trace: &trace_b, particles: &b_particles },
    ];

    // overlap = 3ms, shorter duration = 5ms -> 60% >= 50% threshold.
    let merged = coincidence::merge(&groups, 0.50);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].elements.len(), 2);

    // At 70% the same data yields no coincidence.
    let merged_strict = coincidence::merge(&groups, 0.70);
    assert!(merged_strict.is_empty());
}

/// Property 6: the multi-particle set is invariant under reordering of
/// input isotopes.
#[test]
fn coincidence_symmetry_under_isotope_reordering() {
    let trace_a = Trace::new("sample-1", IsotopeKey::new("A", 10.0), 0.001, vec![0u32; 200]);
    let trace_b = Trace::new("sample-1", IsotopeKey::new("B", 20.0), 0.001, vec![0u32; 200]);
    let trace_c = Trace::new("sample-1", IsotopeKey::new("C", 30.0), 0.001, vec![0u32; 200]);

    let pa = vec![spicms_particles::Particle { left_idx: 10, peak_idx: 11, right_idx: 15, total_counts: 20.0, max_height: 50, threshold: 5.0, background: 0.0 }];
    let pb = vec![spicms_particles::Particle { left_idx: 11, peak_idx: 13, right_idx: 16, total_counts: 25.0, max_height: 55, threshold: 5.0, background: 0.0 }];
    let pc = vec![spicms_particles::Particle { left_idx: 100, peak_idx: 101, right_idx: 105, total_counts: 30.0, max_height: 60, threshold: 5.0, background: 0.0 }];

    let isotope_a = IsotopeKey::new("A", 10.0);
    let isotope_b = IsotopeKey::new("B", 20.0);
    let isotope_c = IsotopeKey::new("C", 30.0);

    let forward = vec![
        coincidence::IsotopeParticles { isotope: &isotope_a, trace: &trace_a, particles: &pa },
        coincidence::IsotopeParticles { isotope: &isotope_b, trace: &trace_b, particles: &pb },
        coincidence::IsotopeParticles { isotope: &isotope_c, trace: &trace_c, particles: &pc },
    ];
    let reversed = vec![
        coincidence::IsotopeParticles { isotope: &isotope_c, trace: &trace_c, particles: &pc },
        coincidence::IsotopeParticles { isotope: &isotope_b, trace: &trace_b, particles: &pb },
        coincidence::IsotopeParticles { isotope: &isotope_a, trace: &trace_a, particles: &pa },
    ];

    let forward_result = coincidence::merge(&forward, 0.0);
    let reversed_result = coincidence::merge(&reversed, 0.0);
    assert_eq!(forward_result, reversed_result);
}

/// Property 7/8: identical inputs yield byte-identical outputs, and that
/// holds across a serde_json persist/reload round-trip.
#[test]
fn determinism_and_round_trip_via_serde_json() {
    let mut counts = vec![0u32; 2000];
    for i in 600..620 {
        counts[i] = 40 + (i as u32 % 5);
    }
    let trace = Trace::new("sample-1", IsotopeKey::new("Ag", 107.0), 0.01, counts);
    let params = manual_params(1, 15.0);

    let raw: Vec<f64> = trace.counts.iter().map(|&c| c as f64).collect();
    let smoothed = smoother::smooth(&raw, params.smooth_window, params.smooth_iterations, params.apply_smoothing);
    let (profile_a, _, _) = background::estimate_profile(&smoothed, &params, 0.47);
    let particles_a = peak_finder::find_particles(&smoothed, &trace.counts, &profile_a, params.min_continuous);

    let (profile_b, _, _) = background::estimate_profile(&smoothed, &params, 0.47);
    let particles_b = peak_finder::find_particles(&smoothed, &trace.counts, &profile_b, params.min_continuous);

    assert_eq!(particles_a, particles_b);

    let json = serde_json::to_string(&particles_a).expect("particles serialize");
    let reloaded: Vec<spicms_particles::Particle> = serde_json::from_str(&json).expect("particles deserialize");
    assert_eq!(particles_a, reloaded);
}

/// Property 9: scaling all `total_counts` by `k` scales `element_mass_fg`
/// by `k` (calibration is linear in counts).
#[test]
fn calibration_linearity() {
    let mut cal = CalibrationState::default();
    cal.transport_rate_methods.insert("gravimetric".into(), 8.0);
    cal.selected_transport_methods = vec!["gravimetric".into()];
    let isotope = IsotopeKey::new("Au", 197.0);
    cal.ionic.insert(
        isotope.clone(),
        IonicCalibration {
            zero: None,
            simple: None,
            weighted: Some(IonicVariant { slope: 1.5e5, intercept: 0.0, r_squared: 0.98, bec: 0.0, lod: 0.0, loq: 0.0 }),
            manual: None,
            density: 19.3,
            molecular_weight: 0.0,
            mass_fraction: 1.0,
            atomic_mass: 196.97,
        },
    );
    cal.method_preference.insert(isotope.clone(), VariantName::Weighted);

    let base = quantitation::quantify(500.0, &isotope, &cal);
    let scaled = quantitation::quantify(500.0 * 3.0, &isotope, &cal);
    assert!(!base.uncalibrated && !scaled.uncalibrated);
    assert!((scaled.element_mass_fg - base.element_mass_fg * 3.0).abs() < 1e-9);
}

/// Full pipeline exercised through the orchestrator, across two isotopes
/// on the same sample, ending in coincidence merging and quantitation.
#[test]
fn engine_end_to_end_two_isotope_sample() {
    let mut counts_ag = vec![0u32; 500];
    counts_ag[200] = 300;
    counts_ag[201] = 200;
    let mut counts_au = vec![0u32; 500];
    counts_au[201] = 250;
    counts_au[202] = 150;

    let trace_ag = Trace::new("sample-1", IsotopeKey::new("Ag", 107.0), 0.001, counts_ag);
    let trace_au = Trace::new("sample-1", IsotopeKey::new("Au", 197.0), 0.001, counts_au);

    let mut engine = Engine::new(0.47, 0.0);
    engine.load_trace(trace_ag, manual_params(1, 10.0));
    engine.load_trace(trace_au, manual_params(1, 10.0));
    engine.apply(Command::Detect("sample-1".to_string())).unwrap();

    let ag = IsotopeKey::new("Ag", 107.0);
    let au = IsotopeKey::new("Au", 197.0);
    assert_eq!(engine.particle_list("sample-1", &ag).len(), 1);
    assert_eq!(engine.particle_list("sample-1", &au).len(), 1);

    let multi = engine.multi_element_particles("sample-1");
    assert_eq!(multi.len(), 1);
    assert_eq!(multi[0].elements.len(), 2);

    let quantified = engine.quantify("sample-1", &ag, 0);
    assert!(quantified.uncalibrated); // no calibration loaded: must be NaN, not a crash
}
