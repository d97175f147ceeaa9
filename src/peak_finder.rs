//! C4: Peak segmentation and integration (§4.4).
//!
//! Traversal state machine per spec: `Below -> Rising (above T, counting
//! run length) -> Confirmed (run >= min_continuous) -> Extending (walking
//! back to lambda) -> Extended (walking forward to lambda) -> Emit ->
//! Below`. This module implements that traversal directly rather than as
//! an explicit enum-driven state object, since the states map one-to-one
//! onto the phases of a single pass over the index range.

use crate::types::{Particle, ThresholdProfile};

/// Find particles in `signal` (the possibly-smoothed trace used for
/// threshold comparisons and boundary extension) using `raw` (the
/// pre-smoothing trace, used only for integration and peak height so
/// smoothing never distorts reported counts).
pub fn find_particles(signal: &[f64], raw: &[u32], profile: &ThresholdProfile, min_continuous: usize) -> Vec<Particle> {
    let n = signal.len();
    debug_assert_eq!(signal.len(), raw.len());
    if n == 0 {
        return Vec::new();
    }

    let runs = candidate_runs(signal, profile, min_continuous);
    let supports = extend_to_background(signal, profile, runs, n);
    let merged = merge_adjacent(supports);
    merged.into_iter().map(|(l, r)| integrate(raw, profile, l, r)).collect()
}

/// Maximal runs where `signal[i] > T(i)`, discarding runs shorter than
/// `min_continuous`. A `NaN` threshold makes every comparison false, so a
/// NaN'd window simply contributes no candidate runs (§4.5/§7: C2 NaN
/// thresholds yield zero particles, never a panic).
fn candidate_runs(signal: &[f64], profile: &ThresholdProfile, min_continuous: usize) -> Vec<(usize, usize)> {
    let n = signal.len();
    let mut runs = Vec::new();
    let mut i = 0;
    while i < n {
        let (_, t) = profile.at(i);
        if signal[i] > t {
            let start = i;
            let mut j = i + 1;
            while j < n {
                let (_, tj) = profile.at(j);
                if signal[j] > tj {
                    j += 1;
                } else {
                    break;
                }
            }
            if j - start >= min_continuous {
                runs.push((start, j - 1));
            }
            i = j;
        } else {
            i += 1;
        }
    }
    runs
}

/// Extend each run's boundary leftward/rightward while the signal remains
/// above the local background, stopping at the trace edge (no
/// extrapolation beyond the trace — §4.4 edge policy).
fn extend_to_background(signal: &[f64], profile: &ThresholdProfile, runs: Vec<(usize, usize)>, n: usize) -> Vec<(usize, usize)> {
    runs.into_iter()
        .map(|(mut l, mut r)| {
            while l > 0 {
                let (lambda, _) = profile.at(l - 1);
                if signal[l - 1] > lambda {
                    l -= 1;
                } else {
                    break;
                }
            }
            while r + 1 < n {
                let (lambda, _) = profile.at(r + 1);
                if signal[r + 1] > lambda {
                    r += 1;
                } else {
                    break;
                }
            }
            (l, r)
        })
        .collect()
}

/// Merge supports that overlap or touch after extension. `supports` is
/// already in ascending order because `candidate_runs` scans left to
/// right and extension cannot reorder runs.
fn merge_adjacent(supports: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (l, r) in supports {
        if let Some(last) = merged.last_mut() {
            if l <= last.1 + 1 {
                last.1 = last.1.max(r);
                continue;
            }
        }
        merged.push((l, r));
    }
    merged
}

/// Integrate counts over `[l, r]` on the raw (pre-smoothing) signal.
fn integrate(raw: &[u32], profile: &ThresholdProfile, l: usize, r: usize) -> Particle {
    let mut total = 0.0;
    let mut max_height = raw[l];
    let mut peak_idx = l;
    for idx in l..=r {
        let (lambda, _) = profile.at(idx);
        total += (raw[idx] as f64 - lambda).max(0.0);
        if raw[idx] > max_height {
            max_height = raw[idx];
            peak_idx = idx;
        }
    }
    let (background, threshold) = profile.at(peak_idx);
    Particle { left_idx: l, peak_idx, right_idx: r, total_counts: total, max_height, threshold, background }
}
