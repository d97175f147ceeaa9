//! C1: Moving-window mean smoother.
//!
//! Given a non-negative count sequence and `(window, iters)`, returns a
//! sequence of equal length. Boundaries truncate the window rather than
//! reflecting or zero-padding, and are renormalized over however many
//! points are actually available.

/// Smooth `signal` in place semantics, returning a new `Vec<f64>` of equal
/// length. `window` must be odd and >= 3; `iterations` >= 1. `apply=false`
/// (or `iterations == 0`) is the identity — property 1 in §8.
pub fn smooth(signal: &[f64], window: usize, iterations: usize, apply: bool) -> Vec<f64> {
    if !apply || iterations == 0 {
        return signal.to_vec();
    }
    debug_assert!(window % 2 == 1 && window >= 3, "smoothing window must be odd and >= 3");

    let half = window / 2;
    let mut current = signal.to_vec();
    let mut scratch = vec![0.0; current.len()];

    for _ in 0..iterations {
        for i in 0..current.len() {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(current.len());
            let sum: f64 = current[lo..hi].iter().sum();
            scratch[i] = sum / (hi - lo) as f64;
        }
        std::mem::swap(&mut current, &mut scratch);
    }
    current
}
