//! C3: Per-trace or per-window background (lambda) estimation, with
//! optional iterative refinement (§4.3).

use crate::threshold;
use crate::types::{DetectionParams, ThresholdProfile, ThresholdWindow};

/// Relative convergence tolerance for the iterative background loop.
const CONVERGENCE_REL_TOL: f64 = 1e-6;

/// Outcome of estimating one window's `(lambda, threshold)`.
struct WindowEstimate {
    background: f64,
    threshold: f64,
    iterations_used: usize,
    converged: bool,
    nan: bool,
}

/// Deterministic mean over `values`, fixed left-to-right traversal order
/// (§5: numerical determinism requires a fixed reduction order).
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0;
    for &v in values {
        sum += v;
    }
    sum / values.len() as f64
}

/// Estimate a piecewise-constant `(lambda, threshold)` profile over
/// `signal`, honoring `use_window_size`/`window_size`. `sigma` is the
/// process-wide Compound-Poisson-Lognormal log-sigma. Returns
/// `(profile, any_window_nan, any_window_non_convergent)`.
pub fn estimate_profile(signal: &[f64], params: &DetectionParams, sigma: f64) -> (ThresholdProfile, bool, bool) {
    let mut windows = Vec::new();
    let mut any_nan = false;
    let mut any_non_convergent = false;

    if !params.use_window_size {
        let est = estimate_window(signal, params, sigma);
        any_nan |= est.nan;
        any_non_convergent |= !est.converged;
        windows.push(ThresholdWindow {
            start: 0,
            end: signal.len(),
            background: est.background,
            threshold: est.threshold,
            iterations_used: est.iterations_used,
        });
    } else {
        let n = signal.len();
        let w = params.window_size.max(1);
        let mut start = 0;
        while start < n {
            let end = (start + w).min(n);
            let est = estimate_window(&signal[start..end], params, sigma);
            any_nan |= est.nan;
            any_non_convergent |= !est.converged;
            windows.push(ThresholdWindow {
                start,
                end,
                background: est.background,
                threshold: est.threshold,
                iterations_used: est.iterations_used,
            });
            start = end;
        }
    }

    (ThresholdProfile { windows }, any_nan, any_non_convergent)
}

fn estimate_window(signal: &[f64], params: &DetectionParams, sigma: f64) -> WindowEstimate {
    let mut lambda = mean(signal);
    let mut outcome = threshold::compute(params.method, lambda, params.alpha, sigma, params.manual_threshold);
    let mut iterations_used = 0;
    let mut converged = true;

    if params.iterative && !outcome.nan {
        converged = false;
        for iter in 1..=params.max_iterations {
            iterations_used = iter;
            let below: Vec<f64> = signal.iter().copied().filter(|&s| s <= outcome.threshold).collect();
            let next_lambda = mean(&below);
            let next_outcome = threshold::compute(params.method, next_lambda, params.alpha, sigma, params.manual_threshold);

            let delta = (next_lambda - lambda).abs();
            let scale = 1.0_f64.max(lambda.abs());
            let converged_now = delta < CONVERGENCE_REL_TOL * scale;

            lambda = next_lambda;
            outcome = next_outcome;

            if outcome.nan {
                break;
            }
            if converged_now {
                converged = true;
                break;
            }
        }
    }

    WindowEstimate { background: lambda, threshold: outcome.threshold, iterations_used, converged, nan: outcome.nan }
}
