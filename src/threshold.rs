//! C2: Four alternative threshold detectors (§4.2).
//!
//! All four return a threshold `T >= background` such that a sample above
//! `T` is significant at the chosen false-positive rate `alpha`. Every
//! function here is pure — no shared state, no I/O.

use crate::types::DetectionMethod;
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::gamma::ln_gamma;

/// Cumulative Poisson mass truncated at this tail probability; see the
/// Compound-Poisson-Lognormal contract (§9 design notes).
const POISSON_TAIL_EPS: f64 = 1e-12;
const MAX_POISSON_TERMS: usize = 200_000;
const MAX_BRACKET_DOUBLINGS: usize = 200;
const ROOT_TOLERANCE: f64 = 1e-10;

/// Outcome of a threshold computation: either a finite threshold, or a
/// `NaN` flagged as such so callers can distinguish "no threshold could be
/// computed" from an accidental float NaN elsewhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdOutcome {
    pub threshold: f64,
    pub nan: bool,
}

impl ThresholdOutcome {
    fn value(t: f64) -> Self {
        Self { threshold: t, nan: false }
    }
    fn undefined() -> Self {
        Self { threshold: f64::NAN, nan: true }
    }
}

/// Standard normal quantile function, `Phi^-1(1 - alpha)`.
fn z_alpha(alpha: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("standard normal is always valid");
    normal.inverse_cdf(1.0 - alpha)
}

fn phi(x: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("standard normal is always valid");
    normal.cdf(x)
}

fn currie(background: f64, alpha: f64) -> f64 {
    let z = z_alpha(alpha);
    let eps = if background < 10.0 { 0.5 } else { 0.0 };
    let eta = 2.0;
    background + z * ((background + eps) * eta).sqrt()
}

fn formula_c(background: f64, alpha: f64) -> f64 {
    let z = z_alpha(alpha);
    let t_r = 1.0_f64;
    background + z * z / 2.0 * t_r + z * (z * z / 4.0 * t_r * t_r + background * t_r * (1.0 + t_r)).sqrt()
}

/// `ln(P(K=k | lambda))` via `ln_gamma`, avoiding factorial overflow for
/// large k.
fn ln_poisson_pmf(k: u64, lambda: f64) -> f64 {
    -lambda + (k as f64) * lambda.ln() - ln_gamma(k as f64 + 1.0)
}

fn poisson_pmf(k: u64, lambda: f64) -> f64 {
    ln_poisson_pmf(k, lambda).exp()
}

/// Fenton-Wilkinson moments for the sum of `k` i.i.d. LogNormal(mu, sigma)
/// draws, with `mu` fixed so a single draw has `E[LogNormal] = 1`.
fn fenton_wilkinson_moments(k: u64, sigma2: f64) -> (f64, f64) {
    let mu = -sigma2 / 2.0;
    let sigma_k2 = (1.0 + (sigma2.exp() - 1.0) / k as f64).ln();
    let m_k = (k as f64).ln() + mu + (sigma2 - sigma_k2) / 2.0;
    (m_k, sigma_k2.sqrt())
}

/// Poisson weights (unconditioned on k>=1) truncated once the cumulative
/// mass (including the k=0 term) reaches `1 - POISSON_TAIL_EPS`.
fn truncated_poisson_weights(lambda: f64) -> Vec<(u64, f64)> {
    let mut terms = Vec::new();
    let mut cum = (-lambda).exp(); // P(K=0), excluded from `terms` but counted toward the tail budget
    let mut k = 1u64;
    loop {
        let w = poisson_pmf(k, lambda);
        terms.push((k, w));
        cum += w;
        if cum >= 1.0 - POISSON_TAIL_EPS || terms.len() >= MAX_POISSON_TERMS {
            break;
        }
        k += 1;
    }
    terms
}

/// The compound-Poisson-Lognormal mixture CDF at `t > 0`.
fn mixture_cdf(t: f64, terms: &[(u64, f64)], sigma2: f64) -> f64 {
    let ln_t = t.ln();
    terms
        .iter()
        .map(|&(k, w)| {
            let (m_k, sigma_k) = fenton_wilkinson_moments(k, sigma2);
            w * phi((ln_t - m_k) / sigma_k)
        })
        .sum()
}

fn compound_poisson_lognormal(background: f64, alpha: f64, sigma: f64) -> ThresholdOutcome {
    if background <= 0.0 {
        return ThresholdOutcome::value(currie(background, alpha));
    }

    let q = 1.0 - alpha;
    let q0 = (q - (-background).exp()) / (1.0 - (-background).exp());
    if q0 <= 0.0 {
        return ThresholdOutcome::undefined();
    }

    let sigma2 = sigma * sigma;
    let terms = truncated_poisson_weights(background);
    let max_f: f64 = terms.iter().map(|&(k, w)| {
        let _ = k;
        w
    }).sum();
    if q0 >= max_f {
        // No finite T solves F(T) = q0: root-find divergence (§7).
        return ThresholdOutcome::undefined();
    }

    // Bracket: F is monotone increasing in T. Expand hi until F(hi) >= q0.
    let mut lo = 1e-9_f64;
    let mut hi = 1.0_f64;
    let mut doublings = 0;
    while mixture_cdf(hi, &terms, sigma2) < q0 && doublings < MAX_BRACKET_DOUBLINGS {
        hi *= 2.0;
        doublings += 1;
    }
    if mixture_cdf(hi, &terms, sigma2) < q0 {
        return ThresholdOutcome::undefined();
    }

    // Bisection to a coarse tolerance.
    let mut f_lo = mixture_cdf(lo, &terms, sigma2) - q0;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        let f_mid = mixture_cdf(mid, &terms, sigma2) - q0;
        if f_mid.abs() < ROOT_TOLERANCE || (hi - lo) < ROOT_TOLERANCE {
            lo = mid;
            hi = mid;
            break;
        }
        if (f_lo < 0.0) == (f_mid < 0.0) {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }

    // Secant-refined bracket (a poor man's Brent step) for extra precision.
    let fa = mixture_cdf(lo, &terms, sigma2) - q0;
    let fb = mixture_cdf(hi, &terms, sigma2) - q0;
    let t = if (fb - fa).abs() > 1e-15 {
        lo - fa * (hi - lo) / (fb - fa)
    } else {
        0.5 * (lo + hi)
    };
    let t = t.clamp(lo.min(hi), lo.max(hi));

    ThresholdOutcome::value(t)
}

/// Compute the detection threshold for `method` given background `lambda`,
/// false-positive rate `alpha`, the Compound-Poisson-Lognormal log-sigma,
/// and the Manual threshold value. `alpha` and `sigma` are ignored by
/// Manual.
pub fn compute(method: DetectionMethod, background: f64, alpha: f64, sigma: f64, manual_threshold: f64) -> ThresholdOutcome {
    match method {
        DetectionMethod::Currie => ThresholdOutcome::value(currie(background, alpha)),
        DetectionMethod::FormulaC => ThresholdOutcome::value(formula_c(background, alpha)),
        DetectionMethod::CompoundPoissonLognormal => compound_poisson_lognormal(background, alpha, sigma),
        DetectionMethod::Manual => ThresholdOutcome::value(manual_threshold),
    }
}
