//! Parameter fingerprinting and the Orchestrator's keyed result cache.
//!
//! Replaces the source's ad-hoc string-hash fingerprinting (§9 design
//! notes) with a canonical serialization of `DetectionParams` (+ the
//! process-wide sigma) into a stable, deterministic 64-bit fingerprint.
//! `std::hash::Hasher` (not `std::collections::hash_map::RandomState`) is
//! used deliberately: `DefaultHasher::new()` seeds with fixed keys, so the
//! fingerprint is stable across process restarts, which the round-trip
//! property (§8, property 8) depends on.

use crate::types::{DetectionParams, IsotopeKey, SampleId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Opaque fingerprint of a `(DetectionParams, sigma)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn compute(params: &DetectionParams, sigma: f64) -> Self {
        // Canonical serialization: serde_json with sorted map keys is not
        // guaranteed by struct field order alone, but DetectionParams has
        // no maps, so `serde_json::to_string` already yields a fixed field
        // order matching the struct's declaration. Sigma is appended
        // explicitly since it is process-wide, not a DetectionParams field.
        let canonical = serde_json::to_string(params).expect("DetectionParams is always serializable");
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        sigma.to_bits().hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// Cache key for one (sample, isotope) unit's detection results.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub sample_id: SampleId,
    pub isotope: IsotopeKey,
}

impl CacheKey {
    pub fn new(sample_id: impl Into<SampleId>, isotope: IsotopeKey) -> Self {
        Self { sample_id: sample_id.into(), isotope }
    }
}
