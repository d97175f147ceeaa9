pub mod background;
pub mod cache;
pub mod coincidence;
pub mod engine;
pub mod error;
pub mod peak_finder;
pub mod progress;
pub mod quantitation;
pub mod smoother;
pub mod threshold;
pub mod types;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use types::{
    CalibrationState, Command, DetectionMethod, DetectionParams, DetectionState, DetectionSummary, IonicCalibration, IonicVariant, IsotopeKey, MultiElementParticle, Particle,
    Quantified, SampleId, ThresholdProfile, ThresholdWindow, Trace, VariantName, Warning,
};
