//! Bar analysis, model scoring and cross-timeframe signal fusion
//!
//! Stages run per stream in open_time order: indicators are computed for a
//! stored bar, the ensemble scores its feature vector, and the signal
//! generator fuses the latest committed predictions of an instrument.

pub mod analyzer;
pub mod ensemble;
pub mod features;
pub mod indicators;
pub mod patterns;
pub mod signal;

pub use analyzer::{AnalyzeOutcome, IndicatorConfig, IndicatorEngine, IndicatorError};
pub use ensemble::{
    EnsembleConfig, EnsembleError, EnsembleScorer, EnsembleWeights, Fused, LinearHead,
    LinearScorer, ModelHeads, ModelOutput, ModelScorer,
};
pub use features::{FeatureVector, FEATURE_NAMES};
pub use patterns::Candle;
pub use signal::{
    Direction, Role, Roles, Signal, SignalConfig, SignalGenerator, SignalKind, SignalReason,
    TimeframeVote,
};
