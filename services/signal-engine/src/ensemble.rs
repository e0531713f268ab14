//! Ensemble scoring: three independent model heads fused into one prediction
//!
//! Each head is a pure function of the bar's feature vector. The fused value
//! is a weighted mean of the three outputs and the confidence falls with
//! their dispersion. Any invalid output fails the whole bar closed.

use chrono::Utc;
use market_data::{Bar, ModelPrediction, PredictionWrite, StoreError, TimeSeriesStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::features::{FeatureVector, FEATURE_NAMES};
use crate::indicators::population_std;

/// Output of one scoring function
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelOutput {
    pub value: f64,
    pub valid: bool,
}

impl ModelOutput {
    pub fn valid(value: f64) -> Self {
        Self { value, valid: true }
    }

    pub fn invalid() -> Self {
        Self {
            value: f64::NAN,
            valid: false,
        }
    }

    fn usable(&self) -> bool {
        self.valid && self.value.is_finite()
    }
}

/// Capability interface for a directional scoring model
pub trait ModelScorer: Send + Sync {
    fn name(&self) -> &str;

    /// Directional score; positive is bullish
    fn score(&self, features: &FeatureVector) -> ModelOutput;
}

/// Linear head exported from offline training: `tanh(bias + Σ wᵢ·xᵢ)`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearHead {
    #[serde(default)]
    pub bias: f64,
    /// Weight per feature name; absent features weigh zero
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

pub struct LinearScorer {
    name: String,
    bias: f64,
    weights: [f64; 12],
}

impl LinearScorer {
    pub fn from_head(name: impl Into<String>, head: &LinearHead) -> Result<Self, EnsembleError> {
        let name = name.into();
        let mut weights = [0.0; 12];
        for (feature, weight) in &head.weights {
            let index = FEATURE_NAMES
                .iter()
                .position(|n| n == feature)
                .ok_or_else(|| EnsembleError::UnknownFeature {
                    model: name.clone(),
                    feature: feature.clone(),
                })?;
            weights[index] = *weight;
        }
        Ok(Self {
            name,
            bias: head.bias,
            weights,
        })
    }

    /// Trend-following head
    pub fn default_lstm() -> LinearHead {
        head(0.0, &[
            ("rsi_centered", 0.8),
            ("macd_hist_rel", 40.0),
            ("price_change_1h", 5.0),
            ("price_change_24h", 2.0),
        ])
    }

    /// Band-position head
    pub fn default_cnn() -> LinearHead {
        head(0.0, &[
            ("bb_position", 1.2),
            ("macd_line_rel", 30.0),
            ("volume_change_1h", 0.05),
        ])
    }

    /// Volatility-damped momentum head
    pub fn default_dnn() -> LinearHead {
        head(0.0, &[
            ("rsi_centered", 0.5),
            ("macd_signal_rel", 20.0),
            ("price_change_24h", 3.0),
            ("atr_rel", -5.0),
            ("volatility_24h", -10.0),
        ])
    }
}

fn head(bias: f64, weights: &[(&str, f64)]) -> LinearHead {
    LinearHead {
        bias,
        weights: weights.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
    }
}

impl ModelScorer for LinearScorer {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, features: &FeatureVector) -> ModelOutput {
        let z = self.bias
            + features
                .values()
                .iter()
                .zip(self.weights.iter())
                .map(|(x, w)| x * w)
                .sum::<f64>();
        let value = z.tanh();
        if value.is_finite() {
            ModelOutput::valid(value)
        } else {
            ModelOutput::invalid()
        }
    }
}

/// Fusion weights of the three model slots
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    #[serde(default = "default_model_weight")]
    pub lstm: f64,
    #[serde(default = "default_model_weight")]
    pub cnn: f64,
    #[serde(default = "default_model_weight")]
    pub dnn: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            lstm: default_model_weight(),
            cnn: default_model_weight(),
            dnn: default_model_weight(),
        }
    }
}

fn default_model_weight() -> f64 {
    1.0 / 3.0
}

/// Heads for the three model slots; `None` uses the built-in head
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelHeads {
    pub lstm: Option<LinearHead>,
    pub cnn: Option<LinearHead>,
    pub dnn: Option<LinearHead>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default)]
    pub weights: EnsembleWeights,
    /// Output σ at which confidence reaches zero
    #[serde(default = "default_dispersion_scale")]
    pub dispersion_scale: f64,
    #[serde(default)]
    pub models: ModelHeads,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            weights: EnsembleWeights::default(),
            dispersion_scale: default_dispersion_scale(),
            models: ModelHeads::default(),
        }
    }
}

fn default_dispersion_scale() -> f64 {
    0.5
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), EnsembleError> {
        let w = &self.weights;
        for (slot, weight) in [("lstm", w.lstm), ("cnn", w.cnn), ("dnn", w.dnn)] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(EnsembleError::InvalidConfig(format!(
                    "weight for {} must be finite and non-negative, got {}",
                    slot, weight
                )));
            }
        }
        if w.lstm + w.cnn + w.dnn <= 0.0 {
            return Err(EnsembleError::InvalidConfig(
                "ensemble weights must not all be zero".to_string(),
            ));
        }
        if !self.dispersion_scale.is_finite() || self.dispersion_scale <= 0.0 {
            return Err(EnsembleError::InvalidConfig(format!(
                "dispersion_scale must be positive, got {}",
                self.dispersion_scale
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    #[error("Model {model} returned an invalid output for {stream}")]
    InvalidOutput { model: String, stream: String },

    #[error("Bar {stream} at {open_time} has no complete feature vector")]
    NotAnalyzed {
        stream: String,
        open_time: chrono::DateTime<Utc>,
    },

    #[error("Model {model} references unknown feature {feature}")]
    UnknownFeature { model: String, feature: String },

    #[error("Invalid ensemble config: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Fused values for one feature vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fused {
    pub lstm: f64,
    pub cnn: f64,
    pub dnn: f64,
    pub ensemble: f64,
    pub confidence: f64,
}

pub struct EnsembleScorer {
    config: EnsembleConfig,
    lstm: Box<dyn ModelScorer>,
    cnn: Box<dyn ModelScorer>,
    dnn: Box<dyn ModelScorer>,
}

impl EnsembleScorer {
    /// Build with linear heads from config, falling back to the built-in heads
    pub fn new(config: EnsembleConfig) -> Result<Self, EnsembleError> {
        let heads = config.models.clone();
        let lstm = LinearScorer::from_head(
            "lstm",
            &heads.lstm.unwrap_or_else(LinearScorer::default_lstm),
        )?;
        let cnn = LinearScorer::from_head("cnn", &heads.cnn.unwrap_or_else(LinearScorer::default_cnn))?;
        let dnn = LinearScorer::from_head("dnn", &heads.dnn.unwrap_or_else(LinearScorer::default_dnn))?;
        Self::with_scorers(config, Box::new(lstm), Box::new(cnn), Box::new(dnn))
    }

    pub fn with_scorers(
        config: EnsembleConfig,
        lstm: Box<dyn ModelScorer>,
        cnn: Box<dyn ModelScorer>,
        dnn: Box<dyn ModelScorer>,
    ) -> Result<Self, EnsembleError> {
        config.validate()?;
        Ok(Self {
            config,
            lstm,
            cnn,
            dnn,
        })
    }

    /// Weighted mean and dispersion-based confidence of three outputs
    pub fn fuse(&self, lstm: f64, cnn: f64, dnn: f64) -> Fused {
        let w = &self.config.weights;
        let ensemble =
            (w.lstm * lstm + w.cnn * cnn + w.dnn * dnn) / (w.lstm + w.cnn + w.dnn);
        let sigma = population_std(&[lstm, cnn, dnn]).unwrap_or(0.0);
        let confidence = (1.0 - sigma / self.config.dispersion_scale).clamp(0.0, 1.0);
        Fused {
            lstm,
            cnn,
            dnn,
            ensemble,
            confidence,
        }
    }

    pub fn score_features(&self, features: &FeatureVector, stream: &str) -> Result<Fused, EnsembleError> {
        let mut outputs = [0.0; 3];
        for (slot, scorer) in [&self.lstm, &self.cnn, &self.dnn].into_iter().enumerate() {
            let output = scorer.score(features);
            if !output.usable() {
                return Err(EnsembleError::InvalidOutput {
                    model: scorer.name().to_string(),
                    stream: stream.to_string(),
                });
            }
            outputs[slot] = output.value;
        }
        Ok(self.fuse(outputs[0], outputs[1], outputs[2]))
    }

    /// Score an analyzed bar into an unsaved prediction
    pub fn predict(&self, bar: &Bar) -> Result<ModelPrediction, EnsembleError> {
        let features = FeatureVector::from_bar(bar)
            .filter(|_| bar.analyzed)
            .ok_or_else(|| EnsembleError::NotAnalyzed {
                stream: bar.label(),
                open_time: bar.open_time,
            })?;
        let fused = self.score_features(&features, &bar.label())?;

        Ok(ModelPrediction {
            id: Uuid::new_v4(),
            market_data_id: bar.id,
            timeframe_id: bar.timeframe_id,
            lstm_pred: fused.lstm,
            cnn_pred: fused.cnn,
            dnn_pred: fused.dnn,
            ensemble_pred: fused.ensemble,
            confidence: fused.confidence,
            prediction_time: bar.close_time,
            created_at: Utc::now(),
        })
    }

    /// Score and persist. On a scoring failure nothing is written and the
    /// bar stays not usable by model.
    pub async fn commit(
        &self,
        store: &dyn TimeSeriesStore,
        bar: &Bar,
    ) -> Result<(ModelPrediction, PredictionWrite), EnsembleError> {
        let prediction = match self.predict(bar) {
            Ok(p) => p,
            Err(e) => {
                warn!("Scoring failed closed for {} at {}: {}", bar.label(), bar.open_time, e);
                return Err(e);
            }
        };

        let write = store.put_prediction(&prediction).await?;
        store.set_usable_by_model(bar.id, true).await?;
        debug!(
            "Prediction for {} at {}: ensemble={:.4} confidence={:.3} ({:?})",
            bar.label(),
            bar.open_time,
            prediction.ensemble_pred,
            prediction.confidence,
            write
        );
        Ok((prediction, write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use market_data::{ContractType, InMemoryStore, IndicatorSet, InstrumentKey, Interval, Timeframe};
    use rust_decimal::Decimal;

    struct Fixed(&'static str, ModelOutput);

    impl ModelScorer for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn score(&self, _features: &FeatureVector) -> ModelOutput {
            self.1
        }
    }

    fn fixed(lstm: f64, cnn: f64, dnn: ModelOutput) -> EnsembleScorer {
        EnsembleScorer::with_scorers(
            EnsembleConfig::default(),
            Box::new(Fixed("lstm", ModelOutput::valid(lstm))),
            Box::new(Fixed("cnn", ModelOutput::valid(cnn))),
            Box::new(Fixed("dnn", dnn)),
        )
        .unwrap()
    }

    fn analyzed_bar() -> Bar {
        let tf = Timeframe::new(
            &InstrumentKey::new("BTCUSDT", ContractType::Perpetual),
            Interval::HOUR_1,
            0.6,
        );
        let mut bar = Bar::new(
            &tf,
            Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap(),
            Decimal::from(100),
            Decimal::from(106),
            Decimal::from(99),
            Decimal::from(105),
            Decimal::from(10),
            5,
        );
        bar.indicators = IndicatorSet {
            rsi_14: Some(60.0),
            macd_line: Some(0.5),
            macd_signal: Some(0.3),
            macd_histogram: Some(0.2),
            bb_upper: Some(108.0),
            bb_middle: Some(102.0),
            bb_lower: Some(96.0),
            atr_14: Some(2.0),
            volatility_1h: Some(0.004),
            volatility_24h: Some(0.01),
            price_change_1h: Some(0.8),
            price_change_24h: Some(2.1),
            volume_change_1h: Some(12.0),
            volume_change_24h: Some(-5.0),
            ..IndicatorSet::default()
        };
        bar.analyzed = true;
        bar
    }

    #[test]
    fn test_equal_weights_give_mean_and_high_confidence() {
        let scorer = fixed(0.8, 0.6, ModelOutput::valid(0.7));
        let fused = scorer.fuse(0.8, 0.6, 0.7);
        assert!((fused.ensemble - 0.7).abs() < 1e-12);
        assert!((fused.confidence - 0.8367).abs() < 1e-3);
        assert!(fused.confidence > 0.6);
    }

    #[test]
    fn test_disagreeing_models_lower_confidence() {
        let scorer = fixed(0.9, -0.9, ModelOutput::valid(0.0));
        let fused = scorer.fuse(0.9, -0.9, 0.0);
        assert!(fused.ensemble.abs() < 1e-12);
        assert_eq!(fused.confidence, 0.0);
    }

    #[test]
    fn test_custom_weights_shift_ensemble() {
        let config = EnsembleConfig {
            weights: EnsembleWeights {
                lstm: 2.0,
                cnn: 1.0,
                dnn: 1.0,
            },
            ..EnsembleConfig::default()
        };
        let scorer = EnsembleScorer::new(config).unwrap();
        let fused = scorer.fuse(1.0, 0.0, 0.0);
        assert!((fused.ensemble - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_predict_uses_bar_close_time() {
        let bar = analyzed_bar();
        let prediction = fixed(0.8, 0.6, ModelOutput::valid(0.7)).predict(&bar).unwrap();
        assert_eq!(prediction.market_data_id, bar.id);
        assert_eq!(prediction.timeframe_id, bar.timeframe_id);
        assert_eq!(prediction.prediction_time, bar.close_time);
    }

    #[test]
    fn test_builtin_heads_are_bounded_and_deterministic() {
        let scorer = EnsembleScorer::new(EnsembleConfig::default()).unwrap();
        let bar = analyzed_bar();
        let a = scorer.predict(&bar).unwrap();
        let b = scorer.predict(&bar).unwrap();
        assert!(a.same_outputs(&b));
        for value in [a.lstm_pred, a.cnn_pred, a.dnn_pred, a.ensemble_pred] {
            assert!((-1.0..=1.0).contains(&value));
        }
        assert!((0.0..=1.0).contains(&a.confidence));
    }

    #[test]
    fn test_unknown_feature_is_rejected() {
        let mut config = EnsembleConfig::default();
        config.models.cnn = Some(head(0.1, &[("funding_skew", 1.0)]));
        let err = EnsembleScorer::new(config).err().unwrap();
        assert!(matches!(err, EnsembleError::UnknownFeature { .. }));
    }

    #[test]
    fn test_unanalyzed_bar_is_not_scored() {
        let mut bar = analyzed_bar();
        bar.analyzed = false;
        let err = fixed(0.1, 0.1, ModelOutput::valid(0.1)).predict(&bar).unwrap_err();
        assert!(matches!(err, EnsembleError::NotAnalyzed { .. }));
    }

    #[tokio::test]
    async fn test_commit_marks_bar_usable() {
        let store = InMemoryStore::new();
        let bar = analyzed_bar();
        store.insert_bar(&bar).await.unwrap();

        let scorer = fixed(0.8, 0.6, ModelOutput::valid(0.7));
        let (_, write) = scorer.commit(&store, &bar).await.unwrap();
        assert_eq!(write, PredictionWrite::Inserted);
        assert!(store.bar(bar.id).await.unwrap().unwrap().usable_by_model);

        let (_, again) = scorer.commit(&store, &bar).await.unwrap();
        assert_eq!(again, PredictionWrite::Unchanged);
        assert_eq!(store.prediction_count().await, 1);
    }

    #[tokio::test]
    async fn test_non_finite_output_fails_closed() {
        let store = InMemoryStore::new();
        let bar = analyzed_bar();
        store.insert_bar(&bar).await.unwrap();

        for bad in [ModelOutput::invalid(), ModelOutput::valid(f64::INFINITY)] {
            let scorer = fixed(0.8, 0.6, bad);
            let err = scorer.commit(&store, &bar).await.unwrap_err();
            assert!(matches!(err, EnsembleError::InvalidOutput { ref model, .. } if model == "dnn"));
        }
        assert_eq!(store.prediction_count().await, 0);
        assert!(!store.bar(bar.id).await.unwrap().unwrap().usable_by_model);
    }
}
