//! Scale-free model inputs derived from an analyzed bar

use market_data::{Bar, IndicatorSet};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

/// Feature names, in vector order
pub const FEATURE_NAMES: [&str; 12] = [
    "rsi_centered",
    "macd_line_rel",
    "macd_signal_rel",
    "macd_hist_rel",
    "bb_position",
    "atr_rel",
    "volatility_1h",
    "volatility_24h",
    "price_change_1h",
    "price_change_24h",
    "volume_change_1h",
    "volume_change_24h",
];

const VOLUME_CHANGE_CLAMP: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    values: [f64; 12],
}

impl FeatureVector {
    /// Build features from a bar's stored indicators.
    /// Returns `None` unless every required indicator is present, the close is
    /// positive and every feature comes out finite.
    pub fn from_bar(bar: &Bar) -> Option<Self> {
        let close = bar.close.to_f64()?;
        Self::from_indicators(&bar.indicators, close)
    }

    pub fn from_indicators(ind: &IndicatorSet, close: f64) -> Option<Self> {
        if !ind.is_complete() || !close.is_finite() || close <= 0.0 {
            return None;
        }
        let (upper, middle, lower) = (ind.bb_upper?, ind.bb_middle?, ind.bb_lower?);
        let band = upper - lower;
        let bb_position = if band > 0.0 { (close - middle) / band } else { 0.0 };

        let features = Self {
            values: [
                (ind.rsi_14? - 50.0) / 50.0,
                ind.macd_line? / close,
                ind.macd_signal? / close,
                ind.macd_histogram? / close,
                bb_position,
                ind.atr_14? / close,
                ind.volatility_1h?,
                ind.volatility_24h?,
                ind.price_change_1h? / 100.0,
                ind.price_change_24h? / 100.0,
                (ind.volume_change_1h? / 100.0).clamp(-VOLUME_CHANGE_CLAMP, VOLUME_CHANGE_CLAMP),
                (ind.volume_change_24h? / 100.0).clamp(-VOLUME_CHANGE_CLAMP, VOLUME_CHANGE_CLAMP),
            ],
        };
        features.is_finite().then_some(features)
    }

    /// Construct directly from values in `FEATURE_NAMES` order
    pub fn from_values(values: [f64; 12]) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }

    pub fn values(&self) -> &[f64; 12] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        FEATURE_NAMES.iter().copied().zip(self.values.iter().copied())
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}
