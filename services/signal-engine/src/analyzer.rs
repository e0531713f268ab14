//! Indicator engine - turns a bar plus its prior bars into an indicator set

use chrono::{DateTime, Duration, Utc};
use market_data::{
    Bar, IndicatorSet, MarketDataError, MarketRegime, StoreError, TimeSeriesStore, TrendDirection,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::indicators;
use crate::patterns::{self, Candle};

/// Relative MA gap treated as no trend
const TREND_FLAT_BAND: f64 = 0.001;
/// Candles handed to the pattern detector
const PATTERN_WINDOW: usize = 30;

/// Indicator periods and the history window fetched per bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
    #[serde(default = "default_bb_period")]
    pub bb_period: usize,
    #[serde(default = "default_bb_width")]
    pub bb_width: f64,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_adx_period")]
    pub adx_period: usize,
    /// Long moving-average period for trend direction; the short one is a quarter of it
    #[serde(default = "default_trend_period")]
    pub trend_period: usize,
    /// Bars on each side of a swing point for support/resistance
    #[serde(default = "default_sr_window")]
    pub sr_window: usize,
    /// Relative distance under which swing levels merge
    #[serde(default = "default_sr_tolerance")]
    pub sr_tolerance: f64,
    /// 24h return volatility above which the regime is high-volatility
    #[serde(default = "default_regime_high_volatility")]
    pub regime_high_volatility: f64,
    /// 24h return volatility below which the regime is low-volatility
    #[serde(default = "default_regime_low_volatility")]
    pub regime_low_volatility: f64,
    /// ADX above which a directional market counts as trending
    #[serde(default = "default_trend_adx_threshold")]
    pub trend_adx_threshold: f64,
    /// Maximum number of prior bars read per computation
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
            bb_period: default_bb_period(),
            bb_width: default_bb_width(),
            atr_period: default_atr_period(),
            adx_period: default_adx_period(),
            trend_period: default_trend_period(),
            sr_window: default_sr_window(),
            sr_tolerance: default_sr_tolerance(),
            regime_high_volatility: default_regime_high_volatility(),
            regime_low_volatility: default_regime_low_volatility(),
            trend_adx_threshold: default_trend_adx_threshold(),
            history_window: default_history_window(),
        }
    }
}

fn default_rsi_period() -> usize { 14 }
fn default_macd_fast() -> usize { 12 }
fn default_macd_slow() -> usize { 26 }
fn default_macd_signal() -> usize { 9 }
fn default_bb_period() -> usize { 20 }
fn default_bb_width() -> f64 { 2.0 }
fn default_atr_period() -> usize { 14 }
fn default_adx_period() -> usize { 14 }
fn default_trend_period() -> usize { 20 }
fn default_sr_window() -> usize { 20 }
fn default_sr_tolerance() -> f64 { 0.02 }
fn default_regime_high_volatility() -> f64 { 0.02 }
fn default_regime_low_volatility() -> f64 { 0.01 }
fn default_trend_adx_threshold() -> f64 { 25.0 }
fn default_history_window() -> usize { 250 }

impl IndicatorConfig {
    /// Volatility extremes win over trend; a trend needs ADX above the
    /// threshold and a non-flat direction
    pub fn classify_regime(
        &self,
        adx: f64,
        volatility_24h: f64,
        direction: TrendDirection,
    ) -> MarketRegime {
        if volatility_24h > self.regime_high_volatility {
            MarketRegime::HighVolatility
        } else if volatility_24h < self.regime_low_volatility {
            MarketRegime::LowVolatility
        } else if adx > self.trend_adx_threshold && direction == TrendDirection::Up {
            MarketRegime::TrendingUp
        } else if adx > self.trend_adx_threshold && direction == TrendDirection::Down {
            MarketRegime::TrendingDown
        } else {
            MarketRegime::Ranging
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndicatorError {
    #[error(transparent)]
    Validation(#[from] MarketDataError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Price not representable as f64 in {stream} at {open_time}")]
    NonNumeric {
        stream: String,
        open_time: DateTime<Utc>,
    },
}

/// Result of analyzing one stored bar
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzeOutcome {
    /// All required indicators computed; the bar is now `analyzed`
    Analyzed(IndicatorSet),
    /// Bar was already analyzed; nothing written
    AlreadyAnalyzed(IndicatorSet),
    /// Some indicators lack history; partial fields saved, bar not analyzed
    InsufficientHistory {
        missing: Vec<&'static str>,
        history: usize,
    },
}

pub struct IndicatorEngine {
    config: IndicatorConfig,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }

    /// Compute indicators for `bar` from `history`.
    ///
    /// Only bars of the same timeframe opening strictly before `bar` are
    /// used, whatever else `history` contains. The result depends only on
    /// those bars, so recomputation is bit-identical.
    pub fn compute(&self, bar: &Bar, history: &[Bar]) -> Result<IndicatorSet, IndicatorError> {
        let mut prior: Vec<&Bar> = history
            .iter()
            .filter(|h| h.timeframe_id == bar.timeframe_id && h.open_time < bar.open_time)
            .collect();
        prior.sort_by_key(|h| h.open_time);
        prior.dedup_by_key(|h| h.open_time);
        if prior.len() > self.config.history_window {
            let excess = prior.len() - self.config.history_window;
            prior.drain(..excess);
        }
        prior.push(bar);

        let to_f64 = |value: Decimal| {
            value.to_f64().ok_or_else(|| IndicatorError::NonNumeric {
                stream: bar.label(),
                open_time: bar.open_time,
            })
        };
        let mut opens = Vec::with_capacity(prior.len());
        let mut closes = Vec::with_capacity(prior.len());
        let mut highs = Vec::with_capacity(prior.len());
        let mut lows = Vec::with_capacity(prior.len());
        let mut volumes = Vec::with_capacity(prior.len());
        for b in &prior {
            opens.push(to_f64(b.open)?);
            closes.push(to_f64(b.close)?);
            highs.push(to_f64(b.high)?);
            lows.push(to_f64(b.low)?);
            volumes.push(to_f64(b.volume)?);
        }

        let cfg = &self.config;
        let bars_1h = bar.interval.bars_in(Duration::hours(1));
        let bars_24h = bar.interval.bars_in(Duration::hours(24));

        let mut set = IndicatorSet {
            rsi_14: indicators::rsi(&closes, cfg.rsi_period),
            atr_14: indicators::atr(&highs, &lows, &closes, cfg.atr_period),
            volatility_1h: indicators::return_volatility(&closes, bars_1h.max(2)),
            volatility_24h: indicators::return_volatility(&closes, bars_24h.max(2)),
            price_change_1h: indicators::percent_change(&closes, bars_1h),
            price_change_24h: indicators::percent_change(&closes, bars_24h),
            volume_change_1h: indicators::percent_change(&volumes, bars_1h),
            volume_change_24h: indicators::percent_change(&volumes, bars_24h),
            ..IndicatorSet::default()
        };

        if let Some(m) = indicators::macd(&closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal) {
            set.macd_line = Some(m.line);
            set.macd_signal = Some(m.signal);
            set.macd_histogram = Some(m.histogram);
        }
        if let Some(bands) = indicators::bollinger(&closes, cfg.bb_period, cfg.bb_width) {
            set.bb_upper = Some(bands.upper);
            set.bb_middle = Some(bands.middle);
            set.bb_lower = Some(bands.lower);
        }
        if let Some(taker_buy) = bar.taker_buy_volume {
            set.depth_imbalance =
                indicators::order_flow_imbalance(to_f64(taker_buy)?, to_f64(bar.volume)?);
        }

        self.market_structure(&mut set, &opens, &highs, &lows, &closes);
        Ok(set)
    }

    /// Directional movement, trend, regime, levels and patterns
    fn market_structure(
        &self,
        set: &mut IndicatorSet,
        opens: &[f64],
        highs: &[f64],
        lows: &[f64],
        closes: &[f64],
    ) {
        let cfg = &self.config;
        let directional = indicators::adx(highs, lows, closes, cfg.adx_period);
        if let Some(d) = &directional {
            set.adx_14 = Some(d.adx);
            set.dmi_plus = Some(d.plus_di);
            set.dmi_minus = Some(d.minus_di);
            set.trend_strength = Some(indicators::trend_strength(d));
        }

        set.trend_direction = indicators::ma_spread(closes, cfg.trend_period).map(|spread| {
            if spread.abs() < TREND_FLAT_BAND {
                TrendDirection::Flat
            } else if spread > 0.0 {
                TrendDirection::Up
            } else {
                TrendDirection::Down
            }
        });

        if let (Some(d), Some(volatility), Some(direction)) =
            (&directional, set.volatility_24h, set.trend_direction)
        {
            set.market_regime = Some(cfg.classify_regime(d.adx, volatility, direction));
        }

        let (supports, resistances) =
            indicators::support_resistance(highs, lows, cfg.sr_window, cfg.sr_tolerance);
        if let Some(&close) = closes.last() {
            set.nearest_support = supports.iter().copied().filter(|l| *l < close).reduce(f64::max);
            set.nearest_resistance =
                resistances.iter().copied().filter(|l| *l > close).reduce(f64::min);
        }
        set.support_levels = supports;
        set.resistance_levels = resistances;

        let start = closes.len().saturating_sub(PATTERN_WINDOW);
        let candles: Vec<Candle> = (start..closes.len())
            .map(|i| Candle {
                open: opens[i],
                high: highs[i],
                low: lows[i],
                close: closes[i],
            })
            .collect();
        set.patterns = patterns::detect(&candles);
    }

    /// Analyze a stored bar: validate, read prior bars, compute, persist.
    ///
    /// A bar failing validation is rejected before anything is read or written.
    pub async fn analyze(
        &self,
        store: &dyn TimeSeriesStore,
        bar: &Bar,
    ) -> Result<AnalyzeOutcome, IndicatorError> {
        bar.validate()?;

        let history = store
            .bars_before(bar.timeframe_id, bar.open_time, self.config.history_window)
            .await?;
        let set = self.compute(bar, &history)?;

        if bar.analyzed {
            if set != bar.indicators {
                warn!(
                    "Recomputed indicators differ for analyzed bar {} at {}; keeping stored values",
                    bar.label(),
                    bar.open_time
                );
            }
            return Ok(AnalyzeOutcome::AlreadyAnalyzed(bar.indicators.clone()));
        }

        let missing = set.missing_required();
        if missing.is_empty() {
            store.save_indicators(bar.id, &set, true).await?;
            debug!("Analyzed {} at {}", bar.label(), bar.open_time);
            Ok(AnalyzeOutcome::Analyzed(set))
        } else {
            store.save_indicators(bar.id, &set, false).await?;
            debug!(
                "Insufficient history for {} at {}: {} prior bars, missing {:?}",
                bar.label(),
                bar.open_time,
                history.len(),
                missing
            );
            Ok(AnalyzeOutcome::InsufficientHistory {
                missing,
                history: history.len(),
            })
        }
    }

    /// Sweep a timeframe's unanalyzed bars in open_time order.
    /// Returns how many bars became analyzed.
    pub async fn analyze_pending(
        &self,
        store: &dyn TimeSeriesStore,
        timeframe_id: Uuid,
        limit: usize,
    ) -> Result<usize, IndicatorError> {
        let pending = store.unanalyzed_bars(timeframe_id, limit).await?;
        let mut analyzed = 0;
        for bar in &pending {
            match self.analyze(store, bar).await {
                Ok(AnalyzeOutcome::Analyzed(_)) => analyzed += 1,
                Ok(_) => {}
                Err(IndicatorError::Validation(e)) => {
                    warn!("Skipping invalid stored bar: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        if analyzed > 0 {
            info!("Analyzed {} of {} pending bars", analyzed, pending.len());
        }
        Ok(analyzed)
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new(IndicatorConfig::default())
    }
}
