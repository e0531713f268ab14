//! Pipeline configuration
//!
//! Loaded once at start-up from a YAML file with `TRADER__` environment
//! overrides, then passed to each component as an immutable snapshot.

use market_data::{ContractType, InstrumentKey, Interval};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_engine::{EnsembleConfig, IndicatorConfig, SignalConfig};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Full configuration snapshot
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Postgres URL; the in-memory store is used when absent
    #[serde(default)]
    pub database_url: Option<String>,
}

impl PipelineConfig {
    /// Load from `TRADER_CONFIG` (or the default path) after reading `.env`
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let path = std::env::var("TRADER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load a YAML file, applying `TRADER__SECTION__KEY` environment overrides
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        use config::{Config, Environment, File, FileFormat};

        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml).required(true))
            .add_source(
                Environment::with_prefix("TRADER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: PipelineConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;

        info!(
            "Loaded configuration from {}: {} pairs, lookback {} days",
            path.display(),
            config.data.pairs.len(),
            config.data.lookback_days
        );
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.pairs.is_empty() {
            return Err(invalid("at least one pair must be configured"));
        }
        if self.data.lookback_days == 0 {
            return Err(invalid("lookback_days must be at least 1"));
        }

        let mut seen = HashSet::new();
        for pair in &self.data.pairs {
            let instrument = pair.instrument();
            if !seen.insert(instrument.clone()) {
                return Err(invalid(format!("pair {} configured twice", instrument)));
            }
            pair.validate()?;
        }

        self.risk.validate()?;
        self.fees.validate()?;
        self.ensemble
            .validate()
            .map_err(|e| invalid(e.to_string()))?;

        let s = &self.signal;
        for (name, value) in [
            ("neutral_band", s.neutral_band),
            ("strong_confidence_threshold", s.strong_confidence_threshold),
            ("min_confidence", s.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("signal.{} must be in [0, 1], got {}", name, value)));
            }
        }
        if s.freshness_intervals == 0 {
            return Err(invalid("signal.freshness_intervals must be at least 1"));
        }

        let i = &self.indicators;
        if i.regime_low_volatility > i.regime_high_volatility {
            return Err(invalid(
                "indicators.regime_low_volatility must not exceed regime_high_volatility",
            ));
        }
        if !(0.0..1.0).contains(&i.sr_tolerance) {
            return Err(invalid(format!(
                "indicators.sr_tolerance must be in [0, 1), got {}",
                i.sr_tolerance
            )));
        }

        let r = &self.runtime;
        if r.max_concurrent_streams == 0 || r.fetch_permits == 0 || r.reorder_capacity == 0 {
            return Err(invalid(
                "runtime.max_concurrent_streams, fetch_permits and reorder_capacity must be at least 1",
            ));
        }
        if r.base_backoff_ms > r.max_backoff_ms {
            return Err(invalid("runtime.base_backoff_ms must not exceed max_backoff_ms"));
        }
        Ok(())
    }
}

/// Instruments and history
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    /// Historical backfill horizon
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            pairs: Vec::new(),
        }
    }
}

fn default_lookback_days() -> u32 { 30 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PairConfig {
    pub symbol: String,
    #[serde(default = "default_contract_type")]
    pub contract_type: ContractType,
    pub timeframes: Vec<TimeframeConfig>,
}

fn default_contract_type() -> ContractType {
    ContractType::Perpetual
}

impl PairConfig {
    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.symbol.clone(), self.contract_type)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(invalid("pair symbol must not be empty"));
        }
        let mut intervals = HashSet::new();
        for tf in &self.timeframes {
            if !intervals.insert(tf.interval) {
                return Err(invalid(format!(
                    "{}: interval {} configured twice",
                    self.instrument(),
                    tf.interval
                )));
            }
            if !(tf.weight > 0.0 && tf.weight <= 1.0) {
                return Err(invalid(format!(
                    "{}/{}: weight must be in (0, 1], got {}",
                    self.instrument(),
                    tf.interval,
                    tf.weight
                )));
            }
        }
        let enabled = self.timeframes.iter().filter(|tf| tf.enabled).count();
        if enabled < 2 {
            return Err(invalid(format!(
                "{}: needs a tactical and a strategic timeframe, {} enabled",
                self.instrument(),
                enabled
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct TimeframeConfig {
    pub interval: Interval,
    /// Relative fusion weight, 0 < weight <= 1
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> f64 { 1.0 }
fn default_enabled() -> bool { true }

/// What the risk controller does when a position would breach the exposure limit
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExposureBreach {
    #[default]
    Veto,
    /// Shrink the position to fit the remaining limit
    Downsize,
}

/// Risk limits and position sizing
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RiskConfig {
    #[serde(default = "default_starting_equity")]
    pub starting_equity: Decimal,
    /// Peak-to-current equity decline that blocks new entries, in percent
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    /// Gross open notional limit as a percent of equity
    #[serde(default = "default_max_exposure_pct")]
    pub max_exposure_pct: Decimal,
    /// Fraction of equity risked between entry and stop
    #[serde(default = "default_sizing_fraction")]
    pub sizing_fraction: Decimal,
    #[serde(default = "default_stop_atr_multiple")]
    pub stop_atr_multiple: Decimal,
    /// Stop distance as a percent of entry when ATR is unavailable
    #[serde(default = "default_fallback_stop_pct")]
    pub fallback_stop_pct: Decimal,
    /// Take-profit distance in multiples of the stop distance
    #[serde(default = "default_reward_ratio")]
    pub reward_ratio: Decimal,
    #[serde(default)]
    pub trailing_stop: bool,
    #[serde(default)]
    pub exposure_breach: ExposureBreach,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            starting_equity: default_starting_equity(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_exposure_pct: default_max_exposure_pct(),
            sizing_fraction: default_sizing_fraction(),
            stop_atr_multiple: default_stop_atr_multiple(),
            fallback_stop_pct: default_fallback_stop_pct(),
            reward_ratio: default_reward_ratio(),
            trailing_stop: false,
            exposure_breach: ExposureBreach::default(),
        }
    }
}

impl RiskConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("starting_equity", self.starting_equity),
            ("max_drawdown_pct", self.max_drawdown_pct),
            ("max_exposure_pct", self.max_exposure_pct),
            ("sizing_fraction", self.sizing_fraction),
            ("stop_atr_multiple", self.stop_atr_multiple),
            ("fallback_stop_pct", self.fallback_stop_pct),
            ("reward_ratio", self.reward_ratio),
        ];
        for (name, value) in positive {
            if value <= Decimal::ZERO {
                return Err(invalid(format!("risk.{} must be positive, got {}", name, value)));
            }
        }
        if self.max_drawdown_pct > Decimal::ONE_HUNDRED {
            return Err(invalid("risk.max_drawdown_pct must not exceed 100"));
        }
        if self.sizing_fraction > Decimal::ONE {
            return Err(invalid("risk.sizing_fraction must not exceed 1"));
        }
        if self.fallback_stop_pct >= Decimal::ONE_HUNDRED {
            return Err(invalid("risk.fallback_stop_pct must be below 100"));
        }
        Ok(())
    }
}

fn default_starting_equity() -> Decimal { Decimal::from(10_000) }
fn default_max_drawdown_pct() -> Decimal { Decimal::from(10) }
fn default_max_exposure_pct() -> Decimal { Decimal::from(50) }
fn default_sizing_fraction() -> Decimal { Decimal::new(1, 2) }
fn default_stop_atr_multiple() -> Decimal { Decimal::from(2) }
fn default_fallback_stop_pct() -> Decimal { Decimal::from(2) }
fn default_reward_ratio() -> Decimal { Decimal::from(2) }

/// Fee and slippage model applied at entry and exit
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct FeeConfig {
    /// Taker fee per side, in basis points of notional
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: Decimal,
    /// Adverse fill adjustment, in basis points of price
    #[serde(default)]
    pub slippage_bps: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            taker_fee_bps: default_taker_fee_bps(),
            slippage_bps: Decimal::ZERO,
        }
    }
}

impl FeeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.taker_fee_bps < Decimal::ZERO || self.slippage_bps < Decimal::ZERO {
            return Err(invalid("fees must not be negative"));
        }
        Ok(())
    }
}

fn default_taker_fee_bps() -> Decimal { Decimal::from(4) }

/// Task pool sizes, source retries and polling
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_fetch_permits")]
    pub fetch_permits: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_reorder_capacity")]
    pub reorder_capacity: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            fetch_permits: default_fetch_permits(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            reorder_capacity: default_reorder_capacity(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn retry_policy(&self) -> market_data::RetryPolicy {
        market_data::RetryPolicy {
            max_retries: self.max_retries,
            base_delay: std::time::Duration::from_millis(self.base_backoff_ms),
            max_delay: std::time::Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn default_max_concurrent_streams() -> usize { 8 }
fn default_fetch_permits() -> usize { 4 }
fn default_max_retries() -> u32 { 5 }
fn default_base_backoff_ms() -> u64 { 250 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_reorder_capacity() -> usize { 32 }
fn default_poll_interval_secs() -> u64 { 30 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8088".to_string()
}
