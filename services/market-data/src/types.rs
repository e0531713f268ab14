use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Futures contract type as named by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractType {
    Perpetual,
    CurrentQuarter,
    NextQuarter,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::Perpetual => "PERPETUAL",
            ContractType::CurrentQuarter => "CURRENT_QUARTER",
            ContractType::NextQuarter => "NEXT_QUARTER",
        }
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractType {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PERPETUAL" => Ok(ContractType::Perpetual),
            "CURRENT_QUARTER" => Ok(ContractType::CurrentQuarter),
            "NEXT_QUARTER" => Ok(ContractType::NextQuarter),
            other => Err(MarketDataError::Malformed(format!(
                "unknown contract type: {}",
                other
            ))),
        }
    }
}

/// Bar sampling interval, written the exchange way ("15m", "1h", "1d")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    minutes: u32,
}

impl Interval {
    pub const MINUTES_15: Interval = Interval { minutes: 15 };
    pub const HOUR_1: Interval = Interval { minutes: 60 };

    pub fn from_minutes(minutes: u32) -> Result<Self> {
        if minutes == 0 {
            return Err(MarketDataError::InvalidInterval("0m".to_string()));
        }
        Ok(Self { minutes })
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes as i64)
    }

    /// Number of whole bars of this interval that fit in `window`, never less than one
    pub fn bars_in(&self, window: Duration) -> usize {
        let bars = window.num_minutes() / self.minutes as i64;
        bars.max(1) as usize
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.minutes;
        if m % 10_080 == 0 {
            write!(f, "{}w", m / 10_080)
        } else if m % 1_440 == 0 {
            write!(f, "{}d", m / 1_440)
        } else if m % 60 == 0 {
            write!(f, "{}h", m / 60)
        } else {
            write!(f, "{}m", m)
        }
    }
}

impl FromStr for Interval {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || MarketDataError::InvalidInterval(s.to_string());
        let unit = s.chars().last().ok_or_else(invalid)?;
        let count: u32 = s[..s.len() - unit.len_utf8()].parse().map_err(|_| invalid())?;
        let scale = match unit {
            'm' => 1,
            'h' => 60,
            'd' => 1_440,
            'w' => 10_080,
            _ => return Err(invalid()),
        };
        let minutes = count.checked_mul(scale).ok_or_else(invalid)?;
        Interval::from_minutes(minutes).map_err(|_| invalid())
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A tradable instrument: one symbol on one contract type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub symbol: String,
    pub contract_type: ContractType,
}

impl InstrumentKey {
    pub fn new(symbol: impl Into<String>, contract_type: ContractType) -> Self {
        Self {
            symbol: symbol.into(),
            contract_type,
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.contract_type)
    }
}

/// Configured sampling interval for an instrument, with its fusion weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeframe {
    pub id: Uuid,
    pub symbol: String,
    pub contract_type: ContractType,
    pub interval: Interval,
    /// Relative weight in cross-timeframe fusion, 0 < weight <= 1
    pub weight: f64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Timeframe {
    pub fn new(instrument: &InstrumentKey, interval: Interval, weight: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: instrument.symbol.clone(),
            contract_type: instrument.contract_type,
            interval,
            weight,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.symbol.clone(), self.contract_type)
    }

    /// Log label, e.g. `BTCUSDT/PERPETUAL/15m`
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.symbol, self.contract_type, self.interval)
    }
}

/// Computed technical indicators for one bar. Every field is null until computed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub rsi_14: Option<f64>,
    pub macd_line: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub atr_14: Option<f64>,
    pub volatility_1h: Option<f64>,
    pub volatility_24h: Option<f64>,
    pub price_change_1h: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub volume_change_1h: Option<f64>,
    pub volume_change_24h: Option<f64>,
    /// Order-flow imbalance; only present when the source supplies taker volume
    pub depth_imbalance: Option<f64>,

    // Market structure. Computed alongside the core set but never required
    // for a bar to count as analyzed.
    pub adx_14: Option<f64>,
    pub dmi_plus: Option<f64>,
    pub dmi_minus: Option<f64>,
    /// ADX signed by the dominant directional index, in [-100, 100]
    pub trend_strength: Option<f64>,
    pub trend_direction: Option<TrendDirection>,
    pub market_regime: Option<MarketRegime>,
    /// Clustered swing-low levels, ascending
    #[serde(default)]
    pub support_levels: Vec<f64>,
    /// Clustered swing-high levels, ascending
    #[serde(default)]
    pub resistance_levels: Vec<f64>,
    pub nearest_support: Option<f64>,
    pub nearest_resistance: Option<f64>,
    #[serde(default)]
    pub patterns: Vec<PricePattern>,
}

/// Direction of the short moving average against the long one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Down,
    Flat,
    Up,
}

impl TrendDirection {
    /// Stored as -1, 0 or 1
    pub fn as_i16(&self) -> i16 {
        match self {
            TrendDirection::Down => -1,
            TrendDirection::Flat => 0,
            TrendDirection::Up => 1,
        }
    }

    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            -1 => Ok(TrendDirection::Down),
            0 => Ok(TrendDirection::Flat),
            1 => Ok(TrendDirection::Up),
            other => Err(MarketDataError::Malformed(format!(
                "unknown trend direction: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    HighVolatility,
    LowVolatility,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::TrendingUp => "trending_up",
            MarketRegime::TrendingDown => "trending_down",
            MarketRegime::Ranging => "ranging",
            MarketRegime::HighVolatility => "high_volatility",
            MarketRegime::LowVolatility => "low_volatility",
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketRegime {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trending_up" => Ok(MarketRegime::TrendingUp),
            "trending_down" => Ok(MarketRegime::TrendingDown),
            "ranging" => Ok(MarketRegime::Ranging),
            "high_volatility" => Ok(MarketRegime::HighVolatility),
            "low_volatility" => Ok(MarketRegime::LowVolatility),
            other => Err(MarketDataError::Malformed(format!(
                "unknown market regime: {}",
                other
            ))),
        }
    }
}

/// Candlestick and chart patterns recognised on the bars up to and including the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricePattern {
    BullishEngulfing,
    BearishEngulfing,
    Doji,
    MorningStar,
    EveningStar,
    DoubleTop,
    DoubleBottom,
    HeadAndShoulders,
    InverseHeadAndShoulders,
}

impl PricePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricePattern::BullishEngulfing => "bullish_engulfing",
            PricePattern::BearishEngulfing => "bearish_engulfing",
            PricePattern::Doji => "doji",
            PricePattern::MorningStar => "morning_star",
            PricePattern::EveningStar => "evening_star",
            PricePattern::DoubleTop => "double_top",
            PricePattern::DoubleBottom => "double_bottom",
            PricePattern::HeadAndShoulders => "head_and_shoulders",
            PricePattern::InverseHeadAndShoulders => "inverse_head_and_shoulders",
        }
    }
}

impl fmt::Display for PricePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PricePattern {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bullish_engulfing" => Ok(PricePattern::BullishEngulfing),
            "bearish_engulfing" => Ok(PricePattern::BearishEngulfing),
            "doji" => Ok(PricePattern::Doji),
            "morning_star" => Ok(PricePattern::MorningStar),
            "evening_star" => Ok(PricePattern::EveningStar),
            "double_top" => Ok(PricePattern::DoubleTop),
            "double_bottom" => Ok(PricePattern::DoubleBottom),
            "head_and_shoulders" => Ok(PricePattern::HeadAndShoulders),
            "inverse_head_and_shoulders" => Ok(PricePattern::InverseHeadAndShoulders),
            other => Err(MarketDataError::Malformed(format!(
                "unknown price pattern: {}",
                other
            ))),
        }
    }
}

impl IndicatorSet {
    /// Names of required indicators that are still null
    pub fn missing_required(&self) -> Vec<&'static str> {
        let required = [
            ("rsi_14", self.rsi_14),
            ("macd_line", self.macd_line),
            ("macd_signal", self.macd_signal),
            ("macd_histogram", self.macd_histogram),
            ("bb_upper", self.bb_upper),
            ("bb_middle", self.bb_middle),
            ("bb_lower", self.bb_lower),
            ("atr_14", self.atr_14),
            ("volatility_1h", self.volatility_1h),
            ("volatility_24h", self.volatility_24h),
            ("price_change_1h", self.price_change_1h),
            ("price_change_24h", self.price_change_24h),
            ("volume_change_1h", self.volume_change_1h),
            ("volume_change_24h", self.volume_change_24h),
        ];
        required
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_required().is_empty()
    }
}

/// One OHLCV record for a symbol/contract/timeframe/open time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub id: Uuid,
    pub timeframe_id: Uuid,
    pub symbol: String,
    pub contract_type: ContractType,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trades: i64,
    pub taker_buy_volume: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub open_interest: Option<Decimal>,
    pub indicators: IndicatorSet,
    pub analyzed: bool,
    pub usable_by_model: bool,
}

/// Uniqueness key of a stored bar
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarKey {
    pub open_time: DateTime<Utc>,
    pub timeframe_id: Uuid,
    pub symbol: String,
    pub contract_type: ContractType,
}

impl Bar {
    /// Create a bar for `timeframe`. Close time is one interval after open, minus 1ms.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timeframe: &Timeframe,
        open_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        trades: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timeframe_id: timeframe.id,
            symbol: timeframe.symbol.clone(),
            contract_type: timeframe.contract_type,
            interval: timeframe.interval,
            open_time,
            close_time: open_time + timeframe.interval.duration() - Duration::milliseconds(1),
            open,
            high,
            low,
            close,
            volume,
            trades,
            taker_buy_volume: None,
            funding_rate: None,
            open_interest: None,
            indicators: IndicatorSet::default(),
            analyzed: false,
            usable_by_model: false,
        }
    }

    pub fn with_close_time(mut self, close_time: DateTime<Utc>) -> Self {
        self.close_time = close_time;
        self
    }

    pub fn with_taker_buy_volume(mut self, volume: Decimal) -> Self {
        self.taker_buy_volume = Some(volume);
        self
    }

    pub fn with_funding_rate(mut self, rate: Decimal) -> Self {
        self.funding_rate = Some(rate);
        self
    }

    pub fn with_open_interest(mut self, open_interest: Decimal) -> Self {
        self.open_interest = Some(open_interest);
        self
    }

    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.symbol.clone(), self.contract_type)
    }

    pub fn key(&self) -> BarKey {
        BarKey {
            open_time: self.open_time,
            timeframe_id: self.timeframe_id,
            symbol: self.symbol.clone(),
            contract_type: self.contract_type,
        }
    }

    /// Log label, e.g. `BTCUSDT/PERPETUAL/15m`
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.symbol, self.contract_type, self.interval)
    }

    /// Sanity checks applied before a bar enters the pipeline
    pub fn validate(&self) -> Result<()> {
        let reject = |reason: &str| {
            Err(MarketDataError::InvalidBar {
                stream: self.label(),
                open_time: self.open_time,
                reason: reason.to_string(),
            })
        };

        if self.open_time >= self.close_time {
            return reject("open_time must be before close_time");
        }
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return reject("prices must be positive");
        }
        if self.high < self.low {
            return reject("high below low");
        }
        if self.high < self.open.max(self.close) || self.low > self.open.min(self.close) {
            return reject("open/close outside the high-low range");
        }
        if self.volume < Decimal::ZERO {
            return reject("negative volume");
        }
        if self.trades < 0 {
            return reject("negative trade count");
        }
        if let Some(taker) = self.taker_buy_volume {
            if taker < Decimal::ZERO || taker > self.volume {
                return reject("taker buy volume outside [0, volume]");
            }
        }
        Ok(())
    }
}

/// Data source health/status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub is_healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate: f64,
    pub avg_latency_ms: u64,
}

/// Error types for market data ingestion
#[derive(Debug, thiserror::Error)]
pub enum MarketDataError {
    #[error("Transient source error: {0}")]
    Transient(String),

    #[error("Rate limit exceeded for {source_name}")]
    RateLimited {
        source_name: String,
        retry_after: Option<u64>,
    },

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Invalid bar {stream} at {open_time}: {reason}")]
    InvalidBar {
        stream: String,
        open_time: DateTime<Utc>,
        reason: String,
    },

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("HTTP client setup failed: {0}")]
    ClientSetup(String),
}

impl MarketDataError {
    /// Whether the failure may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            MarketDataError::Transient(_) | MarketDataError::RateLimited { .. } => true,
            MarketDataError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type for market data operations
pub type Result<T> = std::result::Result<T, MarketDataError>;

/// Trait for upstream market data sources
#[async_trait::async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Closed bars for `timeframe` with open_time in `[start, end)`, in open_time order
    async fn fetch_bars(
        &self,
        timeframe: &Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;

    /// Source health without touching the network
    async fn health(&self) -> SourceHealth;

    /// Source name
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn timeframe() -> Timeframe {
        Timeframe::new(
            &InstrumentKey::new("BTCUSDT", ContractType::Perpetual),
            Interval::MINUTES_15,
            0.4,
        )
    }

    fn bar() -> Bar {
        Bar::new(
            &timeframe(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Decimal::from(100),
            Decimal::from(105),
            Decimal::from(99),
            Decimal::from(102),
            Decimal::from(10),
            42,
        )
    }

    #[test]
    fn test_interval_parse_and_display() {
        assert_eq!("15m".parse::<Interval>().unwrap().minutes(), 15);
        assert_eq!("1h".parse::<Interval>().unwrap(), Interval::HOUR_1);
        assert_eq!("4h".parse::<Interval>().unwrap().minutes(), 240);
        assert_eq!("1d".parse::<Interval>().unwrap().to_string(), "1d");
        assert_eq!(Interval::from_minutes(90).unwrap().to_string(), "90m");
        assert!("0m".parse::<Interval>().is_err());
        assert!("15x".parse::<Interval>().is_err());
        assert!("".parse::<Interval>().is_err());
    }

    #[test]
    fn test_interval_bars_in_window() {
        assert_eq!(Interval::MINUTES_15.bars_in(Duration::hours(1)), 4);
        assert_eq!(Interval::MINUTES_15.bars_in(Duration::hours(24)), 96);
        assert_eq!(Interval::HOUR_1.bars_in(Duration::hours(1)), 1);
        assert_eq!(Interval::from_minutes(240).unwrap().bars_in(Duration::hours(1)), 1);
    }

    #[test]
    fn test_contract_type_serde() {
        let json = serde_json::to_string(&ContractType::CurrentQuarter).unwrap();
        assert_eq!(json, "\"CURRENT_QUARTER\"");
        assert_eq!(
            "PERPETUAL".parse::<ContractType>().unwrap(),
            ContractType::Perpetual
        );
    }

    #[test]
    fn test_bar_close_time_follows_interval() {
        let bar = bar();
        assert_eq!(
            bar.close_time - bar.open_time,
            Duration::minutes(15) - Duration::milliseconds(1)
        );
        assert!(bar.validate().is_ok());
    }

    #[test]
    fn test_bar_validation_rejects_inverted_times() {
        let mut bar = bar();
        bar.close_time = bar.open_time;
        let err = bar.validate().unwrap_err();
        assert!(matches!(err, MarketDataError::InvalidBar { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_bar_validation_rejects_bad_prices() {
        let mut bar = bar();
        bar.low = Decimal::ZERO;
        assert!(bar.validate().is_err());

        let mut bar = self::bar();
        bar.high = Decimal::from(101);
        assert!(bar.validate().is_err(), "close above high must be rejected");
    }

    #[test]
    fn test_indicator_set_reports_missing_fields() {
        let mut set = IndicatorSet::default();
        assert_eq!(set.missing_required().len(), 14);
        set.rsi_14 = Some(55.0);
        assert!(!set.missing_required().contains(&"rsi_14"));
        assert!(!set.is_complete());
    }

    #[test]
    fn test_structure_fields_do_not_gate_completeness() {
        let mut set = IndicatorSet::default();
        set.adx_14 = Some(30.0);
        set.market_regime = Some(MarketRegime::TrendingUp);
        set.patterns = vec![PricePattern::Doji];
        assert_eq!(set.missing_required().len(), 14);
    }

    #[test]
    fn test_regime_and_pattern_names() {
        assert_eq!(
            "high_volatility".parse::<MarketRegime>().unwrap(),
            MarketRegime::HighVolatility
        );
        assert_eq!(MarketRegime::TrendingDown.to_string(), "trending_down");
        assert_eq!(
            serde_json::to_string(&PricePattern::InverseHeadAndShoulders).unwrap(),
            "\"inverse_head_and_shoulders\""
        );
        assert_eq!(
            "morning_star".parse::<PricePattern>().unwrap(),
            PricePattern::MorningStar
        );
        assert!("triangle".parse::<PricePattern>().is_err());
        assert_eq!(TrendDirection::from_i16(-1).unwrap(), TrendDirection::Down);
        assert_eq!(TrendDirection::Up.as_i16(), 1);
        assert!(TrendDirection::from_i16(2).is_err());
    }
}
