//! Postgres adapter for the time-series store

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, FromRow, Pool, Postgres};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{InsertOutcome, PredictionWrite, StoreError, StoreResult, TimeSeriesStore};
use crate::records::{ModelPrediction, PositionRecord};
use crate::types::{
    Bar, ContractType, IndicatorSet, InstrumentKey, Interval, MarketRegime, PricePattern, Timeframe,
    TrendDirection,
};

pub type Db = Pool<Postgres>;

const BAR_SELECT: &str = "SELECT md.id, md.timeframe_id, md.symbol, md.contract_type, \
     tf.interval_minutes, md.open_time, md.close_time, md.open, md.high, md.low, md.close, \
     md.volume, md.trades, md.taker_buy_volume, md.funding_rate, md.open_interest, \
     md.rsi_14, md.macd_line, md.macd_signal, md.macd_histogram, md.bb_upper, md.bb_middle, \
     md.bb_lower, md.atr_14, md.volatility_1h, md.volatility_24h, md.price_change_1h, \
     md.price_change_24h, md.volume_change_1h, md.volume_change_24h, md.depth_imbalance, \
     md.adx_14, md.dmi_plus, md.dmi_minus, md.trend_strength, md.trend_direction, \
     md.market_regime, md.support_levels, md.resistance_levels, md.nearest_support, \
     md.nearest_resistance, md.patterns, md.analyzed, md.usable_by_model \
     FROM market_data md JOIN timeframes tf ON tf.id = md.timeframe_id";

const POSITION_SELECT: &str = "SELECT id, market_data_id, symbol, contract_type, side, size, \
     entry_price, entry_time, take_profit, stop_loss, exit_price, exit_time, fees, pnl, status \
     FROM positions";

/// Store backed by a sqlx Postgres pool
pub struct PgStore {
    db: Db,
}

impl PgStore {
    /// Connect and apply the embedded migrations
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Time-series store connected, migrations applied");

        Ok(Self { db: pool })
    }

    pub fn from_pool(db: Db) -> Self {
        Self { db }
    }

    /// Round-trip check for health endpoints
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn interval_from_row(minutes: i32) -> StoreResult<Interval> {
    let minutes = u32::try_from(minutes).map_err(corrupt)?;
    Interval::from_minutes(minutes).map_err(corrupt)
}

#[derive(Debug, FromRow)]
struct TimeframeRow {
    id: Uuid,
    symbol: String,
    contract_type: String,
    interval_minutes: i32,
    weight: f64,
    enabled: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<TimeframeRow> for Timeframe {
    type Error = StoreError;

    fn try_from(row: TimeframeRow) -> StoreResult<Self> {
        Ok(Timeframe {
            id: row.id,
            symbol: row.symbol,
            contract_type: row.contract_type.parse().map_err(corrupt)?,
            interval: interval_from_row(row.interval_minutes)?,
            weight: row.weight,
            enabled: row.enabled,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct BarRow {
    id: Uuid,
    timeframe_id: Uuid,
    symbol: String,
    contract_type: String,
    interval_minutes: i32,
    open_time: DateTime<Utc>,
    close_time: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    trades: i64,
    taker_buy_volume: Option<Decimal>,
    funding_rate: Option<Decimal>,
    open_interest: Option<Decimal>,
    rsi_14: Option<f64>,
    macd_line: Option<f64>,
    macd_signal: Option<f64>,
    macd_histogram: Option<f64>,
    bb_upper: Option<f64>,
    bb_middle: Option<f64>,
    bb_lower: Option<f64>,
    atr_14: Option<f64>,
    volatility_1h: Option<f64>,
    volatility_24h: Option<f64>,
    price_change_1h: Option<f64>,
    price_change_24h: Option<f64>,
    volume_change_1h: Option<f64>,
    volume_change_24h: Option<f64>,
    depth_imbalance: Option<f64>,
    adx_14: Option<f64>,
    dmi_plus: Option<f64>,
    dmi_minus: Option<f64>,
    trend_strength: Option<f64>,
    trend_direction: Option<i16>,
    market_regime: Option<String>,
    support_levels: Vec<f64>,
    resistance_levels: Vec<f64>,
    nearest_support: Option<f64>,
    nearest_resistance: Option<f64>,
    patterns: Vec<String>,
    analyzed: bool,
    usable_by_model: bool,
}

impl TryFrom<BarRow> for Bar {
    type Error = StoreError;

    fn try_from(row: BarRow) -> StoreResult<Self> {
        Ok(Bar {
            id: row.id,
            timeframe_id: row.timeframe_id,
            symbol: row.symbol,
            contract_type: row.contract_type.parse().map_err(corrupt)?,
            interval: interval_from_row(row.interval_minutes)?,
            open_time: row.open_time,
            close_time: row.close_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            trades: row.trades,
            taker_buy_volume: row.taker_buy_volume,
            funding_rate: row.funding_rate,
            open_interest: row.open_interest,
            indicators: IndicatorSet {
                rsi_14: row.rsi_14,
                macd_line: row.macd_line,
                macd_signal: row.macd_signal,
                macd_histogram: row.macd_histogram,
                bb_upper: row.bb_upper,
                bb_middle: row.bb_middle,
                bb_lower: row.bb_lower,
                atr_14: row.atr_14,
                volatility_1h: row.volatility_1h,
                volatility_24h: row.volatility_24h,
                price_change_1h: row.price_change_1h,
                price_change_24h: row.price_change_24h,
                volume_change_1h: row.volume_change_1h,
                volume_change_24h: row.volume_change_24h,
                depth_imbalance: row.depth_imbalance,
                adx_14: row.adx_14,
                dmi_plus: row.dmi_plus,
                dmi_minus: row.dmi_minus,
                trend_strength: row.trend_strength,
                trend_direction: row
                    .trend_direction
                    .map(TrendDirection::from_i16)
                    .transpose()
                    .map_err(corrupt)?,
                market_regime: row
                    .market_regime
                    .as_deref()
                    .map(str::parse::<MarketRegime>)
                    .transpose()
                    .map_err(corrupt)?,
                support_levels: row.support_levels,
                resistance_levels: row.resistance_levels,
                nearest_support: row.nearest_support,
                nearest_resistance: row.nearest_resistance,
                patterns: row
                    .patterns
                    .iter()
                    .map(|p| p.parse::<PricePattern>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(corrupt)?,
            },
            analyzed: row.analyzed,
            usable_by_model: row.usable_by_model,
        })
    }
}

#[derive(Debug, FromRow)]
struct PredictionRow {
    id: Uuid,
    market_data_id: Uuid,
    timeframe_id: Uuid,
    lstm_pred: f64,
    cnn_pred: f64,
    dnn_pred: f64,
    ensemble_pred: f64,
    confidence: f64,
    prediction_time: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<PredictionRow> for ModelPrediction {
    fn from(row: PredictionRow) -> Self {
        ModelPrediction {
            id: row.id,
            market_data_id: row.market_data_id,
            timeframe_id: row.timeframe_id,
            lstm_pred: row.lstm_pred,
            cnn_pred: row.cnn_pred,
            dnn_pred: row.dnn_pred,
            ensemble_pred: row.ensemble_pred,
            confidence: row.confidence,
            prediction_time: row.prediction_time,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct PositionRow {
    id: Uuid,
    market_data_id: Uuid,
    symbol: String,
    contract_type: String,
    side: String,
    size: Decimal,
    entry_price: Decimal,
    entry_time: DateTime<Utc>,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
    exit_price: Option<Decimal>,
    exit_time: Option<DateTime<Utc>>,
    fees: Option<Decimal>,
    pnl: Option<Decimal>,
    status: String,
}

impl TryFrom<PositionRow> for PositionRecord {
    type Error = StoreError;

    fn try_from(row: PositionRow) -> StoreResult<Self> {
        Ok(PositionRecord {
            id: row.id,
            market_data_id: row.market_data_id,
            symbol: row.symbol,
            contract_type: row.contract_type.parse().map_err(corrupt)?,
            side: row.side.parse().map_err(corrupt)?,
            size: row.size,
            entry_price: row.entry_price,
            entry_time: row.entry_time,
            take_profit: row.take_profit,
            stop_loss: row.stop_loss,
            exit_price: row.exit_price,
            exit_time: row.exit_time,
            fees: row.fees,
            pnl: row.pnl,
            status: row.status.parse().map_err(corrupt)?,
        })
    }
}

fn contract_str(contract_type: ContractType) -> &'static str {
    contract_type.as_str()
}

fn pattern_names(indicators: &IndicatorSet) -> Vec<&'static str> {
    indicators.patterns.iter().map(|p| p.as_str()).collect()
}

#[async_trait::async_trait]
impl TimeSeriesStore for PgStore {
    async fn find_or_create_timeframe(
        &self,
        instrument: &InstrumentKey,
        interval: Interval,
        weight: f64,
    ) -> StoreResult<Timeframe> {
        let candidate = Timeframe::new(instrument, interval, weight);
        sqlx::query(
            "INSERT INTO timeframes (id, symbol, contract_type, interval_minutes, weight, enabled, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT ON CONSTRAINT timeframes_unique DO NOTHING",
        )
        .bind(candidate.id)
        .bind(&candidate.symbol)
        .bind(contract_str(candidate.contract_type))
        .bind(interval.minutes() as i32)
        .bind(candidate.weight)
        .bind(candidate.enabled)
        .bind(candidate.created_at)
        .execute(&self.db)
        .await?;

        let row = sqlx::query_as::<_, TimeframeRow>(
            "SELECT id, symbol, contract_type, interval_minutes, weight, enabled, created_at \
             FROM timeframes WHERE symbol = $1 AND contract_type = $2 AND interval_minutes = $3",
        )
        .bind(&instrument.symbol)
        .bind(contract_str(instrument.contract_type))
        .bind(interval.minutes() as i32)
        .fetch_one(&self.db)
        .await?;

        Timeframe::try_from(row)
    }

    async fn timeframes(&self, instrument: &InstrumentKey) -> StoreResult<Vec<Timeframe>> {
        let rows = sqlx::query_as::<_, TimeframeRow>(
            "SELECT id, symbol, contract_type, interval_minutes, weight, enabled, created_at \
             FROM timeframes WHERE symbol = $1 AND contract_type = $2 ORDER BY interval_minutes",
        )
        .bind(&instrument.symbol)
        .bind(contract_str(instrument.contract_type))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(Timeframe::try_from).collect()
    }

    async fn insert_bar(&self, bar: &Bar) -> StoreResult<InsertOutcome> {
        let ind = &bar.indicators;
        let result = sqlx::query(
            "INSERT INTO market_data (id, timeframe_id, symbol, contract_type, open_time, close_time, \
             open, high, low, close, volume, trades, taker_buy_volume, funding_rate, open_interest, \
             rsi_14, macd_line, macd_signal, macd_histogram, bb_upper, bb_middle, bb_lower, atr_14, \
             volatility_1h, volatility_24h, price_change_1h, price_change_24h, volume_change_1h, \
             volume_change_24h, depth_imbalance, adx_14, dmi_plus, dmi_minus, trend_strength, \
             trend_direction, market_regime, support_levels, resistance_levels, nearest_support, \
             nearest_resistance, patterns, analyzed, usable_by_model) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32, $33, $34, \
             $35, $36, $37, $38, $39, $40, $41, $42, $43) \
             ON CONFLICT ON CONSTRAINT market_data_unique DO NOTHING",
        )
        .bind(bar.id)
        .bind(bar.timeframe_id)
        .bind(&bar.symbol)
        .bind(contract_str(bar.contract_type))
        .bind(bar.open_time)
        .bind(bar.close_time)
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.volume)
        .bind(bar.trades)
        .bind(bar.taker_buy_volume)
        .bind(bar.funding_rate)
        .bind(bar.open_interest)
        .bind(ind.rsi_14)
        .bind(ind.macd_line)
        .bind(ind.macd_signal)
        .bind(ind.macd_histogram)
        .bind(ind.bb_upper)
        .bind(ind.bb_middle)
        .bind(ind.bb_lower)
        .bind(ind.atr_14)
        .bind(ind.volatility_1h)
        .bind(ind.volatility_24h)
        .bind(ind.price_change_1h)
        .bind(ind.price_change_24h)
        .bind(ind.volume_change_1h)
        .bind(ind.volume_change_24h)
        .bind(ind.depth_imbalance)
        .bind(ind.adx_14)
        .bind(ind.dmi_plus)
        .bind(ind.dmi_minus)
        .bind(ind.trend_strength)
        .bind(ind.trend_direction.map(|d| d.as_i16()))
        .bind(ind.market_regime.map(|r| r.as_str()))
        .bind(&ind.support_levels)
        .bind(&ind.resistance_levels)
        .bind(ind.nearest_support)
        .bind(ind.nearest_resistance)
        .bind(pattern_names(ind))
        .bind(bar.analyzed)
        .bind(bar.usable_by_model)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn bar(&self, id: Uuid) -> StoreResult<Option<Bar>> {
        let sql = format!("{} WHERE md.id = $1", BAR_SELECT);
        let row = sqlx::query_as::<_, BarRow>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.map(Bar::try_from).transpose()
    }

    async fn bars_before(
        &self,
        timeframe_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Bar>> {
        let sql = format!(
            "{} WHERE md.timeframe_id = $1 AND md.open_time < $2 ORDER BY md.open_time DESC LIMIT $3",
            BAR_SELECT
        );
        let rows = sqlx::query_as::<_, BarRow>(&sql)
            .bind(timeframe_id)
            .bind(before)
            .bind(limit as i64)
            .fetch_all(&self.db)
            .await?;

        let mut bars = rows
            .into_iter()
            .map(Bar::try_from)
            .collect::<StoreResult<Vec<_>>>()?;
        bars.reverse();
        Ok(bars)
    }

    async fn latest_bar(&self, timeframe_id: Uuid) -> StoreResult<Option<Bar>> {
        let sql = format!(
            "{} WHERE md.timeframe_id = $1 ORDER BY md.open_time DESC LIMIT 1",
            BAR_SELECT
        );
        let row = sqlx::query_as::<_, BarRow>(&sql)
            .bind(timeframe_id)
            .fetch_optional(&self.db)
            .await?;
        row.map(Bar::try_from).transpose()
    }

    async fn unanalyzed_bars(&self, timeframe_id: Uuid, limit: usize) -> StoreResult<Vec<Bar>> {
        let sql = format!(
            "{} WHERE md.timeframe_id = $1 AND md.analyzed = FALSE ORDER BY md.open_time ASC LIMIT $2",
            BAR_SELECT
        );
        let rows = sqlx::query_as::<_, BarRow>(&sql)
            .bind(timeframe_id)
            .bind(limit as i64)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(Bar::try_from).collect()
    }

    async fn save_indicators(
        &self,
        bar_id: Uuid,
        indicators: &IndicatorSet,
        analyzed: bool,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE market_data SET rsi_14 = $2, macd_line = $3, macd_signal = $4, \
             macd_histogram = $5, bb_upper = $6, bb_middle = $7, bb_lower = $8, atr_14 = $9, \
             volatility_1h = $10, volatility_24h = $11, price_change_1h = $12, \
             price_change_24h = $13, volume_change_1h = $14, volume_change_24h = $15, \
             depth_imbalance = $16, adx_14 = $17, dmi_plus = $18, dmi_minus = $19, \
             trend_strength = $20, trend_direction = $21, market_regime = $22, \
             support_levels = $23, resistance_levels = $24, nearest_support = $25, \
             nearest_resistance = $26, patterns = $27, analyzed = $28 WHERE id = $1",
        )
        .bind(bar_id)
        .bind(indicators.rsi_14)
        .bind(indicators.macd_line)
        .bind(indicators.macd_signal)
        .bind(indicators.macd_histogram)
        .bind(indicators.bb_upper)
        .bind(indicators.bb_middle)
        .bind(indicators.bb_lower)
        .bind(indicators.atr_14)
        .bind(indicators.volatility_1h)
        .bind(indicators.volatility_24h)
        .bind(indicators.price_change_1h)
        .bind(indicators.price_change_24h)
        .bind(indicators.volume_change_1h)
        .bind(indicators.volume_change_24h)
        .bind(indicators.depth_imbalance)
        .bind(indicators.adx_14)
        .bind(indicators.dmi_plus)
        .bind(indicators.dmi_minus)
        .bind(indicators.trend_strength)
        .bind(indicators.trend_direction.map(|d| d.as_i16()))
        .bind(indicators.market_regime.map(|r| r.as_str()))
        .bind(&indicators.support_levels)
        .bind(&indicators.resistance_levels)
        .bind(indicators.nearest_support)
        .bind(indicators.nearest_resistance)
        .bind(pattern_names(indicators))
        .bind(analyzed)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("bar {}", bar_id)));
        }
        Ok(())
    }

    async fn set_usable_by_model(&self, bar_id: Uuid, usable: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE market_data SET usable_by_model = $2 WHERE id = $1")
            .bind(bar_id)
            .bind(usable)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("bar {}", bar_id)));
        }
        Ok(())
    }

    async fn put_prediction(&self, prediction: &ModelPrediction) -> StoreResult<PredictionWrite> {
        let existing = sqlx::query_as::<_, PredictionRow>(
            "SELECT id, market_data_id, timeframe_id, lstm_pred, cnn_pred, dnn_pred, ensemble_pred, \
             confidence, prediction_time, created_at FROM model_predictions \
             WHERE market_data_id = $1 AND timeframe_id = $2",
        )
        .bind(prediction.market_data_id)
        .bind(prediction.timeframe_id)
        .fetch_optional(&self.db)
        .await?
        .map(ModelPrediction::from);

        match existing {
            Some(stored) if stored.same_outputs(prediction) => Ok(PredictionWrite::Unchanged),
            Some(stored) => {
                warn!(
                    "Overwriting prediction {} for bar {}: model outputs changed",
                    stored.id, prediction.market_data_id
                );
                sqlx::query(
                    "UPDATE model_predictions SET lstm_pred = $2, cnn_pred = $3, dnn_pred = $4, \
                     ensemble_pred = $5, confidence = $6, prediction_time = $7 WHERE id = $1",
                )
                .bind(stored.id)
                .bind(prediction.lstm_pred)
                .bind(prediction.cnn_pred)
                .bind(prediction.dnn_pred)
                .bind(prediction.ensemble_pred)
                .bind(prediction.confidence)
                .bind(prediction.prediction_time)
                .execute(&self.db)
                .await?;
                Ok(PredictionWrite::Replaced)
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO model_predictions (id, market_data_id, timeframe_id, lstm_pred, \
                     cnn_pred, dnn_pred, ensemble_pred, confidence, prediction_time, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                     ON CONFLICT ON CONSTRAINT model_predictions_unique DO NOTHING",
                )
                .bind(prediction.id)
                .bind(prediction.market_data_id)
                .bind(prediction.timeframe_id)
                .bind(prediction.lstm_pred)
                .bind(prediction.cnn_pred)
                .bind(prediction.dnn_pred)
                .bind(prediction.ensemble_pred)
                .bind(prediction.confidence)
                .bind(prediction.prediction_time)
                .bind(prediction.created_at)
                .execute(&self.db)
                .await?;

                if result.rows_affected() == 0 {
                    Ok(PredictionWrite::Unchanged)
                } else {
                    Ok(PredictionWrite::Inserted)
                }
            }
        }
    }

    async fn latest_prediction(&self, timeframe_id: Uuid) -> StoreResult<Option<ModelPrediction>> {
        let row = sqlx::query_as::<_, PredictionRow>(
            "SELECT id, market_data_id, timeframe_id, lstm_pred, cnn_pred, dnn_pred, ensemble_pred, \
             confidence, prediction_time, created_at FROM model_predictions \
             WHERE timeframe_id = $1 ORDER BY prediction_time DESC LIMIT 1",
        )
        .bind(timeframe_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(ModelPrediction::from))
    }

    async fn insert_open_position(&self, position: &PositionRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO positions (id, market_data_id, symbol, contract_type, side, size, \
             entry_price, entry_time, take_profit, stop_loss, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'open')",
        )
        .bind(position.id)
        .bind(position.market_data_id)
        .bind(&position.symbol)
        .bind(contract_str(position.contract_type))
        .bind(position.side.as_str())
        .bind(position.size)
        .bind(position.entry_price)
        .bind(position.entry_time)
        .bind(position.take_profit)
        .bind(position.stop_loss)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn close_position(&self, position: &PositionRecord) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE positions SET exit_price = $2, exit_time = $3, fees = $4, pnl = $5, \
             stop_loss = $6, status = 'closed' WHERE id = $1 AND status = 'open'",
        )
        .bind(position.id)
        .bind(position.exit_price)
        .bind(position.exit_time)
        .bind(position.fees)
        .bind(position.pnl)
        .bind(position.stop_loss)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "position {} is not open",
                position.id
            )));
        }
        Ok(())
    }

    async fn update_stop_loss(&self, position_id: Uuid, stop_loss: Decimal) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE positions SET stop_loss = $2 WHERE id = $1 AND status = 'open'",
        )
        .bind(position_id)
        .bind(stop_loss)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("open position {}", position_id)));
        }
        Ok(())
    }

    async fn open_positions(&self) -> StoreResult<Vec<PositionRecord>> {
        let sql = format!("{} WHERE status = 'open' ORDER BY entry_time", POSITION_SELECT);
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(PositionRecord::try_from).collect()
    }

    async fn closed_positions(&self) -> StoreResult<Vec<PositionRecord>> {
        let sql = format!("{} WHERE status = 'closed' ORDER BY exit_time", POSITION_SELECT);
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(PositionRecord::try_from).collect()
    }

    async fn positions(&self, instrument: &InstrumentKey) -> StoreResult<Vec<PositionRecord>> {
        let sql = format!(
            "{} WHERE symbol = $1 AND contract_type = $2 ORDER BY entry_time",
            POSITION_SELECT
        );
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(&instrument.symbol)
            .bind(contract_str(instrument.contract_type))
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(PositionRecord::try_from).collect()
    }
}
