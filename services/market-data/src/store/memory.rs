//! In-process store used by tests and database-less runs

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{InsertOutcome, PredictionWrite, StoreError, StoreResult, TimeSeriesStore};
use crate::records::{ModelPrediction, PositionRecord, PositionStatus};
use crate::types::{Bar, BarKey, IndicatorSet, InstrumentKey, Interval, Timeframe};

#[derive(Default)]
struct Tables {
    timeframes: HashMap<Uuid, Timeframe>,
    bars: HashMap<Uuid, Bar>,
    bar_keys: HashSet<BarKey>,
    /// timeframe id -> open_time -> bar id
    series: HashMap<Uuid, BTreeMap<DateTime<Utc>, Uuid>>,
    /// (market_data_id, timeframe_id) -> prediction
    predictions: HashMap<(Uuid, Uuid), ModelPrediction>,
    positions: Vec<PositionRecord>,
}

/// Store backed by in-memory tables behind a single async RwLock
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bars across all timeframes
    pub async fn bar_count(&self) -> usize {
        self.tables.read().await.bars.len()
    }

    /// Number of stored predictions
    pub async fn prediction_count(&self) -> usize {
        self.tables.read().await.predictions.len()
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for InMemoryStore {
    async fn find_or_create_timeframe(
        &self,
        instrument: &InstrumentKey,
        interval: Interval,
        weight: f64,
    ) -> StoreResult<Timeframe> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.timeframes.values().find(|tf| {
            tf.symbol == instrument.symbol
                && tf.contract_type == instrument.contract_type
                && tf.interval == interval
        }) {
            return Ok(existing.clone());
        }

        let timeframe = Timeframe::new(instrument, interval, weight);
        tables.timeframes.insert(timeframe.id, timeframe.clone());
        debug!("Created timeframe {}", timeframe.label());
        Ok(timeframe)
    }

    async fn timeframes(&self, instrument: &InstrumentKey) -> StoreResult<Vec<Timeframe>> {
        let tables = self.tables.read().await;
        let mut found: Vec<Timeframe> = tables
            .timeframes
            .values()
            .filter(|tf| {
                tf.symbol == instrument.symbol && tf.contract_type == instrument.contract_type
            })
            .cloned()
            .collect();
        found.sort_by_key(|tf| tf.interval);
        Ok(found)
    }

    async fn insert_bar(&self, bar: &Bar) -> StoreResult<InsertOutcome> {
        let mut tables = self.tables.write().await;
        let key = bar.key();
        if tables.bar_keys.contains(&key) {
            return Ok(InsertOutcome::Duplicate);
        }

        tables.bar_keys.insert(key);
        tables
            .series
            .entry(bar.timeframe_id)
            .or_default()
            .insert(bar.open_time, bar.id);
        tables.bars.insert(bar.id, bar.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn bar(&self, id: Uuid) -> StoreResult<Option<Bar>> {
        Ok(self.tables.read().await.bars.get(&id).cloned())
    }

    async fn bars_before(
        &self,
        timeframe_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Bar>> {
        let tables = self.tables.read().await;
        let Some(series) = tables.series.get(&timeframe_id) else {
            return Ok(Vec::new());
        };

        let mut bars: Vec<Bar> = series
            .range(..before)
            .rev()
            .take(limit)
            .filter_map(|(_, id)| tables.bars.get(id).cloned())
            .collect();
        bars.reverse();
        Ok(bars)
    }

    async fn latest_bar(&self, timeframe_id: Uuid) -> StoreResult<Option<Bar>> {
        let tables = self.tables.read().await;
        Ok(tables
            .series
            .get(&timeframe_id)
            .and_then(|series| series.values().next_back())
            .and_then(|id| tables.bars.get(id).cloned()))
    }

    async fn unanalyzed_bars(&self, timeframe_id: Uuid, limit: usize) -> StoreResult<Vec<Bar>> {
        let tables = self.tables.read().await;
        let Some(series) = tables.series.get(&timeframe_id) else {
            return Ok(Vec::new());
        };

        Ok(series
            .values()
            .filter_map(|id| tables.bars.get(id))
            .filter(|bar| !bar.analyzed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_indicators(
        &self,
        bar_id: Uuid,
        indicators: &IndicatorSet,
        analyzed: bool,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let bar = tables
            .bars
            .get_mut(&bar_id)
            .ok_or_else(|| StoreError::NotFound(format!("bar {}", bar_id)))?;
        bar.indicators = indicators.clone();
        bar.analyzed = analyzed;
        Ok(())
    }

    async fn set_usable_by_model(&self, bar_id: Uuid, usable: bool) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let bar = tables
            .bars
            .get_mut(&bar_id)
            .ok_or_else(|| StoreError::NotFound(format!("bar {}", bar_id)))?;
        bar.usable_by_model = usable;
        Ok(())
    }

    async fn put_prediction(&self, prediction: &ModelPrediction) -> StoreResult<PredictionWrite> {
        let mut tables = self.tables.write().await;
        let key = (prediction.market_data_id, prediction.timeframe_id);
        let outcome = match tables.predictions.get(&key) {
            None => PredictionWrite::Inserted,
            Some(existing) if existing.same_outputs(prediction) => {
                return Ok(PredictionWrite::Unchanged)
            }
            Some(_) => PredictionWrite::Replaced,
        };
        tables.predictions.insert(key, prediction.clone());
        Ok(outcome)
    }

    async fn latest_prediction(&self, timeframe_id: Uuid) -> StoreResult<Option<ModelPrediction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .predictions
            .values()
            .filter(|p| p.timeframe_id == timeframe_id)
            .max_by_key(|p| p.prediction_time)
            .cloned())
    }

    async fn insert_open_position(&self, position: &PositionRecord) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.positions.iter().any(|p| {
            p.is_open() && p.symbol == position.symbol && p.contract_type == position.contract_type
        }) {
            return Err(StoreError::Conflict(format!(
                "open position already exists for {}",
                position.instrument()
            )));
        }
        tables.positions.push(position.clone());
        Ok(())
    }

    async fn close_position(&self, position: &PositionRecord) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .positions
            .iter_mut()
            .find(|p| p.id == position.id)
            .ok_or_else(|| StoreError::NotFound(format!("position {}", position.id)))?;
        if stored.status == PositionStatus::Closed {
            return Err(StoreError::Conflict(format!(
                "position {} already closed",
                position.id
            )));
        }
        *stored = position.clone();
        Ok(())
    }

    async fn update_stop_loss(&self, position_id: Uuid, stop_loss: Decimal) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .positions
            .iter_mut()
            .find(|p| p.id == position_id && p.is_open())
            .ok_or_else(|| StoreError::NotFound(format!("open position {}", position_id)))?;
        stored.stop_loss = Some(stop_loss);
        Ok(())
    }

    async fn open_positions(&self) -> StoreResult<Vec<PositionRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.positions.iter().filter(|p| p.is_open()).cloned().collect())
    }

    async fn closed_positions(&self) -> StoreResult<Vec<PositionRecord>> {
        let tables = self.tables.read().await;
        let mut closed: Vec<PositionRecord> = tables
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Closed)
            .cloned()
            .collect();
        closed.sort_by_key(|p| p.exit_time);
        Ok(closed)
    }

    async fn positions(&self, instrument: &InstrumentKey) -> StoreResult<Vec<PositionRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .positions
            .iter()
            .filter(|p| {
                p.symbol == instrument.symbol && p.contract_type == instrument.contract_type
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::PositionSide;
    use crate::types::ContractType;
    use chrono::{Duration, TimeZone};

    fn instrument() -> InstrumentKey {
        InstrumentKey::new("ETHUSDT", ContractType::Perpetual)
    }

    fn bar_at(tf: &Timeframe, minutes: i64) -> Bar {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        Bar::new(
            tf,
            t0 + Duration::minutes(minutes),
            Decimal::from(10),
            Decimal::from(11),
            Decimal::from(9),
            Decimal::from(10),
            Decimal::from(100),
            5,
        )
    }

    fn open_position(side: PositionSide) -> PositionRecord {
        PositionRecord {
            id: Uuid::new_v4(),
            market_data_id: Uuid::new_v4(),
            symbol: "ETHUSDT".to_string(),
            contract_type: ContractType::Perpetual,
            side,
            size: Decimal::ONE,
            entry_price: Decimal::from(100),
            entry_time: Utc::now(),
            take_profit: None,
            stop_loss: Some(Decimal::from(95)),
            exit_price: None,
            exit_time: None,
            fees: None,
            pnl: None,
            status: PositionStatus::Open,
        }
    }

    #[tokio::test]
    async fn test_duplicate_bar_is_stored_once() {
        let store = InMemoryStore::new();
        let tf = store
            .find_or_create_timeframe(&instrument(), Interval::MINUTES_15, 0.4)
            .await
            .unwrap();

        let first = bar_at(&tf, 0);
        // Same key, fresh id: a redelivery from the source
        let mut again = first.clone();
        again.id = Uuid::new_v4();

        assert_eq!(store.insert_bar(&first).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_bar(&again).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.bar_count().await, 1);
    }

    #[tokio::test]
    async fn test_find_or_create_timeframe_is_stable() {
        let store = InMemoryStore::new();
        let a = store
            .find_or_create_timeframe(&instrument(), Interval::HOUR_1, 0.6)
            .await
            .unwrap();
        let b = store
            .find_or_create_timeframe(&instrument(), Interval::HOUR_1, 0.6)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.timeframes(&instrument()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bars_before_is_strict_and_ascending() {
        let store = InMemoryStore::new();
        let tf = store
            .find_or_create_timeframe(&instrument(), Interval::MINUTES_15, 0.4)
            .await
            .unwrap();
        for i in 0..10 {
            store.insert_bar(&bar_at(&tf, i * 15)).await.unwrap();
        }

        let pivot = bar_at(&tf, 5 * 15).open_time;
        let history = store.bars_before(tf.id, pivot, 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].open_time < w[1].open_time));
        assert!(history.iter().all(|b| b.open_time < pivot));
        assert_eq!(history[2].open_time, pivot - Duration::minutes(15));
    }

    #[tokio::test]
    async fn test_prediction_write_outcomes() {
        let store = InMemoryStore::new();
        let mut prediction = ModelPrediction {
            id: Uuid::new_v4(),
            market_data_id: Uuid::new_v4(),
            timeframe_id: Uuid::new_v4(),
            lstm_pred: 0.8,
            cnn_pred: 0.6,
            dnn_pred: 0.7,
            ensemble_pred: 0.7,
            confidence: 0.83,
            prediction_time: Utc::now(),
            created_at: Utc::now(),
        };

        assert_eq!(
            store.put_prediction(&prediction).await.unwrap(),
            PredictionWrite::Inserted
        );
        assert_eq!(
            store.put_prediction(&prediction).await.unwrap(),
            PredictionWrite::Unchanged
        );
        prediction.ensemble_pred = 0.1;
        assert_eq!(
            store.put_prediction(&prediction).await.unwrap(),
            PredictionWrite::Replaced
        );
        assert_eq!(store.prediction_count().await, 1);
    }

    #[tokio::test]
    async fn test_second_open_position_conflicts() {
        let store = InMemoryStore::new();
        tokio_test::assert_ok!(
            store
                .insert_open_position(&open_position(PositionSide::Long))
                .await
        );
        let err = store
            .insert_open_position(&open_position(PositionSide::Short))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_position_only_once() {
        let store = InMemoryStore::new();
        let mut position = open_position(PositionSide::Long);
        store.insert_open_position(&position).await.unwrap();

        position.status = PositionStatus::Closed;
        position.exit_price = Some(Decimal::from(95));
        position.pnl = Some(Decimal::from(-5));
        store.close_position(&position).await.unwrap();

        tokio_test::assert_err!(store.close_position(&position).await);
        assert!(store.open_positions().await.unwrap().is_empty());
        assert_eq!(store.positions(&instrument()).await.unwrap().len(), 1);
        assert_eq!(store.closed_positions().await.unwrap(), vec![position]);
    }

    #[tokio::test]
    async fn test_closed_positions_in_exit_order() {
        let store = InMemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for (minutes, pnl) in [(30, 2), (10, -3)] {
            let mut position = open_position(PositionSide::Long);
            store.insert_open_position(&position).await.unwrap();
            position.status = PositionStatus::Closed;
            position.exit_time = Some(t0 + Duration::minutes(minutes));
            position.pnl = Some(Decimal::from(pnl));
            store.close_position(&position).await.unwrap();
        }

        let closed = store.closed_positions().await.unwrap();
        let pnls: Vec<_> = closed.iter().map(|p| p.pnl.unwrap()).collect();
        assert_eq!(pnls, vec![Decimal::from(-3), Decimal::from(2)]);
    }
}
