//! Time-series storage for bars, predictions and positions
//!
//! The store is the only place pipeline stages share state. Writes are
//! idempotent: duplicate bars and unchanged predictions come back as
//! outcomes, never as errors.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::records::{ModelPrediction, PositionRecord};
use crate::types::{Bar, IndicatorSet, InstrumentKey, Interval, Timeframe};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Constraint conflict: {0}")]
    Conflict(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of a bar insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A bar with the same uniqueness key already exists; nothing was written
    Duplicate,
}

/// Result of a prediction write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionWrite {
    Inserted,
    /// Same outputs already stored for this (bar, timeframe)
    Unchanged,
    /// Outputs differed and the stored record was overwritten
    Replaced,
}

/// Durable, time-ordered storage with uniqueness constraints
#[async_trait::async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Find the timeframe for (symbol, contract, interval) or create it
    async fn find_or_create_timeframe(
        &self,
        instrument: &InstrumentKey,
        interval: Interval,
        weight: f64,
    ) -> StoreResult<Timeframe>;

    async fn timeframes(&self, instrument: &InstrumentKey) -> StoreResult<Vec<Timeframe>>;

    async fn insert_bar(&self, bar: &Bar) -> StoreResult<InsertOutcome>;

    async fn bar(&self, id: Uuid) -> StoreResult<Option<Bar>>;

    /// Up to `limit` bars of the timeframe with open_time strictly before `before`,
    /// ascending by open_time
    async fn bars_before(
        &self,
        timeframe_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Bar>>;

    async fn latest_bar(&self, timeframe_id: Uuid) -> StoreResult<Option<Bar>>;

    /// Bars not yet analyzed, ascending by open_time
    async fn unanalyzed_bars(&self, timeframe_id: Uuid, limit: usize) -> StoreResult<Vec<Bar>>;

    async fn save_indicators(
        &self,
        bar_id: Uuid,
        indicators: &IndicatorSet,
        analyzed: bool,
    ) -> StoreResult<()>;

    async fn set_usable_by_model(&self, bar_id: Uuid, usable: bool) -> StoreResult<()>;

    async fn put_prediction(&self, prediction: &ModelPrediction) -> StoreResult<PredictionWrite>;

    async fn latest_prediction(&self, timeframe_id: Uuid) -> StoreResult<Option<ModelPrediction>>;

    /// Insert an open position. Fails with `Conflict` if the instrument already has one.
    async fn insert_open_position(&self, position: &PositionRecord) -> StoreResult<()>;

    /// Persist exit fields of a previously open position
    async fn close_position(&self, position: &PositionRecord) -> StoreResult<()>;

    async fn update_stop_loss(&self, position_id: Uuid, stop_loss: Decimal) -> StoreResult<()>;

    async fn open_positions(&self) -> StoreResult<Vec<PositionRecord>>;

    /// Closed positions across all instruments, ascending by exit_time
    async fn closed_positions(&self) -> StoreResult<Vec<PositionRecord>>;

    async fn positions(&self, instrument: &InstrumentKey) -> StoreResult<Vec<PositionRecord>>;
}
