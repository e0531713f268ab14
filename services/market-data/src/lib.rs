//! Market data for the futures signal pipeline
//!
//! Bars, timeframes, predictions and position rows, the upstream kline
//! source, the time-series store and per-stream reordering.

pub mod records;
pub mod reorder;
pub mod store;
pub mod types;
pub mod sources {
    pub mod binance;
}

pub use records::{ModelPrediction, PositionRecord, PositionSide, PositionStatus};
pub use reorder::{Admission, ReorderBuffer};
pub use sources::binance::{parse_kline, BinanceFuturesClient, RetryPolicy};
pub use store::{
    InMemoryStore, InsertOutcome, PgStore, PredictionWrite, StoreError, StoreResult,
    TimeSeriesStore,
};
pub use types::*;
