//! Append-only prediction records and position rows

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::types::{ContractType, InstrumentKey, MarketDataError};

/// Ensemble output for one (bar, timeframe)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub id: Uuid,
    pub market_data_id: Uuid,
    pub timeframe_id: Uuid,
    pub lstm_pred: f64,
    pub cnn_pred: f64,
    pub dnn_pred: f64,
    pub ensemble_pred: f64,
    /// Agreement across the three model outputs, in [0, 1]
    pub confidence: f64,
    /// Close time of the scored bar
    pub prediction_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ModelPrediction {
    /// True when both records carry the same model outputs
    pub fn same_outputs(&self, other: &ModelPrediction) -> bool {
        self.lstm_pred.to_bits() == other.lstm_pred.to_bits()
            && self.cnn_pred.to_bits() == other.cnn_pred.to_bits()
            && self.dnn_pred.to_bits() == other.dnn_pred.to_bits()
            && self.ensemble_pred.to_bits() == other.ensemble_pred.to_bits()
            && self.confidence.to_bits() == other.confidence.to_bits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            other => Err(MarketDataError::Malformed(format!("unknown side: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            other => Err(MarketDataError::Malformed(format!("unknown status: {}", other))),
        }
    }
}

/// Persisted position row. `pnl` stays null until the position is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: Uuid,
    /// Bar whose signal opened the position
    pub market_data_id: Uuid,
    pub symbol: String,
    pub contract_type: ContractType,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub fees: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub status: PositionStatus,
}

impl PositionRecord {
    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.symbol.clone(), self.contract_type)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}
