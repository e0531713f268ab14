//! Risk controller - gates every position entry
//!
//! Checks, in order: the emergency halt, current drawdown, and gross exposure
//! after the new position. Violations are explicit vetoes carrying the limit
//! that was breached. Evaluation happens while the caller holds the portfolio
//! write lock, so concurrent entries cannot both claim the same headroom.

use chrono::{DateTime, Utc};
use market_data::InstrumentKey;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{error, info, warn};

use crate::config::{ExposureBreach, RiskConfig};
use crate::portfolio::Portfolio;

/// System-wide block on new entries, cleared only by an operator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyHalt {
    pub reason: String,
    pub set_at: DateTime<Utc>,
}

/// A rejected entry and the limit it breached
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "breach", rename_all = "snake_case")]
pub enum RiskVeto {
    EmergencyHalt { reason: String },
    Drawdown { current_pct: Decimal, max_pct: Decimal },
    Exposure {
        current: Decimal,
        requested: Decimal,
        limit: Decimal,
    },
}

impl fmt::Display for RiskVeto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskVeto::EmergencyHalt { reason } => write!(f, "emergency halt active: {}", reason),
            RiskVeto::Drawdown { current_pct, max_pct } => write!(
                f,
                "drawdown {}% at or above limit {}%",
                current_pct.round_dp(4),
                max_pct
            ),
            RiskVeto::Exposure {
                current,
                requested,
                limit,
            } => write!(
                f,
                "exposure {} + {} exceeds limit {}",
                current.round_dp(2),
                requested.round_dp(2),
                limit.round_dp(2)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approved {
        size: Decimal,
        /// Requested size when the exposure limit forced a smaller one
        downsized_from: Option<Decimal>,
    },
    Vetoed(RiskVeto),
}

pub struct RiskController {
    config: RiskConfig,
    portfolio: Arc<RwLock<Portfolio>>,
    halt: RwLock<Option<EmergencyHalt>>,
}

impl RiskController {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            portfolio: Arc::new(RwLock::new(Portfolio::new(config.starting_equity))),
            halt: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn portfolio(&self) -> &Arc<RwLock<Portfolio>> {
        &self.portfolio
    }

    /// Exclusive portfolio access for an evaluate-then-commit sequence
    pub async fn lock_portfolio(&self) -> RwLockWriteGuard<'_, Portfolio> {
        self.portfolio.write().await
    }

    /// Evaluate an entry of `size` at `price` against the locked portfolio
    pub async fn evaluate(
        &self,
        portfolio: &Portfolio,
        instrument: &InstrumentKey,
        size: Decimal,
        price: Decimal,
    ) -> RiskDecision {
        if let Some(halt) = self.halt.read().await.as_ref() {
            return self.veto(
                instrument,
                RiskVeto::EmergencyHalt {
                    reason: halt.reason.clone(),
                },
            );
        }

        let drawdown = portfolio.drawdown_pct();
        if drawdown >= self.config.max_drawdown_pct {
            return self.veto(
                instrument,
                RiskVeto::Drawdown {
                    current_pct: drawdown,
                    max_pct: self.config.max_drawdown_pct,
                },
            );
        }

        let limit = portfolio.equity() * self.config.max_exposure_pct / Decimal::ONE_HUNDRED;
        let current = portfolio.gross_exposure();
        let requested = size * price;
        if current + requested <= limit {
            return RiskDecision::Approved {
                size,
                downsized_from: None,
            };
        }

        let breach = RiskVeto::Exposure {
            current,
            requested,
            limit,
        };
        match self.config.exposure_breach {
            ExposureBreach::Downsize if limit > current && price > Decimal::ZERO => {
                let allowed = ((limit - current) / price).round_dp_with_strategy(
                    8,
                    rust_decimal::RoundingStrategy::ToZero,
                );
                if allowed <= Decimal::ZERO {
                    return self.veto(instrument, breach);
                }
                info!(
                    "Downsizing {} entry from {} to {} to fit exposure limit {}",
                    instrument,
                    size,
                    allowed,
                    limit.round_dp(2)
                );
                RiskDecision::Approved {
                    size: allowed,
                    downsized_from: Some(size),
                }
            }
            _ => self.veto(instrument, breach),
        }
    }

    fn veto(&self, instrument: &InstrumentKey, veto: RiskVeto) -> RiskDecision {
        warn!("Risk veto for {}: {}", instrument, veto);
        RiskDecision::Vetoed(veto)
    }

    /// Block all new entries until cleared. An existing halt keeps its original reason.
    pub async fn halt(&self, reason: impl Into<String>) -> EmergencyHalt {
        let mut halt = self.halt.write().await;
        if let Some(existing) = halt.as_ref() {
            return existing.clone();
        }
        let new_halt = EmergencyHalt {
            reason: reason.into(),
            set_at: Utc::now(),
        };
        error!("EMERGENCY HALT set: {}", new_halt.reason);
        *halt = Some(new_halt.clone());
        new_halt
    }

    /// Operator action. Returns the halt that was cleared, if any.
    pub async fn clear_halt(&self) -> Option<EmergencyHalt> {
        let cleared = self.halt.write().await.take();
        if let Some(halt) = &cleared {
            info!("Emergency halt cleared by operator (was: {})", halt.reason);
        }
        cleared
    }

    pub async fn halt_status(&self) -> Option<EmergencyHalt> {
        self.halt.read().await.clone()
    }
}
