//! Position manager - one state machine per instrument
//!
//! Each (symbol, contract_type) slot moves `none -> open -> closed` and is
//! eligible for a new entry once closed. Transitions for a slot run under
//! that slot's exclusive lock. The store is written first; the in-memory
//! slot only changes after the write succeeds.

use chrono::{DateTime, Utc};
use market_data::{
    Bar, InstrumentKey, PositionRecord, PositionSide, PositionStatus, StoreError, TimeSeriesStore,
};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use signal_engine::{Signal, SignalKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FeeConfig, RiskConfig};
use crate::risk::{RiskController, RiskDecision, RiskVeto};

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);
const PRICE_DP: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cannot size entry for {instrument}: {reason}")]
    InvalidPlan { instrument: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PositionError>;

/// An open position plus the distance its stop trails at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenPosition {
    pub record: PositionRecord,
    pub stop_distance: Decimal,
}

/// Lifecycle state of one instrument
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "state", content = "position", rename_all = "snake_case")]
pub enum PositionSlot {
    #[default]
    None,
    Open(OpenPosition),
    Closed(PositionRecord),
}

impl PositionSlot {
    pub fn is_open(&self) -> bool {
        matches!(self, PositionSlot::Open(_))
    }
}

/// Entry economics fixed at open time
#[derive(Debug, Clone, PartialEq)]
pub struct TradePlan {
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub stop_distance: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened(PositionRecord),
    Vetoed(RiskVeto),
    /// A position is already open for the instrument
    AlreadyOpen { position_id: Uuid },
    /// Hold signals never open anything
    NoTrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    NoPosition,
    Held {
        /// New stop when the trailing stop moved
        trailed_to: Option<Decimal>,
    },
    Closed {
        record: PositionRecord,
        reason: ExitReason,
    },
}

pub struct PositionManager {
    store: Arc<dyn TimeSeriesStore>,
    risk: Arc<RiskController>,
    config: RiskConfig,
    fees: FeeConfig,
    slots: Mutex<HashMap<InstrumentKey, Arc<Mutex<PositionSlot>>>>,
}

impl PositionManager {
    pub fn new(store: Arc<dyn TimeSeriesStore>, risk: Arc<RiskController>, fees: FeeConfig) -> Self {
        let config = *risk.config();
        Self {
            store,
            risk,
            config,
            fees,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, instrument: &InstrumentKey) -> Arc<Mutex<PositionSlot>> {
        let mut slots = self.slots.lock().await;
        slots.entry(instrument.clone()).or_default().clone()
    }

    /// Current state of an instrument's slot
    pub async fn state(&self, instrument: &InstrumentKey) -> PositionSlot {
        let slot = self.slot(instrument).await;
        let guard = slot.lock().await;
        guard.clone()
    }

    pub async fn open_positions(&self) -> Vec<PositionRecord> {
        let slots: Vec<Arc<Mutex<PositionSlot>>> = self.slots.lock().await.values().cloned().collect();
        let mut open = Vec::new();
        for slot in slots {
            if let PositionSlot::Open(p) = &*slot.lock().await {
                open.push(p.record.clone());
            }
        }
        open.sort_by_key(|r| r.entry_time);
        open
    }

    /// Rebuild open slots and portfolio holdings from the store. Closed
    /// positions are replayed first so realized pnl and peak equity carry over.
    pub async fn restore(&self) -> Result<usize> {
        let closed = self.store.closed_positions().await?;
        self.risk.lock_portfolio().await.replay_closed(&closed);

        let records = self.store.open_positions().await?;
        for record in &records {
            let slot = self.slot(&record.instrument()).await;
            let mut slot = slot.lock().await;
            let mut portfolio = self.risk.lock_portfolio().await;
            *slot = PositionSlot::Open(OpenPosition {
                record: record.clone(),
                stop_distance: self.restored_stop_distance(record),
            });
            portfolio.on_open(record);
        }
        if !records.is_empty() {
            info!("Restored {} open positions", records.len());
        }
        Ok(records.len())
    }

    fn restored_stop_distance(&self, record: &PositionRecord) -> Decimal {
        match (record.take_profit, record.stop_loss) {
            (Some(tp), _) if self.config.reward_ratio > Decimal::ZERO => {
                (tp - record.entry_price).abs() / self.config.reward_ratio
            }
            (_, Some(sl)) => (record.entry_price - sl).abs(),
            _ => Decimal::ZERO,
        }
    }

    /// Size an entry off `bar`'s close and ATR for the given equity
    pub fn plan_entry(&self, side: PositionSide, bar: &Bar, equity: Decimal) -> Result<TradePlan> {
        let invalid = |reason: &str| PositionError::InvalidPlan {
            instrument: bar.instrument().to_string(),
            reason: reason.to_string(),
        };

        let entry_price = self.slipped(bar.close, side, true);
        let stop_distance = match bar.indicators.atr_14.and_then(Decimal::from_f64) {
            Some(atr) if atr > Decimal::ZERO => atr * self.config.stop_atr_multiple,
            _ => entry_price * self.config.fallback_stop_pct / Decimal::ONE_HUNDRED,
        }
        .round_dp(PRICE_DP);
        if stop_distance <= Decimal::ZERO {
            return Err(invalid("stop distance is zero"));
        }

        let sign = side.sign();
        let stop_loss = entry_price - sign * stop_distance;
        let take_profit = entry_price + sign * self.config.reward_ratio * stop_distance;
        if stop_loss <= Decimal::ZERO || take_profit <= Decimal::ZERO {
            return Err(invalid("stop or target below zero"));
        }

        let size = (equity * self.config.sizing_fraction / stop_distance).round_dp_with_strategy(
            PRICE_DP,
            rust_decimal::RoundingStrategy::ToZero,
        );
        if size <= Decimal::ZERO {
            return Err(invalid("size rounds to zero"));
        }

        Ok(TradePlan {
            side,
            entry_price,
            size,
            stop_loss,
            take_profit,
            stop_distance,
        })
    }

    /// Open a position for a trade signal on its entry bar, subject to risk approval
    pub async fn open(&self, signal: &Signal, bar: &Bar) -> Result<OpenOutcome> {
        let side = match signal.kind {
            SignalKind::Long => PositionSide::Long,
            SignalKind::Short => PositionSide::Short,
            SignalKind::Hold => return Ok(OpenOutcome::NoTrade),
        };
        let instrument = bar.instrument();
        let slot = self.slot(&instrument).await;
        let mut slot = slot.lock().await;
        if let Some(outcome) = already_open(&instrument, &slot) {
            return Ok(outcome);
        }

        let mut portfolio = self.risk.lock_portfolio().await;
        let plan = self.plan_entry(side, bar, portfolio.equity())?;
        self.admit(&instrument, bar.id, bar.close_time, plan, &mut slot, &mut portfolio)
            .await
    }

    /// Open with precomputed entry economics; risk is still evaluated
    pub async fn open_with_plan(
        &self,
        instrument: &InstrumentKey,
        market_data_id: Uuid,
        entry_time: DateTime<Utc>,
        plan: TradePlan,
    ) -> Result<OpenOutcome> {
        let slot = self.slot(instrument).await;
        let mut slot = slot.lock().await;
        if let Some(outcome) = already_open(instrument, &slot) {
            return Ok(outcome);
        }
        let mut portfolio = self.risk.lock_portfolio().await;
        self.admit(instrument, market_data_id, entry_time, plan, &mut slot, &mut portfolio)
            .await
    }

    async fn admit(
        &self,
        instrument: &InstrumentKey,
        market_data_id: Uuid,
        entry_time: DateTime<Utc>,
        mut plan: TradePlan,
        slot: &mut PositionSlot,
        portfolio: &mut crate::portfolio::Portfolio,
    ) -> Result<OpenOutcome> {
        match self
            .risk
            .evaluate(portfolio, instrument, plan.size, plan.entry_price)
            .await
        {
            RiskDecision::Vetoed(veto) => return Ok(OpenOutcome::Vetoed(veto)),
            RiskDecision::Approved { size, .. } => plan.size = size,
        }

        let record = PositionRecord {
            id: Uuid::new_v4(),
            market_data_id,
            symbol: instrument.symbol.clone(),
            contract_type: instrument.contract_type,
            side: plan.side,
            size: plan.size,
            entry_price: plan.entry_price,
            entry_time,
            take_profit: Some(plan.take_profit),
            stop_loss: Some(plan.stop_loss),
            exit_price: None,
            exit_time: None,
            fees: None,
            pnl: None,
            status: PositionStatus::Open,
        };

        match self.store.insert_open_position(&record).await {
            Ok(()) => {}
            Err(StoreError::Conflict(msg)) => {
                warn!("Store already holds an open position for {}: {}", instrument, msg);
                let existing = self
                    .store
                    .positions(instrument)
                    .await?
                    .into_iter()
                    .find(PositionRecord::is_open)
                    .map(|r| r.id)
                    .unwrap_or_default();
                return Ok(OpenOutcome::AlreadyOpen {
                    position_id: existing,
                });
            }
            Err(e) => return Err(e.into()),
        }

        portfolio.on_open(&record);
        *slot = PositionSlot::Open(OpenPosition {
            record: record.clone(),
            stop_distance: plan.stop_distance,
        });
        info!(
            "Opened {} {} {} @ {} | SL {} | TP {}",
            instrument, record.side, record.size, record.entry_price, plan.stop_loss, plan.take_profit
        );
        Ok(OpenOutcome::Opened(record))
    }

    /// Check an instrument's open position against a newly committed bar
    pub async fn monitor(&self, bar: &Bar) -> Result<MonitorOutcome> {
        let instrument = bar.instrument();
        let slot = self.slot(&instrument).await;
        let mut slot = slot.lock().await;
        let PositionSlot::Open(open) = &*slot else {
            return Ok(MonitorOutcome::NoPosition);
        };
        // Bars that closed before the entry cannot exit it
        if bar.close_time <= open.record.entry_time {
            return Ok(MonitorOutcome::Held { trailed_to: None });
        }

        if let Some((reason, exit_price)) = self.exit_fill(&open.record, bar) {
            let closed = self.settle(&open.record, exit_price, bar.close_time);
            self.store.close_position(&closed).await?;
            self.risk.lock_portfolio().await.on_close(&closed);
            info!(
                "Closed {} {} on {:?} @ {} | PnL {} (fees {})",
                instrument,
                closed.side,
                reason,
                exit_price,
                closed.pnl.unwrap_or_default(),
                closed.fees.unwrap_or_default()
            );
            *slot = PositionSlot::Closed(closed.clone());
            return Ok(MonitorOutcome::Closed {
                record: closed,
                reason,
            });
        }

        self.risk.lock_portfolio().await.mark(&instrument, bar.close);

        if !self.config.trailing_stop {
            return Ok(MonitorOutcome::Held { trailed_to: None });
        }
        let Some(new_stop) = trailed_stop(open, bar) else {
            return Ok(MonitorOutcome::Held { trailed_to: None });
        };
        self.store.update_stop_loss(open.record.id, new_stop).await?;
        debug!("Trailed {} stop to {}", instrument, new_stop);
        if let PositionSlot::Open(open) = &mut *slot {
            open.record.stop_loss = Some(new_stop);
        }
        Ok(MonitorOutcome::Held {
            trailed_to: Some(new_stop),
        })
    }

    /// Exit level touched by `bar`, if any. The stop wins when both are touched.
    fn exit_fill(&self, record: &PositionRecord, bar: &Bar) -> Option<(ExitReason, Decimal)> {
        let (stop_hit, target_hit) = match record.side {
            PositionSide::Long => (
                record.stop_loss.filter(|sl| bar.low <= *sl),
                record.take_profit.filter(|tp| bar.high >= *tp),
            ),
            PositionSide::Short => (
                record.stop_loss.filter(|sl| bar.high >= *sl),
                record.take_profit.filter(|tp| bar.low <= *tp),
            ),
        };

        let (reason, level) = match (stop_hit, target_hit) {
            (Some(sl), _) => (ExitReason::StopLoss, sl),
            (None, Some(tp)) => (ExitReason::TakeProfit, tp),
            (None, None) => return None,
        };

        // A bar that opens beyond the level fills at the open
        let gapped = match (record.side, reason) {
            (PositionSide::Long, ExitReason::StopLoss) => bar.open < level,
            (PositionSide::Long, ExitReason::TakeProfit) => bar.open > level,
            (PositionSide::Short, ExitReason::StopLoss) => bar.open > level,
            (PositionSide::Short, ExitReason::TakeProfit) => bar.open < level,
        };
        let fill = if gapped { bar.open } else { level };
        Some((reason, self.slipped(fill, record.side, false)))
    }

    /// Closed copy of `record` with exit, fees and net pnl
    fn settle(&self, record: &PositionRecord, exit_price: Decimal, exit_time: DateTime<Utc>) -> PositionRecord {
        let gross = (exit_price - record.entry_price) * record.size * record.side.sign();
        let fees = (self.fees.taker_fee_bps * (record.entry_price + exit_price) * record.size / BPS)
            .round_dp(PRICE_DP);
        PositionRecord {
            exit_price: Some(exit_price),
            exit_time: Some(exit_time),
            fees: Some(fees),
            pnl: Some((gross - fees).round_dp(PRICE_DP)),
            status: PositionStatus::Closed,
            ..record.clone()
        }
    }

    /// Adjust a fill price against the position by the configured slippage
    fn slipped(&self, price: Decimal, side: PositionSide, entering: bool) -> Decimal {
        if self.fees.slippage_bps.is_zero() {
            return price;
        }
        let adverse = self.fees.slippage_bps / BPS;
        // Buying fills higher, selling fills lower
        let buying = matches!((side, entering), (PositionSide::Long, true) | (PositionSide::Short, false));
        let factor = if buying {
            Decimal::ONE + adverse
        } else {
            Decimal::ONE - adverse
        };
        (price * factor).round_dp(PRICE_DP)
    }
}

fn already_open(instrument: &InstrumentKey, slot: &PositionSlot) -> Option<OpenOutcome> {
    let PositionSlot::Open(open) = slot else {
        return None;
    };
    warn!(
        "Rejecting entry for {}: position {} already open",
        instrument, open.record.id
    );
    Some(OpenOutcome::AlreadyOpen {
        position_id: open.record.id,
    })
}

/// Ratcheted stop after a bar that did not exit, if it improves
fn trailed_stop(open: &OpenPosition, bar: &Bar) -> Option<Decimal> {
    let current = open.record.stop_loss?;
    if open.stop_distance <= Decimal::ZERO {
        return None;
    }
    let candidate = match open.record.side {
        PositionSide::Long => bar.high - open.stop_distance,
        PositionSide::Short => bar.low + open.stop_distance,
    };
    let improves = match open.record.side {
        PositionSide::Long => candidate > current,
        PositionSide::Short => candidate < current && candidate > Decimal::ZERO,
    };
    improves.then_some(candidate)
}
