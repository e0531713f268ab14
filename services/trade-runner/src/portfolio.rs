//! Portfolio tracking - equity, open exposure and drawdown

use chrono::{DateTime, Utc};
use market_data::{InstrumentKey, PositionRecord, PositionSide};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Account-level view of all positions opened by this runner
#[derive(Debug, Clone)]
pub struct Portfolio {
    starting_equity: Decimal,
    realized_pnl: Decimal,
    peak_equity: Decimal,
    positions: HashMap<InstrumentKey, Holding>,
    last_updated: DateTime<Utc>,
}

/// Open position as the portfolio sees it
#[derive(Debug, Clone)]
struct Holding {
    side: PositionSide,
    size: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
}

impl Holding {
    fn unrealized(&self) -> Decimal {
        (self.mark_price - self.entry_price) * self.size * self.side.sign()
    }

    fn notional(&self) -> Decimal {
        self.size * self.mark_price
    }
}

/// Portfolio snapshot for reporting
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub starting_equity: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub drawdown_pct: Decimal,
    pub gross_exposure: Decimal,
    pub positions: Vec<HoldingSnapshot>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldingSnapshot {
    pub instrument: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Portfolio {
    pub fn new(starting_equity: Decimal) -> Self {
        Self {
            starting_equity,
            realized_pnl: Decimal::ZERO,
            peak_equity: starting_equity,
            positions: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(Holding::unrealized).sum()
    }

    pub fn equity(&self) -> Decimal {
        self.starting_equity + self.realized_pnl + self.unrealized_pnl()
    }

    /// Decline from peak equity, in percent
    pub fn drawdown_pct(&self) -> Decimal {
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let drawdown = (self.peak_equity - self.equity()) / self.peak_equity * Decimal::ONE_HUNDRED;
        drawdown.max(Decimal::ZERO)
    }

    /// Gross open notional at current marks
    pub fn gross_exposure(&self) -> Decimal {
        self.positions.values().map(Holding::notional).sum()
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Track a newly opened (or restored) position
    pub fn on_open(&mut self, position: &PositionRecord) {
        self.positions.insert(
            position.instrument(),
            Holding {
                side: position.side,
                size: position.size,
                entry_price: position.entry_price,
                mark_price: position.entry_price,
            },
        );
        self.touch();
        debug!(
            "Portfolio tracking {} {} {} @ {}",
            position.instrument(),
            position.side,
            position.size,
            position.entry_price
        );
    }

    /// Update the mark price of an instrument's open position
    pub fn mark(&mut self, instrument: &InstrumentKey, price: Decimal) {
        if let Some(holding) = self.positions.get_mut(instrument) {
            holding.mark_price = price;
            self.touch();
        }
    }

    /// Realize a closed position's net pnl
    pub fn on_close(&mut self, position: &PositionRecord) {
        self.positions.remove(&position.instrument());
        let pnl = position.pnl.unwrap_or(Decimal::ZERO);
        self.realized_pnl += pnl;
        self.touch();
        info!(
            "Realized {} on {} | Equity: {} | Drawdown: {}%",
            pnl,
            position.instrument(),
            self.equity(),
            self.drawdown_pct().round_dp(2)
        );
    }

    /// Replay closed positions, in exit order, so realized pnl and the
    /// equity peak survive a restart
    pub fn replay_closed(&mut self, closed: &[PositionRecord]) {
        for position in closed {
            self.realized_pnl += position.pnl.unwrap_or(Decimal::ZERO);
            self.peak_equity = self.peak_equity.max(self.starting_equity + self.realized_pnl);
        }
        self.touch();
        if !closed.is_empty() {
            info!(
                "Replayed {} closed positions | Realized: {} | Peak: {} | Drawdown: {}%",
                closed.len(),
                self.realized_pnl,
                self.peak_equity,
                self.drawdown_pct().round_dp(2)
            );
        }
    }

    fn touch(&mut self) {
        self.peak_equity = self.peak_equity.max(self.equity());
        self.last_updated = Utc::now();
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        let mut positions: Vec<HoldingSnapshot> = self
            .positions
            .iter()
            .map(|(instrument, h)| HoldingSnapshot {
                instrument: instrument.to_string(),
                side: h.side,
                size: h.size,
                entry_price: h.entry_price,
                mark_price: h.mark_price,
                unrealized_pnl: h.unrealized(),
            })
            .collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));

        PortfolioSnapshot {
            starting_equity: self.starting_equity,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl(),
            equity: self.equity(),
            peak_equity: self.peak_equity,
            drawdown_pct: self.drawdown_pct(),
            gross_exposure: self.gross_exposure(),
            positions,
            last_updated: self.last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_data::{ContractType, PositionStatus};
    use uuid::Uuid;

    fn record(side: PositionSide, size: i64, entry: i64) -> PositionRecord {
        PositionRecord {
            id: Uuid::new_v4(),
            market_data_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            contract_type: ContractType::Perpetual,
            side,
            size: Decimal::from(size),
            entry_price: Decimal::from(entry),
            entry_time: Utc::now(),
            take_profit: None,
            stop_loss: None,
            exit_price: None,
            exit_time: None,
            fees: None,
            pnl: None,
            status: PositionStatus::Open,
        }
    }

    #[test]
    fn test_portfolio_new() {
        let portfolio = Portfolio::new(Decimal::from(10_000));
        assert_eq!(portfolio.equity(), Decimal::from(10_000));
        assert_eq!(portfolio.drawdown_pct(), Decimal::ZERO);
        assert_eq!(portfolio.open_count(), 0);
    }

    #[test]
    fn test_mark_to_market_and_drawdown() {
        let mut portfolio = Portfolio::new(Decimal::from(1_000));
        let long = record(PositionSide::Long, 2, 100);
        portfolio.on_open(&long);
        let key = long.instrument();

        portfolio.mark(&key, Decimal::from(150));
        assert_eq!(portfolio.equity(), Decimal::from(1_100));
        assert_eq!(portfolio.gross_exposure(), Decimal::from(300));

        // Peak was 1100; falling to 1045 is a 5% drawdown
        portfolio.mark(&key, Decimal::from(122) + Decimal::new(5, 1));
        assert_eq!(portfolio.equity(), Decimal::from(1_045));
        assert_eq!(portfolio.drawdown_pct(), Decimal::from(5));
    }

    #[test]
    fn test_replay_closed_rebuilds_peak_and_drawdown() {
        let mut portfolio = Portfolio::new(Decimal::from(1_000));
        let closed: Vec<PositionRecord> = [100, -150, 20]
            .into_iter()
            .map(|pnl| {
                let mut r = record(PositionSide::Long, 1, 100);
                r.pnl = Some(Decimal::from(pnl));
                r.status = PositionStatus::Closed;
                r
            })
            .collect();

        portfolio.replay_closed(&closed);
        // 1000 -> 1100 (peak) -> 950 -> 970
        assert_eq!(portfolio.equity(), Decimal::from(970));
        assert_eq!(portfolio.snapshot().peak_equity, Decimal::from(1_100));
        assert_eq!(
            portfolio.drawdown_pct(),
            Decimal::from(130) / Decimal::from(1_100) * Decimal::ONE_HUNDRED
        );
    }

    #[test]
    fn test_short_unrealized_and_close() {
        let mut portfolio = Portfolio::new(Decimal::from(1_000));
        let mut short = record(PositionSide::Short, 1, 100);
        portfolio.on_open(&short);
        portfolio.mark(&short.instrument(), Decimal::from(90));
        assert_eq!(portfolio.unrealized_pnl(), Decimal::from(10));

        short.pnl = Some(Decimal::from(9));
        short.status = PositionStatus::Closed;
        portfolio.on_close(&short);
        assert_eq!(portfolio.open_count(), 0);
        assert_eq!(portfolio.equity(), Decimal::from(1_009));
        let snapshot = portfolio.snapshot();
        assert_eq!(snapshot.realized_pnl, Decimal::from(9));
        assert!(snapshot.positions.is_empty());
    }
}
