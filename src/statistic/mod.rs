use crate::{
    portfolio::LedgerEvent,
    statistic::drawdown::{DrawdownGenerator, MaxDrawdownGenerator},
    types::StrategyId,
    Timed,
};
use chrono::{DateTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Drawdown metrics over an equity stream.
pub mod drawdown;

/// Closed-trade P&Ls retained for rolling averages.
const TRADE_PNL_RETENTION: usize = 256;

/// Consistent, owned view of a strategy's rolling performance.
///
/// Produced by the owning runner and published via a `watch` channel, so readers never
/// block the writer and never observe torn fields.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatisticsSnapshot {
    pub strategy: StrategyId,
    pub time_start: DateTime<Utc>,
    pub time_now: DateTime<Utc>,
    pub equity_initial: Decimal,
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub net_pnl: Decimal,
    pub realised_pnl: Decimal,
    pub unrealised_pnl: Decimal,
    pub fees_paid: Decimal,
    /// Net P&L over initial equity.
    pub total_return: f64,
    /// Drawdown currently in progress, as a fraction of the peak.
    pub drawdown_current: f64,
    /// Largest drawdown observed, completed or in progress.
    pub drawdown_max: f64,
    /// Fills applied.
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: Option<f64>,
    pub profit_factor: Option<f64>,
    pub avg_trade_pnl: Option<Decimal>,
}

/// Rolling per-strategy performance accounting, fed by the portfolio's [`LedgerEvent`]
/// stream (fills and mark updates). Pure consumer: never calls back into the portfolio.
///
/// Bounded memory: fixed-width state plus a capped rolling list of closed-trade P&Ls.
#[derive(Debug, Clone)]
pub struct TearSheetGenerator {
    strategy: StrategyId,
    time_start: DateTime<Utc>,
    time_now: DateTime<Utc>,
    equity_initial: Decimal,
    equity: Decimal,
    peak_equity: Decimal,
    realised_pnl: Decimal,
    fees_paid: Decimal,
    trades: u64,
    wins: u64,
    losses: u64,
    gross_profit: Decimal,
    gross_loss: Decimal,
    trade_pnls: VecDeque<Decimal>,
    drawdown: DrawdownGenerator,
    drawdown_max: MaxDrawdownGenerator,
}

impl TearSheetGenerator {
    pub fn init(strategy: StrategyId, time_start: DateTime<Utc>, equity_initial: Decimal) -> Self {
        Self {
            strategy,
            time_start,
            time_now: time_start,
            equity_initial,
            equity: equity_initial,
            peak_equity: equity_initial,
            realised_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            trades: 0,
            wins: 0,
            losses: 0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            trade_pnls: VecDeque::new(),
            drawdown: DrawdownGenerator::init(Timed::new(
                equity_initial.to_f64().unwrap_or(0.0),
                time_start,
            )),
            drawdown_max: MaxDrawdownGenerator::default(),
        }
    }

    /// Update from the next portfolio event.
    pub fn update(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::FillApplied {
                realised_pnl_delta,
                fees,
                equity,
                time,
                ..
            } => {
                self.trades += 1;
                self.realised_pnl += realised_pnl_delta;
                self.fees_paid += fees;

                if *realised_pnl_delta != Decimal::ZERO {
                    if *realised_pnl_delta > Decimal::ZERO {
                        self.wins += 1;
                        self.gross_profit += realised_pnl_delta;
                    } else {
                        self.losses += 1;
                        self.gross_loss += realised_pnl_delta.abs();
                    }
                    self.trade_pnls.push_back(*realised_pnl_delta);
                    while self.trade_pnls.len() > TRADE_PNL_RETENTION {
                        self.trade_pnls.pop_front();
                    }
                }

                self.update_equity(*equity, *time);
            }
            LedgerEvent::Mark { equity, time, .. } => {
                self.update_equity(*equity, *time);
            }
        }
    }

    fn update_equity(&mut self, equity: Decimal, time: DateTime<Utc>) {
        self.equity = equity;
        self.peak_equity = self.peak_equity.max(equity);
        self.time_now = time;

        if let Some(ended) = self
            .drawdown
            .update(Timed::new(equity.to_f64().unwrap_or(0.0), time))
        {
            self.drawdown_max.update(&ended);
        }
    }

    /// Generate an owned snapshot of the current state.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let net_pnl = self.equity - self.equity_initial;
        // Ledger identity rearranged: unrealised = equity - initial - realised + fees
        let unrealised_pnl = net_pnl - self.realised_pnl + self.fees_paid;

        let total_return = if self.equity_initial > Decimal::ZERO {
            (net_pnl / self.equity_initial).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        let drawdown_current = self
            .drawdown
            .generate()
            .map(|drawdown| drawdown.value)
            .unwrap_or(0.0);
        let drawdown_max = self
            .drawdown_max
            .generate()
            .map(|max| max.0.value)
            .unwrap_or(0.0)
            .max(drawdown_current);

        let closed = self.wins + self.losses;
        let win_rate = (closed > 0).then(|| self.wins as f64 / closed as f64);
        let profit_factor = (self.gross_loss > Decimal::ZERO)
            .then(|| (self.gross_profit / self.gross_loss).to_f64().unwrap_or(0.0));
        let avg_trade_pnl = (!self.trade_pnls.is_empty()).then(|| {
            self.trade_pnls.iter().sum::<Decimal>() / Decimal::from(self.trade_pnls.len() as u64)
        });

        StatisticsSnapshot {
            strategy: self.strategy.clone(),
            time_start: self.time_start,
            time_now: self.time_now,
            equity_initial: self.equity_initial,
            equity: self.equity,
            peak_equity: self.peak_equity,
            net_pnl,
            realised_pnl: self.realised_pnl,
            unrealised_pnl,
            fees_paid: self.fees_paid,
            total_return,
            drawdown_current,
            drawdown_max,
            trades: self.trades,
            wins: self.wins,
            losses: self.losses,
            win_rate,
            profit_factor,
            avg_trade_pnl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Symbol};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn time(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap()
    }

    fn fill_event(
        realised: Decimal,
        fees: Decimal,
        equity: Decimal,
        minute: u32,
    ) -> LedgerEvent {
        LedgerEvent::FillApplied {
            strategy: StrategyId::new("s1"),
            symbol: Symbol::new("SYM"),
            side: Side::Buy,
            quantity: dec!(1),
            price: dec!(100),
            fees,
            realised_pnl_delta: realised,
            equity,
            time: time(minute),
        }
    }

    fn mark_event(equity: Decimal, minute: u32) -> LedgerEvent {
        LedgerEvent::Mark {
            strategy: StrategyId::new("s1"),
            symbol: Symbol::new("SYM"),
            price: dec!(100),
            equity,
            unrealised_pnl: Decimal::ZERO,
            time: time(minute),
        }
    }

    fn generator() -> TearSheetGenerator {
        TearSheetGenerator::init(StrategyId::new("s1"), time(0), dec!(10000))
    }

    #[test]
    fn initial_snapshot_is_flat() {
        let snapshot = generator().snapshot();

        assert_eq!(snapshot.equity, dec!(10000));
        assert_eq!(snapshot.net_pnl, Decimal::ZERO);
        assert_eq!(snapshot.trades, 0);
        assert_eq!(snapshot.win_rate, None);
        assert_eq!(snapshot.total_return, 0.0);
    }

    #[test]
    fn fills_accumulate_trades_and_pnl() {
        let mut generator = generator();
        generator.update(&fill_event(Decimal::ZERO, Decimal::ZERO, dec!(10000), 1));
        generator.update(&fill_event(dec!(150), Decimal::ZERO, dec!(10150), 2));
        generator.update(&fill_event(dec!(-50), Decimal::ZERO, dec!(10100), 3));

        let snapshot = generator.snapshot();
        assert_eq!(snapshot.trades, 3);
        assert_eq!(snapshot.wins, 1);
        assert_eq!(snapshot.losses, 1);
        assert_eq!(snapshot.realised_pnl, dec!(100));
        assert_eq!(snapshot.net_pnl, dec!(100));
        assert_eq!(snapshot.win_rate, Some(0.5));
        assert_eq!(snapshot.profit_factor, Some(3.0));
        assert_eq!(snapshot.avg_trade_pnl, Some(dec!(50)));
    }

    #[test]
    fn marks_move_equity_and_drawdown() {
        let mut generator = generator();
        generator.update(&mark_event(dec!(11000), 1));
        generator.update(&mark_event(dec!(9900), 2));

        let snapshot = generator.snapshot();
        assert_eq!(snapshot.peak_equity, dec!(11000));
        assert!((snapshot.drawdown_current - 0.1).abs() < 1e-12);
        assert!((snapshot.drawdown_max - 0.1).abs() < 1e-12);

        // Recovery completes the drawdown period; max remains
        generator.update(&mark_event(dec!(11500), 3));
        let snapshot = generator.snapshot();
        assert_eq!(snapshot.drawdown_current, 0.0);
        assert!((snapshot.drawdown_max - 0.1).abs() < 1e-12);
    }

    #[test]
    fn unrealised_pnl_derives_from_ledger_identity() {
        let mut generator = generator();
        // Buy fill with fees: equity dips by the fee
        generator.update(&fill_event(Decimal::ZERO, dec!(10), dec!(9990), 1));
        // Mark-up: equity rises with unrealised gains
        generator.update(&mark_event(dec!(10490), 2));

        let snapshot = generator.snapshot();
        assert_eq!(snapshot.realised_pnl, Decimal::ZERO);
        assert_eq!(snapshot.fees_paid, dec!(10));
        assert_eq!(snapshot.unrealised_pnl, dec!(500));
    }

    #[test]
    fn trade_pnl_retention_is_bounded() {
        let mut generator = generator();
        for index in 0..400u32 {
            generator.update(&fill_event(dec!(1), Decimal::ZERO, dec!(10000), index % 60));
        }
        assert_eq!(generator.trade_pnls.len(), TRADE_PNL_RETENTION);
    }
}
