use crate::{
    error::InvariantViolation,
    portfolio::position::Position,
    types::{Side, StrategyId, Symbol},
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Fills retained per sub-ledger for inspection; older records are pruned.
const FILL_RETENTION: usize = 1024;

/// Relative tolerance for the ledger identity check. Average-cost division is the only
/// place the otherwise-exact decimal arithmetic can pick up rounding.
fn identity_tolerance() -> Decimal {
    Decimal::new(1, 9)
}

/// A fill as recorded in a sub-ledger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FillRecord {
    pub order_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub time: DateTime<Utc>,
}

/// Per-strategy slice of the overall portfolio: cash, positions, realised P&L and a capped
/// fill history. Single writer (the owning runner's portfolio manager); snapshots are
/// cloned out for readers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubLedger {
    pub strategy: StrategyId,
    pub initial_cash: Decimal,
    pub cash: Decimal,
    pub positions: IndexMap<Symbol, Position>,
    pub realised_pnl: Decimal,
    pub fees_paid: Decimal,
    /// Last mark price per symbol; fills mark at the fill price.
    pub marks: IndexMap<Symbol, Decimal>,
    pub fills: VecDeque<FillRecord>,
}

impl SubLedger {
    pub fn new(strategy: StrategyId, initial_cash: Decimal) -> Self {
        Self {
            strategy,
            initial_cash,
            cash: initial_cash,
            positions: IndexMap::new(),
            realised_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            marks: IndexMap::new(),
            fills: VecDeque::new(),
        }
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol).filter(|position| !position.is_flat())
    }

    /// Signed quantity currently held in `symbol` (zero when flat).
    pub fn position_quantity(&self, symbol: &Symbol) -> Decimal {
        self.positions
            .get(symbol)
            .map(|position| position.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// Mark price for `symbol`, falling back to the position's average cost.
    pub fn mark_price(&self, symbol: &Symbol) -> Option<Decimal> {
        self.marks.get(symbol).copied().or_else(|| {
            self.positions
                .get(symbol)
                .map(|position| position.average_cost)
        })
    }

    pub fn set_mark(&mut self, symbol: Symbol, price: Decimal) {
        self.marks.insert(symbol, price);
    }

    /// Cash plus the marked value of every position.
    pub fn equity(&self) -> Decimal {
        let positions: Decimal = self
            .positions
            .values()
            .map(|position| {
                let mark = self
                    .mark_price(&position.symbol)
                    .unwrap_or(position.average_cost);
                position.market_value(mark)
            })
            .sum();
        self.cash + positions
    }

    pub fn unrealised_pnl(&self) -> Decimal {
        self.positions
            .values()
            .map(|position| {
                let mark = self
                    .mark_price(&position.symbol)
                    .unwrap_or(position.average_cost);
                position.unrealised_pnl(mark)
            })
            .sum()
    }

    /// Apply a fill atomically: cash, position, realised P&L, fees and the fill record all
    /// move together. Returns the realised P&L delta.
    pub fn apply_fill(&mut self, record: FillRecord) -> Result<Decimal, InvariantViolation> {
        let position = self
            .positions
            .entry(record.symbol.clone())
            .or_insert_with(|| Position::flat(record.symbol.clone()));

        let realised = position.apply_fill(record.side, record.quantity, record.price);

        self.cash -= record.quantity * record.price * record.side.direction();
        self.cash -= record.fees;
        self.fees_paid += record.fees;
        self.realised_pnl += realised;
        self.marks.insert(record.symbol.clone(), record.price);

        self.fills.push_back(record);
        while self.fills.len() > FILL_RETENTION {
            self.fills.pop_front();
        }

        self.check_identity()?;
        Ok(realised)
    }

    /// Ledger identity: `cash + Σ market_value == initial_cash + realised + unrealised - fees`
    /// within relative tolerance.
    pub fn check_identity(&self) -> Result<(), InvariantViolation> {
        let lhs = self.equity();
        let rhs = self.initial_cash + self.realised_pnl + self.unrealised_pnl() - self.fees_paid;

        let scale = Decimal::ONE.max(lhs.abs());
        if (lhs - rhs).abs() > identity_tolerance() * scale {
            return Err(InvariantViolation::new(
                "sub-ledger",
                format!(
                    "{}: equity {lhs} != initial + realised + unrealised - fees {rhs}",
                    self.strategy
                ),
            ));
        }
        Ok(())
    }
}

/// Aggregate view summing every sub-ledger.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregateLedger {
    pub cash: Decimal,
    pub equity: Decimal,
    pub realised_pnl: Decimal,
    pub positions: IndexMap<Symbol, Decimal>,
}

impl AggregateLedger {
    pub fn sum<'a>(ledgers: impl IntoIterator<Item = &'a SubLedger>) -> Self {
        let mut aggregate = Self {
            cash: Decimal::ZERO,
            equity: Decimal::ZERO,
            realised_pnl: Decimal::ZERO,
            positions: IndexMap::new(),
        };

        for ledger in ledgers {
            aggregate.cash += ledger.cash;
            aggregate.equity += ledger.equity();
            aggregate.realised_pnl += ledger.realised_pnl;
            for position in ledger.positions.values() {
                if position.is_flat() {
                    continue;
                }
                *aggregate
                    .positions
                    .entry(position.symbol.clone())
                    .or_insert(Decimal::ZERO) += position.quantity;
            }
        }

        aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn fill(symbol: &str, side: Side, quantity: Decimal, price: Decimal) -> FillRecord {
        FillRecord {
            order_id: Uuid::new_v4(),
            symbol: Symbol::new(symbol),
            side,
            quantity,
            price,
            fees: Decimal::ZERO,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn buy_fill_moves_cash_into_position() {
        let mut ledger = SubLedger::new(StrategyId::new("s1"), dec!(10000));
        ledger.apply_fill(fill("AAPL", Side::Buy, dec!(10), dec!(100))).unwrap();

        assert_eq!(ledger.cash, dec!(9000));
        assert_eq!(ledger.position_quantity(&Symbol::new("AAPL")), dec!(10));
        assert_eq!(ledger.equity(), dec!(10000));
    }

    #[test]
    fn round_trip_realises_pnl() {
        let mut ledger = SubLedger::new(StrategyId::new("s1"), dec!(10000));
        ledger.apply_fill(fill("AAPL", Side::Buy, dec!(10), dec!(100))).unwrap();
        ledger.apply_fill(fill("AAPL", Side::Sell, dec!(10), dec!(110))).unwrap();

        assert_eq!(ledger.cash, dec!(10100));
        assert_eq!(ledger.realised_pnl, dec!(100));
        assert!(ledger.position(&Symbol::new("AAPL")).is_none());
        assert_eq!(ledger.equity(), dec!(10100));
    }

    #[test]
    fn fees_reduce_cash_and_accumulate() {
        let mut ledger = SubLedger::new(StrategyId::new("s1"), dec!(10000));
        let mut record = fill("AAPL", Side::Buy, dec!(10), dec!(100));
        record.fees = dec!(2.5);
        ledger.apply_fill(record).unwrap();

        assert_eq!(ledger.cash, dec!(8997.5));
        assert_eq!(ledger.fees_paid, dec!(2.5));
    }

    #[test]
    fn identity_holds_across_marks() {
        let mut ledger = SubLedger::new(StrategyId::new("s1"), dec!(10000));
        ledger.apply_fill(fill("AAPL", Side::Buy, dec!(10), dec!(100))).unwrap();

        ledger.set_mark(Symbol::new("AAPL"), dec!(123.45));
        assert!(ledger.check_identity().is_ok());
        assert_eq!(ledger.equity(), dec!(9000) + dec!(10) * dec!(123.45));
    }

    #[test]
    fn aggregate_sums_sub_ledgers() {
        let mut first = SubLedger::new(StrategyId::new("s1"), dec!(10000));
        first.apply_fill(fill("AAPL", Side::Buy, dec!(10), dec!(100))).unwrap();

        let mut second = SubLedger::new(StrategyId::new("s2"), dec!(5000));
        second.apply_fill(fill("AAPL", Side::Buy, dec!(5), dec!(100))).unwrap();
        second.apply_fill(fill("MSFT", Side::Sell, dec!(2), dec!(300))).unwrap();

        let aggregate = AggregateLedger::sum([&first, &second]);
        assert_eq!(aggregate.cash, dec!(9000) + dec!(5100));
        assert_eq!(aggregate.positions[&Symbol::new("AAPL")], dec!(15));
        assert_eq!(aggregate.positions[&Symbol::new("MSFT")], dec!(-2));
        assert_eq!(aggregate.equity, first.equity() + second.equity());
    }
}
