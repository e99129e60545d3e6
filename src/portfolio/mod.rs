use crate::{
    execution::{
        broker::BrokerCapabilities,
        order::{AttributedFill, OrderKind},
    },
    portfolio::error::PortfolioError,
    strategy::signal::{Signal, SignalKind, SizingIntent, TimeInForce},
    types::{floor_to_whole_units, round_down_to_step, Side, StrategyId, Symbol},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Defines all possible portfolio errors.
pub mod error;

/// Per-strategy sub-ledger and the aggregate view.
pub mod ledger;

/// Signed-quantity average-cost position accounting.
pub mod position;

pub use ledger::{AggregateLedger, FillRecord, SubLedger};
pub use position::Position;

/// Default sizing applied to BUY/SELL signals carrying no intent: 10% of strategy equity.
fn default_equity_fraction() -> Decimal {
    Decimal::new(1, 1)
}

/// Why an order proposal was refused. Observability events, not errors.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    UnsupportedOrderType,
    BelowMinNotional,
    InsufficientCash,
    InsufficientPosition,
    ShortingDisabled,
    ExceedsMaxPosition,
    BelowMinLot,
    ZeroQuantity,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RejectReason::UnsupportedOrderType => "UNSUPPORTED_ORDER_TYPE",
            RejectReason::BelowMinNotional => "BELOW_MIN_NOTIONAL",
            RejectReason::InsufficientCash => "INSUFFICIENT_CASH",
            RejectReason::InsufficientPosition => "INSUFFICIENT_POSITION",
            RejectReason::ShortingDisabled => "SHORTING_DISABLED",
            RejectReason::ExceedsMaxPosition => "EXCEEDS_MAX_POSITION",
            RejectReason::BelowMinLot => "BELOW_MIN_LOT",
            RejectReason::ZeroQuantity => "ZERO_QUANTITY",
        };
        f.write_str(name)
    }
}

/// Structured sizing/gating refusal.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

impl Rejection {
    fn new<S: Into<String>>(reason: RejectReason, detail: S) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Sized order proposal that passed every gate, ready for the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderProposal {
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
}

/// Event emitted by the portfolio for the statistics consumer.
///
/// Statistics is a pure consumer of this stream and never calls back into the portfolio.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum LedgerEvent {
    FillApplied {
        strategy: StrategyId,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
        realised_pnl_delta: Decimal,
        equity: Decimal,
        time: DateTime<Utc>,
    },
    Mark {
        strategy: StrategyId,
        symbol: Symbol,
        price: Decimal,
        equity: Decimal,
        unrealised_pnl: Decimal,
        time: DateTime<Utc>,
    },
}

/// Converts signals into sized, capability-gated order proposals and applies fills to the
/// strategy's sub-ledger. One instance per strategy, owned by its runner.
#[derive(Debug, Clone)]
pub struct PortfolioManager {
    ledger: SubLedger,
    allow_short: bool,
    default_equity_fraction: Decimal,
}

impl PortfolioManager {
    pub fn new(strategy: StrategyId, initial_cash: Decimal) -> Self {
        Self {
            ledger: SubLedger::new(strategy, initial_cash),
            allow_short: false,
            default_equity_fraction: default_equity_fraction(),
        }
    }

    pub fn allow_short(mut self, allow: bool) -> Self {
        self.allow_short = allow;
        self
    }

    pub fn ledger(&self) -> &SubLedger {
        &self.ledger
    }

    /// Record a mark price and emit the statistics event.
    pub fn mark(&mut self, symbol: Symbol, price: Decimal, time: DateTime<Utc>) -> LedgerEvent {
        self.ledger.set_mark(symbol.clone(), price);
        LedgerEvent::Mark {
            strategy: self.ledger.strategy.clone(),
            symbol,
            price,
            equity: self.ledger.equity(),
            unrealised_pnl: self.ledger.unrealised_pnl(),
            time,
        }
    }

    /// Resolve the signal's sizing intent into a concrete quantity and run the gate
    /// sequence. The first failing gate rejects.
    pub fn size_signal(
        &self,
        signal: &Signal,
        symbol: &Symbol,
        capabilities: &BrokerCapabilities,
    ) -> Result<OrderProposal, Rejection> {
        let price = signal.price;
        let equity = self.ledger.equity();
        let current = self.ledger.position_quantity(symbol);
        let current_value = current * price;

        let signed = if signal.kind == SignalKind::Close {
            -current
        } else {
            let direction = match signal.kind.side() {
                Some(side) => side.direction(),
                None => {
                    return Err(Rejection::new(
                        RejectReason::ZeroQuantity,
                        "HOLD signals are not sized",
                    ))
                }
            };
            match &signal.sizing {
                SizingIntent::Units(quantity) => *quantity * direction,
                SizingIntent::Notional(value) => value / price * direction,
                SizingIntent::EquityPct(fraction) | SizingIntent::LegacyFraction(fraction) => {
                    *fraction * equity / price * direction
                }
                SizingIntent::TargetUnits(target) => *target - current,
                SizingIntent::TargetNotional(target) => (*target - current_value) / price,
                SizingIntent::TargetEquityPct(fraction) => {
                    (*fraction * equity - current_value) / price
                }
                SizingIntent::None => self.default_equity_fraction * equity / price * direction,
            }
        };

        if signed == Decimal::ZERO {
            return Err(Rejection::new(
                RejectReason::ZeroQuantity,
                "sizing resolved to zero quantity",
            ));
        }

        let side = if signed > Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        };

        // Rounding happens only here, at the broker-interface boundary
        let mut quantity = round_down_to_step(signed.abs(), capabilities.step_size);
        if !capabilities.fractional_shares {
            quantity = floor_to_whole_units(quantity);
        }
        if quantity == Decimal::ZERO {
            return Err(Rejection::new(
                RejectReason::ZeroQuantity,
                "quantity rounded to zero at broker step size",
            ));
        }

        let kind = order_kind(signal.kind);
        self.gate(kind, side, quantity, price, current, capabilities)?;

        Ok(OrderProposal {
            symbol: symbol.clone(),
            side,
            kind,
            quantity,
            limit_price: signal.limit_price,
            stop_price: signal.stop_price,
            time_in_force: signal.time_in_force,
        })
    }

    fn gate(
        &self,
        kind: OrderKind,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        current: Decimal,
        capabilities: &BrokerCapabilities,
    ) -> Result<(), Rejection> {
        if !capabilities.supports(kind) {
            return Err(Rejection::new(
                RejectReason::UnsupportedOrderType,
                format!("broker does not support {kind} orders"),
            ));
        }

        let notional = (quantity * price).abs();
        if notional < capabilities.min_notional {
            return Err(Rejection::new(
                RejectReason::BelowMinNotional,
                format!(
                    "notional {notional} below broker minimum {}",
                    capabilities.min_notional
                ),
            ));
        }

        match side {
            Side::Buy => {
                let cost = quantity * price;
                if cost > self.ledger.cash {
                    return Err(Rejection::new(
                        RejectReason::InsufficientCash,
                        format!("cost {cost} exceeds cash {}", self.ledger.cash),
                    ));
                }
            }
            Side::Sell => {
                let resulting = current - quantity;
                if resulting < Decimal::ZERO && !self.allow_short {
                    let reason = if current > Decimal::ZERO {
                        RejectReason::InsufficientPosition
                    } else {
                        RejectReason::ShortingDisabled
                    };
                    return Err(Rejection::new(
                        reason,
                        format!("sell {quantity} against position {current}"),
                    ));
                }
            }
        }

        if let Some(max) = capabilities.max_position_size {
            let resulting = (current + quantity * side.direction()).abs();
            if resulting > max {
                return Err(Rejection::new(
                    RejectReason::ExceedsMaxPosition,
                    format!("resulting position {resulting} exceeds broker maximum {max}"),
                ));
            }
        }

        if quantity < capabilities.min_lot_size {
            return Err(Rejection::new(
                RejectReason::BelowMinLot,
                format!(
                    "quantity {quantity} below broker lot size {}",
                    capabilities.min_lot_size
                ),
            ));
        }

        Ok(())
    }

    /// Apply an attributed fill to the sub-ledger atomically and emit the statistics event.
    pub fn apply_fill(&mut self, fill: &AttributedFill) -> Result<LedgerEvent, PortfolioError> {
        let realised = self.ledger.apply_fill(FillRecord {
            order_id: fill.order_id.0,
            symbol: fill.symbol.clone(),
            side: fill.side,
            quantity: fill.fill.quantity,
            price: fill.fill.price,
            fees: fill.fill.fees,
            time: fill.fill.time,
        })?;

        Ok(LedgerEvent::FillApplied {
            strategy: self.ledger.strategy.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            quantity: fill.fill.quantity,
            price: fill.fill.price,
            fees: fill.fill.fees,
            realised_pnl_delta: realised,
            equity: self.ledger.equity(),
            time: fill.fill.time,
        })
    }
}

fn order_kind(kind: SignalKind) -> OrderKind {
    match kind {
        SignalKind::LimitBuy | SignalKind::LimitSell => OrderKind::Limit,
        SignalKind::StopBuy | SignalKind::StopSell => OrderKind::Stop,
        SignalKind::StopLimitBuy | SignalKind::StopLimitSell => OrderKind::StopLimit,
        _ => OrderKind::Market,
    }
}
