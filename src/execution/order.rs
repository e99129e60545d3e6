use crate::{
    error::InvariantViolation,
    strategy::signal::TimeInForce,
    types::{Side, StrategyId, Symbol},
};
use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

/// Local order identifier, assigned by the gateway at submission.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Broker-assigned order identifier, recorded when the submission is acknowledged.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct BrokerOrderId(pub SmolStr);

impl BrokerOrderId {
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(SmolStr::new(id))
    }
}

/// Execution style of an order.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// Order lifecycle state.
///
/// `Pending → Working → (PartiallyFilled)* → {Filled, Cancelled, Rejected, Expired}`.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Working,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled
                | OrderState::Cancelled
                | OrderState::Rejected
                | OrderState::Expired
        )
    }

    /// Whether `self → next` is a legal lifecycle transition.
    pub fn can_transition(&self, next: OrderState) -> bool {
        match self {
            OrderState::Pending => matches!(
                next,
                OrderState::Working | OrderState::Rejected | OrderState::Cancelled
            ),
            OrderState::Working => matches!(
                next,
                OrderState::PartiallyFilled
                    | OrderState::Filled
                    | OrderState::Cancelled
                    | OrderState::Rejected
                    | OrderState::Expired
            ),
            OrderState::PartiallyFilled => matches!(
                next,
                OrderState::PartiallyFilled
                    | OrderState::Filled
                    | OrderState::Cancelled
                    | OrderState::Expired
            ),
            _ => false,
        }
    }
}

/// Sized, gated order proposal handed to the gateway for submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderRequest {
    pub id: OrderId,
    pub strategy: StrategyId,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
}

/// An order tracked by the gateway from submission to terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub strategy: StrategyId,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub state: OrderState,
    pub broker_id: Option<BrokerOrderId>,
    pub filled_quantity: Decimal,
    /// Quantity-weighted mean of fill prices; zero until the first fill.
    pub average_fill_price: Decimal,
    pub time_submit: DateTime<Utc>,
    pub time_terminal: Option<DateTime<Utc>>,
}

impl Order {
    pub fn from_request(request: OrderRequest, time_submit: DateTime<Utc>) -> Self {
        Self {
            id: request.id,
            strategy: request.strategy,
            symbol: request.symbol,
            side: request.side,
            kind: request.kind,
            quantity: request.quantity,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            time_in_force: request.time_in_force,
            state: OrderState::Pending,
            broker_id: None,
            filled_quantity: Decimal::ZERO,
            average_fill_price: Decimal::ZERO,
            time_submit,
            time_terminal: None,
        }
    }

    pub fn quantity_remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Transition the order state, recording the terminal timestamp where applicable.
    pub fn transition(
        &mut self,
        next: OrderState,
        time: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        if !self.state.can_transition(next) {
            return Err(InvariantViolation::new(
                "order-state",
                format!("{}: illegal transition {} -> {next}", self.id, self.state),
            ));
        }
        self.state = next;
        if next.is_terminal() {
            self.time_terminal = Some(time);
        }
        Ok(())
    }

    /// Apply a fill: accumulate the filled quantity, recompute the weighted average fill
    /// price, and advance the state. Overfills violate the order invariant.
    pub fn apply_fill(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        time: DateTime<Utc>,
    ) -> Result<OrderState, InvariantViolation> {
        let filled = self.filled_quantity + quantity;
        if filled > self.quantity {
            return Err(InvariantViolation::new(
                "order-fill",
                format!(
                    "{}: fills sum to {filled}, exceeding order quantity {}",
                    self.id, self.quantity
                ),
            ));
        }

        self.average_fill_price = if filled == Decimal::ZERO {
            Decimal::ZERO
        } else {
            (self.average_fill_price * self.filled_quantity + price * quantity) / filled
        };
        self.filled_quantity = filled;

        let next = if filled == self.quantity {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        self.transition(next, time)?;
        Ok(next)
    }
}

/// A fill as reported by the broker. Identity is `(broker_order_id, sequence)`; applying
/// the same identity twice is a no-op at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Fill {
    pub broker_order_id: BrokerOrderId,
    pub sequence: u64,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub time: DateTime<Utc>,
}

/// A deduplicated fill attributed to its originating strategy and local order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AttributedFill {
    pub strategy: StrategyId,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub fill: Fill,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn request() -> OrderRequest {
        OrderRequest {
            id: OrderId::random(),
            strategy: StrategyId::new("s1"),
            symbol: Symbol::new("AAPL"),
            side: Side::Buy,
            kind: OrderKind::Market,
            quantity: dec!(10),
            limit_price: None,
            stop_price: None,
            time_in_force: None,
        }
    }

    fn time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut order = Order::from_request(request(), time());
        assert_eq!(order.state, OrderState::Pending);

        order.transition(OrderState::Working, time()).unwrap();
        assert_eq!(order.apply_fill(dec!(4), dec!(100), time()).unwrap(), OrderState::PartiallyFilled);
        assert_eq!(order.apply_fill(dec!(6), dec!(101), time()).unwrap(), OrderState::Filled);

        assert!(order.state.is_terminal());
        assert_eq!(order.filled_quantity, dec!(10));
        assert_eq!(order.average_fill_price, dec!(100.6));
        assert!(order.time_terminal.is_some());
    }

    #[test]
    fn terminal_states_refuse_transitions() {
        let mut order = Order::from_request(request(), time());
        order.transition(OrderState::Working, time()).unwrap();
        order.transition(OrderState::Cancelled, time()).unwrap();

        assert!(order.transition(OrderState::Working, time()).is_err());
        assert!(order.transition(OrderState::Filled, time()).is_err());
    }

    #[test]
    fn pending_cannot_partially_fill() {
        let mut order = Order::from_request(request(), time());
        assert!(order.apply_fill(dec!(4), dec!(100), time()).is_err());
    }

    #[test]
    fn overfill_is_an_invariant_violation() {
        let mut order = Order::from_request(request(), time());
        order.transition(OrderState::Working, time()).unwrap();
        order.apply_fill(dec!(8), dec!(100), time()).unwrap();

        assert!(order.apply_fill(dec!(5), dec!(100), time()).is_err());
    }

    #[test]
    fn average_fill_price_is_quantity_weighted() {
        let mut order = Order::from_request(request(), time());
        order.transition(OrderState::Working, time()).unwrap();
        order.apply_fill(dec!(2), dec!(90), time()).unwrap();
        order.apply_fill(dec!(8), dec!(110), time()).unwrap();

        assert_eq!(order.average_fill_price, dec!(106));
    }
}
