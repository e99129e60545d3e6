use crate::types::{Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An open position in one symbol. Quantity sign encodes long/short.
///
/// Average-cost accounting: increasing fills recompute the average cost as a quantity
/// weighted mean; reducing fills realise P&L against the running average; a fill that
/// reduces through zero closes the position and reopens the remainder at the fill price.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub average_cost: Decimal,
}

impl Position {
    pub fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            quantity: Decimal::ZERO,
            average_cost: Decimal::ZERO,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == Decimal::ZERO
    }

    pub fn market_value(&self, mark: Decimal) -> Decimal {
        self.quantity * mark
    }

    pub fn unrealised_pnl(&self, mark: Decimal) -> Decimal {
        (mark - self.average_cost) * self.quantity
    }

    /// Apply a fill to the position, returning the realised P&L delta (zero for purely
    /// increasing fills). `quantity` is the unsigned fill quantity.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal) -> Decimal {
        let delta = quantity * side.direction();

        if self.quantity == Decimal::ZERO {
            self.quantity = delta;
            self.average_cost = price;
            return Decimal::ZERO;
        }

        let increasing = (self.quantity > Decimal::ZERO) == (delta > Decimal::ZERO);
        if increasing {
            let held = self.quantity.abs();
            let added = delta.abs();
            self.average_cost =
                (self.average_cost * held + price * added) / (held + added);
            self.quantity += delta;
            return Decimal::ZERO;
        }

        // Reducing: realise against the running average for the closed quantity
        let closed = delta.abs().min(self.quantity.abs());
        let long_short = if self.quantity > Decimal::ZERO {
            Decimal::ONE
        } else {
            Decimal::NEGATIVE_ONE
        };
        let realised = (price - self.average_cost) * closed * long_short;

        let remaining = self.quantity + delta;
        if remaining == Decimal::ZERO {
            self.quantity = Decimal::ZERO;
            self.average_cost = Decimal::ZERO;
        } else if (remaining > Decimal::ZERO) == (self.quantity > Decimal::ZERO) {
            // Partial reduce; average cost unchanged
            self.quantity = remaining;
        } else {
            // Reduced through zero: flip into a new position at the fill price
            self.quantity = remaining;
            self.average_cost = price;
        }

        realised
    }
}
