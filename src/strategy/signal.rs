use crate::types::Side;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-agnostic trading intent produced by a [`SignalEvaluator`](super::SignalEvaluator).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Signal {
    pub kind: SignalKind,
    /// Reference price the evaluator saw (usually the last close). Strictly positive.
    pub price: Decimal,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub sizing: SizingIntent,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    /// Opaque evaluator annotations, passed through to observability surfaces.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Signal {
    pub fn new(kind: SignalKind, price: Decimal, time: DateTime<Utc>) -> Self {
        Self {
            kind,
            price,
            time,
            sizing: SizingIntent::None,
            limit_price: None,
            stop_price: None,
            time_in_force: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn hold(price: Decimal, time: DateTime<Utc>) -> Self {
        Self::new(SignalKind::Hold, price, time)
    }

    pub fn with_sizing(mut self, sizing: SizingIntent) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn with_limit_price(mut self, limit_price: Decimal) -> Self {
        self.limit_price = Some(limit_price);
        self
    }

    pub fn with_stop_price(mut self, stop_price: Decimal) -> Self {
        self.stop_price = Some(stop_price);
        self
    }

    pub fn with_time_in_force(mut self, time_in_force: TimeInForce) -> Self {
        self.time_in_force = Some(time_in_force);
        self
    }

    /// Validate the signal's structural invariants.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.price <= Decimal::ZERO {
            return Err(SignalError::NonPositivePrice(self.price));
        }
        if self.kind.requires_limit_price() && self.limit_price.is_none() {
            return Err(SignalError::MissingLimitPrice(self.kind));
        }
        if self.kind.requires_stop_price() && self.stop_price.is_none() {
            return Err(SignalError::MissingStopPrice(self.kind));
        }
        Ok(())
    }
}

/// Kind of trading intent.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
    Close,
    LimitBuy,
    LimitSell,
    StopBuy,
    StopSell,
    StopLimitBuy,
    StopLimitSell,
}

impl SignalKind {
    /// Order side this signal maps to. `Hold` maps to none; `Close` derives its side from
    /// the current position at sizing time.
    pub fn side(&self) -> Option<Side> {
        match self {
            SignalKind::Buy
            | SignalKind::LimitBuy
            | SignalKind::StopBuy
            | SignalKind::StopLimitBuy => Some(Side::Buy),
            SignalKind::Sell
            | SignalKind::LimitSell
            | SignalKind::StopSell
            | SignalKind::StopLimitSell => Some(Side::Sell),
            SignalKind::Hold | SignalKind::Close => None,
        }
    }

    pub fn requires_limit_price(&self) -> bool {
        matches!(
            self,
            SignalKind::LimitBuy
                | SignalKind::LimitSell
                | SignalKind::StopLimitBuy
                | SignalKind::StopLimitSell
        )
    }

    pub fn requires_stop_price(&self) -> bool {
        matches!(
            self,
            SignalKind::StopBuy
                | SignalKind::StopSell
                | SignalKind::StopLimitBuy
                | SignalKind::StopLimitSell
        )
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalKind::Buy => "BUY",
            SignalKind::Sell => "SELL",
            SignalKind::Hold => "HOLD",
            SignalKind::Close => "CLOSE",
            SignalKind::LimitBuy => "LIMIT_BUY",
            SignalKind::LimitSell => "LIMIT_SELL",
            SignalKind::StopBuy => "STOP_BUY",
            SignalKind::StopSell => "STOP_SELL",
            SignalKind::StopLimitBuy => "STOP_LIMIT_BUY",
            SignalKind::StopLimitSell => "STOP_LIMIT_SELL",
        };
        f.write_str(name)
    }
}

/// Abstract quantity specification, resolved to a concrete order quantity by the
/// portfolio manager. At most one intent is set by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingIntent {
    /// Absolute quantity of units.
    Units(Decimal),
    /// Absolute notional value in account currency.
    Notional(Decimal),
    /// Fraction of current strategy equity.
    EquityPct(Decimal),
    /// Bring the position to this absolute quantity.
    TargetUnits(Decimal),
    /// Bring the position value to this absolute notional.
    TargetNotional(Decimal),
    /// Bring the position value to this fraction of strategy equity.
    TargetEquityPct(Decimal),
    /// Backtesting-library legacy form; interpreted as a fraction of strategy equity.
    LegacyFraction(Decimal),
    /// No sizing supplied; the portfolio manager applies its default.
    #[default]
    None,
}

/// Execution-style lifetime hint forwarded to the broker.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    GoodTilCancelled,
    ImmediateOrCancel,
    FillOrKill,
    Day,
}

/// A structurally invalid signal.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SignalError {
    #[error("signal price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("{0} signal requires a limit price")]
    MissingLimitPrice(SignalKind),

    #[error("{0} signal requires a stop price")]
    MissingStopPrice(SignalKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn market_signal_validates() {
        let signal = Signal::new(SignalKind::Buy, dec!(100), time())
            .with_sizing(SizingIntent::EquityPct(dec!(0.1)));
        assert!(signal.validate().is_ok());
    }

    #[test]
    fn non_positive_price_rejected() {
        let signal = Signal::new(SignalKind::Buy, Decimal::ZERO, time());
        assert!(matches!(
            signal.validate(),
            Err(SignalError::NonPositivePrice(_))
        ));
    }

    #[test]
    fn limit_kinds_require_limit_price() {
        let missing = Signal::new(SignalKind::LimitBuy, dec!(100), time());
        assert!(matches!(
            missing.validate(),
            Err(SignalError::MissingLimitPrice(SignalKind::LimitBuy))
        ));

        let present = Signal::new(SignalKind::LimitBuy, dec!(100), time())
            .with_limit_price(dec!(99.5));
        assert!(present.validate().is_ok());
    }

    #[test]
    fn stop_limit_requires_both_prices() {
        let signal = Signal::new(SignalKind::StopLimitSell, dec!(100), time())
            .with_limit_price(dec!(98));
        assert!(matches!(
            signal.validate(),
            Err(SignalError::MissingStopPrice(SignalKind::StopLimitSell))
        ));

        let complete = signal.with_stop_price(dec!(99));
        assert!(complete.validate().is_ok());
    }

    #[test]
    fn sizing_intent_serialises_snake_case() {
        let json = serde_json::to_string(&SizingIntent::EquityPct(dec!(0.25))).unwrap();
        assert_eq!(json, "{\"equity_pct\":\"0.25\"}");
    }
}
