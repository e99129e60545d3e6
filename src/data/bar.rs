use crate::types::{Granularity, Symbol};
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One OHLCV record for a `(symbol, granularity)` at a point in time.
///
/// Immutable once admitted to a buffer. `closed` marks the bar as the canonical close of its
/// period; providers that stream partial bars send `closed: false` updates which may later be
/// replaced by the closing bar at the same timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Constructor)]
pub struct Bar {
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub closed: bool,
}

impl Bar {
    /// Validate the OHLCV invariants: `low <= {open, close} <= high`, positive prices,
    /// non-negative volume.
    pub fn validate(&self) -> Result<(), BarError> {
        if self.low <= Decimal::ZERO {
            return Err(BarError::NonPositivePrice {
                symbol: self.symbol.clone(),
                time: self.time,
            });
        }
        if self.low > self.high {
            return Err(BarError::LowAboveHigh {
                symbol: self.symbol.clone(),
                time: self.time,
            });
        }
        if self.open < self.low
            || self.open > self.high
            || self.close < self.low
            || self.close > self.high
        {
            return Err(BarError::OpenCloseOutsideRange {
                symbol: self.symbol.clone(),
                time: self.time,
            });
        }
        if self.volume < Decimal::ZERO {
            return Err(BarError::NegativeVolume {
                symbol: self.symbol.clone(),
                time: self.time,
            });
        }
        Ok(())
    }
}

/// A bar that failed its OHLCV invariants on admission.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BarError {
    #[error("{symbol} bar at {time} has non-positive price")]
    NonPositivePrice { symbol: Symbol, time: DateTime<Utc> },

    #[error("{symbol} bar at {time} has low > high")]
    LowAboveHigh { symbol: Symbol, time: DateTime<Utc> },

    #[error("{symbol} bar at {time} has open/close outside [low, high]")]
    OpenCloseOutsideRange { symbol: Symbol, time: DateTime<Utc> },

    #[error("{symbol} bar at {time} has negative volume")]
    NegativeVolume { symbol: Symbol, time: DateTime<Utc> },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    /// Closed bar helper used across the data tests.
    pub(crate) fn bar(minute: u32, close: Decimal) -> Bar {
        Bar {
            symbol: Symbol::new("TEST"),
            granularity: Granularity::Minute1,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(100),
            closed: true,
        }
    }

    #[test]
    fn valid_bar_passes() {
        let mut candle = bar(0, dec!(100));
        candle.high = dec!(101);
        candle.low = dec!(99);
        assert!(candle.validate().is_ok());
    }

    #[test]
    fn low_above_high_rejected() {
        let mut candle = bar(0, dec!(100));
        candle.low = dec!(102);
        candle.high = dec!(101);
        candle.open = dec!(102);
        candle.close = dec!(102);
        assert!(matches!(
            candle.validate(),
            Err(BarError::LowAboveHigh { .. })
        ));
    }

    #[test]
    fn close_outside_range_rejected() {
        let mut candle = bar(0, dec!(100));
        candle.close = dec!(105);
        assert!(matches!(
            candle.validate(),
            Err(BarError::OpenCloseOutsideRange { .. })
        ));
    }

    #[test]
    fn negative_volume_rejected() {
        let mut candle = bar(0, dec!(100));
        candle.volume = dec!(-1);
        assert!(matches!(
            candle.validate(),
            Err(BarError::NegativeVolume { .. })
        ));
    }
}
