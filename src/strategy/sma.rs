use crate::{
    data::bar::Bar,
    strategy::{
        error::StrategyError,
        signal::{Signal, SignalKind},
        EngineParams, SignalEvaluator,
    },
};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Simple moving-average crossover evaluator.
///
/// Emits `BUY` when the fast average crosses above the slow average and `CLOSE` when it
/// crosses back below; everything else is `HOLD`. Ships as the registry's built-in engine
/// and doubles as the deterministic workhorse for runtime tests.
#[derive(Debug)]
pub struct SmaCrossover {
    fast: usize,
    slow: usize,
    /// Relation observed on the previous evaluation; crossovers are edges, not levels.
    fast_was_above: Option<bool>,
}

impl SmaCrossover {
    pub fn new(fast: usize, slow: usize) -> Result<Self, StrategyError> {
        if fast == 0 || slow == 0 || fast >= slow {
            return Err(StrategyError::InvalidParams(format!(
                "sma_crossover requires 0 < fast < slow, got fast={fast} slow={slow}"
            )));
        }
        Ok(Self {
            fast,
            slow,
            fast_was_above: None,
        })
    }

    /// Factory registered under `sma_crossover`. Params: `fast` (default 10), `slow`
    /// (default 30).
    pub fn from_params(params: &EngineParams) -> Result<Box<dyn SignalEvaluator>, StrategyError> {
        let fast = param_usize(params, "fast")?.unwrap_or(10);
        let slow = param_usize(params, "slow")?.unwrap_or(30);
        Ok(Box::new(Self::new(fast, slow)?))
    }
}

fn param_usize(params: &EngineParams, key: &str) -> Result<Option<usize>, StrategyError> {
    match params.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| {
                StrategyError::InvalidParams(format!("{key} must be a positive integer"))
            }),
    }
}

fn sma(window: &[Bar], periods: usize) -> Decimal {
    let tail = &window[window.len() - periods..];
    let sum: Decimal = tail.iter().map(|bar| bar.close).sum();
    sum / Decimal::from(periods)
}

#[async_trait]
impl SignalEvaluator for SmaCrossover {
    async fn evaluate(
        &mut self,
        window: &[Bar],
        _: &EngineParams,
    ) -> Result<Signal, StrategyError> {
        let last = window
            .last()
            .ok_or_else(|| StrategyError::Evaluator("empty window".to_owned()))?;

        if window.len() < self.slow {
            return Ok(Signal::hold(last.close, last.time));
        }

        let fast = sma(window, self.fast);
        let slow = sma(window, self.slow);
        let above = fast > slow;
        let crossed = self.fast_was_above.replace(above);

        let kind = match (crossed, above) {
            (Some(false), true) => SignalKind::Buy,
            (Some(true), false) => SignalKind::Close,
            _ => SignalKind::Hold,
        };

        Ok(Signal::new(kind, last.close, last.time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Granularity, Symbol};
    use chrono::{TimeDelta, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn window(closes: &[i64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(index, close)| {
                let close = Decimal::from(*close);
                Bar {
                    symbol: Symbol::new("TEST"),
                    granularity: Granularity::Minute1,
                    time: start + TimeDelta::minutes(index as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: dec!(1),
                    closed: true,
                }
            })
            .collect()
    }

    #[test]
    fn rejects_degenerate_periods() {
        assert!(SmaCrossover::new(10, 10).is_err());
        assert!(SmaCrossover::new(0, 10).is_err());
        assert!(SmaCrossover::new(2, 5).is_ok());
    }

    #[tokio::test]
    async fn holds_until_window_covers_slow_period() {
        let mut evaluator = SmaCrossover::new(2, 5).unwrap();
        let bars = window(&[100, 101, 102]);

        let signal = evaluator
            .evaluate(&bars, &EngineParams::new())
            .await
            .unwrap();
        assert_eq!(signal.kind, SignalKind::Hold);
    }

    #[tokio::test]
    async fn buys_on_golden_cross_and_closes_on_death_cross() {
        let mut evaluator = SmaCrossover::new(2, 4).unwrap();
        let params = EngineParams::new();

        // Downtrend: fast below slow
        let signal = evaluator
            .evaluate(&window(&[110, 108, 106, 104]), &params)
            .await
            .unwrap();
        assert_eq!(signal.kind, SignalKind::Hold);

        // Sharp reversal: fast crosses above
        let signal = evaluator
            .evaluate(&window(&[108, 106, 104, 120]), &params)
            .await
            .unwrap();
        assert_eq!(signal.kind, SignalKind::Buy);

        // Collapse: fast crosses back below
        let signal = evaluator
            .evaluate(&window(&[106, 104, 120, 80]), &params)
            .await
            .unwrap();
        assert_eq!(signal.kind, SignalKind::Close);
    }

    #[tokio::test]
    async fn no_repeat_signal_while_relation_unchanged() {
        let mut evaluator = SmaCrossover::new(2, 4).unwrap();
        let params = EngineParams::new();

        evaluator
            .evaluate(&window(&[110, 108, 106, 104]), &params)
            .await
            .unwrap();
        let cross = evaluator
            .evaluate(&window(&[108, 106, 104, 120]), &params)
            .await
            .unwrap();
        assert_eq!(cross.kind, SignalKind::Buy);

        let still_above = evaluator
            .evaluate(&window(&[106, 104, 120, 125]), &params)
            .await
            .unwrap();
        assert_eq!(still_above.kind, SignalKind::Hold);
    }
}
