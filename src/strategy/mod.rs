use crate::{data::bar::Bar, strategy::error::StrategyError};
use async_trait::async_trait;
use std::time::Duration;

/// Defines all possible strategy-evaluation errors.
pub mod error;

/// Named evaluator factories registered at build time.
pub mod registry;

/// Engine-agnostic signal model.
pub mod signal;

/// Built-in moving-average crossover evaluator.
pub mod sma;

pub use registry::{EngineInfo, EngineRegistry};
pub use signal::{Signal, SignalKind, SizingIntent, TimeInForce};

/// Default wall-clock bound on a single evaluator call.
pub const DEFAULT_EVALUATOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine-specific strategy parameters, passed through the deploy spec verbatim.
pub type EngineParams = serde_json::Map<String, serde_json::Value>;

/// Evaluates a strategy over a window of bars and returns a [`Signal`].
///
/// The evaluator encapsulates the backtesting library's notion of "strategy context": it
/// may carry opaque per-strategy state across calls. Calls for a single strategy are always
/// serial - each evaluator instance is owned by exactly one runner.
#[async_trait]
pub trait SignalEvaluator: Send {
    async fn evaluate(
        &mut self,
        window: &[Bar],
        params: &EngineParams,
    ) -> Result<Signal, StrategyError>;
}

/// Thin dispatcher over a [`SignalEvaluator`] applying the per-call timeout and validating
/// the returned signal.
pub struct SignalEngine {
    evaluator: Box<dyn SignalEvaluator>,
    timeout: Duration,
}

impl std::fmt::Debug for SignalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalEngine")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SignalEngine {
    pub fn new(evaluator: Box<dyn SignalEvaluator>, timeout: Duration) -> Self {
        Self { evaluator, timeout }
    }

    /// Evaluate the strategy over `window`, bounded by the configured timeout.
    pub async fn evaluate(
        &mut self,
        window: &[Bar],
        params: &EngineParams,
    ) -> Result<Signal, StrategyError> {
        let signal = tokio::time::timeout(self.timeout, self.evaluator.evaluate(window, params))
            .await
            .map_err(|_| StrategyError::EvaluatorTimeout {
                timeout_secs: self.timeout.as_secs(),
            })??;

        signal.validate()?;
        Ok(signal)
    }
}
