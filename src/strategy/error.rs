use crate::strategy::signal::SignalError;
use thiserror::Error;

/// Defines all possible strategy-evaluation errors.
///
/// Strategy errors are isolated to the owning runner: each increments a per-strategy error
/// counter, and enough consecutive errors transition the runner to `Errored`.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StrategyError {
    #[error("evaluator: {0}")]
    Evaluator(String),

    #[error("evaluator exceeded {timeout_secs}s timeout")]
    EvaluatorTimeout { timeout_secs: u64 },

    #[error("invalid signal: {0}")]
    InvalidSignal(#[from] SignalError),

    #[error("no engine registered under name: {0}")]
    UnknownEngine(String),

    #[error("invalid engine params: {0}")]
    InvalidParams(String),
}
