use crate::{
    data::error::DataError, execution::error::ExecutionError, portfolio::error::PortfolioError,
    strategy::error::StrategyError, system::error::ConfigError,
};
use thiserror::Error;

/// Process exit code for a clean shutdown.
pub const EXIT_CLEAN: i32 = 0;

/// Process exit code for a configuration or deploy-spec validation failure.
pub const EXIT_CONFIG: i32 = 1;

/// Process exit code for an unrecoverable runtime error (eg/ an [`InvariantViolation`]).
pub const EXIT_RUNTIME: i32 = 2;

/// Top-level StrateQueue error taxonomy.
///
/// Transient upstream errors are retried where they occur and never surface here. Permanent
/// upstream and strategy errors are isolated to the owning strategy. An
/// [`StrateQueueError::InvariantViolation`] indicates a runtime bug and is fatal to the whole
/// process.
#[derive(Debug, Clone, Error)]
pub enum StrateQueueError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("market data: {0}")]
    Data(#[from] DataError),

    #[error("strategy: {0}")]
    Strategy(#[from] StrategyError),

    #[error("portfolio: {0}")]
    Portfolio(#[from] PortfolioError),

    #[error("execution: {0}")]
    Execution(#[from] ExecutionError),

    #[error("invariant violated: {0}")]
    InvariantViolation(#[from] InvariantViolation),

    #[error("channel receiver dropped")]
    RxDropped(#[from] RxDropped),

    #[error("JoinError: {0}")]
    JoinError(String),
}

impl StrateQueueError {
    /// Process exit code this error maps to at the daemon boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            StrateQueueError::Config(_) => EXIT_CONFIG,
            _ => EXIT_RUNTIME,
        }
    }
}

/// Ledger arithmetic, order state ordering, or buffer monotonicity broke.
///
/// Better to crash and restart cleanly than to keep trading on corrupt state.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{component}: {detail}")]
pub struct InvariantViolation {
    pub component: &'static str,
    pub detail: String,
}

impl InvariantViolation {
    pub fn new<S: Into<String>>(component: &'static str, detail: S) -> Self {
        Self {
            component,
            detail: detail.into(),
        }
    }
}

/// A channel receiver was dropped while the transmitter was still in use.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("RxDropped")]
pub struct RxDropped;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RxDropped {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StrateQueueError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::RxDropped(RxDropped)
    }
}

impl From<tokio::task::JoinError> for StrateQueueError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::JoinError(format!("{value:?}"))
    }
}
