use crate::types::StrategyId;
use thiserror::Error;

/// Deploy-spec and configuration errors.
///
/// Surfaced at deploy; a spec that fails validation never reaches the runtime. Maps to
/// process exit code 1 at the daemon boundary.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("strategy file not found: {0}")]
    StrategyFileMissing(String),

    #[error("no engine specified and auto-detection is ambiguous: {0}")]
    EngineNotSpecified(String),

    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    #[error("engine init failed: {0}")]
    EngineInit(String),

    #[error("unknown data provider: {0}")]
    UnknownProvider(String),

    #[error("unknown broker: {0}")]
    UnknownBroker(String),

    #[error("no symbols specified")]
    NoSymbols,

    #[error("lookback must be at least 1")]
    InvalidLookback,

    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),

    #[error("allocation {requested} exceeds unallocated equity {available}")]
    AllocationExceedsEquity { requested: String, available: String },

    #[error("broker incapable: {0}")]
    BrokerIncapable(String),

    #[error("strategy id already deployed: {0}")]
    DuplicateStrategyId(StrategyId),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(StrategyId),

    #[error("strategy {0} is not in a terminal state")]
    StrategyStillActive(StrategyId),

    #[error("broker account unavailable: {0}")]
    AccountUnavailable(String),

    #[error("credential store: {0}")]
    Credentials(String),

    #[error("strategy upload: {0}")]
    Upload(String),
}
