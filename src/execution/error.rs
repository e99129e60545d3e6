use thiserror::Error;

/// Defines all possible broker / execution errors.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ExecutionError {
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("broker RPC exceeded {timeout_secs}s timeout")]
    Timeout { timeout_secs: u64 },

    #[error("broker rejected order: {0}")]
    Rejected(String),

    #[error("broker connection lost")]
    ConnectionLost,

    #[error("broker does not know order: {0}")]
    UnknownOrder(String),

    #[error("no broker registered under name: {0}")]
    UnknownBroker(String),
}

impl ExecutionError {
    /// Whether the caller should retry (or reconcile) rather than fail the order outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutionError::Transient(_)
                | ExecutionError::Timeout { .. }
                | ExecutionError::ConnectionLost
        )
    }
}
