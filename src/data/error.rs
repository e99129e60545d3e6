use crate::{data::bar::BarError, types::Symbol};
use thiserror::Error;

/// Defines all possible market data errors.
///
/// [`DataError::is_transient`] partitions the taxonomy: transient errors are retried with
/// bounded exponential backoff by the owning feed task; permanent errors are surfaced to
/// every subscriber as a fatal per-subscription error.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DataError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("no data provider registered under name: {0}")]
    UnknownProvider(String),

    #[error("provider does not recognise symbol: {0}")]
    UnknownSymbol(Symbol),

    #[error("provider rejected subscription for {symbol}: {reason}")]
    Rejected { symbol: Symbol, reason: String },

    #[error("realtime feed ended")]
    StreamEnded,

    #[error("invalid bar: {0}")]
    InvalidBar(#[from] BarError),

    #[error("no bar received within {elapsed_secs}s (stale feed)")]
    Stale { elapsed_secs: i64 },

    #[error("warmup did not complete within {timeout_secs}s")]
    WarmupTimeout { timeout_secs: u64 },
}

impl DataError {
    /// Whether the owning feed should retry (with backoff) rather than fail the subscription.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::Transient(_) | DataError::StreamEnded | DataError::Stale { .. }
        )
    }
}
