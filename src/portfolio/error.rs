use crate::error::InvariantViolation;
use thiserror::Error;

/// Defines all possible portfolio errors.
///
/// Sizing rejections are not errors - they are observability events returned as
/// [`Rejection`](super::Rejection) values. What remains here is genuinely exceptional.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PortfolioError {
    #[error("ledger invariant: {0}")]
    Invariant(#[from] InvariantViolation),
}
