use crate::types::{Granularity, Symbol};
use serde::{Deserialize, Serialize};

/// OHLCV bar model and admission invariants.
pub mod bar;

/// Capacity-bounded per-subscription bar ring buffer.
pub mod buffer;

/// Defines all possible market data errors.
pub mod error;

/// Subscription lifecycle, feed tasks, reconnect & backfill.
pub mod manager;

/// The `DataProvider` adapter interface consumed by the [`manager::DataManager`].
pub mod provider;

/// Scripted in-memory provider for deterministic tests and offline sessions.
pub mod replay;

pub use bar::Bar;
pub use buffer::{Admitted, BarBuffer};
pub use error::DataError;
pub use manager::{DataManager, SubscriptionHandle, WindowSnapshot};
pub use provider::{BarStream, DataProvider};
pub use replay::ReplayProvider;

/// Identity of a shared bar buffer and its feed.
///
/// Two strategies subscribing to the same key share one buffer and one feed regardless of
/// provider-adapter instances.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct SubscriptionKey {
    pub provider: String,
    pub symbol: Symbol,
    pub granularity: Granularity,
}

impl SubscriptionKey {
    pub fn new<P: Into<String>>(provider: P, symbol: Symbol, granularity: Granularity) -> Self {
        Self {
            provider: provider.into(),
            symbol,
            granularity,
        }
    }
}
