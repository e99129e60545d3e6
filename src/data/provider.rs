use crate::{
    data::{bar::Bar, error::DataError},
    types::{Granularity, Symbol},
};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of realtime bars (or transient errors) for one subscription.
pub type BarStream = BoxStream<'static, Result<Bar, DataError>>;

/// Market data provider adapter.
///
/// Implementations are registered with the
/// [`DataManager`](crate::data::manager::DataManager) by name and resolved at deploy. The
/// manager owns the provider pool; strategy runners never touch a provider directly.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Stable provider name used in subscription keys and deploy specs.
    fn name(&self) -> &str;

    /// Fetch up to `limit` most recent historical bars, oldest first.
    ///
    /// A provider with less history than requested returns what it has; the caller treats
    /// the shortfall as "history exhausted", not an error.
    async fn fetch_history(
        &self,
        symbol: &Symbol,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Bar>, DataError>;

    /// Open the realtime feed for `(symbol, granularity)`.
    async fn subscribe(
        &self,
        symbol: &Symbol,
        granularity: Granularity,
    ) -> Result<BarStream, DataError>;
}
