use crate::{
    data::{bar::Bar, error::DataError, provider::{BarStream, DataProvider}},
    types::{Granularity, Symbol},
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// In-memory [`DataProvider`] replaying scripted bars.
///
/// Backs deterministic runtime tests and offline paper sessions: history is loaded up front
/// (and extended by every pushed live bar, so reconnect backfill sees the full series), and
/// live bars are pushed explicitly by the driver.
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    name: String,
    inner: Arc<parking_lot::Mutex<ReplayInner>>,
}

#[derive(Debug, Default)]
struct ReplayInner {
    series: HashMap<(Symbol, Granularity), SeriesState>,
    subscribe_calls: u64,
}

#[derive(Debug, Default)]
struct SeriesState {
    history: Vec<Bar>,
    live_txs: Vec<mpsc::UnboundedSender<Result<Bar, DataError>>>,
    rejection: Option<DataError>,
}

impl ReplayProvider {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(parking_lot::Mutex::new(ReplayInner::default())),
        }
    }

    /// Load (or extend) the historical series for `(symbol, granularity)`.
    pub fn load_history(&self, symbol: Symbol, granularity: Granularity, bars: Vec<Bar>) {
        let mut inner = self.inner.lock();
        inner
            .series
            .entry((symbol, granularity))
            .or_default()
            .history
            .extend(bars);
    }

    /// Script a permanent rejection for `(symbol, granularity)` subscriptions.
    pub fn reject(&self, symbol: Symbol, granularity: Granularity, error: DataError) {
        let mut inner = self.inner.lock();
        inner
            .series
            .entry((symbol, granularity))
            .or_default()
            .rejection = Some(error);
    }

    /// Push a live bar to every open subscription of its series, recording it in history.
    pub fn push_bar(&self, bar: Bar) {
        let mut inner = self.inner.lock();
        let series = inner
            .series
            .entry((bar.symbol.clone(), bar.granularity))
            .or_default();
        series.history.push(bar.clone());
        series
            .live_txs
            .retain(|tx| tx.send(Ok(bar.clone())).is_ok());
    }

    /// Push a stream error (eg/ a transient disconnect) to every open subscription.
    pub fn push_error(&self, symbol: Symbol, granularity: Granularity, error: DataError) {
        let mut inner = self.inner.lock();
        if let Some(series) = inner.series.get_mut(&(symbol, granularity)) {
            series
                .live_txs
                .retain(|tx| tx.send(Err(error.clone())).is_ok());
        }
    }

    /// Drop every open subscription stream, simulating a feed disconnect.
    pub fn disconnect(&self, symbol: Symbol, granularity: Granularity) {
        let mut inner = self.inner.lock();
        if let Some(series) = inner.series.get_mut(&(symbol, granularity)) {
            series.live_txs.clear();
        }
    }

    /// Number of currently open live subscriptions for the series.
    pub fn live_subscribers(&self, symbol: &Symbol, granularity: Granularity) -> usize {
        let mut inner = self.inner.lock();
        match inner.series.get_mut(&(symbol.clone(), granularity)) {
            Some(series) => {
                series.live_txs.retain(|tx| !tx.is_closed());
                series.live_txs.len()
            }
            None => 0,
        }
    }

    /// Number of times [`DataProvider::subscribe`] was called.
    pub fn subscribe_calls(&self) -> u64 {
        self.inner.lock().subscribe_calls
    }
}

#[async_trait]
impl DataProvider for ReplayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_history(
        &self,
        symbol: &Symbol,
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<Bar>, DataError> {
        let inner = self.inner.lock();
        let Some(series) = inner.series.get(&(symbol.clone(), granularity)) else {
            return Err(DataError::UnknownSymbol(symbol.clone()));
        };
        if let Some(rejection) = &series.rejection {
            return Err(rejection.clone());
        }

        let start = series.history.len().saturating_sub(limit);
        Ok(series.history[start..].to_vec())
    }

    async fn subscribe(
        &self,
        symbol: &Symbol,
        granularity: Granularity,
    ) -> Result<BarStream, DataError> {
        let mut inner = self.inner.lock();
        inner.subscribe_calls += 1;

        let Some(series) = inner.series.get_mut(&(symbol.clone(), granularity)) else {
            return Err(DataError::UnknownSymbol(symbol.clone()));
        };
        if let Some(rejection) = &series.rejection {
            return Err(rejection.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        series.live_txs.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
