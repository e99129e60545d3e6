use crate::{
    clock::SharedClock,
    data::{
        bar::Bar,
        buffer::BarBuffer,
        error::DataError,
        provider::DataProvider,
        SubscriptionKey,
    },
    types::{Granularity, Symbol},
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use futures::StreamExt;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Base reconnect backoff for a dropped provider feed.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Reconnect backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Seed fetch attempts before the feed task is left to recover the subscription on its own.
const SEED_ATTEMPTS: u32 = 3;

/// Number of expected bar intervals without data before a subscription is considered stale.
const STALE_INTERVALS: i32 = 3;

/// Result of reading a strategy's bar window.
#[derive(Debug, Clone)]
pub enum WindowSnapshot {
    /// Window of at least `lookback` bars (or the provider's full history if shorter),
    /// oldest first.
    Ready(Arc<[Bar]>),
    /// Fewer bars buffered than the subscription needs; warmup is still in progress.
    NotReady { have: usize, need: usize },
    /// No bar admitted within `STALE_INTERVALS` expected periods.
    Stale {
        last_bar: Option<DateTime<Utc>>,
        elapsed: TimeDelta,
    },
    /// The provider rejected this subscription; fatal for every subscriber of the key.
    Failed(DataError),
}

/// Handle to a live subscription. Cloning is not supported - each subscriber holds its own
/// handle, and dropping the last handle for a key cancels the feed and releases the buffer.
#[derive(Debug)]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    lookback: usize,
    inner: Arc<Inner>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}

/// Owns one [`BarBuffer`] per `(provider, symbol, granularity)`, the provider pool, and the
/// per-subscription feed tasks.
///
/// Subscriptions are de-duplicated: two strategies subscribing to the same key share one
/// buffer and one feed. Buffers are seeded from a historical fetch on first subscription,
/// then kept current by the provider's realtime feed; disconnects reconnect with exponential
/// backoff and the gap is backfilled from a historical query.
#[derive(Debug, Clone)]
pub struct DataManager {
    inner: Arc<Inner>,
}

struct Inner {
    clock: SharedClock,
    providers: parking_lot::RwLock<FnvHashMap<String, Arc<dyn DataProvider>>>,
    subscriptions: parking_lot::Mutex<FnvHashMap<SubscriptionKey, SubscriptionState>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManagerInner")
            .field("providers", &self.providers.read().keys().collect::<Vec<_>>())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

struct SubscriptionState {
    shared: Arc<SubscriptionShared>,
    refcount: usize,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

/// State shared between the feed task and snapshot readers.
struct SubscriptionShared {
    buffer: parking_lot::RwLock<BarBuffer>,
    /// Provider returned less history than requested; warmup completes with what exists.
    history_exhausted: AtomicBool,
    available_history: AtomicUsize,
    failure: parking_lot::Mutex<Option<DataError>>,
}

impl SubscriptionShared {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: parking_lot::RwLock::new(BarBuffer::new(capacity)),
            history_exhausted: AtomicBool::new(false),
            available_history: AtomicUsize::new(0),
            failure: parking_lot::Mutex::new(None),
        }
    }

    fn fail(&self, error: DataError) {
        *self.failure.lock() = Some(error);
    }
}

impl DataManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                providers: parking_lot::RwLock::new(FnvHashMap::default()),
                subscriptions: parking_lot::Mutex::new(FnvHashMap::default()),
            }),
        }
    }

    /// Register a provider adapter under its [`DataProvider::name`].
    pub fn register_provider(&self, provider: Arc<dyn DataProvider>) {
        let name = provider.name().to_owned();
        self.inner.providers.write().insert(name, provider);
    }

    /// Names of every registered provider, for deploy validation.
    pub fn provider_names(&self) -> Vec<String> {
        self.inner.providers.read().keys().cloned().collect()
    }

    /// Subscribe to `(provider, symbol, granularity)` with the given lookback.
    ///
    /// Idempotent per key: an existing buffer has its capacity grown to
    /// `max(existing, lookback)` and its history topped up if the new subscriber needs a
    /// longer window. The first subscription seeds the buffer from a historical fetch and
    /// starts the feed task.
    pub async fn subscribe(
        &self,
        provider: &str,
        symbol: Symbol,
        granularity: Granularity,
        lookback: usize,
    ) -> Result<SubscriptionHandle, DataError> {
        let lookback = lookback.max(1);
        let provider = self
            .inner
            .providers
            .read()
            .get(provider)
            .cloned()
            .ok_or_else(|| DataError::UnknownProvider(provider.to_owned()))?;

        let key = SubscriptionKey::new(provider.name(), symbol.clone(), granularity);

        let (shared, is_new) = {
            let mut subscriptions = self.inner.subscriptions.lock();
            match subscriptions.get_mut(&key) {
                Some(state) => {
                    state.refcount += 1;
                    state.shared.buffer.write().grow_capacity(lookback);
                    (Arc::clone(&state.shared), false)
                }
                None => {
                    let shared = Arc::new(SubscriptionShared::new(lookback));
                    let (shutdown_tx, shutdown_rx) = oneshot::channel();
                    subscriptions.insert(
                        key.clone(),
                        SubscriptionState {
                            shared: Arc::clone(&shared),
                            refcount: 1,
                            shutdown_tx: Some(shutdown_tx),
                        },
                    );

                    tokio::spawn(run_feed(
                        self.inner.clock.clone(),
                        Arc::clone(&provider),
                        key.clone(),
                        Arc::clone(&shared),
                        shutdown_rx,
                    ));

                    (shared, true)
                }
            }
        };

        let needs_history = is_new || shared.buffer.read().len() < lookback;
        if needs_history && !shared.history_exhausted.load(Ordering::Acquire) {
            seed_history(&provider, &key, &shared, lookback).await;
        }

        info!(
            provider = %key.provider,
            symbol = %key.symbol,
            granularity = %key.granularity,
            lookback,
            shared = !is_new,
            "subscribed"
        );

        Ok(SubscriptionHandle {
            key,
            lookback,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Read the subscription's current window.
    pub fn snapshot(&self, handle: &SubscriptionHandle) -> WindowSnapshot {
        let shared = {
            let subscriptions = self.inner.subscriptions.lock();
            match subscriptions.get(&handle.key) {
                Some(state) => Arc::clone(&state.shared),
                None => {
                    return WindowSnapshot::Failed(DataError::StreamEnded);
                }
            }
        };

        if let Some(failure) = shared.failure.lock().clone() {
            return WindowSnapshot::Failed(failure);
        }

        let buffer = shared.buffer.read();
        let have = buffer.len();
        let need = if shared.history_exhausted.load(Ordering::Acquire) {
            handle
                .lookback
                .min(shared.available_history.load(Ordering::Acquire).max(1))
        } else {
            handle.lookback
        };

        if have < need {
            return WindowSnapshot::NotReady { have, need };
        }

        let last_bar = buffer.tail_time();
        if let Some(last) = last_bar {
            let elapsed = self.inner.clock.now() - last;
            if elapsed > handle.key.granularity.duration() * STALE_INTERVALS {
                return WindowSnapshot::Stale {
                    last_bar,
                    elapsed,
                };
            }
        }

        let snapshot = buffer.snapshot();
        let window_start = snapshot.len().saturating_sub(handle.lookback);
        if window_start == 0 {
            WindowSnapshot::Ready(snapshot)
        } else {
            WindowSnapshot::Ready(snapshot[window_start..].iter().cloned().collect())
        }
    }
}

impl Inner {
    fn release(&self, key: &SubscriptionKey) {
        let mut subscriptions = self.subscriptions.lock();
        let Some(state) = subscriptions.get_mut(key) else {
            return;
        };

        state.refcount -= 1;
        if state.refcount == 0 {
            let state = subscriptions.remove(key).expect("state exists");
            drop(state.shutdown_tx);
            debug!(
                provider = %key.provider,
                symbol = %key.symbol,
                granularity = %key.granularity,
                "last subscriber released - feed cancelled"
            );
        }
    }
}

/// Seed (or top up) the buffer from a historical fetch, retrying transient failures.
async fn seed_history(
    provider: &Arc<dyn DataProvider>,
    key: &SubscriptionKey,
    shared: &Arc<SubscriptionShared>,
    lookback: usize,
) {
    let mut backoff = BACKOFF_BASE;
    for attempt in 1..=SEED_ATTEMPTS {
        match provider
            .fetch_history(&key.symbol, key.granularity, lookback)
            .await
        {
            Ok(bars) => {
                if bars.len() < lookback {
                    shared
                        .available_history
                        .store(bars.len(), Ordering::Release);
                    shared.history_exhausted.store(true, Ordering::Release);
                }
                let mut buffer = shared.buffer.write();
                merge_bars(&mut buffer, bars);
                return;
            }
            Err(err) if err.is_transient() && attempt < SEED_ATTEMPTS => {
                warn!(symbol = %key.symbol, %err, attempt, "history seed failed - retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            Err(err) if err.is_transient() => {
                // Feed task backfills once the realtime stream connects
                warn!(symbol = %key.symbol, %err, "history seed failed - deferring to feed");
                return;
            }
            Err(err) => {
                error!(symbol = %key.symbol, %err, "history seed rejected");
                shared.fail(err);
                return;
            }
        }
    }
}

/// Merge fetched bars into the buffer.
///
/// Bars newer than the tail append through the normal admission path. If the fetch reaches
/// further back than the buffer head (a longer-lookback subscriber arrived), the buffer is
/// rebuilt from the union, preferring already-admitted bars on timestamp collision.
fn merge_bars(buffer: &mut BarBuffer, incoming: Vec<Bar>) {
    let head_time = buffer.snapshot().first().map(|bar| bar.time);
    let needs_rebuild = match (incoming.first(), head_time) {
        (Some(first), Some(head)) => first.time < head,
        _ => false,
    };

    if !needs_rebuild {
        for bar in incoming {
            if let Err(err) = buffer.admit(bar) {
                warn!(%err, "historical bar failed validation - skipped");
            }
        }
        return;
    }

    let mut union: BTreeMap<DateTime<Utc>, Bar> = buffer
        .snapshot()
        .iter()
        .cloned()
        .map(|bar| (bar.time, bar))
        .collect();
    for bar in incoming {
        union.entry(bar.time).or_insert(bar);
    }

    let mut rebuilt = BarBuffer::new(buffer.capacity());
    for (_, bar) in union {
        if let Err(err) = rebuilt.admit(bar) {
            warn!(%err, "historical bar failed validation - skipped");
        }
    }
    *buffer = rebuilt;
}

/// Feed task: one per subscription key.
///
/// Consumes the provider's realtime stream into the shared buffer. Transient errors and
/// stream ends reconnect with exponential backoff (cap 60s) and backfill the gap from a
/// historical query; permanent errors mark the subscription failed and end the task.
async fn run_feed(
    clock: SharedClock,
    provider: Arc<dyn DataProvider>,
    key: SubscriptionKey,
    shared: Arc<SubscriptionShared>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut backoff = BACKOFF_BASE;
    let mut first_connect = true;

    loop {
        let subscribed = tokio::select! {
            result = provider.subscribe(&key.symbol, key.granularity) => result,
            _ = &mut shutdown_rx => return,
        };

        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(err) if err.is_transient() => {
                warn!(symbol = %key.symbol, %err, "feed connect failed - backing off");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = &mut shutdown_rx => return,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
            Err(err) => {
                error!(symbol = %key.symbol, %err, "feed rejected - subscription failed");
                shared.fail(err);
                return;
            }
        };

        backoff = BACKOFF_BASE;

        // Backfill whatever the disconnect (or a deferred seed) missed
        if !first_connect || shared.buffer.read().is_empty() {
            backfill_gap(&clock, &provider, &key, &shared).await;
        }
        first_connect = false;

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = &mut shutdown_rx => return,
            };

            match item {
                Some(Ok(bar)) => {
                    let mut buffer = shared.buffer.write();
                    match buffer.admit(bar) {
                        Ok(verdict) => debug!(symbol = %key.symbol, ?verdict, "bar admitted"),
                        Err(err) => warn!(symbol = %key.symbol, %err, "bar rejected"),
                    }
                }
                Some(Err(err)) if err.is_transient() => {
                    warn!(symbol = %key.symbol, %err, "feed error - reconnecting");
                    break;
                }
                Some(Err(err)) => {
                    error!(symbol = %key.symbol, %err, "feed fatal - subscription failed");
                    shared.fail(err);
                    return;
                }
                None => {
                    warn!(symbol = %key.symbol, "feed ended - reconnecting");
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = &mut shutdown_rx => return,
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// Fetch the missing `(last_buffered, now]` range as a historical query and merge it.
async fn backfill_gap(
    clock: &SharedClock,
    provider: &Arc<dyn DataProvider>,
    key: &SubscriptionKey,
    shared: &Arc<SubscriptionShared>,
) {
    let (capacity, last) = {
        let buffer = shared.buffer.read();
        (buffer.capacity(), buffer.tail_time())
    };

    let limit = match last {
        Some(last) => {
            let period = key.granularity.duration().num_seconds().max(1);
            let missing = (clock.now() - last).num_seconds() / period;
            if missing < 1 {
                return;
            }
            // One extra period of margin around the boundary
            usize::try_from(missing + 1).unwrap_or(capacity).min(capacity)
        }
        None => capacity,
    };

    match provider.fetch_history(&key.symbol, key.granularity, limit).await {
        Ok(bars) => {
            let count = bars.len();
            let mut buffer = shared.buffer.write();
            merge_bars(&mut buffer, bars);
            debug!(symbol = %key.symbol, count, "gap backfilled");
        }
        Err(err) if err.is_transient() => {
            warn!(symbol = %key.symbol, %err, "gap backfill failed - feed continues");
        }
        Err(err) => {
            error!(symbol = %key.symbol, %err, "gap backfill rejected");
            shared.fail(err);
        }
    }
}
