use crate::types::Granularity;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Default settle delay applied after each bar boundary, giving the provider time to deliver
/// the closing bar before the strategy evaluates.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Defines how the runtime determines the current time.
///
/// A single clock instance is injected everywhere time is read. Tests substitute a
/// [`ManualClock`] to make the runtime deterministic.
pub trait RuntimeClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Process-wide shared clock handle.
pub type SharedClock = Arc<dyn RuntimeClock>;

/// Live clock using `Utc::now()`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct LiveClock;

impl RuntimeClock for LiveClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<parking_lot::RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(start)),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.inner.write() = time;
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut lock = self.inner.write();
        *lock += delta;
    }
}

impl RuntimeClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.read()
    }
}

/// A scheduled evaluation tick for one strategy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct Tick {
    /// Monotonic per-strategy tick sequence.
    pub sequence: u64,
    /// Bar boundary this tick fired for.
    pub due: DateTime<Utc>,
    /// Clock time when the tick was emitted (boundary + settle delay).
    pub fired: DateTime<Utc>,
}

/// Handle to a spawned [`TickScheduler`] task.
///
/// Dropping the handle (or calling [`SchedulerHandle::cancel`]) cancels the tick source.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    dropped: Arc<AtomicU64>,
}

impl SchedulerHandle {
    /// Cancel the tick source. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Number of ticks dropped because the previous tick was still executing.
    pub fn ticks_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Periodic tick emitter keyed by a strategy's bar granularity.
///
/// Ticks are emitted at each wall-clock bar boundary plus `settle_delay`. The tick channel
/// has capacity one, so a tick that arrives while the previous tick is still executing is
/// dropped with a metric incremented - ticks for a given strategy are totally ordered and
/// never emitted concurrently with themselves.
#[derive(Debug)]
pub struct TickScheduler;

impl TickScheduler {
    pub fn spawn(
        clock: SharedClock,
        granularity: Granularity,
        settle_delay: Duration,
        tick_tx: mpsc::Sender<Tick>,
    ) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_task = Arc::clone(&dropped);

        tokio::spawn(async move {
            let mut sequence = 0u64;
            loop {
                let now = clock.now();
                let due = granularity.next_boundary(now);
                let fire_at = due + TimeDelta::from_std(settle_delay).unwrap_or_default();
                let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let tick = Tick {
                            sequence,
                            due,
                            fired: clock.now(),
                        };
                        sequence += 1;

                        match tick_tx.try_send(tick) {
                            Ok(()) => debug!(?tick, %granularity, "tick emitted"),
                            Err(mpsc::error::TrySendError::Full(tick)) => {
                                dropped_task.fetch_add(1, Ordering::Relaxed);
                                warn!(?tick, "tick dropped - previous tick still executing");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        SchedulerHandle {
            shutdown_tx: Some(shutdown_tx),
            dropped,
        }
    }
}
