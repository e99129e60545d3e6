#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments)]

//! # StrateQueue
//! StrateQueue is a live trading runtime: it takes strategies authored against backtesting
//! libraries and runs them against live market data, producing a stream of trading signals
//! and, optionally, routing those signals as orders to a brokerage.
//!
//! The runtime is a single-process daemon organised as a set of long-lived tokio tasks
//! connected by typed channels:
//! * `DataManager` ingests bars from pluggable market-data providers into shared ring buffers.
//! * `StrategyRunner`s drive per-strategy signal extraction over sliding windows of those bars.
//! * `PortfolioManager` translates engine-agnostic signals into sized, capability-checked orders.
//! * `OrderGateway` owns all broker I/O, tracks order lifecycles and applies fills at-most-once.
//! * `TearSheetGenerator` maintains rolling per-strategy performance statistics.
//! * `Supervisor` is the control plane: deploy, pause, resume, stop, inspect.
//!
//! Adapter families (`SignalEvaluator`, `DataProvider`, `BrokerAdapter`) are narrow traits
//! registered statically at build time and resolved by name at deploy.

use chrono::{DateTime, Utc};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Typed channel primitives used for all cross-component communication.
pub mod channel;

/// Monotonic time source and the per-strategy tick scheduler.
pub mod clock;

/// Bar model, ring buffers, the `DataProvider` interface and the `DataManager`.
pub mod data;

/// Defines all top-level errors produced by the runtime.
pub mod error;

/// Order model, the `BrokerAdapter` interface, the `OrderGateway` and the paper broker.
pub mod execution;

/// Default tracing initialisers.
pub mod logging;

/// Per-strategy sub-ledgers, signal sizing and fill application.
pub mod portfolio;

/// Rolling per-strategy performance accounting.
///
/// eg/ `TearSheet`, `DrawdownGenerator`, etc.
pub mod statistic;

/// Signal model, the `SignalEvaluator` interface and the engine registry.
pub mod strategy;

/// Per-strategy runner state machine driving the tick loop.
pub mod runner;

/// Supervisor / control plane: strategy registry, deploy validation, credentials.
pub mod system;

/// Shared value types: symbols, granularities, identifiers, broker-boundary rounding.
pub mod types;

/// A timed value.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Deserialize,
    Serialize,
    Constructor,
)]
pub struct Timed<T> {
    pub value: T,
    pub time: DateTime<Utc>,
}

/// Monotonically increasing event sequence shared across runtime components.
///
/// Cheap to clone; clones observe the same underlying counter.
#[derive(Debug, Clone, Default)]
pub struct Sequence(Arc<AtomicU64>);

impl Sequence {
    /// Returns the next sequence value, incrementing the shared counter.
    pub fn fetch_next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the current sequence value without incrementing.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_clones_share_counter() {
        let sequence = Sequence::default();
        let clone = sequence.clone();

        assert_eq!(sequence.fetch_next(), 0);
        assert_eq!(clone.fetch_next(), 1);
        assert_eq!(sequence.peek(), 2);
    }
}
