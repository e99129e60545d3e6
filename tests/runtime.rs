//! End-to-end runtime scenarios: deploy through the supervisor, drive bars through the
//! replay provider, fill through the paper broker, and observe ledgers and statistics.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{collections::VecDeque, path::PathBuf, sync::Arc, time::Duration};
use stratequeue::{
    clock::ManualClock,
    data::{Bar, ReplayProvider},
    execution::{BrokerCapabilities, BrokerOrderId, PaperBroker},
    runner::{StopOptions, StrategyStatus, TradeMode},
    strategy::{
        error::StrategyError, signal::Signal, EngineParams, EngineRegistry, SignalEvaluator,
        SignalKind, SizingIntent,
    },
    system::{
        deploy::{Allocation, DeploySpec},
        error::ConfigError,
        Supervisor,
    },
    types::{Granularity, StrategyId, Symbol},
};

/// Evaluator that replays a scripted signal sequence from its params, then holds.
struct Scripted {
    steps: VecDeque<Step>,
}

#[derive(serde::Deserialize)]
struct Step {
    kind: SignalKind,
    #[serde(default)]
    sizing: SizingIntent,
}

fn scripted_factory(
    params: &EngineParams,
) -> Result<Box<dyn SignalEvaluator>, StrategyError> {
    let steps = match params.get("script") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| StrategyError::InvalidParams(err.to_string()))?,
        None => VecDeque::new(),
    };
    Ok(Box::new(Scripted { steps }))
}

#[async_trait]
impl SignalEvaluator for Scripted {
    async fn evaluate(
        &mut self,
        window: &[Bar],
        _: &EngineParams,
    ) -> Result<Signal, StrategyError> {
        let last = window
            .last()
            .ok_or_else(|| StrategyError::Evaluator("empty window".to_owned()))?;
        match self.steps.pop_front() {
            Some(step) => {
                Ok(Signal::new(step.kind, last.close, last.time).with_sizing(step.sizing))
            }
            None => Ok(Signal::hold(last.close, last.time)),
        }
    }
}

struct Rig {
    clock: ManualClock,
    provider: ReplayProvider,
    broker: PaperBroker,
    supervisor: Supervisor,
    strategy_file: PathBuf,
    scratch: PathBuf,
}

impl Rig {
    /// Clock starts 30s past the last seeded bar, so windows are fresh and the next tick
    /// boundary is close.
    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 30).unwrap()
    }

    fn new(capabilities: BrokerCapabilities) -> Self {
        let clock = ManualClock::new(Self::start_time());
        let shared = Arc::new(clock.clone());

        let provider = ReplayProvider::new("replay");
        let broker = PaperBroker::new("paper", shared.clone(), dec!(100000))
            .with_capabilities(capabilities);

        let mut engines = EngineRegistry::with_builtin();
        engines.register("scripted", scripted_factory);

        let mut supervisor = Supervisor::new(shared).with_engines(engines);
        supervisor.register_provider(Arc::new(provider.clone()));
        supervisor.register_broker(Arc::new(broker.clone()));

        let scratch = std::env::temp_dir().join(format!("stratequeue-e2e-{}", uuid()));
        std::fs::create_dir_all(&scratch).unwrap();
        let strategy_file = scratch.join("strategy.py");
        std::fs::write(&strategy_file, "# scripted strategy under test\n").unwrap();

        Self {
            clock,
            provider,
            broker,
            supervisor,
            strategy_file,
            scratch,
        }
    }

    /// Seed 30 one-minute bars ending at 10:00 with a constant close, and mark the broker.
    fn seed(&self, symbol: &str, close: Decimal) {
        let bars: Vec<Bar> = (0..30)
            .map(|index| {
                let time = Utc.with_ymd_and_hms(2024, 1, 2, 9, 31, 0).unwrap()
                    + TimeDelta::minutes(index);
                Bar::new(
                    Symbol::new(symbol),
                    Granularity::Minute1,
                    time,
                    close,
                    close,
                    close,
                    close,
                    dec!(1000),
                    true,
                )
            })
            .collect();
        self.provider
            .load_history(Symbol::new(symbol), Granularity::Minute1, bars);
        self.broker.set_mark(Symbol::new(symbol), close);
    }

    fn spec(&self, id: &str, symbol: &str, script: serde_json::Value) -> DeploySpec {
        let mut params = EngineParams::new();
        params.insert("script".to_owned(), script);
        DeploySpec {
            strategy: self.strategy_file.clone(),
            strategy_id: Some(id.to_owned()),
            engine: Some("scripted".to_owned()),
            symbols: vec![Symbol::new(symbol)],
            granularity: Granularity::Minute1,
            lookback: 10,
            duration_mins: None,
            allocation: Allocation::Notional {
                notional: dec!(10000),
            },
            data_source: "replay".to_owned(),
            broker: "paper".to_owned(),
            mode: TradeMode::Paper,
            allow_short: false,
            params,
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.scratch);
    }
}

fn uuid() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Poll under paused tokio time: each sleep auto-advances the virtual clock, so minutes of
/// scheduler cadence elapse in milliseconds of wall time.
async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("timed out waiting for {what}");
}

fn buy(sizing: serde_json::Value) -> serde_json::Value {
    serde_json::json!([{ "kind": "BUY", "sizing": sizing }])
}

#[tokio::test(start_paused = true)]
async fn buy_sized_by_equity_pct_updates_ledger() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let id = rig
        .supervisor
        .deploy(rig.spec("s1", "AAPL", buy(serde_json::json!({ "equity_pct": "0.10" }))))
        .await
        .unwrap();

    let supervisor = &rig.supervisor;
    wait_until("fill applied", || {
        supervisor
            .statistics(&id)
            .is_some_and(|stats| stats.trades == 1)
    })
    .await;

    let ledger = rig.supervisor.ledger(&id).unwrap();
    assert_eq!(ledger.cash, dec!(9000));
    let position = ledger.position(&Symbol::new("AAPL")).unwrap();
    assert_eq!(position.quantity, dec!(10));
    assert_eq!(position.average_cost, dec!(100));

    let stats = rig.supervisor.statistics(&id).unwrap();
    assert_eq!(stats.equity, dec!(10000));
}

#[tokio::test(start_paused = true)]
async fn min_notional_rejection_leaves_ledger_untouched() {
    let mut rig = Rig::new(BrokerCapabilities {
        min_notional: dec!(10),
        ..BrokerCapabilities::unrestricted()
    });
    rig.seed("PENNY", dec!(9.30));

    let id = rig
        .supervisor
        .deploy(rig.spec("s2", "PENNY", buy(serde_json::json!({ "notional": "9.0" }))))
        .await
        .unwrap();

    let supervisor = &rig.supervisor;
    wait_until("signal recorded", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.last_signal_kind == Some(SignalKind::Buy))
    })
    .await;

    let ledger = rig.supervisor.ledger(&id).unwrap();
    assert_eq!(ledger.cash, dec!(10000));
    assert!(ledger.positions.values().all(|position| position.is_flat()));
    assert_eq!(rig.supervisor.statistics(&id).unwrap().trades, 0);
}

#[tokio::test(start_paused = true)]
async fn target_equity_pct_reduces_position() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(50));

    // Allocation $2000; buy 20 @ 50 (position value $1000, equity $2000), then bring the
    // position down to 25% of equity => hold $500 => sell 10
    let script = serde_json::json!([
        { "kind": "BUY", "sizing": { "units": "20" } },
        { "kind": "SELL", "sizing": { "target_equity_pct": "0.25" } }
    ]);
    let mut spec = rig.spec("s3", "AAPL", script);
    spec.allocation = Allocation::Notional {
        notional: dec!(2000),
    };
    let id = rig.supervisor.deploy(spec).await.unwrap();

    let supervisor = &rig.supervisor;
    wait_until("both fills applied", || {
        supervisor
            .statistics(&id)
            .is_some_and(|stats| stats.trades == 2)
    })
    .await;

    let ledger = rig.supervisor.ledger(&id).unwrap();
    let position = ledger.position(&Symbol::new("AAPL")).unwrap();
    assert_eq!(position.quantity, dec!(10));
    assert_eq!(position.average_cost, dec!(50));
    assert_eq!(ledger.cash, dec!(1500));
}

#[tokio::test(start_paused = true)]
async fn duplicate_fill_event_applies_once() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let id = rig
        .supervisor
        .deploy(rig.spec("s4", "AAPL", buy(serde_json::json!({ "units": "10" }))))
        .await
        .unwrap();

    let supervisor = &rig.supervisor;
    wait_until("fill applied", || {
        supervisor
            .statistics(&id)
            .is_some_and(|stats| stats.trades == 1)
    })
    .await;

    // Broker re-delivers the first fill of the first paper order
    rig.broker.resend_fill(&BrokerOrderId::new("paper-0"), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = rig.supervisor.statistics(&id).unwrap();
    assert_eq!(stats.trades, 1);
    assert_eq!(rig.supervisor.ledger(&id).unwrap().cash, dec!(9000));
}

#[tokio::test(start_paused = true)]
async fn hard_stop_with_liquidate_flattens_and_snapshots() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("TSLA", dec!(200));

    let id = rig
        .supervisor
        .deploy(rig.spec("s6", "TSLA", buy(serde_json::json!({ "units": "5" }))))
        .await
        .unwrap();

    let supervisor = &rig.supervisor;
    wait_until("entry fill applied", || {
        supervisor
            .statistics(&id)
            .is_some_and(|stats| stats.trades == 1)
    })
    .await;

    rig.supervisor
        .stop(
            &id,
            StopOptions {
                liquidate: true,
                force: false,
            },
        )
        .unwrap();

    let supervisor = &rig.supervisor;
    wait_until("stopped", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Stopped)
    })
    .await;

    let ledger = rig.supervisor.ledger(&id).unwrap();
    assert!(ledger.positions.values().all(|position| position.is_flat()));
    assert_eq!(ledger.cash, dec!(10000));

    // Statistics remain queryable after stop
    let stats = rig.supervisor.statistics(&id).unwrap();
    assert_eq!(stats.trades, 2);
    assert_eq!(stats.equity, dec!(10000));
}

#[tokio::test(start_paused = true)]
async fn deploy_list_get_round_trip() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let spec = rig.spec("round-trip", "AAPL", serde_json::json!([]));
    let id = rig.supervisor.deploy(spec.clone()).await.unwrap();
    assert_eq!(id, StrategyId::new("round-trip"));

    let record = rig.supervisor.get(&id).unwrap();
    assert_eq!(record.symbols, spec.symbols);
    assert_eq!(record.granularity, spec.granularity);
    assert_eq!(record.lookback, spec.lookback);
    assert_eq!(record.mode, spec.mode);
    assert_eq!(record.data_source, spec.data_source);
    assert_eq!(record.broker, spec.broker);
    assert_eq!(record.engine, "scripted");
    assert_eq!(record.allocation, spec.allocation);
    assert_eq!(record.allocation_cash, dec!(10000));

    let listed = rig.supervisor.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}

#[tokio::test(start_paused = true)]
async fn pause_resume_and_idempotent_stop() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let id = rig
        .supervisor
        .deploy(rig.spec("lifecycle", "AAPL", serde_json::json!([])))
        .await
        .unwrap();

    let supervisor = &rig.supervisor;
    wait_until("running", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Running)
    })
    .await;

    rig.supervisor.pause(&id).unwrap();
    let supervisor = &rig.supervisor;
    wait_until("paused", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Paused)
    })
    .await;

    rig.supervisor.resume(&id).unwrap();
    let supervisor = &rig.supervisor;
    wait_until("running again", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Running)
    })
    .await;

    rig.supervisor.stop(&id, StopOptions::default()).unwrap();
    let supervisor = &rig.supervisor;
    wait_until("stopped", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Stopped)
    })
    .await;

    // Stopping an already-stopped strategy is idempotent
    rig.supervisor.stop(&id, StopOptions::default()).unwrap();
    assert_eq!(
        rig.supervisor.get(&id).unwrap().status,
        StrategyStatus::Stopped
    );

    // Terminal strategies can be removed; active ones cannot be removed twice
    rig.supervisor.remove(&id).unwrap();
    assert!(rig.supervisor.get(&id).is_none());
    assert!(matches!(
        rig.supervisor.remove(&id),
        Err(ConfigError::UnknownStrategy(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn lookback_beyond_history_still_warms_up() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let mut spec = rig.spec("short-history", "AAPL", serde_json::json!([]));
    spec.lookback = 500;
    let id = rig.supervisor.deploy(spec).await.unwrap();

    let supervisor = &rig.supervisor;
    wait_until("running despite short history", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Running)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn stale_feed_errors_the_runner() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let id = rig
        .supervisor
        .deploy(rig.spec("stale", "AAPL", serde_json::json!([])))
        .await
        .unwrap();

    let supervisor = &rig.supervisor;
    wait_until("running", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Running)
    })
    .await;

    // No bar for far longer than 3 intervals
    rig.clock.advance(TimeDelta::minutes(30));

    let supervisor = &rig.supervisor;
    wait_until("errored on stale feed", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Errored)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn duration_expiry_stops_gracefully() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let mut spec = rig.spec("bounded", "AAPL", serde_json::json!([]));
    spec.duration_mins = Some(5);
    let id = rig.supervisor.deploy(spec).await.unwrap();

    let supervisor = &rig.supervisor;
    wait_until("running", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Running)
    })
    .await;

    rig.clock.advance(TimeDelta::minutes(6));
    // Keep the feed fresh so the expiry path is what stops the strategy
    for index in 0..7 {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 10, 1, 0).unwrap()
            + TimeDelta::minutes(index);
        rig.provider.push_bar(Bar::new(
            Symbol::new("AAPL"),
            Granularity::Minute1,
            time,
            dec!(100),
            dec!(100),
            dec!(100),
            dec!(100),
            dec!(1000),
            true,
        ));
    }

    let supervisor = &rig.supervisor;
    wait_until("stopped on duration expiry", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.status == StrategyStatus::Stopped)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn deploy_validation_failures() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    // Missing strategy file
    let mut spec = rig.spec("bad-file", "AAPL", serde_json::json!([]));
    spec.strategy = PathBuf::from("/nonexistent/strategy.py");
    let response = rig.supervisor.validate(&spec).await;
    assert!(!response.valid);
    assert!(response.errors[0].contains("strategy file not found"));

    // Unknown engine
    let mut spec = rig.spec("bad-engine", "AAPL", serde_json::json!([]));
    spec.engine = Some("vectorbt".to_owned());
    assert!(matches!(
        rig.supervisor.deploy(spec).await,
        Err(ConfigError::UnknownEngine(_))
    ));

    // Unknown provider
    let mut spec = rig.spec("bad-provider", "AAPL", serde_json::json!([]));
    spec.data_source = "ghost".to_owned();
    assert!(matches!(
        rig.supervisor.deploy(spec).await,
        Err(ConfigError::UnknownProvider(_))
    ));

    // Allocation beyond account equity (account holds $100k)
    let mut spec = rig.spec("too-big", "AAPL", serde_json::json!([]));
    spec.allocation = Allocation::Notional {
        notional: dec!(200000),
    };
    assert!(matches!(
        rig.supervisor.deploy(spec).await,
        Err(ConfigError::AllocationExceedsEquity { .. })
    ));

    // Duplicate id
    let spec = rig.spec("dup", "AAPL", serde_json::json!([]));
    rig.supervisor.deploy(spec.clone()).await.unwrap();
    assert!(matches!(
        rig.supervisor.deploy(spec).await,
        Err(ConfigError::DuplicateStrategyId(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn fraction_allocations_cannot_exceed_whole() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));
    rig.seed("MSFT", dec!(100));

    let mut first = rig.spec("alloc-a", "AAPL", serde_json::json!([]));
    first.allocation = Allocation::Fraction(dec!(0.6));
    rig.supervisor.deploy(first).await.unwrap();

    let mut second = rig.spec("alloc-b", "MSFT", serde_json::json!([]));
    second.allocation = Allocation::Fraction(dec!(0.5));
    assert!(matches!(
        rig.supervisor.deploy(second).await,
        Err(ConfigError::InvalidAllocation(_))
    ));

    let mut fits = rig.spec("alloc-c", "MSFT", serde_json::json!([]));
    fits.allocation = Allocation::Fraction(dec!(0.4));
    rig.supervisor.deploy(fits).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn signals_mode_records_but_never_trades() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let mut spec = rig.spec(
        "observer",
        "AAPL",
        buy(serde_json::json!({ "equity_pct": "0.5" })),
    );
    spec.mode = TradeMode::Signals;
    let id = rig.supervisor.deploy(spec).await.unwrap();

    let supervisor = &rig.supervisor;
    wait_until("signal recorded", || {
        supervisor
            .get(&id)
            .is_some_and(|record| record.last_signal_kind == Some(SignalKind::Buy))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let ledger = rig.supervisor.ledger(&id).unwrap();
    assert_eq!(ledger.cash, dec!(10000));
    assert_eq!(rig.supervisor.statistics(&id).unwrap().trades, 0);
}

#[tokio::test(start_paused = true)]
async fn supervisor_shutdown_stops_everything() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    rig.supervisor
        .deploy(rig.spec("shutdown-a", "AAPL", serde_json::json!([])))
        .await
        .unwrap();
    rig.supervisor
        .deploy(rig.spec("shutdown-b", "AAPL", serde_json::json!([])))
        .await
        .unwrap();

    let supervisor = std::mem::replace(
        &mut rig.supervisor,
        Supervisor::new(Arc::new(rig.clock.clone())),
    );
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn registry_broadcast_publishes_monotonic_snapshots() {
    let mut rig = Rig::new(BrokerCapabilities::unrestricted());
    rig.seed("AAPL", dec!(100));

    let mut snapshots = rig.supervisor.subscribe();

    rig.supervisor
        .deploy(rig.spec("snap-a", "AAPL", serde_json::json!([])))
        .await
        .unwrap();
    rig.supervisor
        .deploy(rig.spec("snap-b", "AAPL", serde_json::json!([])))
        .await
        .unwrap();

    let first = snapshots.recv().await.unwrap();
    let second = snapshots.recv().await.unwrap();

    assert!(second.sequence > first.sequence);
    assert_eq!(first.strategies.len(), 1);
    assert_eq!(second.strategies.len(), 2);
    assert_eq!(second.strategies[0].id, StrategyId::new("snap-a"));
}
