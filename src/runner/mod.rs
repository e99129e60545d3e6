use crate::{
    clock::{SchedulerHandle, SharedClock, Tick, TickScheduler, DEFAULT_SETTLE_DELAY},
    data::{DataManager, SubscriptionHandle, WindowSnapshot},
    error::{RxDropped, StrateQueueError},
    execution::{
        broker::BrokerCapabilities,
        order::{OrderId, OrderKind, OrderRequest, OrderState},
        ExecutionEvent, GatewayHandle,
    },
    portfolio::PortfolioManager,
    statistic::{StatisticsSnapshot, TearSheetGenerator},
    strategy::{
        signal::{Signal, SignalKind},
        EngineParams, SignalEngine, SignalEvaluator, DEFAULT_EVALUATOR_TIMEOUT,
    },
    types::{Granularity, Side, StrategyId, Symbol},
    Timed,
};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Default warmup bound: history seeding plus feed connection for every symbol.
pub const DEFAULT_WARMUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive strategy errors tolerated before the runner transitions to `Errored`.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Bound on waiting for open orders (and liquidation fills) while stopping.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Execution mode of a deployed strategy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    /// Observe only: signals are recorded, the gateway is never called.
    Signals,
    /// Orders routed to a broker instance configured for simulated fills.
    Paper,
    /// Orders routed to a live broker instance.
    Live,
}

/// Lifecycle status of a strategy runner.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Errored,
}

impl StrategyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StrategyStatus::Stopped | StrategyStatus::Errored)
    }
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StrategyStatus::Initializing => "INITIALIZING",
            StrategyStatus::Running => "RUNNING",
            StrategyStatus::Paused => "PAUSED",
            StrategyStatus::Stopping => "STOPPING",
            StrategyStatus::Stopped => "STOPPED",
            StrategyStatus::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}

/// How a stop should treat open orders and positions.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct StopOptions {
    /// Submit closing market orders for every open position and wait for their fills.
    pub liquidate: bool,
    /// Cancel open orders instead of waiting for them to terminate.
    pub force: bool,
}

/// Command accepted by a running strategy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunnerCommand {
    Pause,
    Resume,
    Stop(StopOptions),
}

/// Per-strategy runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub id: StrategyId,
    pub symbols: Vec<Symbol>,
    pub data_provider: String,
    pub granularity: Granularity,
    pub lookback: usize,
    pub mode: TradeMode,
    /// Capital allocated to this strategy, in account currency.
    pub allocation_cash: Decimal,
    pub allow_short: bool,
    /// Runtime bound; expiry behaves like a graceful stop.
    pub duration: Option<TimeDelta>,
    pub settle_delay: Duration,
    pub evaluator_timeout: Duration,
    pub warmup_timeout: Duration,
    pub max_consecutive_errors: u32,
    pub params: EngineParams,
}

impl RunnerConfig {
    pub fn new(
        id: StrategyId,
        symbols: Vec<Symbol>,
        data_provider: impl Into<String>,
        granularity: Granularity,
        lookback: usize,
        mode: TradeMode,
        allocation_cash: Decimal,
    ) -> Self {
        Self {
            id,
            symbols,
            data_provider: data_provider.into(),
            granularity,
            lookback,
            mode,
            allocation_cash,
            allow_short: false,
            duration: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
            evaluator_timeout: DEFAULT_EVALUATOR_TIMEOUT,
            warmup_timeout: DEFAULT_WARMUP_TIMEOUT,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            params: EngineParams::new(),
        }
    }
}

/// Published view of a runner, refreshed after every state change.
#[derive(Debug, Clone)]
pub struct RunnerView {
    pub status: StrategyStatus,
    pub last_signal: Option<Timed<SignalKind>>,
    pub statistics: StatisticsSnapshot,
    pub ledger: crate::portfolio::SubLedger,
    pub ticks_dropped: u64,
    pub consecutive_errors: u32,
    pub rejections: u64,
}

/// Handle held by the supervisor for one spawned runner.
#[derive(Debug)]
pub struct RunnerHandle {
    pub command_tx: mpsc::UnboundedSender<RunnerCommand>,
    pub view_rx: watch::Receiver<RunnerView>,
    pub task: JoinHandle<Result<(), StrateQueueError>>,
}

impl RunnerHandle {
    pub fn send(&self, command: RunnerCommand) -> Result<(), RxDropped> {
        self.command_tx.send(command).map_err(RxDropped::from)
    }

    pub fn view(&self) -> RunnerView {
        self.view_rx.borrow().clone()
    }
}

/// Per-strategy state machine composing the data manager, signal engine, portfolio,
/// gateway and statistics.
///
/// On each tick: pull a window per symbol, evaluate the signal, size and gate it, dispatch
/// to the gateway (mode permitting) and refresh statistics. The tick loop is
/// single-flighted: the tick channel has capacity one and the scheduler drops ticks that
/// arrive while the previous tick is still executing.
pub struct StrategyRunner {
    config: RunnerConfig,
    clock: SharedClock,
    data: DataManager,
    engine: SignalEngine,
    portfolio: PortfolioManager,
    stats: TearSheetGenerator,
    capabilities: BrokerCapabilities,
    gateway: Option<GatewayHandle>,
    command_rx: mpsc::UnboundedReceiver<RunnerCommand>,
    tick_rx: mpsc::Receiver<Tick>,
    execution_rx: mpsc::UnboundedReceiver<ExecutionEvent>,
    /// Keeps the execution channel open in `signals` mode (nothing ever sends).
    _execution_tx: mpsc::UnboundedSender<ExecutionEvent>,
    view_tx: watch::Sender<RunnerView>,
    scheduler: Option<SchedulerHandle>,
    handles: Vec<SubscriptionHandle>,
    open_orders: HashSet<OrderId>,
    status: StrategyStatus,
    last_signal: Option<Timed<SignalKind>>,
    consecutive_errors: u32,
    rejections: u64,
    deadline: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for StrategyRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRunner")
            .field("id", &self.config.id)
            .field("status", &self.status)
            .finish()
    }
}

impl StrategyRunner {
    /// Spawn a runner driven by a bar-aligned [`TickScheduler`].
    pub fn spawn(
        config: RunnerConfig,
        clock: SharedClock,
        data: DataManager,
        evaluator: Box<dyn SignalEvaluator>,
        capabilities: BrokerCapabilities,
        gateway: Option<GatewayHandle>,
    ) -> Result<RunnerHandle, RxDropped> {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let scheduler = TickScheduler::spawn(
            clock.clone(),
            config.granularity,
            config.settle_delay,
            tick_tx,
        );
        Self::spawn_with_ticks(
            config,
            clock,
            data,
            evaluator,
            capabilities,
            gateway,
            tick_rx,
            Some(scheduler),
        )
    }

    /// Spawn a runner with an externally driven tick source (deterministic tests, custom
    /// cadences).
    pub fn spawn_with_ticks(
        config: RunnerConfig,
        clock: SharedClock,
        data: DataManager,
        evaluator: Box<dyn SignalEvaluator>,
        capabilities: BrokerCapabilities,
        gateway: Option<GatewayHandle>,
        tick_rx: mpsc::Receiver<Tick>,
        scheduler: Option<SchedulerHandle>,
    ) -> Result<RunnerHandle, RxDropped> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (execution_tx, execution_rx) = mpsc::unbounded_channel();

        if let Some(gateway) = &gateway {
            gateway.register(config.id.clone(), execution_tx.clone())?;
        }

        let portfolio =
            PortfolioManager::new(config.id.clone(), config.allocation_cash)
                .allow_short(config.allow_short);
        let stats = TearSheetGenerator::init(
            config.id.clone(),
            clock.now(),
            config.allocation_cash,
        );
        let engine = SignalEngine::new(evaluator, config.evaluator_timeout);

        let initial_view = RunnerView {
            status: StrategyStatus::Initializing,
            last_signal: None,
            statistics: stats.snapshot(),
            ledger: portfolio.ledger().clone(),
            ticks_dropped: 0,
            consecutive_errors: 0,
            rejections: 0,
        };
        let (view_tx, view_rx) = watch::channel(initial_view);

        let runner = Self {
            config,
            clock,
            data,
            engine,
            portfolio,
            stats,
            capabilities,
            gateway,
            command_rx,
            tick_rx,
            execution_rx,
            _execution_tx: execution_tx,
            view_tx,
            scheduler,
            handles: Vec::new(),
            open_orders: HashSet::new(),
            status: StrategyStatus::Initializing,
            last_signal: None,
            consecutive_errors: 0,
            rejections: 0,
            deadline: None,
        };

        let task = tokio::spawn(runner.run());
        Ok(RunnerHandle {
            command_tx,
            view_rx,
            task,
        })
    }

    /// Runner event loop: warmup, then ticks/commands/execution events until stopped.
    pub async fn run(mut self) -> Result<(), StrateQueueError> {
        info!(id = %self.config.id, "StrategyRunner starting");

        match self.warmup().await {
            Ok(true) => {
                self.deadline = self
                    .config
                    .duration
                    .map(|duration| self.clock.now() + duration);
                self.set_status(StrategyStatus::Running);
            }
            Ok(false) => {
                // Stop requested before warmup completed
                self.finalise(StrategyStatus::Stopped);
                return Ok(());
            }
            Err(err) => {
                error!(id = %self.config.id, %err, "warmup failed");
                self.finalise(StrategyStatus::Errored);
                return Err(err);
            }
        }

        loop {
            tokio::select! {
                biased;

                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await? {
                            break;
                        }
                    }
                    None => {
                        warn!(id = %self.config.id, "command transmitter dropped - stopping");
                        self.stop(StopOptions::default()).await?;
                        break;
                    }
                },

                event = self.execution_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_execution_event(event)?;
                    }
                },

                tick = self.tick_rx.recv(), if self.status == StrategyStatus::Running => {
                    match tick {
                        Some(tick) => {
                            if self.handle_tick(tick).await? {
                                break;
                            }
                        }
                        None => {
                            warn!(id = %self.config.id, "tick source ended - stopping");
                            self.stop(StopOptions::default()).await?;
                            break;
                        }
                    }
                },
            }
        }

        info!(id = %self.config.id, status = %self.status, "StrategyRunner finished");
        Ok(())
    }

    /// Subscribe every symbol and wait until each window is ready (or history exhausted).
    ///
    /// Returns `Ok(false)` if a stop command arrived during warmup.
    async fn warmup(&mut self) -> Result<bool, StrateQueueError> {
        for symbol in self.config.symbols.clone() {
            let handle = self
                .data
                .subscribe(
                    &self.config.data_provider,
                    symbol,
                    self.config.granularity,
                    self.config.lookback,
                )
                .await
                .map_err(StrateQueueError::Data)?;
            self.handles.push(handle);
        }

        let timeout_secs = self.config.warmup_timeout.as_secs();
        let warmed = tokio::time::timeout(self.config.warmup_timeout, async {
            loop {
                while let Ok(command) = self.command_rx.try_recv() {
                    if matches!(command, RunnerCommand::Stop(_)) {
                        return Ok(false);
                    }
                }

                let mut ready = true;
                for handle in &self.handles {
                    match self.data.snapshot(handle) {
                        WindowSnapshot::Ready(_) | WindowSnapshot::Stale { .. } => {}
                        WindowSnapshot::NotReady { .. } => ready = false,
                        WindowSnapshot::Failed(err) => {
                            return Err(StrateQueueError::Data(err));
                        }
                    }
                }
                if ready {
                    return Ok(true);
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await;

        match warmed {
            Ok(result) => result,
            Err(_) => Err(StrateQueueError::Data(
                crate::data::DataError::WarmupTimeout { timeout_secs },
            )),
        }
    }

    /// Returns `Ok(true)` when the runner should exit its loop.
    async fn handle_command(&mut self, command: RunnerCommand) -> Result<bool, StrateQueueError> {
        debug!(id = %self.config.id, ?command, "command received");
        match command {
            RunnerCommand::Pause => {
                if self.status == StrategyStatus::Running {
                    self.set_status(StrategyStatus::Paused);
                }
                Ok(false)
            }
            RunnerCommand::Resume => {
                if self.status == StrategyStatus::Paused {
                    self.set_status(StrategyStatus::Running);
                }
                Ok(false)
            }
            RunnerCommand::Stop(options) => {
                self.stop(options).await?;
                Ok(true)
            }
        }
    }

    /// Stop sequence: cancel the tick source, refuse new signals, optionally cancel or
    /// liquidate, wait for terminal order states, release subscriptions.
    async fn stop(&mut self, options: StopOptions) -> Result<(), StrateQueueError> {
        if self.status.is_terminal() {
            return Ok(());
        }
        info!(id = %self.config.id, ?options, "stopping");
        self.set_status(StrategyStatus::Stopping);

        if let Some(scheduler) = &mut self.scheduler {
            scheduler.cancel();
        }

        if let Some(gateway) = self.gateway.clone() {
            if options.force {
                let _ = gateway.cancel_all(self.config.id.clone());
            }

            if options.liquidate {
                self.submit_liquidation(&gateway);
            }

            let drained = tokio::time::timeout(STOP_DRAIN_TIMEOUT, async {
                while !self.open_orders.is_empty()
                    || (options.liquidate && !self.positions_flat())
                {
                    match self.execution_rx.recv().await {
                        Some(event) => self.handle_execution_event(event)?,
                        None => break,
                    }
                }
                Ok::<(), StrateQueueError>(())
            })
            .await;

            match drained {
                Ok(result) => result?,
                Err(_) => warn!(
                    id = %self.config.id,
                    open_orders = self.open_orders.len(),
                    "stop drain timed out - releasing anyway"
                ),
            }

            let _ = gateway.deregister(self.config.id.clone());
        }

        self.finalise(StrategyStatus::Stopped);
        Ok(())
    }

    /// Submit closing market orders for every open position.
    fn submit_liquidation(&mut self, gateway: &GatewayHandle) {
        let positions: Vec<(Symbol, Decimal)> = self
            .portfolio
            .ledger()
            .positions
            .values()
            .filter(|position| !position.is_flat())
            .map(|position| (position.symbol.clone(), position.quantity))
            .collect();

        for (symbol, quantity) in positions {
            let side = if quantity > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };
            let request = OrderRequest {
                id: OrderId::random(),
                strategy: self.config.id.clone(),
                symbol: symbol.clone(),
                side,
                kind: OrderKind::Market,
                quantity: quantity.abs(),
                limit_price: None,
                stop_price: None,
                time_in_force: None,
            };
            info!(id = %self.config.id, %symbol, %side, quantity = %quantity.abs(), "liquidating");
            self.open_orders.insert(request.id);
            if gateway.submit(request).is_err() {
                warn!(id = %self.config.id, "gateway unavailable for liquidation");
            }
        }
    }

    fn positions_flat(&self) -> bool {
        self.portfolio
            .ledger()
            .positions
            .values()
            .all(|position| position.is_flat())
    }

    fn handle_execution_event(&mut self, event: ExecutionEvent) -> Result<(), StrateQueueError> {
        match event {
            ExecutionEvent::Fill(fill) => {
                let ledger_event = self
                    .portfolio
                    .apply_fill(&fill)
                    .map_err(StrateQueueError::Portfolio)?;
                self.stats.update(&ledger_event);
            }
            ExecutionEvent::OrderUpdate { order, reason } => {
                if order.state.is_terminal() {
                    self.open_orders.remove(&order.id);
                    if order.state == OrderState::Rejected {
                        warn!(
                            id = %self.config.id,
                            order_id = %order.id,
                            reason = reason.as_deref().unwrap_or("unspecified"),
                            "order rejected by broker"
                        );
                    }
                } else {
                    self.open_orders.insert(order.id);
                }
            }
        }
        self.publish_view();
        Ok(())
    }

    /// Tick loop body. Returns `Ok(true)` when the runner should exit (duration expiry or
    /// a fatal per-strategy error).
    async fn handle_tick(&mut self, tick: Tick) -> Result<bool, StrateQueueError> {
        if let Some(deadline) = self.deadline {
            if tick.fired >= deadline {
                info!(id = %self.config.id, "configured duration elapsed - stopping");
                self.stop(StopOptions::default()).await?;
                return Ok(true);
            }
        }

        let windows: Vec<(Symbol, WindowSnapshot)> = self
            .handles
            .iter()
            .map(|handle| (handle.key().symbol.clone(), self.data.snapshot(handle)))
            .collect();

        for (symbol, snapshot) in windows {
            match snapshot {
                WindowSnapshot::NotReady { have, need } => {
                    debug!(id = %self.config.id, %symbol, have, need, "window not ready - tick skipped");
                }
                WindowSnapshot::Stale { last_bar, elapsed } => {
                    warn!(id = %self.config.id, %symbol, ?last_bar, ?elapsed, "stale feed");
                    if self.record_strategy_error() {
                        self.finalise(StrategyStatus::Errored);
                        return Ok(true);
                    }
                }
                WindowSnapshot::Failed(err) => {
                    error!(id = %self.config.id, %symbol, %err, "subscription failed");
                    self.finalise(StrategyStatus::Errored);
                    return Ok(true);
                }
                WindowSnapshot::Ready(window) => {
                    if self.evaluate_window(&symbol, &window, tick).await? {
                        return Ok(true);
                    }
                }
            }
        }

        self.publish_view();
        Ok(false)
    }

    /// Evaluate one symbol's window and act on the signal. Returns `Ok(true)` if the
    /// runner transitioned to `Errored`.
    async fn evaluate_window(
        &mut self,
        symbol: &Symbol,
        window: &[crate::data::Bar],
        tick: Tick,
    ) -> Result<bool, StrateQueueError> {
        let last_close = window.last().map(|bar| bar.close).unwrap_or(Decimal::ZERO);
        if last_close > Decimal::ZERO {
            let mark = self.portfolio.mark(symbol.clone(), last_close, tick.fired);
            self.stats.update(&mark);
        }

        let signal = match self.engine.evaluate(window, &self.config.params).await {
            Ok(signal) => signal,
            Err(err) => {
                warn!(id = %self.config.id, %symbol, %err, "evaluator error");
                if self.record_strategy_error() {
                    self.finalise(StrategyStatus::Errored);
                    return Ok(true);
                }
                return Ok(false);
            }
        };

        self.consecutive_errors = 0;
        self.last_signal = Some(Timed::new(signal.kind, signal.time));

        if signal.kind == SignalKind::Hold {
            return Ok(false);
        }

        self.dispatch_signal(symbol, &signal);
        Ok(false)
    }

    /// Size, gate and (mode permitting) submit the signal.
    fn dispatch_signal(&mut self, symbol: &Symbol, signal: &Signal) {
        let proposal = match self
            .portfolio
            .size_signal(signal, symbol, &self.capabilities)
        {
            Ok(proposal) => proposal,
            Err(rejection) => {
                self.rejections += 1;
                info!(
                    id = %self.config.id,
                    %symbol,
                    reason = %rejection.reason,
                    detail = %rejection.detail,
                    "signal rejected"
                );
                return;
            }
        };

        if self.config.mode == TradeMode::Signals {
            debug!(id = %self.config.id, %symbol, kind = %signal.kind, "signals mode - recorded only");
            return;
        }

        let Some(gateway) = &self.gateway else {
            warn!(id = %self.config.id, "no gateway configured - signal dropped");
            return;
        };

        let request = OrderRequest {
            id: OrderId::random(),
            strategy: self.config.id.clone(),
            symbol: proposal.symbol,
            side: proposal.side,
            kind: proposal.kind,
            quantity: proposal.quantity,
            limit_price: proposal.limit_price,
            stop_price: proposal.stop_price,
            time_in_force: proposal.time_in_force,
        };
        self.open_orders.insert(request.id);
        if gateway.submit(request).is_err() {
            warn!(id = %self.config.id, "gateway unavailable - signal dropped");
        }
    }

    /// Count a strategy error; `true` when the consecutive budget is exhausted.
    fn record_strategy_error(&mut self) -> bool {
        self.consecutive_errors += 1;
        self.consecutive_errors >= self.config.max_consecutive_errors
    }

    fn set_status(&mut self, status: StrategyStatus) {
        if self.status != status {
            info!(id = %self.config.id, from = %self.status, to = %status, "status transition");
            self.status = status;
        }
        self.publish_view();
    }

    /// Terminal transition: cancel ticks, release data handles, publish the final view.
    fn finalise(&mut self, status: StrategyStatus) {
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.cancel();
        }
        self.handles.clear();
        self.status = status;
        self.publish_view();
    }

    fn publish_view(&self) {
        let view = RunnerView {
            status: self.status,
            last_signal: self.last_signal.clone(),
            statistics: self.stats.snapshot(),
            ledger: self.portfolio.ledger().clone(),
            ticks_dropped: self
                .scheduler
                .as_ref()
                .map(SchedulerHandle::ticks_dropped)
                .unwrap_or(0),
            consecutive_errors: self.consecutive_errors,
            rejections: self.rejections,
        };
        let _ = self.view_tx.send_replace(view);
    }
}
