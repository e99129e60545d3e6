use crate::{
    channel::{mpsc_unbounded, UnboundedRx, UnboundedTx},
    clock::SharedClock,
    error::{InvariantViolation, RxDropped},
    types::StrategyId,
};
use fnv::FnvHashMap;
use futures::{stream::BoxStream, StreamExt};
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The `BrokerAdapter` interface and capability model.
pub mod broker;

/// Defines all possible broker / execution errors.
pub mod error;

/// Order model and lifecycle state machine.
pub mod order;

/// In-memory paper broker.
pub mod paper;

pub use broker::{AccountSnapshot, BrokerAdapter, BrokerCapabilities, BrokerOrderStatus};
pub use order::{
    AttributedFill, BrokerOrderId, Fill, Order, OrderId, OrderKind, OrderRequest, OrderState,
};
pub use paper::PaperBroker;

/// Default broker RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Default reconciliation sweep cadence for working orders.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fill identities remembered for dedup; oldest evicted beyond this.
const SEEN_FILL_CAPACITY: usize = 4096;

/// Event published by the gateway to the owning strategy's runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// Order lifecycle change, with the broker's reason where one was given.
    OrderUpdate {
        order: Order,
        reason: Option<String>,
    },
    /// Deduplicated fill; the synchronisation edge for ledger updates.
    Fill(AttributedFill),
}

/// Command accepted by the gateway task.
#[derive(Debug)]
pub enum GatewayCommand {
    /// Route execution events for `strategy` to `events_tx`.
    Register {
        strategy: StrategyId,
        events_tx: mpsc::UnboundedSender<ExecutionEvent>,
    },
    Deregister {
        strategy: StrategyId,
    },
    Submit(OrderRequest),
    Cancel {
        strategy: StrategyId,
        order_id: OrderId,
    },
    /// Cancel every open order belonging to `strategy` (force-stop path).
    CancelAll {
        strategy: StrategyId,
    },
}

/// Cheaply cloneable handle for talking to a running [`OrderGateway`].
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    command_tx: UnboundedTx<GatewayCommand, RxDropped>,
}

impl GatewayHandle {
    pub fn register(
        &self,
        strategy: StrategyId,
        events_tx: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Result<(), RxDropped> {
        self.command_tx.tx
            .send(GatewayCommand::Register { strategy, events_tx })
            .map_err(RxDropped::from)
    }

    pub fn deregister(&self, strategy: StrategyId) -> Result<(), RxDropped> {
        self.command_tx.tx
            .send(GatewayCommand::Deregister { strategy })
            .map_err(RxDropped::from)
    }

    pub fn submit(&self, request: OrderRequest) -> Result<(), RxDropped> {
        self.command_tx.tx
            .send(GatewayCommand::Submit(request))
            .map_err(RxDropped::from)
    }

    pub fn cancel(&self, strategy: StrategyId, order_id: OrderId) -> Result<(), RxDropped> {
        self.command_tx.tx
            .send(GatewayCommand::Cancel { strategy, order_id })
            .map_err(RxDropped::from)
    }

    pub fn cancel_all(&self, strategy: StrategyId) -> Result<(), RxDropped> {
        self.command_tx.tx
            .send(GatewayCommand::CancelAll { strategy })
            .map_err(RxDropped::from)
    }
}

/// Gateway tuning knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub rpc_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Owns all broker I/O: the open-order table, order lifecycle tracking, fill ingestion with
/// at-most-once application, and the periodic reconciliation sweep.
///
/// One gateway task per broker instance. The broker's push fill stream is authoritative;
/// the polling sweep only repairs order-state drift for working orders. Runners register a
/// per-strategy event channel; every event for an order is routed to its originating
/// strategy.
pub struct OrderGateway {
    broker: Arc<dyn BrokerAdapter>,
    clock: SharedClock,
    config: GatewayConfig,
    open: FnvHashMap<OrderId, Order>,
    by_broker: FnvHashMap<BrokerOrderId, OrderId>,
    routes: FnvHashMap<StrategyId, mpsc::UnboundedSender<ExecutionEvent>>,
    seen_fills: HashSet<(BrokerOrderId, u64)>,
    seen_fifo: VecDeque<(BrokerOrderId, u64)>,
    /// Submissions that timed out and await a reconciliation probe.
    probes: Vec<OrderId>,
}

impl std::fmt::Debug for OrderGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderGateway")
            .field("broker", &self.broker.name())
            .field("open", &self.open.len())
            .finish()
    }
}

impl OrderGateway {
    /// Construct the gateway and its command handle. Call [`OrderGateway::run`] on a
    /// dedicated task.
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        clock: SharedClock,
        config: GatewayConfig,
    ) -> (Self, GatewayHandle, UnboundedRx<GatewayCommand>) {
        let (command_tx, command_rx) = mpsc_unbounded();
        (
            Self {
                broker,
                clock,
                config,
                open: FnvHashMap::default(),
                by_broker: FnvHashMap::default(),
                routes: FnvHashMap::default(),
                seen_fills: HashSet::new(),
                seen_fifo: VecDeque::new(),
                probes: Vec::new(),
            },
            GatewayHandle { command_tx },
            command_rx,
        )
    }

    /// Gateway event loop. Returns on command-channel close (normal shutdown) or a fatal
    /// invariant violation.
    pub async fn run(
        mut self,
        mut command_rx: UnboundedRx<GatewayCommand>,
    ) -> Result<(), InvariantViolation> {
        info!(broker = self.broker.name(), "OrderGateway running");

        let mut fills = match self.broker.fills().await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(%err, "fill stream unavailable - will retry on poll");
                None
            }
        };

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await?,
                    None => break,
                },
                fill = next_fill(&mut fills) => match fill {
                    Some(fill) => self.ingest_fill(fill)?,
                    None => {
                        warn!("fill stream ended - will reconnect on poll");
                        fills = None;
                    }
                },
                _ = poll.tick() => {
                    if fills.is_none() {
                        fills = self.broker.fills().await.ok();
                    }
                    self.reconcile().await?;
                }
            }
        }

        info!(broker = self.broker.name(), "OrderGateway shutting down");
        Ok(())
    }

    async fn handle_command(
        &mut self,
        command: GatewayCommand,
    ) -> Result<(), InvariantViolation> {
        match command {
            GatewayCommand::Register { strategy, events_tx } => {
                self.routes.insert(strategy, events_tx);
            }
            GatewayCommand::Deregister { strategy } => {
                self.routes.remove(&strategy);
            }
            GatewayCommand::Submit(request) => self.submit(request).await?,
            GatewayCommand::Cancel { strategy, order_id } => {
                self.cancel(&strategy, order_id).await?
            }
            GatewayCommand::CancelAll { strategy } => {
                let order_ids: Vec<OrderId> = self
                    .open
                    .values()
                    .filter(|order| order.strategy == strategy)
                    .map(|order| order.id)
                    .collect();
                for order_id in order_ids {
                    self.cancel(&strategy, order_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn submit(&mut self, request: OrderRequest) -> Result<(), InvariantViolation> {
        let mut order = Order::from_request(request.clone(), self.clock.now());
        let submitted =
            tokio::time::timeout(self.config.rpc_timeout, self.broker.submit(&request)).await;

        match submitted {
            Ok(Ok(broker_id)) => {
                order.broker_id = Some(broker_id.clone());
                order.transition(OrderState::Working, self.clock.now())?;
                self.by_broker.insert(broker_id, order.id);
                self.emit_update(order.clone(), None);
                self.open.insert(order.id, order);
            }
            Ok(Err(err)) if err.is_transient() => {
                warn!(order_id = %order.id, %err, "submission inconclusive - scheduling probe");
                self.probes.push(order.id);
                self.emit_update(order.clone(), Some(err.to_string()));
                self.open.insert(order.id, order);
            }
            Ok(Err(err)) => {
                order.transition(OrderState::Rejected, self.clock.now())?;
                warn!(order_id = %order.id, %err, "broker rejected order");
                self.emit_update(order, Some(err.to_string()));
            }
            Err(_) => {
                warn!(order_id = %order.id, "submission timed out - scheduling probe");
                self.probes.push(order.id);
                self.emit_update(order.clone(), Some("submission timed out".to_owned()));
                self.open.insert(order.id, order);
            }
        }
        Ok(())
    }

    async fn cancel(
        &mut self,
        strategy: &StrategyId,
        order_id: OrderId,
    ) -> Result<(), InvariantViolation> {
        let Some(order) = self.open.get(&order_id) else {
            debug!(%order_id, "cancel for unknown or already-terminal order - ignored");
            return Ok(());
        };
        if order.strategy != *strategy {
            warn!(%order_id, "cancel from non-owning strategy - ignored");
            return Ok(());
        }

        match order.broker_id.clone() {
            None => {
                // Never acknowledged by the broker; cancel locally
                let mut order = self.open.remove(&order_id).expect("order exists");
                order.transition(OrderState::Cancelled, self.clock.now())?;
                self.probes.retain(|probe| *probe != order_id);
                self.emit_update(order, Some("cancelled before acknowledgement".to_owned()));
            }
            Some(broker_id) => {
                let cancelled =
                    tokio::time::timeout(self.config.rpc_timeout, self.broker.cancel(&broker_id))
                        .await;
                match cancelled {
                    Ok(Ok(())) => {
                        let mut order = self.open.remove(&order_id).expect("order exists");
                        self.by_broker.remove(&broker_id);
                        order.transition(OrderState::Cancelled, self.clock.now())?;
                        self.emit_update(order, None);
                    }
                    Ok(Err(err)) if err.is_transient() => {
                        warn!(%order_id, %err, "cancel inconclusive - reconcile will resolve");
                    }
                    Ok(Err(err)) => {
                        // Typically a fill/cancel race; status poll adopts the truth
                        debug!(%order_id, %err, "cancel refused by broker");
                    }
                    Err(_) => {
                        warn!(%order_id, "cancel timed out - reconcile will resolve");
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one broker fill with at-most-once semantics.
    fn ingest_fill(&mut self, fill: Fill) -> Result<(), InvariantViolation> {
        let identity = (fill.broker_order_id.clone(), fill.sequence);
        if self.seen_fills.contains(&identity) {
            debug!(broker_order_id = %fill.broker_order_id, sequence = fill.sequence,
                "duplicate fill dropped");
            return Ok(());
        }
        self.seen_fills.insert(identity.clone());
        self.seen_fifo.push_back(identity);
        while self.seen_fifo.len() > SEEN_FILL_CAPACITY {
            if let Some(evicted) = self.seen_fifo.pop_front() {
                self.seen_fills.remove(&evicted);
            }
        }

        let Some(order_id) = self.by_broker.get(&fill.broker_order_id).copied() else {
            warn!(broker_order_id = %fill.broker_order_id, "fill for unknown order - dropped");
            return Ok(());
        };
        let Some(order) = self.open.get_mut(&order_id) else {
            warn!(%order_id, "fill for released order - dropped");
            return Ok(());
        };

        let state = order.apply_fill(fill.quantity, fill.price, fill.time)?;
        let attributed = AttributedFill {
            strategy: order.strategy.clone(),
            order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            fill,
        };
        let order = order.clone();
        let strategy = attributed.strategy.clone();

        // Fill first (the ledger synchronisation edge), then the state update
        self.emit(&strategy, ExecutionEvent::Fill(attributed));
        self.emit_update(order, None);

        if state.is_terminal() {
            self.release(&order_id);
        }
        Ok(())
    }

    /// Periodic sweep: probe timed-out submissions and repair state drift on working
    /// orders. Never synthesises fills - the push stream is authoritative for those.
    async fn reconcile(&mut self) -> Result<(), InvariantViolation> {
        let probes = std::mem::take(&mut self.probes);
        for order_id in probes {
            if !self.open.contains_key(&order_id) {
                continue;
            }
            match self.broker.lookup(&order_id).await {
                Ok(Some((broker_id, status))) => {
                    let order = self.open.get_mut(&order_id).expect("order exists");
                    info!(%order_id, %broker_id, "probe adopted broker state");
                    order.broker_id = Some(broker_id.clone());
                    order.transition(OrderState::Working, self.clock.now())?;
                    self.by_broker.insert(broker_id, order_id);
                    let order = order.clone();
                    self.emit_update(order, None);
                    self.adopt_status(order_id, status)?;
                }
                Ok(None) => {
                    let mut order = self.open.remove(&order_id).expect("order exists");
                    order.transition(OrderState::Rejected, self.clock.now())?;
                    self.emit_update(order, Some("submission never reached broker".to_owned()));
                }
                Err(err) => {
                    warn!(%order_id, %err, "probe failed - retrying next sweep");
                    self.probes.push(order_id);
                }
            }
        }

        let working: Vec<(OrderId, BrokerOrderId)> = self
            .open
            .values()
            .filter(|order| !order.state.is_terminal())
            .filter_map(|order| order.broker_id.clone().map(|broker_id| (order.id, broker_id)))
            .collect();

        for (order_id, broker_id) in working {
            match self.broker.order_status(&broker_id).await {
                Ok(status) => self.adopt_status(order_id, status)?,
                Err(err) if err.is_transient() => {
                    debug!(%order_id, %err, "status poll failed - retrying next sweep");
                }
                Err(err) => {
                    warn!(%order_id, %err, "status poll rejected");
                }
            }
        }
        Ok(())
    }

    /// Adopt a broker-reported status for drift the fill stream cannot deliver
    /// (external cancels, expiries, rejections).
    fn adopt_status(
        &mut self,
        order_id: OrderId,
        status: BrokerOrderStatus,
    ) -> Result<(), InvariantViolation> {
        let Some(order) = self.open.get_mut(&order_id) else {
            return Ok(());
        };

        if status.filled_quantity > order.filled_quantity {
            warn!(
                %order_id,
                broker_filled = %status.filled_quantity,
                local_filled = %order.filled_quantity,
                "fill drift detected - awaiting authoritative fill stream"
            );
        }

        let adopt = match status.state {
            OrderState::Cancelled | OrderState::Rejected | OrderState::Expired => {
                !order.state.is_terminal()
            }
            _ => false,
        };
        if adopt {
            if !order.state.can_transition(status.state) {
                warn!(
                    %order_id,
                    local = %order.state,
                    broker = %status.state,
                    "broker state not adoptable from local state - leaving to fill stream"
                );
                return Ok(());
            }
            order.transition(status.state, self.clock.now())?;
            let order = order.clone();
            self.emit_update(order, Some("adopted from reconciliation".to_owned()));
            self.release(&order_id);
        }
        Ok(())
    }

    fn release(&mut self, order_id: &OrderId) {
        if let Some(order) = self.open.remove(order_id) {
            if let Some(broker_id) = &order.broker_id {
                self.by_broker.remove(broker_id);
            }
        }
    }

    fn emit_update(&mut self, order: Order, reason: Option<String>) {
        let strategy = order.strategy.clone();
        self.emit(&strategy, ExecutionEvent::OrderUpdate { order, reason });
    }

    fn emit(&mut self, strategy: &StrategyId, event: ExecutionEvent) {
        match self.routes.get(strategy) {
            Some(tx) => {
                if tx.send(event).is_err() {
                    warn!(%strategy, "execution event receiver dropped - route removed");
                    self.routes.remove(strategy);
                }
            }
            None => debug!(%strategy, "execution event for unregistered strategy - dropped"),
        }
    }
}

async fn next_fill(fills: &mut Option<BoxStream<'static, Fill>>) -> Option<Fill> {
    match fills {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}
