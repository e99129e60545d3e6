use crate::{
    clock::SharedClock,
    execution::{
        broker::{AccountSnapshot, BrokerAdapter, BrokerCapabilities, BrokerOrderStatus},
        error::ExecutionError,
        order::{BrokerOrderId, Fill, OrderId, OrderKind, OrderRequest, OrderState},
    },
    types::{Side, Symbol},
};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use rust_decimal::Decimal;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// In-memory broker backing `paper` mode and the runtime tests.
///
/// Market orders fill instantly at the symbol's last mark price; limit and stop orders rest
/// until a mark crosses them. Fills are published on a broadcast stream with per-order
/// sequence numbers, exactly as a live push-stream broker would.
#[derive(Clone)]
pub struct PaperBroker {
    name: String,
    capabilities: BrokerCapabilities,
    clock: SharedClock,
    inner: Arc<parking_lot::Mutex<PaperInner>>,
    fill_tx: broadcast::Sender<Fill>,
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBroker")
            .field("name", &self.name)
            .field("orders", &self.inner.lock().orders.len())
            .finish()
    }
}

struct PaperInner {
    account: AccountSnapshot,
    fee_rate: Decimal,
    connected: bool,
    marks: HashMap<Symbol, Decimal>,
    orders: HashMap<BrokerOrderId, PaperOrder>,
    by_client: HashMap<OrderId, BrokerOrderId>,
    next_order: u64,
}

struct PaperOrder {
    request: OrderRequest,
    state: OrderState,
    filled_quantity: Decimal,
    average_fill_price: Decimal,
    /// Stop orders arm once triggered; a triggered stop-limit becomes a resting limit.
    triggered: bool,
    fills: Vec<Fill>,
}

impl PaperOrder {
    fn status(&self) -> BrokerOrderStatus {
        BrokerOrderStatus {
            state: self.state,
            filled_quantity: self.filled_quantity,
            average_fill_price: self.average_fill_price,
        }
    }
}

impl PaperBroker {
    pub fn new<S: Into<String>>(name: S, clock: SharedClock, equity: Decimal) -> Self {
        let (fill_tx, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            capabilities: BrokerCapabilities::unrestricted(),
            clock,
            inner: Arc::new(parking_lot::Mutex::new(PaperInner {
                account: AccountSnapshot {
                    cash: equity,
                    equity,
                },
                fee_rate: Decimal::ZERO,
                connected: true,
                marks: HashMap::new(),
                orders: HashMap::new(),
                by_client: HashMap::new(),
                next_order: 0,
            })),
            fill_tx,
        }
    }

    pub fn with_capabilities(mut self, capabilities: BrokerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fee rate as a fraction of fill notional.
    pub fn with_fee_rate(self, fee_rate: Decimal) -> Self {
        self.inner.lock().fee_rate = fee_rate;
        self
    }

    /// Simulate connection loss: every RPC fails with `ConnectionLost` until restored.
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().connected = connected;
    }

    /// Publish a mark price and cross any resting orders it triggers.
    pub fn set_mark(&self, symbol: Symbol, price: Decimal) {
        let fills = {
            let mut inner = self.inner.lock();
            inner.marks.insert(symbol.clone(), price);
            inner.cross(&symbol, price, self.clock.now())
        };
        for fill in fills {
            let _ = self.fill_tx.send(fill);
        }
    }

    /// Manually fill part of a working order, eg/ to script partial-fill scenarios.
    pub fn fill_working(
        &self,
        broker_id: &BrokerOrderId,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), ExecutionError> {
        let fill = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let now = self.clock.now();
            let fee_rate = inner.fee_rate;
            let order = inner
                .orders
                .get_mut(broker_id)
                .ok_or_else(|| ExecutionError::UnknownOrder(broker_id.to_string()))?;
            if order.state.is_terminal() {
                return Err(ExecutionError::Rejected("order already terminal".into()));
            }
            order.record_fill(broker_id.clone(), quantity, price, fee_rate, now)
        };
        let _ = self.fill_tx.send(fill);
        Ok(())
    }

    /// Re-emit an already-published fill, for at-most-once delivery tests.
    pub fn resend_fill(&self, broker_id: &BrokerOrderId, sequence: u64) {
        let fill = self.inner.lock().orders.get(broker_id).and_then(|order| {
            order
                .fills
                .iter()
                .find(|fill| fill.sequence == sequence)
                .cloned()
        });
        if let Some(fill) = fill {
            let _ = self.fill_tx.send(fill);
        }
    }

    /// Broker-assigned id for a submitted client order id, if any.
    pub fn broker_id_of(&self, client_id: &OrderId) -> Option<BrokerOrderId> {
        self.inner.lock().by_client.get(client_id).cloned()
    }
}

impl PaperInner {
    fn ensure_connected(&self) -> Result<(), ExecutionError> {
        if self.connected {
            Ok(())
        } else {
            Err(ExecutionError::ConnectionLost)
        }
    }

    /// Cross resting orders for `symbol` against a fresh mark.
    fn cross(
        &mut self,
        symbol: &Symbol,
        price: Decimal,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<Fill> {
        let fee_rate = self.fee_rate;
        let mut emitted = Vec::new();

        for (broker_id, order) in self.orders.iter_mut() {
            if order.state.is_terminal() || &order.request.symbol != symbol {
                continue;
            }

            if !order.triggered {
                if let Some(stop) = order.request.stop_price {
                    let hit = match order.request.side {
                        Side::Buy => price >= stop,
                        Side::Sell => price <= stop,
                    };
                    if !hit {
                        continue;
                    }
                    order.triggered = true;
                    if order.request.kind == OrderKind::Stop {
                        let quantity = order.request.quantity - order.filled_quantity;
                        emitted.push(order.record_fill(
                            broker_id.clone(),
                            quantity,
                            price,
                            fee_rate,
                            now,
                        ));
                        continue;
                    }
                }
            }

            if let Some(limit) = order.request.limit_price {
                let crossed = match order.request.side {
                    Side::Buy => price <= limit,
                    Side::Sell => price >= limit,
                };
                if crossed {
                    let quantity = order.request.quantity - order.filled_quantity;
                    emitted.push(order.record_fill(
                        broker_id.clone(),
                        quantity,
                        price,
                        fee_rate,
                        now,
                    ));
                }
            }
        }

        emitted
    }
}

impl PaperOrder {
    fn record_fill(
        &mut self,
        broker_id: BrokerOrderId,
        quantity: Decimal,
        price: Decimal,
        fee_rate: Decimal,
        time: chrono::DateTime<chrono::Utc>,
    ) -> Fill {
        let fill = Fill {
            broker_order_id: broker_id,
            sequence: self.fills.len() as u64,
            quantity,
            price,
            fees: (quantity * price).abs() * fee_rate,
            time,
        };

        self.filled_quantity += quantity;
        let filled = self.filled_quantity;
        self.average_fill_price = if filled == Decimal::ZERO {
            Decimal::ZERO
        } else {
            (self.average_fill_price * (filled - quantity) + price * quantity) / filled
        };
        self.state = if self.filled_quantity >= self.request.quantity {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };

        self.fills.push(fill.clone());
        fill
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BrokerCapabilities {
        self.capabilities.clone()
    }

    async fn account(&self) -> Result<AccountSnapshot, ExecutionError> {
        let inner = self.inner.lock();
        inner.ensure_connected()?;
        Ok(inner.account.clone())
    }

    async fn submit(&self, request: &OrderRequest) -> Result<BrokerOrderId, ExecutionError> {
        let (broker_id, immediate) = {
            let mut inner = self.inner.lock();
            inner.ensure_connected()?;

            let mark = match inner.marks.get(&request.symbol) {
                Some(mark) => *mark,
                None if request.kind == OrderKind::Market => {
                    return Err(ExecutionError::Rejected(format!(
                        "no market price for {}",
                        request.symbol
                    )))
                }
                None => Decimal::ZERO,
            };

            let broker_id = BrokerOrderId::new(format!("paper-{}", inner.next_order));
            inner.next_order += 1;

            let mut order = PaperOrder {
                request: request.clone(),
                state: OrderState::Working,
                filled_quantity: Decimal::ZERO,
                average_fill_price: Decimal::ZERO,
                triggered: false,
                fills: Vec::new(),
            };

            let fee_rate = inner.fee_rate;
            let immediate = if request.kind == OrderKind::Market {
                Some(order.record_fill(
                    broker_id.clone(),
                    request.quantity,
                    mark,
                    fee_rate,
                    self.clock.now(),
                ))
            } else {
                None
            };

            inner.by_client.insert(request.id, broker_id.clone());
            inner.orders.insert(broker_id.clone(), order);
            debug!(%broker_id, symbol = %request.symbol, "paper order accepted");

            (broker_id, immediate)
        };

        if let Some(fill) = immediate {
            let _ = self.fill_tx.send(fill);
        }

        // Resting limit orders may already be crossable at the current mark
        let crossed = {
            let mut inner = self.inner.lock();
            match inner.marks.get(&request.symbol).copied() {
                Some(mark) if request.kind != OrderKind::Market => {
                    inner.cross(&request.symbol, mark, self.clock.now())
                }
                _ => Vec::new(),
            }
        };
        for fill in crossed {
            let _ = self.fill_tx.send(fill);
        }

        Ok(broker_id)
    }

    async fn cancel(&self, id: &BrokerOrderId) -> Result<(), ExecutionError> {
        let mut inner = self.inner.lock();
        inner.ensure_connected()?;

        let order = inner
            .orders
            .get_mut(id)
            .ok_or_else(|| ExecutionError::UnknownOrder(id.to_string()))?;
        if order.state.is_terminal() {
            return Err(ExecutionError::Rejected("order already terminal".into()));
        }
        order.state = OrderState::Cancelled;
        Ok(())
    }

    async fn order_status(&self, id: &BrokerOrderId) -> Result<BrokerOrderStatus, ExecutionError> {
        let inner = self.inner.lock();
        inner.ensure_connected()?;
        inner
            .orders
            .get(id)
            .map(PaperOrder::status)
            .ok_or_else(|| ExecutionError::UnknownOrder(id.to_string()))
    }

    async fn lookup(
        &self,
        client_id: &OrderId,
    ) -> Result<Option<(BrokerOrderId, BrokerOrderStatus)>, ExecutionError> {
        let inner = self.inner.lock();
        inner.ensure_connected()?;
        Ok(inner.by_client.get(client_id).map(|broker_id| {
            let status = inner.orders[broker_id].status();
            (broker_id.clone(), status)
        }))
    }

    async fn fills(&self) -> Result<BoxStream<'static, Fill>, ExecutionError> {
        self.inner.lock().ensure_connected()?;
        let stream = BroadcastStream::new(self.fill_tx.subscribe())
            .filter_map(|result| async move { result.ok() });
        Ok(stream.boxed())
    }
}
