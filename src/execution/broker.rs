use crate::execution::{
    error::ExecutionError,
    order::{BrokerOrderId, Fill, OrderId, OrderKind, OrderRequest, OrderState},
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Sizing and order-type constraints of a broker instance.
///
/// Static for the lifetime of the runtime; the portfolio manager gates every order
/// proposal against these before it reaches the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrokerCapabilities {
    pub min_notional: Decimal,
    pub max_position_size: Option<Decimal>,
    pub min_lot_size: Decimal,
    pub step_size: Decimal,
    pub fractional_shares: bool,
    pub supported_order_kinds: Vec<OrderKind>,
}

impl BrokerCapabilities {
    /// Capabilities with no binding constraint, for paper trading and tests.
    pub fn unrestricted() -> Self {
        Self {
            min_notional: Decimal::ZERO,
            max_position_size: None,
            min_lot_size: Decimal::ZERO,
            step_size: Decimal::ZERO,
            fractional_shares: true,
            supported_order_kinds: vec![
                OrderKind::Market,
                OrderKind::Limit,
                OrderKind::Stop,
                OrderKind::StopLimit,
            ],
        }
    }

    pub fn supports(&self, kind: OrderKind) -> bool {
        self.supported_order_kinds.contains(&kind)
    }
}

/// Broker's view of one order, as returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrokerOrderStatus {
    pub state: OrderState,
    pub filled_quantity: Decimal,
    pub average_fill_price: Decimal,
}

/// Broker account totals, read at deploy time for allocation arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountSnapshot {
    pub cash: Decimal,
    pub equity: Decimal,
}

/// Brokerage adapter.
///
/// Implementations own the wire protocol (REST, websocket, FIX, in-memory paper fills);
/// the gateway owns lifecycle tracking, reconciliation and fill dedup on top. Whether an
/// instance is paper or live is encoded in its configuration - the runtime routes
/// submissions without knowing the difference.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Stable broker name used in deploy specs.
    fn name(&self) -> &str;

    fn capabilities(&self) -> BrokerCapabilities;

    async fn account(&self) -> Result<AccountSnapshot, ExecutionError>;

    /// Submit an order. The request carries the local [`OrderId`] as the client order id,
    /// enabling [`BrokerAdapter::lookup`] after a submission timeout.
    async fn submit(&self, request: &OrderRequest) -> Result<BrokerOrderId, ExecutionError>;

    async fn cancel(&self, id: &BrokerOrderId) -> Result<(), ExecutionError>;

    async fn order_status(&self, id: &BrokerOrderId) -> Result<BrokerOrderStatus, ExecutionError>;

    /// Find an order by the client order id it was submitted with. `None` means the broker
    /// never received the submission.
    async fn lookup(
        &self,
        client_id: &OrderId,
    ) -> Result<Option<(BrokerOrderId, BrokerOrderStatus)>, ExecutionError>;

    /// Push stream of fills for every order submitted through this adapter.
    async fn fills(&self) -> Result<BoxStream<'static, Fill>, ExecutionError>;
}
