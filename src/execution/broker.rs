//! Broker contract
//!
//! The decision loop talks to any venue through this trait. [`super::PaperBroker`]
//! is the in-process simulation.

use async_trait::async_trait;
use uuid::Uuid;

use super::order::{AccountSnapshot, BrokerError, ClosedLeg, Fill, OrderAck, OrderRequest};
use crate::trading_core::bars::Bar;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit one leg order
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError>;

    /// Cancel a working order
    async fn cancel_order(&self, symbol: &str, order_id: Uuid) -> Result<(), BrokerError>;

    /// Flatten the given filled legs at market
    async fn close_legs(
        &self,
        symbol: &str,
        leg_ids: &[Uuid],
        price: f64,
    ) -> Result<Vec<ClosedLeg>, BrokerError>;

    async fn account(&self) -> Result<AccountSnapshot, BrokerError>;

    /// Working orders filled since the last poll, given the latest closed bar
    async fn poll_fills(&self, symbol: &str, bar: &Bar) -> Result<Vec<Fill>, BrokerError>;
}
