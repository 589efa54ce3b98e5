//! Order, fill and account types shared by brokers

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::trading_core::grid::{GridLeg, OrderKind};
use crate::types::Side;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("order {id} rejected: {reason}")]
    Rejected { id: Uuid, reason: String },
    #[error("unknown order {0}")]
    UnknownOrder(Uuid),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

impl BrokerError {
    /// Worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One order for one grid leg. The leg id doubles as the client order id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    /// Limit price, or the reference price for market orders
    pub price: f64,
    pub volume: Decimal,
    pub contract_size: Decimal,
}

impl OrderRequest {
    pub fn for_leg(symbol: &str, leg: &GridLeg, kind: OrderKind, contract_size: Decimal) -> Self {
        Self {
            id: leg.id,
            symbol: symbol.to_string(),
            side: leg.side,
            kind,
            price: leg.entry_price,
            volume: leg.volume,
            contract_size,
        }
    }

    /// Whether a bar spanning `low..=high` reaches this limit
    pub fn touched(&self, low: f64, high: f64) -> bool {
        match self.side {
            Side::Buy => low <= self.price,
            Side::Sell => high >= self.price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Filled { price: f64 },
    Working,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: Uuid,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub volume: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// One position closed out of a basket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedLeg {
    pub leg_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub volume: Decimal,
    pub pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub realized_pnl: Decimal,
    pub open_positions: usize,
}
