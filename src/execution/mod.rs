//! Execution module: grid actions to broker orders
//!
//! The decision core only produces `TradeAction`s. This module owns the
//! broker contract, the paper broker used for replay, and the engine that
//! applies actions and reports fills back into the grid.

mod broker;
mod engine;
mod order;
mod paper;
mod position;

pub use broker::Broker;
pub use engine::{ExecutionEngine, ExecutionEvent};
pub use order::{AccountSnapshot, BrokerError, ClosedLeg, Fill, OrderAck, OrderRequest, OrderStatus};
pub use paper::PaperBroker;
pub use position::{AccountLedger, OpenPosition};
