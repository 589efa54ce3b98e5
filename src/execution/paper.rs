//! Paper broker
//!
//! Market orders fill at their reference price. Limit orders rest until a later
//! bar trades through them and then fill at the limit.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use super::broker::Broker;
use super::order::{AccountSnapshot, BrokerError, ClosedLeg, Fill, OrderAck, OrderRequest, OrderStatus};
use super::position::AccountLedger;
use crate::trading_core::bars::Bar;
use crate::trading_core::grid::OrderKind;

struct PaperState {
    ledger: AccountLedger,
    working: Vec<OrderRequest>,
}

pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                ledger: AccountLedger::new(starting_balance),
                working: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PaperState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("paper broker state poisoned".to_string()))
    }

    /// Orders still resting
    pub fn working_orders(&self, symbol: &str) -> Vec<OrderRequest> {
        self.lock()
            .map(|s| s.working.iter().filter(|o| o.symbol == symbol).cloned().collect())
            .unwrap_or_default()
    }
}

fn validate(order: &OrderRequest) -> Result<(), BrokerError> {
    if order.volume <= Decimal::ZERO {
        return Err(BrokerError::Rejected {
            id: order.id,
            reason: format!("volume {} not positive", order.volume),
        });
    }
    if !order.price.is_finite() || order.price <= 0.0 {
        return Err(BrokerError::Rejected {
            id: order.id,
            reason: format!("price {} invalid", order.price),
        });
    }
    Ok(())
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError> {
        validate(&order)?;
        let mut state = self.lock()?;
        let order_id = order.id;
        match order.kind {
            OrderKind::Market => {
                let fill = Fill {
                    order_id,
                    symbol: order.symbol.clone(),
                    side: order.side,
                    price: order.price,
                    volume: order.volume,
                    filled_at: Utc::now(),
                };
                state.ledger.open(&fill, order.contract_size);
                debug!("PAPER FILL: {} {} {} @ {:.5}", order.symbol, order.side, order.volume, order.price);
                Ok(OrderAck {
                    order_id,
                    status: OrderStatus::Filled { price: order.price },
                })
            }
            OrderKind::Limit => {
                debug!("PAPER WORKING: {} {} {} @ {:.5}", order.symbol, order.side, order.volume, order.price);
                state.working.push(order);
                Ok(OrderAck {
                    order_id,
                    status: OrderStatus::Working,
                })
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: Uuid) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let before = state.working.len();
        state.working.retain(|o| !(o.id == order_id && o.symbol == symbol));
        if state.working.len() == before {
            return Err(BrokerError::UnknownOrder(order_id));
        }
        Ok(())
    }

    async fn close_legs(
        &self,
        symbol: &str,
        leg_ids: &[Uuid],
        price: f64,
    ) -> Result<Vec<ClosedLeg>, BrokerError> {
        let mut state = self.lock()?;
        for id in leg_ids {
            match state.ledger.position(id) {
                Some(p) if p.symbol == symbol && p.pnl_at(price).is_some() => {}
                Some(_) => {
                    return Err(BrokerError::Rejected {
                        id: *id,
                        reason: format!("cannot close at {}", price),
                    })
                }
                None => return Err(BrokerError::UnknownOrder(*id)),
            }
        }

        let now = Utc::now();
        let closed: Vec<ClosedLeg> = leg_ids
            .iter()
            .filter_map(|id| state.ledger.close(*id, price, now))
            .collect();
        info!("PAPER CLOSE: {} {} legs @ {:.5}", symbol, closed.len(), price);
        Ok(closed)
    }

    async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        Ok(self.lock()?.ledger.snapshot())
    }

    async fn poll_fills(&self, symbol: &str, bar: &Bar) -> Result<Vec<Fill>, BrokerError> {
        let mut state = self.lock()?;
        let (hit, resting): (Vec<OrderRequest>, Vec<OrderRequest>) = std::mem::take(&mut state.working)
            .into_iter()
            .partition(|o| o.symbol == symbol && o.touched(bar.low, bar.high));
        state.working = resting;

        let mut fills = Vec::with_capacity(hit.len());
        for order in hit {
            let fill = Fill {
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: order.side,
                price: order.price,
                volume: order.volume,
                filled_at: bar.open_time,
            };
            state.ledger.open(&fill, order.contract_size);
            debug!("PAPER FILL: {} {} {} @ {:.5} (limit)", order.symbol, order.side, order.volume, order.price);
            fills.push(fill);
        }
        Ok(fills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::test_support::minute_bar;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn order(side: Side, kind: OrderKind, price: f64) -> OrderRequest {
        OrderRequest {
            id: Uuid::new_v4(),
            symbol: "EURUSD".into(),
            side,
            kind,
            price,
            volume: dec!(1),
            contract_size: dec!(1),
        }
    }

    #[tokio::test]
    async fn test_market_fills_and_limit_rests() {
        let broker = PaperBroker::new(dec!(1000));
        let market = broker.place_order(order(Side::Buy, OrderKind::Market, 100.0)).await.unwrap();
        assert_eq!(market.status, OrderStatus::Filled { price: 100.0 });

        let limit = broker.place_order(order(Side::Buy, OrderKind::Limit, 95.0)).await.unwrap();
        assert_eq!(limit.status, OrderStatus::Working);
        assert_eq!(broker.working_orders("EURUSD").len(), 1);
        assert_eq!(broker.account().await.unwrap().open_positions, 1);
    }

    #[tokio::test]
    async fn test_limit_fills_when_bar_trades_through() {
        let broker = PaperBroker::new(dec!(1000));
        let limit = order(Side::Buy, OrderKind::Limit, 95.0);
        let id = limit.id;
        broker.place_order(limit).await.unwrap();

        let above = minute_bar(0, 97.0, 98.0, 96.0, 97.5, 100.0);
        assert!(broker.poll_fills("EURUSD", &above).await.unwrap().is_empty());

        let through = minute_bar(1, 96.0, 96.5, 94.5, 95.5, 100.0);
        let fills = broker.poll_fills("EURUSD", &through).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, id);
        assert_eq!(fills[0].price, 95.0);
        assert!(broker.working_orders("EURUSD").is_empty());
    }

    #[tokio::test]
    async fn test_close_legs_books_profit() {
        let broker = PaperBroker::new(dec!(1000));
        let a = order(Side::Sell, OrderKind::Market, 100.0);
        let b = order(Side::Sell, OrderKind::Market, 102.0);
        let ids = vec![a.id, b.id];
        broker.place_order(a).await.unwrap();
        broker.place_order(b).await.unwrap();

        let closed = broker.close_legs("EURUSD", &ids, 98.0).await.unwrap();
        let total: Decimal = closed.iter().map(|c| c.pnl).sum();
        assert_eq!(total, dec!(6));
        let account = broker.account().await.unwrap();
        assert_eq!(account.balance, dec!(1006));
        assert_eq!(account.open_positions, 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_invalid_volume() {
        let broker = PaperBroker::new(dec!(1000));
        assert_eq!(
            broker.cancel_order("EURUSD", Uuid::nil()).await,
            Err(BrokerError::UnknownOrder(Uuid::nil()))
        );
        let mut bad = order(Side::Buy, OrderKind::Market, 100.0);
        bad.volume = Decimal::ZERO;
        assert!(matches!(broker.place_order(bad).await, Err(BrokerError::Rejected { .. })));
    }
}
