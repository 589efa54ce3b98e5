//! Execution engine - turns grid actions into broker calls
//!
//! Callers hold the symbol's trader guard while executing, so all order
//! traffic for one symbol is serialized.

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::Broker;
use super::order::{AccountSnapshot, BrokerError, ClosedLeg, OrderRequest, OrderStatus};
use crate::advisory::RetryPolicy;
use crate::trading_core::bars::Bar;
use crate::trading_core::grid::{ExitReason, GridLeg, GridManager, OrderKind, TradeAction};
use crate::types::Side;

/// Events emitted by the execution engine
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Leg accepted by the broker; `fill_price` is set for immediate fills
    LegPlaced {
        symbol: String,
        leg: GridLeg,
        kind: OrderKind,
        basket_id: Option<Uuid>,
        fill_price: Option<f64>,
    },
    /// Resting leg filled
    LegFilled {
        symbol: String,
        leg_id: Uuid,
        price: f64,
    },
    /// Broker refused the leg; it was dropped from the basket
    LegRejected {
        symbol: String,
        leg_id: Uuid,
        reason: String,
    },
    LegsCancelled {
        symbol: String,
        side: Side,
        count: usize,
    },
    /// Every leg of a basket is flat
    BasketClosed {
        symbol: String,
        side: Side,
        basket_id: Uuid,
        reason: ExitReason,
        legs: Vec<ClosedLeg>,
        realized: Decimal,
        peak_profit: Decimal,
    },
    Error {
        symbol: String,
        message: String,
    },
}

pub struct ExecutionEngine {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    event_tx: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionEngine {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            broker,
            retry: RetryPolicy {
                max_attempts: 3,
                base: std::time::Duration::from_millis(200),
                cap: std::time::Duration::from_secs(1),
            },
            event_tx,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Subscribe to execution events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }

    pub async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        self.call("account", || self.broker.account()).await
    }

    /// Apply fills of resting legs that the latest bar reached
    pub async fn sync_fills(&self, symbol: &str, bar: &Bar, grid: &mut GridManager) -> Vec<ExecutionEvent> {
        let fills = match self.call("poll fills", || self.broker.poll_fills(symbol, bar)).await {
            Ok(f) => f,
            Err(e) => return vec![self.emit(error(symbol, format!("fill poll failed: {}", e)))],
        };
        let mut events = Vec::with_capacity(fills.len());
        for fill in fills {
            if grid.on_fill(fill.order_id, fill.price) {
                events.push(self.emit(ExecutionEvent::LegFilled {
                    symbol: symbol.to_string(),
                    leg_id: fill.order_id,
                    price: fill.price,
                }));
            } else {
                warn!("{} fill for unknown leg {}", symbol, fill.order_id);
            }
        }
        events
    }

    /// Execute one bar's actions in order
    pub async fn execute(
        &self,
        symbol: &str,
        actions: &[TradeAction],
        price: f64,
        contract_size: Decimal,
        grid: &mut GridManager,
    ) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        for action in actions {
            match action {
                TradeAction::PlaceLeg { leg, kind } => {
                    events.push(self.place_leg(symbol, leg, *kind, contract_size, grid).await);
                }
                TradeAction::CancelLegs { side, leg_ids } => {
                    let (count, _) = self.cancel_legs(symbol, leg_ids, grid).await;
                    events.push(self.emit(ExecutionEvent::LegsCancelled {
                        symbol: symbol.to_string(),
                        side: *side,
                        count,
                    }));
                }
                TradeAction::CloseBasket { side, basket_id, reason } => {
                    if let Some(event) = self.close_basket(symbol, *side, *basket_id, *reason, price, grid).await {
                        events.push(event);
                    }
                }
            }
        }
        events
    }

    async fn place_leg(
        &self,
        symbol: &str,
        leg: &GridLeg,
        kind: OrderKind,
        contract_size: Decimal,
        grid: &mut GridManager,
    ) -> ExecutionEvent {
        let request = OrderRequest::for_leg(symbol, leg, kind, contract_size);
        match self.call("place order", || self.broker.place_order(request.clone())).await {
            Ok(ack) => {
                let fill_price = match ack.status {
                    OrderStatus::Filled { price } => {
                        grid.on_fill(leg.id, price);
                        Some(price)
                    }
                    OrderStatus::Working => None,
                };
                info!(
                    "ENTRY: {} {} leg {} {} @ {:.5} ({:?})",
                    symbol, leg.side, leg.step_index, leg.volume, leg.entry_price, kind
                );
                self.emit(ExecutionEvent::LegPlaced {
                    symbol: symbol.to_string(),
                    leg: leg.clone(),
                    kind,
                    basket_id: grid.basket(leg.side).map(|b| b.id),
                    fill_price,
                })
            }
            Err(e) => {
                warn!("{} leg {} dropped: {}", symbol, leg.id, e);
                grid.discard_leg(leg.id);
                self.emit(ExecutionEvent::LegRejected {
                    symbol: symbol.to_string(),
                    leg_id: leg.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Cancel resting legs. A leg leaves the grid only once the broker no
    /// longer holds it; failed cancels stay `Cancelling` for the next bar.
    /// Returns (cancelled, failed).
    async fn cancel_legs(&self, symbol: &str, leg_ids: &[Uuid], grid: &mut GridManager) -> (usize, usize) {
        let mut cancelled = 0;
        let mut failed = 0;
        for id in leg_ids {
            match self.call("cancel order", || self.broker.cancel_order(symbol, *id)).await {
                Ok(()) => {
                    cancelled += 1;
                    grid.discard_leg(*id);
                }
                Err(BrokerError::UnknownOrder(_)) => {
                    debug!("{} leg {} already gone", symbol, id);
                    grid.discard_leg(*id);
                }
                Err(e) => {
                    warn!("{} cancel of {} failed: {}", symbol, id, e);
                    failed += 1;
                }
            }
        }
        (cancelled, failed)
    }

    async fn close_basket(
        &self,
        symbol: &str,
        side: Side,
        basket_id: Uuid,
        reason: ExitReason,
        price: f64,
        grid: &mut GridManager,
    ) -> Option<ExecutionEvent> {
        let basket = grid.basket(side)?;
        if basket.id != basket_id {
            debug!("{} close for stale basket {} ignored", symbol, basket_id);
            return None;
        }
        let resting = basket.resting_leg_ids();

        let (_, failed) = self.cancel_legs(symbol, &resting, grid).await;
        if failed > 0 {
            // a live order could still fill; flatten once the broker holds none
            return Some(self.emit(error(
                symbol,
                format!("{} basket close waits on {} unconfirmed cancels", side, failed),
            )));
        }

        let basket = grid.basket(side)?;
        let open: Vec<Uuid> = basket.open_legs().map(|l| l.id).collect();
        let peak_profit = basket.peak_profit;

        let closed = if open.is_empty() {
            Vec::new()
        } else {
            match self.call("close legs", || self.broker.close_legs(symbol, &open, price)).await {
                Ok(c) => c,
                Err(e) => {
                    // basket stays in Closing; the trader re-issues the close next bar
                    return Some(self.emit(error(symbol, format!("{} basket close failed: {}", side, e))));
                }
            }
        };

        grid.confirm_closed(side);
        let realized: Decimal = closed.iter().map(|c| c.pnl).sum();
        info!(
            "EXIT: {} {} basket {} | {} legs | realized {} | peak {}",
            symbol,
            side,
            reason,
            closed.len(),
            realized,
            peak_profit
        );
        Some(self.emit(ExecutionEvent::BasketClosed {
            symbol: symbol.to_string(),
            side,
            basket_id,
            reason,
            legs: closed,
            realized,
            peak_profit,
        }))
    }

    async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!("Broker {} failed (attempt {}): {} - retrying in {:?}", what, attempt, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn emit(&self, event: ExecutionEvent) -> ExecutionEvent {
        let _ = self.event_tx.send(event.clone());
        event
    }
}

fn error(symbol: &str, message: String) -> ExecutionEvent {
    ExecutionEvent::Error {
        symbol: symbol.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::order::{Fill, OrderAck};
    use crate::execution::paper::PaperBroker;
    use crate::trading_core::grid::{GridConfig, GridState};
    use crate::trading_core::risk::VolumeConstraints;
    use crate::trading_core::test_support::minute_bar;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn grid() -> GridManager {
        GridManager::new(
            GridConfig {
                band_points: 0.0,
                ..Default::default()
            },
            dec!(1),
        )
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: std::time::Duration::from_millis(1),
            cap: std::time::Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_ladder_then_take_profit_close() {
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        let engine = ExecutionEngine::new(broker.clone());
        let mut events = engine.subscribe();
        let mut grid = grid();

        let actions = grid
            .plan_entry(Side::Buy, 100.0, None, dec!(1), &VolumeConstraints::default(), Utc::now())
            .unwrap();
        let placed = engine.execute("EURUSD", &actions, 100.0, dec!(1), &mut grid).await;
        assert_eq!(placed.len(), actions.len());
        assert!(matches!(events.recv().await.unwrap(), ExecutionEvent::LegPlaced { fill_price: Some(_), .. }));
        assert_eq!(grid.basket(Side::Buy).unwrap().open_legs().count(), 1);

        // first limit at 90 fills on a bar trading down to it
        let dip = minute_bar(1, 92.0, 92.5, 89.5, 91.0, 100.0);
        let fills = engine.sync_fills("EURUSD", &dip, &mut grid).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(grid.basket(Side::Buy).unwrap().open_legs().count(), 2);

        let evaluation = grid.evaluate_side(Side::Buy, 120.0, dec!(5)).unwrap();
        assert!(evaluation.should_close);
        let close = grid.pending_close(Side::Buy).unwrap();
        let closed = engine.execute("EURUSD", &[close], 120.0, dec!(1), &mut grid).await;

        match &closed[0] {
            ExecutionEvent::BasketClosed { legs, realized, reason, .. } => {
                assert_eq!(legs.len(), 2);
                // 20 × 1 + 30 × 1.5
                assert_eq!(*realized, dec!(65));
                assert_eq!(*reason, ExitReason::TakeProfit);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(grid.state(Side::Buy), GridState::Empty);
        assert!(broker.working_orders("EURUSD").is_empty());
        assert_eq!(engine.account().await.unwrap().balance, dec!(10065));
    }

    struct FlakyBroker {
        failures: AtomicUsize,
        cancel_failures: AtomicUsize,
        inner: PaperBroker,
    }

    impl FlakyBroker {
        fn new(failures: usize, cancel_failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                cancel_failures: AtomicUsize::new(cancel_failures),
                inner: PaperBroker::new(dec!(1000)),
            }
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError> {
            if take_failure(&self.failures) {
                return Err(BrokerError::Unavailable("gateway timeout".into()));
            }
            self.inner.place_order(order).await
        }
        async fn cancel_order(&self, symbol: &str, order_id: Uuid) -> Result<(), BrokerError> {
            if take_failure(&self.cancel_failures) {
                return Err(BrokerError::Unavailable("cancel gateway down".into()));
            }
            self.inner.cancel_order(symbol, order_id).await
        }
        async fn close_legs(&self, symbol: &str, leg_ids: &[Uuid], price: f64) -> Result<Vec<ClosedLeg>, BrokerError> {
            self.inner.close_legs(symbol, leg_ids, price).await
        }
        async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
            self.inner.account().await
        }
        async fn poll_fills(&self, symbol: &str, bar: &Bar) -> Result<Vec<Fill>, BrokerError> {
            self.inner.poll_fills(symbol, bar).await
        }
    }

    #[tokio::test]
    async fn test_transient_broker_failure_retried_then_dropped() {
        let mut grid = grid();
        let actions = grid
            .plan_entry(Side::Sell, 100.0, None, dec!(1), &VolumeConstraints::default(), Utc::now())
            .unwrap();
        let market = &actions[..1];

        // two failures then success
        let broker = Arc::new(FlakyBroker::new(2, 0));
        let engine = ExecutionEngine::new(broker).with_retry(quick_retry());
        let events = engine.execute("EURUSD", market, 100.0, dec!(1), &mut grid).await;
        assert!(matches!(events[0], ExecutionEvent::LegPlaced { .. }));

        // more failures than attempts: leg is discarded
        let mut grid = self::grid();
        let actions = grid
            .plan_entry(Side::Sell, 100.0, None, dec!(1), &VolumeConstraints::default(), Utc::now())
            .unwrap();
        let broker = Arc::new(FlakyBroker::new(10, 0));
        let engine = ExecutionEngine::new(broker).with_retry(quick_retry());
        let events = engine.execute("EURUSD", &actions[..1], 100.0, dec!(1), &mut grid).await;
        assert!(matches!(events[0], ExecutionEvent::LegRejected { .. }));
        let leg_id = match &actions[0] {
            TradeAction::PlaceLeg { leg, .. } => leg.id,
            _ => unreachable!(),
        };
        assert!(grid
            .basket(Side::Sell)
            .map_or(true, |b| b.legs.iter().all(|l| l.id != leg_id)));
    }

    #[tokio::test]
    async fn test_basket_close_waits_for_unconfirmed_cancels() {
        let broker = Arc::new(FlakyBroker::new(0, 1000));
        let engine = ExecutionEngine::new(broker.clone()).with_retry(quick_retry());
        let mut grid = grid();

        let actions = grid
            .plan_entry(Side::Buy, 100.0, None, dec!(1), &VolumeConstraints::default(), Utc::now())
            .unwrap();
        engine.execute("EURUSD", &actions, 100.0, dec!(1), &mut grid).await;
        assert!(grid.evaluate_side(Side::Buy, 120.0, dec!(5)).unwrap().should_close);

        // cancels keep failing: nothing is flattened and the basket keeps its legs
        let close = grid.pending_close(Side::Buy).unwrap();
        let events = engine.execute("EURUSD", &[close], 120.0, dec!(1), &mut grid).await;
        assert!(matches!(events[0], ExecutionEvent::Error { .. }));
        assert_eq!(grid.state(Side::Buy), GridState::Closing);
        assert_eq!(grid.basket(Side::Buy).unwrap().legs.len(), 5);
        assert_eq!(broker.inner.working_orders("EURUSD").len(), 4);

        // the order that could not be cancelled fills and stays tracked
        let dip = minute_bar(1, 92.0, 92.5, 89.5, 91.0, 100.0);
        let fills = engine.sync_fills("EURUSD", &dip, &mut grid).await;
        assert!(matches!(fills.as_slice(), [ExecutionEvent::LegFilled { .. }]));
        assert_eq!(grid.basket(Side::Buy).unwrap().open_legs().count(), 2);

        broker.cancel_failures.store(0, Ordering::SeqCst);
        let close = grid.pending_close(Side::Buy).unwrap();
        let events = engine.execute("EURUSD", &[close], 120.0, dec!(1), &mut grid).await;
        match &events[0] {
            ExecutionEvent::BasketClosed { legs, realized, .. } => {
                assert_eq!(legs.len(), 2);
                assert_eq!(*realized, dec!(65));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(grid.state(Side::Buy), GridState::Empty);
        assert!(broker.inner.working_orders("EURUSD").is_empty());
    }
}
