//! Martingale grid manager
//!
//! One basket per side. A basket moves through:
//! - Building: at least one ladder leg still pending
//! - Managing: every leg filled, exits evaluated each bar
//! - Closing: exit requested, waiting for the broker to flatten
//!
//! Legs are never closed one by one; the whole basket goes at once.
//! A pending leg leaves the basket only after the broker confirmed its
//! cancel; until then it sits in `Cancelling` and can still fill.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::risk::{to_decimal, VolumeConstraints};
use super::smoother::PriceSmoother;
use crate::types::Side;

/// Upper bound for `GridConfig::max_legs`
pub const MAX_GRID_LEGS: usize = 50;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridError {
    #[error("{0} basket is closing; new ladder refused")]
    BasketClosing(Side),
    #[error("{side} basket already holds {legs} legs")]
    MaxLegsReached { side: Side, legs: usize },
    #[error("price {price:.5} is on the wrong side of the smoothed band around {estimate:.5}")]
    AgainstSmoothedTrend { price: f64, estimate: f64 },
    #[error("fibonacci ladder needs a swing range")]
    MissingSwingRange,
    #[error("base lot must be positive, got {0}")]
    InvalidLot(Decimal),
    #[error("price {0} cannot be used for P&L")]
    InvalidPrice(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LadderMode {
    Fibonacci,
    #[default]
    FixedPoints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotProgression {
    Fibonacci,
    #[default]
    Geometric,
}

/// Grid configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub ladder: LadderMode,
    /// Distance between fixed ladder levels
    pub step_points: f64,
    /// Retracement ratios of the last swing range
    pub fib_levels: Vec<f64>,
    pub max_legs: usize,
    pub progression: LotProgression,
    pub lot_multiplier: Decimal,
    /// Floating profit that arms the trailing lock
    pub lock_trigger: Decimal,
    /// Fraction of peak profit the lock protects
    pub lock_retrace: Decimal,
    /// Allow buy and sell baskets at the same time
    pub hedging: bool,
    /// Tolerance around the smoothed price; 0 disables the gate
    pub band_points: f64,
    pub process_variance: f64,
    pub measurement_variance: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            ladder: LadderMode::FixedPoints,
            step_points: 10.0,
            fib_levels: vec![0.382, 0.5, 0.618, 0.786],
            max_legs: 5,
            progression: LotProgression::Geometric,
            lot_multiplier: Decimal::new(15, 1), // 1.5
            lock_trigger: Decimal::new(20, 0),
            lock_retrace: Decimal::new(5, 1), // 50% of peak
            hedging: false,
            band_points: 10.0,
            process_variance: 0.01,
            measurement_variance: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Pending,
    /// Cancel sent, broker has not confirmed it
    Cancelling,
    Open,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLeg {
    pub id: Uuid,
    pub side: Side,
    pub entry_price: f64,
    pub volume: Decimal,
    pub step_index: usize,
    pub status: LegStatus,
}

impl GridLeg {
    pub fn floating_pnl(&self, price: f64, contract_size: Decimal) -> Result<Decimal, GridError> {
        let points = (price - self.entry_price) * self.side.sign();
        let points = to_decimal(points).map_err(|_| GridError::InvalidPrice(price))?;
        Ok(points * self.volume * contract_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridState {
    Empty,
    Building,
    Managing,
    Closing,
}

impl std::fmt::Display for GridState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GridState::Empty => write!(f, "EMPTY"),
            GridState::Building => write!(f, "BUILDING"),
            GridState::Managing => write!(f, "MANAGING"),
            GridState::Closing => write!(f, "CLOSING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basket {
    pub id: Uuid,
    pub side: Side,
    pub legs: Vec<GridLeg>,
    /// Highest floating profit seen, also the favourable excursion
    pub peak_profit: Decimal,
    pub lock_level: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    exit: Option<ExitReason>,
}

impl Basket {
    fn new(side: Side, opened_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            side,
            legs: Vec::new(),
            peak_profit: Decimal::ZERO,
            lock_level: None,
            opened_at,
            exit: None,
        }
    }

    pub fn state(&self) -> GridState {
        if self.exit.is_some() {
            GridState::Closing
        } else if self.legs.iter().any(|l| l.status == LegStatus::Pending) {
            GridState::Building
        } else if self.open_legs().next().is_some() {
            GridState::Managing
        } else {
            GridState::Empty
        }
    }

    pub fn is_closing(&self) -> bool {
        self.exit.is_some()
    }

    /// Why the basket is being closed, once it is
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    pub fn open_legs(&self) -> impl Iterator<Item = &GridLeg> {
        self.legs.iter().filter(|l| l.status == LegStatus::Open)
    }

    /// Legs that still rest at the broker: pending or awaiting a cancel
    pub fn resting_leg_ids(&self) -> Vec<Uuid> {
        self.legs
            .iter()
            .filter(|l| l.status != LegStatus::Open)
            .map(|l| l.id)
            .collect()
    }

    fn cancelling_leg_ids(&self) -> Vec<Uuid> {
        self.legs
            .iter()
            .filter(|l| l.status == LegStatus::Cancelling)
            .map(|l| l.id)
            .collect()
    }

    pub fn open_volume(&self) -> Decimal {
        self.open_legs().map(|l| l.volume).sum()
    }

    /// Volume-weighted entry of the open legs
    pub fn average_entry(&self) -> Option<f64> {
        let total: f64 = self.open_legs().filter_map(|l| l.volume.to_f64()).sum();
        if total <= 0.0 {
            return None;
        }
        let weighted: f64 = self
            .open_legs()
            .filter_map(|l| l.volume.to_f64().map(|v| v * l.entry_price))
            .sum();
        Some(weighted / total)
    }

    pub fn floating_pnl(&self, price: f64, contract_size: Decimal) -> Result<Decimal, GridError> {
        self.open_legs()
            .map(|l| l.floating_pnl(price, contract_size))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    TrailingLock,
    Reversal,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::TrailingLock => write!(f, "trailing_lock"),
            ExitReason::Reversal => write!(f, "reversal"),
        }
    }
}

/// Instruction for the execution layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TradeAction {
    PlaceLeg { leg: GridLeg, kind: OrderKind },
    CancelLegs { side: Side, leg_ids: Vec<Uuid> },
    CloseBasket { side: Side, basket_id: Uuid, reason: ExitReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketEvaluation {
    pub side: Side,
    pub floating_pnl: Decimal,
    pub peak_profit: Decimal,
    pub target: Decimal,
    pub lock_level: Option<Decimal>,
    pub should_close: bool,
    pub reason: Option<ExitReason>,
}

/// Grid and basket bookkeeping for one symbol
#[derive(Debug, Clone)]
pub struct GridManager {
    config: GridConfig,
    contract_size: Decimal,
    buy: Option<Basket>,
    sell: Option<Basket>,
    smoother: PriceSmoother,
}

impl GridManager {
    pub fn new(config: GridConfig, contract_size: Decimal) -> Self {
        let smoother = PriceSmoother::new(config.process_variance, config.measurement_variance);
        Self {
            config,
            contract_size,
            buy: None,
            sell: None,
            smoother,
        }
    }

    pub fn set_config(&mut self, config: GridConfig, contract_size: Decimal) {
        self.smoother
            .set_variances(config.process_variance, config.measurement_variance);
        self.config = config;
        self.contract_size = contract_size;
    }

    pub fn basket(&self, side: Side) -> Option<&Basket> {
        match side {
            Side::Buy => self.buy.as_ref(),
            Side::Sell => self.sell.as_ref(),
        }
    }

    fn slot(&mut self, side: Side) -> &mut Option<Basket> {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    pub fn state(&self, side: Side) -> GridState {
        self.basket(side).map(|b| b.state()).unwrap_or(GridState::Empty)
    }

    pub fn smoothed_price(&self) -> Option<f64> {
        self.smoother.estimate()
    }

    /// Fold a closed-bar price into the smoother
    pub fn observe_price(&mut self, close: f64) -> f64 {
        self.smoother.update(close)
    }

    /// Build a ladder for `side` anchored at `price`.
    ///
    /// With hedging off an opposite basket is closed first and the ladder is
    /// deferred; the returned actions then hold only that close.
    pub fn plan_entry(
        &mut self,
        side: Side,
        price: f64,
        swing_range: Option<(f64, f64)>,
        base_lot: Decimal,
        volume: &VolumeConstraints,
        now: DateTime<Utc>,
    ) -> Result<Vec<TradeAction>, GridError> {
        if base_lot <= Decimal::ZERO {
            return Err(GridError::InvalidLot(base_lot));
        }
        let mut actions = Vec::new();

        if !self.config.hedging {
            if let Some(opposite) = self.slot(side.opposite()).as_mut() {
                if opposite.exit.is_none() {
                    opposite.exit = Some(ExitReason::Reversal);
                    info!("GRID REVERSAL: closing {} basket before {} ladder", opposite.side, side);
                    actions.push(TradeAction::CloseBasket {
                        side: opposite.side,
                        basket_id: opposite.id,
                        reason: ExitReason::Reversal,
                    });
                }
                return Ok(actions);
            }
        }

        if self.basket(side).is_some_and(|b| b.is_closing()) {
            return Err(GridError::BasketClosing(side));
        }

        if let Some(estimate) = self.smoother.estimate() {
            let band = self.config.band_points;
            let against = match side {
                Side::Buy => price < estimate - band,
                Side::Sell => price > estimate + band,
            };
            if band > 0.0 && against {
                return Err(GridError::AgainstSmoothedTrend { price, estimate });
            }
        }

        // legs whose cancel is unconfirmed may still fill, so they keep their slot
        let open_count = self
            .basket(side)
            .map(|b| {
                b.legs
                    .iter()
                    .filter(|l| l.status != LegStatus::Pending)
                    .count()
            })
            .unwrap_or(0);
        let available = self.config.max_legs.saturating_sub(open_count);
        if available == 0 {
            return Err(GridError::MaxLegsReached {
                side,
                legs: open_count,
            });
        }
        let levels = self.ladder_prices(side, price, swing_range, available)?;
        let progression = self.config.progression;
        let multiplier = self.config.lot_multiplier;

        let basket = self.slot(side).get_or_insert_with(|| Basket::new(side, now));

        let mut stale = Vec::new();
        for leg in basket.legs.iter_mut().filter(|l| l.status == LegStatus::Pending) {
            leg.status = LegStatus::Cancelling;
            stale.push(leg.id);
        }
        if !stale.is_empty() {
            debug!("GRID: cancelling {} stale {} legs", stale.len(), side);
            actions.push(TradeAction::CancelLegs {
                side,
                leg_ids: stale,
            });
        }

        for (k, level) in levels.iter().enumerate() {
            let step_index = open_count + k;
            let lot = volume.normalize(lot_for_step(progression, base_lot, multiplier, step_index, volume.max));
            let leg = GridLeg {
                id: Uuid::new_v4(),
                side,
                entry_price: *level,
                volume: lot,
                step_index,
                status: LegStatus::Pending,
            };
            basket.legs.push(leg.clone());
            actions.push(TradeAction::PlaceLeg {
                leg,
                kind: if k == 0 { OrderKind::Market } else { OrderKind::Limit },
            });
        }

        info!(
            "GRID LADDER: {} {} legs from {:.5} | base lot {}",
            side,
            levels.len(),
            price,
            base_lot
        );
        Ok(actions)
    }

    fn ladder_prices(
        &self,
        side: Side,
        price: f64,
        swing_range: Option<(f64, f64)>,
        count: usize,
    ) -> Result<Vec<f64>, GridError> {
        let mut levels = vec![price];
        match self.config.ladder {
            LadderMode::FixedPoints => {
                for k in 1..count {
                    levels.push(price - side.sign() * self.config.step_points * k as f64);
                }
            }
            LadderMode::Fibonacci => {
                let (high, low) = swing_range
                    .filter(|(h, l)| h > l)
                    .ok_or(GridError::MissingSwingRange)?;
                let span = high - low;
                let mut fibs: Vec<f64> = self
                    .config
                    .fib_levels
                    .iter()
                    .map(|r| match side {
                        Side::Buy => high - span * r,
                        Side::Sell => low + span * r,
                    })
                    .filter(|p| match side {
                        Side::Buy => *p < price,
                        Side::Sell => *p > price,
                    })
                    .collect();
                // nearest level first
                fibs.sort_by(|a, b| {
                    let da = (a - price).abs();
                    let db = (b - price).abs();
                    da.total_cmp(&db)
                });
                levels.extend(fibs);
            }
        }
        levels.truncate(count);
        Ok(levels)
    }

    /// Mark a pending leg filled. Returns false for unknown ids.
    pub fn on_fill(&mut self, leg_id: Uuid, fill_price: f64) -> bool {
        for basket in [self.buy.as_mut(), self.sell.as_mut()].into_iter().flatten() {
            if let Some(leg) = basket.legs.iter_mut().find(|l| l.id == leg_id) {
                match leg.status {
                    LegStatus::Pending => {
                        debug!("GRID FILL: {} leg {} @ {:.5}", leg.side, leg.step_index, fill_price);
                    }
                    LegStatus::Cancelling => {
                        warn!(
                            "GRID FILL: {} leg {} filled @ {:.5} before its cancel, kept in basket",
                            leg.side, leg.step_index, fill_price
                        );
                    }
                    LegStatus::Open => return true,
                }
                leg.status = LegStatus::Open;
                leg.entry_price = fill_price;
                return true;
            }
        }
        false
    }

    /// Drop a resting leg the broker no longer holds: refused or cancelled.
    /// Filled legs are kept; only a basket close removes them.
    pub fn discard_leg(&mut self, leg_id: Uuid) {
        for side in [Side::Buy, Side::Sell] {
            let slot = self.slot(side);
            if let Some(basket) = slot.as_mut() {
                basket.legs.retain(|l| l.id != leg_id || l.status == LegStatus::Open);
                if basket.legs.is_empty() && !basket.is_closing() {
                    *slot = None;
                }
            }
        }
    }

    /// Update peaks and decide exits for both baskets at one target
    pub fn evaluate(&mut self, price: f64, target: Decimal) -> Vec<BasketEvaluation> {
        [Side::Buy, Side::Sell]
            .into_iter()
            .filter_map(|side| self.evaluate_side(side, price, target))
            .collect()
    }

    /// Update the peak and decide the exit of one basket at `price`
    pub fn evaluate_side(&mut self, side: Side, price: f64, target: Decimal) -> Option<BasketEvaluation> {
        let contract_size = self.contract_size;
        let lock_trigger = self.config.lock_trigger;
        let lock_retrace = self.config.lock_retrace;

        let basket = self.slot(side).as_mut()?;
        if basket.is_closing() || basket.open_legs().next().is_none() {
            return None;
        }
        let floating = match basket.floating_pnl(price, contract_size) {
            Ok(v) => v,
            Err(e) => {
                warn!("GRID: {} basket not evaluated: {}", side, e);
                return None;
            }
        };

        if floating > basket.peak_profit {
            basket.peak_profit = floating;
        }
        if lock_trigger > Decimal::ZERO && basket.peak_profit >= lock_trigger {
            basket.lock_level = Some(basket.peak_profit * lock_retrace);
        }

        let reason = if floating >= target {
            Some(ExitReason::TakeProfit)
        } else if basket.lock_level.is_some_and(|lock| floating < lock) {
            Some(ExitReason::TrailingLock)
        } else {
            None
        };

        if let Some(r) = reason {
            basket.exit = Some(r);
            info!(
                "BASKET EXIT: {} {} | P&L {} | peak {} | target {}",
                side, r, floating, basket.peak_profit, target
            );
        }

        Some(BasketEvaluation {
            side,
            floating_pnl: floating,
            peak_profit: basket.peak_profit,
            target,
            lock_level: basket.lock_level,
            should_close: reason.is_some(),
            reason,
        })
    }

    /// Close action for a basket already flagged as closing
    pub fn close_action(&self, side: Side, reason: ExitReason) -> Option<TradeAction> {
        let basket = self.basket(side)?;
        Some(TradeAction::CloseBasket {
            side,
            basket_id: basket.id,
            reason,
        })
    }

    /// Re-issue the close of a basket the broker has not flattened yet
    pub fn pending_close(&self, side: Side) -> Option<TradeAction> {
        let reason = self.basket(side)?.exit_reason()?;
        self.close_action(side, reason)
    }

    /// Re-issue cancels the broker has not confirmed yet. Closing baskets
    /// are covered by their close.
    pub fn pending_cancel(&self, side: Side) -> Option<TradeAction> {
        let basket = self.basket(side)?;
        if basket.is_closing() {
            return None;
        }
        let leg_ids = basket.cancelling_leg_ids();
        (!leg_ids.is_empty()).then_some(TradeAction::CancelLegs { side, leg_ids })
    }

    /// Forget a basket once the broker confirmed it flat
    pub fn confirm_closed(&mut self, side: Side) -> Option<Basket> {
        self.slot(side).take()
    }
}

/// Lot for the `step`th leg (0-based), never above `cap`
pub fn lot_for_step(
    progression: LotProgression,
    base: Decimal,
    multiplier: Decimal,
    step: usize,
    cap: Decimal,
) -> Decimal {
    let lot = match progression {
        LotProgression::Fibonacci => base.checked_mul(Decimal::from(fibonacci(step + 1))),
        LotProgression::Geometric => {
            let mut lot = Some(base);
            for _ in 0..step {
                match lot {
                    Some(l) if l < cap => lot = l.checked_mul(multiplier),
                    _ => break,
                }
            }
            lot
        }
    };
    lot.map_or(cap, |l| l.min(cap))
}

/// fib(1) = fib(2) = 1
fn fibonacci(n: usize) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
