//! Account ledger: open leg positions, balance and realized P&L

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::order::{AccountSnapshot, ClosedLeg, Fill};
use crate::trading_core::risk::to_decimal;
use crate::types::Side;

/// One filled leg still open
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub volume: Decimal,
    pub contract_size: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl OpenPosition {
    /// P&L if closed at `price`
    pub fn pnl_at(&self, price: f64) -> Option<Decimal> {
        let move_points = to_decimal((price - self.entry_price) * self.side.sign()).ok()?;
        Some(move_points * self.volume * self.contract_size)
    }
}

#[derive(Debug)]
pub struct AccountLedger {
    positions: HashMap<Uuid, OpenPosition>,
    history: VecDeque<ClosedLeg>,
    balance: Decimal,
    realized: Decimal,
    max_history: usize,
}

impl AccountLedger {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            positions: HashMap::new(),
            history: VecDeque::new(),
            balance: starting_balance,
            realized: Decimal::ZERO,
            max_history: 1000,
        }
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn position(&self, leg_id: &Uuid) -> Option<&OpenPosition> {
        self.positions.get(leg_id)
    }

    /// Record a fill as a new open position
    pub fn open(&mut self, fill: &Fill, contract_size: Decimal) {
        self.positions.insert(
            fill.order_id,
            OpenPosition {
                symbol: fill.symbol.clone(),
                side: fill.side,
                entry_price: fill.price,
                volume: fill.volume,
                contract_size,
                opened_at: fill.filled_at,
            },
        );
    }

    /// Close one position at `price`, booking its P&L. `None` for unknown legs
    /// or a price that cannot be valued.
    pub fn close(&mut self, leg_id: Uuid, price: f64, at: DateTime<Utc>) -> Option<ClosedLeg> {
        let pnl = self.positions.get(&leg_id)?.pnl_at(price)?;
        let position = self.positions.remove(&leg_id)?;

        self.balance += pnl;
        self.realized += pnl;

        let record = ClosedLeg {
            leg_id,
            symbol: position.symbol,
            side: position.side,
            entry_price: position.entry_price,
            exit_price: price,
            volume: position.volume,
            pnl,
            closed_at: at,
        };
        self.history.push_back(record.clone());
        if self.history.len() > self.max_history {
            self.history.pop_front();
        }
        Some(record)
    }

    pub fn history(&self) -> &VecDeque<ClosedLeg> {
        &self.history
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            balance: self.balance,
            realized_pnl: self.realized,
            open_positions: self.positions.len(),
        }
    }
}
