//! Journal contract and records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Direction, Side};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("journal writer has stopped")]
    Closed,
    #[error("unknown trade {0}")]
    UnknownTrade(Uuid),
}

/// One fused decision and what the gate made of it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: Uuid,
    pub symbol: String,
    pub bar_time: DateTime<Utc>,
    pub direction: Direction,
    pub strength: f64,
    pub quality: Option<f64>,
    pub accepted: bool,
    pub rejection: Option<String>,
    /// Individual strategy votes as JSON
    pub votes: serde_json::Value,
}

/// One grid leg as opened
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub basket_id: Option<Uuid>,
    pub symbol: String,
    pub side: Side,
    pub step_index: usize,
    pub entry_price: f64,
    pub volume: Decimal,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub exit_price: f64,
    pub pnl: Decimal,
    pub exit_reason: String,
    /// Peak floating profit of the basket the leg belonged to
    pub basket_peak: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Rolling statistics over the most recent closed legs of one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_pnl: Decimal,
    pub average_pnl: Decimal,
    /// Mean basket peak profit, one entry per basket
    pub avg_favourable_excursion: Option<Decimal>,
}

impl PerformanceSummary {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }
}

/// Append + recent-window read over signals and trades
pub trait Journal: Send {
    fn save_signal(&mut self, signal: &SignalRecord) -> Result<(), JournalError>;

    fn save_trade(&mut self, trade: &TradeRecord) -> Result<(), JournalError>;

    fn update_trade_outcome(&mut self, trade_id: Uuid, outcome: &TradeOutcome) -> Result<(), JournalError>;

    /// Summary of the last `window` closed trades for `symbol`
    fn get_recent_performance(&mut self, symbol: &str, window: usize) -> Result<PerformanceSummary, JournalError>;
}
