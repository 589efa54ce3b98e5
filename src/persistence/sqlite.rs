//! SQLite journal
//!
//! WAL mode. Writes that hit `SQLITE_BUSY`/`SQLITE_LOCKED` force a truncating
//! checkpoint and try again a bounded number of times. Money is stored as
//! decimal TEXT so no value passes through a float.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use super::journal::{Journal, JournalError, PerformanceSummary, SignalRecord, TradeOutcome, TradeRecord};

const MAX_BUSY_RETRIES: u32 = 3;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS signals (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    bar_time TEXT NOT NULL,
    direction TEXT NOT NULL,
    strength REAL NOT NULL,
    quality REAL,
    accepted INTEGER NOT NULL,
    rejection TEXT,
    votes TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_symbol_time ON signals(symbol, bar_time);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    basket_id TEXT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    entry_price REAL NOT NULL,
    volume TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    exit_price REAL,
    pnl TEXT,
    exit_reason TEXT,
    basket_peak TEXT,
    closed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_trades_symbol_closed ON trades(symbol, closed_at);
"#;

pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!("Journal {} opened (journal_mode={})", path.display(), mode);
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, JournalError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, JournalError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Run `op`, checkpointing and retrying on lock contention
    fn with_retry<T>(&mut self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T, JournalError> {
        let mut attempt = 0;
        loop {
            match op(&self.conn) {
                Err(e) if is_contention(&e) && attempt < MAX_BUSY_RETRIES => {
                    attempt += 1;
                    warn!("Journal contention ({}), checkpoint and retry {}/{}", e, attempt, MAX_BUSY_RETRIES);
                    if let Err(ce) = self.checkpoint() {
                        warn!("Journal checkpoint failed: {}", ce);
                    }
                    std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                }
                result => return result.map_err(JournalError::from),
            }
        }
    }

    fn checkpoint(&self) -> rusqlite::Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
    }
}

fn is_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn parse_decimal(raw: &str) -> Result<Decimal, JournalError> {
    Decimal::from_str(raw).map_err(|e| JournalError::Corrupt(format!("decimal {:?}: {}", raw, e)))
}

impl Journal for SqliteJournal {
    fn save_signal(&mut self, signal: &SignalRecord) -> Result<(), JournalError> {
        let votes = serde_json::to_string(&signal.votes)?;
        let direction = signal.direction.to_string();
        let bar_time = signal.bar_time.to_rfc3339();
        self.with_retry(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO signals
                 (id, symbol, bar_time, direction, strength, quality, accepted, rejection, votes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    signal.id.to_string(),
                    signal.symbol,
                    bar_time,
                    direction,
                    signal.strength,
                    signal.quality,
                    signal.accepted,
                    signal.rejection,
                    votes,
                ],
            )
        })?;
        Ok(())
    }

    fn save_trade(&mut self, trade: &TradeRecord) -> Result<(), JournalError> {
        let side = trade.side.to_string();
        let opened_at = trade.opened_at.to_rfc3339();
        self.with_retry(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trades
                 (id, basket_id, symbol, side, step_index, entry_price, volume, opened_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    trade.id.to_string(),
                    trade.basket_id.map(|b| b.to_string()),
                    trade.symbol,
                    side,
                    trade.step_index as i64,
                    trade.entry_price,
                    trade.volume.to_string(),
                    opened_at,
                ],
            )
        })?;
        Ok(())
    }

    fn update_trade_outcome(&mut self, trade_id: Uuid, outcome: &TradeOutcome) -> Result<(), JournalError> {
        let closed_at = outcome.closed_at.to_rfc3339();
        let updated = self.with_retry(|conn| {
            conn.execute(
                "UPDATE trades SET exit_price = ?2, pnl = ?3, exit_reason = ?4, basket_peak = ?5, closed_at = ?6
                 WHERE id = ?1",
                params![
                    trade_id.to_string(),
                    outcome.exit_price,
                    outcome.pnl.to_string(),
                    outcome.exit_reason,
                    outcome.basket_peak.to_string(),
                    closed_at,
                ],
            )
        })?;
        if updated == 0 {
            return Err(JournalError::UnknownTrade(trade_id));
        }
        Ok(())
    }

    fn get_recent_performance(&mut self, symbol: &str, window: usize) -> Result<PerformanceSummary, JournalError> {
        let rows: Vec<(String, Option<String>, Option<String>)> = self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pnl, basket_id, basket_peak FROM trades
                 WHERE symbol = ?1 AND closed_at IS NOT NULL
                 ORDER BY closed_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![symbol, window as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut summary = PerformanceSummary::default();
        let mut peaks: HashMap<String, Decimal> = HashMap::new();
        for (pnl, basket_id, peak) in rows {
            let pnl = parse_decimal(&pnl)?;
            summary.trades += 1;
            summary.total_pnl += pnl;
            if pnl > Decimal::ZERO {
                summary.wins += 1;
            } else {
                summary.losses += 1;
            }
            if let (Some(basket), Some(peak)) = (basket_id, peak) {
                peaks.insert(basket, parse_decimal(&peak)?);
            }
        }
        if summary.trades > 0 {
            summary.average_pnl = summary.total_pnl / Decimal::from(summary.trades);
        }
        if !peaks.is_empty() {
            let total: Decimal = peaks.values().sum();
            summary.avg_favourable_excursion = Some(total / Decimal::from(peaks.len()));
        }
        Ok(summary)
    }
}

impl SqliteJournal {
    /// Stored trade by id, mostly for inspection
    pub fn trade_pnl(&self, trade_id: Uuid) -> Result<Option<Decimal>, JournalError> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT pnl FROM trades WHERE id = ?1",
                params![trade_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.flatten().map(|p| parse_decimal(&p)).transpose()
    }

    pub fn signal_count(&self, symbol: &str) -> Result<usize, JournalError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}
