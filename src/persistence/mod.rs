//! Persistence: signal and trade journal
//!
//! - [`journal`] - Journal trait and record types
//! - [`sqlite`] - SQLite (WAL) implementation
//! - [`writer`] - Queue-fed background writer used by the decision loop

pub mod journal;
pub mod sqlite;
pub mod writer;

pub use journal::{Journal, JournalError, PerformanceSummary, SignalRecord, TradeOutcome, TradeRecord};
pub use sqlite::SqliteJournal;
pub use writer::JournalWriter;
