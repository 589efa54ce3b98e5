//! Background journal writer
//!
//! The decision loop only ever `try_send`s into a bounded queue; a blocking
//! task owns the journal and applies commands in order. Failed writes are
//! retried there and then logged and dropped.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::journal::{Journal, JournalError, PerformanceSummary, SignalRecord, TradeOutcome, TradeRecord};

const WRITE_ATTEMPTS: u32 = 3;

enum JournalCommand {
    Signal(SignalRecord),
    Trade(TradeRecord),
    Outcome {
        trade_id: Uuid,
        outcome: TradeOutcome,
    },
    Performance {
        symbol: String,
        window: usize,
        reply: oneshot::Sender<Result<PerformanceSummary, JournalError>>,
    },
}

impl JournalCommand {
    fn label(&self) -> &'static str {
        match self {
            JournalCommand::Signal(_) => "signal",
            JournalCommand::Trade(_) => "trade",
            JournalCommand::Outcome { .. } => "trade outcome",
            JournalCommand::Performance { .. } => "performance query",
        }
    }
}

#[derive(Clone)]
pub struct JournalWriter {
    tx: mpsc::Sender<JournalCommand>,
}

impl JournalWriter {
    /// Move `journal` onto a blocking task and return the queue handle
    pub fn spawn<J: Journal + 'static>(journal: J, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::task::spawn_blocking(move || run(journal, rx));
        (Self { tx }, handle)
    }

    pub fn save_signal(&self, record: SignalRecord) {
        self.enqueue(JournalCommand::Signal(record));
    }

    pub fn save_trade(&self, record: TradeRecord) {
        self.enqueue(JournalCommand::Trade(record));
    }

    pub fn update_trade_outcome(&self, trade_id: Uuid, outcome: TradeOutcome) {
        self.enqueue(JournalCommand::Outcome { trade_id, outcome });
    }

    /// Answered after every write queued before it
    pub async fn recent_performance(&self, symbol: &str, window: usize) -> Result<PerformanceSummary, JournalError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Performance {
                symbol: symbol.to_string(),
                window,
                reply,
            })
            .await
            .map_err(|_| JournalError::Closed)?;
        rx.await.map_err(|_| JournalError::Closed)?
    }

    fn enqueue(&self, command: JournalCommand) {
        let label = command.label();
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => warn!("Journal queue full, {} dropped", label),
            Err(mpsc::error::TrySendError::Closed(_)) => error!("Journal writer stopped, {} dropped", label),
        }
    }
}

fn run<J: Journal>(mut journal: J, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            JournalCommand::Performance { symbol, window, reply } => {
                let _ = reply.send(journal.get_recent_performance(&symbol, window));
            }
            JournalCommand::Signal(record) => {
                write_with_retry("signal", || journal.save_signal(&record));
            }
            JournalCommand::Trade(record) => {
                write_with_retry("trade", || journal.save_trade(&record));
            }
            JournalCommand::Outcome { trade_id, outcome } => {
                write_with_retry("trade outcome", || journal.update_trade_outcome(trade_id, &outcome));
            }
        }
    }
    info!("Journal writer stopped");
}

fn write_with_retry(label: &str, mut op: impl FnMut() -> Result<(), JournalError>) {
    for attempt in 1..=WRITE_ATTEMPTS {
        match op() {
            Ok(()) => return,
            Err(JournalError::UnknownTrade(id)) => {
                warn!("Journal {} for unknown trade {} dropped", label, id);
                return;
            }
            Err(e) if attempt < WRITE_ATTEMPTS => {
                warn!("Journal {} write failed (attempt {}): {}", label, attempt, e);
                std::thread::sleep(Duration::from_millis(100 * attempt as u64));
            }
            Err(e) => error!("Journal {} write dropped after {} attempts: {}", label, WRITE_ATTEMPTS, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::sqlite::SqliteJournal;
    use crate::types::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_writes_visible_to_later_query() {
        let dir = tempfile::tempdir().unwrap();
        let journal = SqliteJournal::open(&dir.path().join("j.db")).unwrap();
        let (writer, handle) = JournalWriter::spawn(journal, 16);

        let trade = TradeRecord {
            id: Uuid::new_v4(),
            basket_id: Some(Uuid::new_v4()),
            symbol: "EURUSD".into(),
            side: Side::Sell,
            step_index: 0,
            entry_price: 1.1,
            volume: dec!(0.5),
            opened_at: Utc::now(),
        };
        writer.save_trade(trade.clone());
        writer.update_trade_outcome(
            trade.id,
            TradeOutcome {
                exit_price: 1.09,
                pnl: dec!(4.2),
                exit_reason: "take_profit".into(),
                basket_peak: dec!(5),
                closed_at: Utc::now(),
            },
        );

        let perf = writer.recent_performance("EURUSD", 10).await.unwrap();
        assert_eq!(perf.trades, 1);
        assert_eq!(perf.total_pnl, dec!(4.2));
        assert_eq!(perf.avg_favourable_excursion, Some(dec!(5)));

        drop(writer);
        handle.await.unwrap();
    }

    struct FailingJournal {
        failures: u32,
        saved: u32,
    }

    impl Journal for FailingJournal {
        fn save_signal(&mut self, _: &SignalRecord) -> Result<(), JournalError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(JournalError::Corrupt("disk busy".into()));
            }
            self.saved += 1;
            Ok(())
        }
        fn save_trade(&mut self, _: &TradeRecord) -> Result<(), JournalError> {
            Ok(())
        }
        fn update_trade_outcome(&mut self, _: Uuid, _: &TradeOutcome) -> Result<(), JournalError> {
            Ok(())
        }
        fn get_recent_performance(&mut self, _: &str, _: usize) -> Result<PerformanceSummary, JournalError> {
            Ok(PerformanceSummary {
                trades: self.saved as usize,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_failed_write_retried_in_background() {
        let (writer, _handle) = JournalWriter::spawn(FailingJournal { failures: 2, saved: 0 }, 4);
        writer.save_signal(SignalRecord {
            id: Uuid::new_v4(),
            symbol: "EURUSD".into(),
            bar_time: Utc::now(),
            direction: crate::types::Direction::Buy,
            strength: 60.0,
            quality: None,
            accepted: false,
            rejection: None,
            votes: serde_json::Value::Null,
        });
        let perf = writer.recent_performance("EURUSD", 1).await.unwrap();
        assert_eq!(perf.trades, 1);
    }
}
