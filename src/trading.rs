//! Decision loop runner
//!
//! Drives one symbol bar by bar: fills from the broker, advisory vote,
//! the trader pipeline, journal records, then order execution. The symbol's
//! trader guard is held for the whole cycle, so cycles for one symbol never
//! overlap and only one task submits its orders.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advisory::{AdvisoryClient, OpinionRequest};
use crate::config::ConfigStore;
use crate::execution::{ExecutionEngine, ExecutionEvent};
use crate::persistence::{JournalWriter, SignalRecord, TradeOutcome, TradeRecord};
use crate::trading_core::{Bar, CycleOutcome, SymbolBook, SymbolTrader};

/// What one bar produced
#[derive(Debug, Clone)]
pub struct BarReport {
    pub outcome: CycleOutcome,
    pub events: Vec<ExecutionEvent>,
}

/// Totals for one replayed feed
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedSummary {
    pub symbol: String,
    pub bars: usize,
    pub signals: usize,
    pub accepted: usize,
    pub legs_placed: usize,
    pub baskets_closed: usize,
    pub realized: Decimal,
}

impl FeedSummary {
    fn record(&mut self, report: &BarReport) {
        self.bars += 1;
        if !report.outcome.decision.is_hold() {
            self.signals += 1;
        }
        if report.outcome.accepted() {
            self.accepted += 1;
        }
        for event in &report.events {
            match event {
                ExecutionEvent::LegPlaced { .. } => self.legs_placed += 1,
                ExecutionEvent::BasketClosed { realized, .. } => {
                    self.baskets_closed += 1;
                    self.realized += *realized;
                }
                _ => {}
            }
        }
    }
}

pub struct DecisionLoop {
    config: ConfigStore,
    book: Arc<SymbolBook>,
    engine: Arc<ExecutionEngine>,
    advisory: Option<Arc<AdvisoryClient>>,
    journal: Option<JournalWriter>,
}

impl DecisionLoop {
    pub fn new(config: ConfigStore, book: Arc<SymbolBook>, engine: Arc<ExecutionEngine>) -> Self {
        Self {
            config,
            book,
            engine,
            advisory: None,
            journal: None,
        }
    }

    pub fn with_advisory(mut self, client: Arc<AdvisoryClient>) -> Self {
        self.advisory = Some(client);
        self
    }

    pub fn with_journal(mut self, writer: JournalWriter) -> Self {
        self.journal = Some(writer);
        self
    }

    /// Run one closed bar through the full cycle
    pub async fn process_bar(&self, symbol: &str, bar: Bar) -> BarReport {
        let engine_config = self.config.snapshot().await;
        let symbol_config = engine_config.symbol(symbol);
        let contract_size = symbol_config.risk.contract_size;
        let advisory_name = self.advisory.as_ref().map(|c| c.name().to_string());

        let make_config = symbol_config.clone();
        let mut trader = self
            .book
            .lock(symbol, move || {
                let trader = SymbolTrader::new(symbol, make_config);
                match advisory_name {
                    Some(name) => trader.with_advisory(name),
                    None => trader,
                }
            })
            .await;
        trader.apply_config(symbol_config);

        let mut events = self.engine.sync_fills(symbol, &bar, trader.grid_mut()).await;

        if let Some(client) = &self.advisory {
            self.ask_advisory(client, &mut trader, bar).await;
        }

        if let Some(journal) = &self.journal {
            // the writer answers behind queued writes; never wait on it for long
            let wait = Duration::from_millis(engine_config.journal.performance_timeout_ms);
            let query = journal.recent_performance(symbol, engine_config.journal.performance_window);
            match tokio::time::timeout(wait, query).await {
                Ok(Ok(perf)) => trader.set_average_excursion(perf.avg_favourable_excursion),
                Ok(Err(e)) => debug!("{} performance unavailable: {}", symbol, e),
                Err(_) => debug!("{} performance query timed out, keeping last excursion", symbol),
            }
        }

        let balance = match self.engine.account().await {
            Ok(account) => account.balance,
            Err(e) => {
                // a zero balance makes the sizer reject any entry this bar
                warn!("{} account unavailable, entries held: {}", symbol, e);
                Decimal::ZERO
            }
        };

        let outcome = trader.on_bar(bar, balance);
        self.journal_signal(symbol, &outcome);

        let executed = self
            .engine
            .execute(symbol, &outcome.actions, bar.close, contract_size, trader.grid_mut())
            .await;
        events.extend(executed);
        self.journal_events(&events, bar);

        BarReport { outcome, events }
    }

    /// Replay a whole bar series, optionally pacing between bars
    pub async fn run_feed(&self, symbol: &str, bars: Vec<Bar>, pace: Option<Duration>) -> Result<FeedSummary> {
        let mut summary = FeedSummary {
            symbol: symbol.to_string(),
            ..Default::default()
        };
        info!("{}: replaying {} bars", symbol, bars.len());
        for bar in bars {
            let report = self.process_bar(symbol, bar).await;
            summary.record(&report);
            if let Some(delay) = pace {
                tokio::time::sleep(delay).await;
            }
        }
        info!(
            "{} done: {} bars | {} signals | {} accepted | {} legs | {} baskets closed | realized {}",
            symbol,
            summary.bars,
            summary.signals,
            summary.accepted,
            summary.legs_placed,
            summary.baskets_closed,
            summary.realized
        );
        Ok(summary)
    }

    async fn ask_advisory(&self, client: &AdvisoryClient, trader: &mut SymbolTrader, bar: Bar) {
        let history = trader.history();
        let keep = client.snapshot_bars().saturating_sub(1);
        let start = history.len().saturating_sub(keep);
        let mut bars = history[start..].to_vec();
        bars.push(bar);

        let request = OpinionRequest {
            symbol: trader.symbol().to_string(),
            bars,
            signals: Vec::new(),
        };
        match client.request_opinion(&request).await {
            Ok(opinion) => {
                trader.set_advisory_opinion(opinion.into_signal(client.name()));
            }
            Err(e) => warn!("{} advisory vote dropped: {}", request.symbol, e),
        }
    }

    fn journal_signal(&self, symbol: &str, outcome: &CycleOutcome) {
        let Some(journal) = &self.journal else {
            return;
        };
        if outcome.decision.is_hold() {
            return;
        }
        let votes = match serde_json::to_value(&outcome.decision.votes) {
            Ok(v) => v,
            Err(e) => {
                warn!("{} votes not serializable: {}", symbol, e);
                serde_json::Value::Null
            }
        };
        journal.save_signal(SignalRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            bar_time: outcome.bar_time,
            direction: outcome.decision.direction,
            strength: outcome.decision.strength,
            quality: outcome.quality.as_ref().map(|q| q.total),
            accepted: outcome.accepted(),
            rejection: outcome.rejection.clone(),
            votes,
        });
    }

    fn journal_events(&self, events: &[ExecutionEvent], bar: Bar) {
        let Some(journal) = &self.journal else {
            return;
        };
        for event in events {
            match event {
                ExecutionEvent::LegPlaced {
                    symbol,
                    leg,
                    basket_id,
                    fill_price,
                    ..
                } => journal.save_trade(TradeRecord {
                    id: leg.id,
                    basket_id: *basket_id,
                    symbol: symbol.clone(),
                    side: leg.side,
                    step_index: leg.step_index,
                    entry_price: fill_price.unwrap_or(leg.entry_price),
                    volume: leg.volume,
                    opened_at: bar.open_time,
                }),
                ExecutionEvent::BasketClosed {
                    legs,
                    reason,
                    peak_profit,
                    ..
                } => {
                    for leg in legs {
                        journal.update_trade_outcome(
                            leg.leg_id,
                            TradeOutcome {
                                exit_price: leg.exit_price,
                                pnl: leg.pnl,
                                exit_reason: reason.to_string(),
                                basket_peak: *peak_profit,
                                closed_at: bar.open_time,
                            },
                        );
                    }
                }
                _ => {}
            }
        }
    }
}
