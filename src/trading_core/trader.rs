//! Per-symbol decision pipeline
//!
//! One closed bar at a time:
//! - Score pending fusion votes and evaluate basket exits
//! - Run every strategy and fuse the votes
//! - Gate the decision on quality, size it, and plan the grid ladder
//!
//! No broker code lives here; the caller turns `TradeAction`s into orders.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::bars::Bar;
use super::fusion::{FusedDecision, FusionOptimizer, Strategy};
use super::grid::{BasketEvaluation, GridManager, TradeAction};
use super::indicators;
use super::orb::RangeBreakoutDetector;
use super::quality::{QualityGate, QualityInput, QualityScore};
use super::risk::{RiskProfile, RiskSizer};
use super::structure::{StructureAnalysis, StructureAnalyzer};
use crate::config::SymbolConfig;
use crate::types::{Direction, Side, Signal, SignalSource};

/// Everything that happened for one bar
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub bar_time: DateTime<Utc>,
    pub decision: FusedDecision,
    pub quality: Option<QualityScore>,
    pub risk: Option<RiskProfile>,
    pub evaluations: Vec<BasketEvaluation>,
    pub actions: Vec<TradeAction>,
    /// Why an entry did not go ahead
    pub rejection: Option<String>,
}

impl CycleOutcome {
    fn hold(bar_time: DateTime<Utc>) -> Self {
        Self {
            bar_time,
            decision: FusedDecision {
                direction: Direction::Neutral,
                strength: 0.0,
                buy_score: 0.0,
                sell_score: 0.0,
                votes: Vec::new(),
            },
            quality: None,
            risk: None,
            evaluations: Vec::new(),
            actions: Vec::new(),
            rejection: None,
        }
    }

    pub fn accepted(&self) -> bool {
        self.quality.as_ref().is_some_and(|q| q.accept)
    }
}

pub struct SymbolTrader {
    symbol: String,
    config: SymbolConfig,
    history: Vec<Bar>,
    bar_index: u64,
    strategies: Vec<Strategy>,
    fusion: FusionOptimizer,
    gate: QualityGate,
    sizer: RiskSizer,
    grid: GridManager,
    avg_favourable_excursion: Option<Decimal>,
}

impl SymbolTrader {
    pub fn new(symbol: impl Into<String>, config: SymbolConfig) -> Self {
        let strategies = vec![
            Strategy::structure(StructureAnalyzer::new(config.structure.clone())),
            Strategy::RangeBreakout(RangeBreakoutDetector::new(config.range.clone())),
        ];
        Self {
            symbol: symbol.into(),
            fusion: FusionOptimizer::new(config.fusion.clone()),
            gate: QualityGate::new(config.quality.clone()),
            sizer: RiskSizer::new(config.risk.clone()),
            grid: GridManager::new(config.grid.clone(), config.risk.contract_size),
            history: Vec::with_capacity(config.history_bars),
            bar_index: 0,
            strategies,
            avg_favourable_excursion: None,
            config,
        }
    }

    /// Add an advisory voter fed through [`Self::set_advisory_opinion`]
    pub fn with_advisory(mut self, name: impl Into<String>) -> Self {
        self.strategies.push(Strategy::advisory(name));
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn history(&self) -> &[Bar] {
        &self.history
    }

    pub fn grid(&self) -> &GridManager {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut GridManager {
        &mut self.grid
    }

    pub fn fusion(&self) -> &FusionOptimizer {
        &self.fusion
    }

    /// Swap in new parameters while keeping all accumulated state
    pub fn apply_config(&mut self, config: SymbolConfig) {
        for strategy in &mut self.strategies {
            match strategy {
                Strategy::Structure { analyzer, .. } => {
                    *analyzer = StructureAnalyzer::new(config.structure.clone())
                }
                Strategy::RangeBreakout(detector) => detector.set_config(config.range.clone()),
                Strategy::Advisory { .. } => {}
            }
        }
        self.fusion.set_config(config.fusion.clone());
        self.gate = QualityGate::new(config.quality.clone());
        self.sizer = RiskSizer::new(config.risk.clone());
        self.grid.set_config(config.grid.clone(), config.risk.contract_size);
        self.config = config;
    }

    /// Hand an advisory vote to the matching strategy for the next bar
    pub fn set_advisory_opinion(&mut self, signal: Signal) -> bool {
        let SignalSource::Advisory(source) = &signal.source else {
            return false;
        };
        for strategy in &mut self.strategies {
            if let Strategy::Advisory { name, opinion } = strategy {
                if name == source {
                    *opinion = Some(signal);
                    return true;
                }
            }
        }
        false
    }

    /// Recent average favourable excursion of closed baskets
    pub fn set_average_excursion(&mut self, mfe: Option<Decimal>) {
        self.avg_favourable_excursion = mfe;
    }

    fn structure_analysis(&self) -> Option<&StructureAnalysis> {
        self.strategies.iter().find_map(|s| match s {
            Strategy::Structure { last, .. } => last.as_ref(),
            _ => None,
        })
    }

    /// Run the full pipeline for one closed bar
    pub fn on_bar(&mut self, bar: Bar, balance: Decimal) -> CycleOutcome {
        let mut outcome = CycleOutcome::hold(bar.open_time);

        if !bar.is_well_formed() {
            warn!("{} malformed bar at {} ignored", self.symbol, bar.open_time);
            outcome.rejection = Some("malformed bar".to_string());
            return outcome;
        }
        if let Some(last) = self.history.last() {
            if bar.open_time <= last.open_time {
                debug!("{} stale bar at {} ignored", self.symbol, bar.open_time);
                outcome.rejection = Some("bar not newer than history".to_string());
                return outcome;
            }
        }

        self.history.push(bar);
        if self.history.len() > self.config.history_bars {
            let excess = self.history.len() - self.config.history_bars;
            self.history.drain(..excess);
        }
        self.bar_index += 1;
        self.grid.observe_price(bar.close);
        self.fusion.resolve(self.bar_index, bar.close);

        self.evaluate_exits(&bar, &mut outcome);

        let decision = self.fusion.evaluate(&mut self.strategies, &self.history);
        // every non-neutral vote is scored, including outvoted ones on a hold
        self.fusion.track(self.bar_index, bar.close, &decision);
        outcome.decision = decision.clone();
        let Some(side) = decision.direction.side() else {
            return outcome;
        };
        info!(
            "{} SIGNAL: {} @ {:.5} | strength {:.0} | buy {:.2} sell {:.2}",
            self.symbol, side, bar.close, decision.strength, decision.buy_score, decision.sell_score
        );

        self.plan_entry(side, &bar, &decision, balance, &mut outcome);
        outcome
    }

    fn evaluate_exits(&mut self, bar: &Bar, outcome: &mut CycleOutcome) {
        for side in [Side::Buy, Side::Sell] {
            if let Some(action) = self.grid.pending_cancel(side) {
                debug!("{} {} cancels unconfirmed, re-issuing", self.symbol, side);
                outcome.actions.push(action);
            }
        }
        let Some(atr) = indicators::atr(&self.history, self.config.risk.atr_period) else {
            return;
        };
        for side in [Side::Buy, Side::Sell] {
            let Some(basket) = self.grid.basket(side) else {
                continue;
            };
            if basket.is_closing() {
                if let Some(action) = self.grid.pending_close(side) {
                    debug!("{} {} basket still closing, re-issuing close", self.symbol, side);
                    outcome.actions.push(action);
                }
                continue;
            }
            let volume = basket.open_volume();
            if volume.is_zero() {
                continue;
            }
            let target = match self
                .sizer
                .basket_target(volume, atr, self.avg_favourable_excursion)
            {
                Ok(t) => t,
                Err(e) => {
                    warn!("{} {} basket target unavailable: {}", self.symbol, side, e);
                    continue;
                }
            };
            let Some(evaluation) = self.grid.evaluate_side(side, bar.close, target) else {
                continue;
            };
            if let Some(reason) = evaluation.reason {
                if let Some(action) = self.grid.close_action(side, reason) {
                    outcome.actions.push(action);
                }
            }
            outcome.evaluations.push(evaluation);
        }
    }

    fn plan_entry(
        &mut self,
        side: Side,
        bar: &Bar,
        decision: &FusedDecision,
        balance: Decimal,
        outcome: &mut CycleOutcome,
    ) {
        let structure = self
            .structure_analysis()
            .cloned()
            .unwrap_or_else(|| StructureAnalysis::neutral("structure not run"));

        let quality = self.gate.evaluate(&QualityInput {
            side,
            bars: &self.history,
            structure: &structure,
            strength: decision.strength,
            timestamp: bar.open_time,
        });
        outcome.quality = Some(quality.clone());
        if !quality.accept {
            info!(
                "{} REJECTED {}: quality {:.0} (time={} volume={} gap={})",
                self.symbol, side, quality.total, quality.time_gate, quality.volume_gate, quality.gap_gate
            );
            outcome.rejection = Some(format!("quality {:.0} below gate", quality.total));
            return;
        }

        let profile = match self.sizer.assess(&self.history, balance, self.config.spread) {
            Ok(p) => p,
            Err(e) => {
                warn!("{} {} entry not sized: {}", self.symbol, side, e);
                outcome.rejection = Some(e.to_string());
                return;
            }
        };
        outcome.risk = Some(profile);
        info!(
            "{} ACCEPTED {}: quality {:.0} | SL {} TP {} | size {}",
            self.symbol, side, quality.total, profile.sl_distance, profile.tp_distance, profile.position_size
        );

        match self.grid.plan_entry(
            side,
            bar.close,
            structure.last_swing_range(),
            profile.position_size,
            &self.config.risk.volume,
            bar.open_time,
        ) {
            Ok(actions) => outcome.actions.extend(actions),
            Err(e) => {
                info!("{} ladder not placed: {}", self.symbol, e);
                outcome.rejection = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::fusion::FusionConfig;
    use crate::trading_core::grid::{ExitReason, GridState, OrderKind};
    use crate::trading_core::test_support::{minute_bar, uptrend_with_retest};
    use rust_decimal_macros::dec;

    fn run_until(trader: &mut SymbolTrader, bars: &[Bar]) -> Vec<CycleOutcome> {
        bars.iter().map(|b| trader.on_bar(*b, dec!(10000))).collect()
    }

    #[test]
    fn test_order_block_retest_opens_buy_ladder() {
        let bars = uptrend_with_retest();
        let mut trader = SymbolTrader::new("TEST", SymbolConfig::default());
        let outcomes = run_until(&mut trader, &bars[..=55]);
        let last = &outcomes[55];

        assert_eq!(last.decision.direction, Direction::Buy);
        let quality = last.quality.as_ref().unwrap();
        assert!(quality.total >= 70.0);
        assert!(quality.accept);
        assert!(last.risk.is_some());
        assert!(last
            .actions
            .iter()
            .any(|a| matches!(a, TradeAction::PlaceLeg { kind: OrderKind::Market, .. })));
        assert_eq!(trader.grid().state(Side::Buy), GridState::Building);

        // nothing was opened before the retest
        assert!(outcomes[..55].iter().all(|o| o.actions.is_empty()));
    }

    #[test]
    fn test_basket_take_profit_after_fill() {
        let bars = uptrend_with_retest();
        let mut trader = SymbolTrader::new("TEST", SymbolConfig::default());
        let outcomes = run_until(&mut trader, &bars[..=55]);

        let market_leg = outcomes[55]
            .actions
            .iter()
            .find_map(|a| match a {
                TradeAction::PlaceLeg { leg, kind: OrderKind::Market } => Some(leg.id),
                _ => None,
            })
            .unwrap();
        assert!(trader.grid_mut().on_fill(market_leg, 152.8));

        let rally = minute_bar(56, 152.8, 173.5, 152.7, 173.0, 150.0);
        let outcome = trader.on_bar(rally, dec!(10000));
        assert!(outcome.evaluations.iter().any(|e| e.should_close));
        assert!(outcome.actions.iter().any(|a| matches!(
            a,
            TradeAction::CloseBasket { side: Side::Buy, reason: ExitReason::TakeProfit, .. }
        )));
        assert_eq!(trader.grid().state(Side::Buy), GridState::Closing);

        // broker never confirmed the close: the next bar asks again
        let next = minute_bar(57, 173.0, 173.5, 172.5, 173.2, 100.0);
        let outcome = trader.on_bar(next, dec!(10000));
        assert!(outcome.actions.iter().any(|a| matches!(
            a,
            TradeAction::CloseBasket { side: Side::Buy, reason: ExitReason::TakeProfit, .. }
        )));
    }

    #[test]
    fn test_votes_scored_when_decision_holds() {
        let config = SymbolConfig {
            fusion: FusionConfig {
                decision_threshold: 1.0,
                evaluation_window: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut trader = SymbolTrader::new("TEST", config);
        let outcomes = run_until(&mut trader, &uptrend_with_retest());

        assert!(outcomes.iter().all(|o| o.decision.is_hold()));
        let cast = outcomes
            .iter()
            .filter(|o| o.decision.votes.iter().any(|v| !v.is_neutral()))
            .count();
        assert!(cast > 0);
        let scored: u32 = trader.fusion().stats().values().map(|s| s.evaluated).sum();
        assert!(scored > 0);
    }

    #[test]
    fn test_stale_and_malformed_bars_ignored() {
        let bars = uptrend_with_retest();
        let mut trader = SymbolTrader::new("TEST", SymbolConfig::default());
        trader.on_bar(bars[1], dec!(10000));
        let stale = trader.on_bar(bars[0], dec!(10000));
        assert!(stale.rejection.is_some());
        assert_eq!(trader.history().len(), 1);

        let mut broken = bars[2];
        broken.high = broken.low - 1.0;
        assert!(trader.on_bar(broken, dec!(10000)).rejection.is_some());
        assert_eq!(trader.history().len(), 1);
    }

    #[test]
    fn test_short_history_holds() {
        let bars = uptrend_with_retest();
        let mut trader = SymbolTrader::new("TEST", SymbolConfig::default());
        let outcomes = run_until(&mut trader, &bars[..20]);
        assert!(outcomes.iter().all(|o| o.decision.direction == Direction::Neutral));
    }

    #[test]
    fn test_advisory_opinion_routed_by_name() {
        let mut trader = SymbolTrader::new("TEST", SymbolConfig::default()).with_advisory("llm");
        let vote = Signal::new(SignalSource::Advisory("llm".into()), Direction::Sell, 80.0, "bearish");
        assert!(trader.set_advisory_opinion(vote));
        let other = Signal::new(SignalSource::Advisory("other".into()), Direction::Sell, 80.0, "x");
        assert!(!trader.set_advisory_opinion(other));
    }

    #[test]
    fn test_history_is_capped() {
        let config = SymbolConfig {
            history_bars: 50,
            ..Default::default()
        };
        let mut trader = SymbolTrader::new("TEST", config);
        run_until(&mut trader, &uptrend_with_retest());
        assert_eq!(trader.history().len(), 50);
    }
}
