//! Adaptive signal fusion
//!
//! Independent strategies vote; votes are weighted by each strategy's
//! track record and normalised by the weight of the strategies that actually
//! voted. Weights follow `0.5 + accuracy` once a strategy has been scored.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bars::Bar;
use super::orb::RangeBreakoutDetector;
use super::structure::{StructureAnalysis, StructureAnalyzer};
use crate::types::{Direction, Signal, SignalSource};

/// Fusion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Normalised score a side must exceed to be emitted
    pub decision_threshold: f64,
    /// Bars until a vote is scored against realised price
    pub evaluation_window: usize,
    /// Moves smaller than this are not scored
    pub dead_zone_points: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            decision_threshold: 0.4,
            evaluation_window: 5,
            dead_zone_points: 0.0,
        }
    }
}

/// Closed set of strategies the optimizer can drive
#[derive(Debug, Clone)]
pub enum Strategy {
    Structure {
        analyzer: StructureAnalyzer,
        last: Option<StructureAnalysis>,
    },
    RangeBreakout(RangeBreakoutDetector),
    /// Opinion supplied from outside before each pass, consumed by it
    Advisory { name: String, opinion: Option<Signal> },
}

impl Strategy {
    pub fn structure(analyzer: StructureAnalyzer) -> Self {
        Strategy::Structure { analyzer, last: None }
    }

    pub fn advisory(name: impl Into<String>) -> Self {
        Strategy::Advisory {
            name: name.into(),
            opinion: None,
        }
    }

    pub fn source(&self) -> SignalSource {
        match self {
            Strategy::Structure { .. } => SignalSource::Structure,
            Strategy::RangeBreakout(_) => SignalSource::RangeBreakout,
            Strategy::Advisory { name, .. } => SignalSource::Advisory(name.clone()),
        }
    }

    pub fn name(&self) -> String {
        self.source().name()
    }

    pub fn detect(&mut self, bars: &[Bar]) -> Signal {
        match self {
            Strategy::Structure { analyzer, last } => {
                let analysis = analyzer.analyze(bars);
                let signal = analysis.signal.clone();
                *last = Some(analysis);
                signal
            }
            Strategy::RangeBreakout(detector) => detector.detect(bars),
            Strategy::Advisory { name, opinion } => opinion
                .take()
                .unwrap_or_else(|| Signal::neutral(SignalSource::Advisory(name.clone()), "no opinion")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub weight: f64,
    pub correct: u32,
    pub evaluated: u32,
}

impl Default for StrategyStats {
    fn default() -> Self {
        Self {
            weight: 1.0,
            correct: 0,
            evaluated: 0,
        }
    }
}

impl StrategyStats {
    pub fn accuracy(&self) -> Option<f64> {
        (self.evaluated > 0).then(|| self.correct as f64 / self.evaluated as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedDecision {
    pub direction: Direction,
    /// Winning normalised score × 100, 0 on hold
    pub strength: f64,
    pub buy_score: f64,
    pub sell_score: f64,
    pub votes: Vec<Signal>,
}

impl FusedDecision {
    pub fn is_hold(&self) -> bool {
        self.direction == Direction::Neutral
    }
}

#[derive(Debug, Clone)]
struct PendingEvaluation {
    due_bar: u64,
    entry_price: f64,
    votes: Vec<(String, Direction)>,
}

#[derive(Debug, Clone, Default)]
pub struct FusionOptimizer {
    config: FusionConfig,
    stats: BTreeMap<String, StrategyStats>,
    pending: VecDeque<PendingEvaluation>,
}

impl FusionOptimizer {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            stats: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn set_config(&mut self, config: FusionConfig) {
        self.config = config;
    }

    pub fn weight(&self, name: &str) -> f64 {
        self.stats.get(name).map(|s| s.weight).unwrap_or(1.0)
    }

    pub fn stats(&self) -> &BTreeMap<String, StrategyStats> {
        &self.stats
    }

    /// Run every strategy on `bars` and fuse the votes
    pub fn evaluate(&mut self, strategies: &mut [Strategy], bars: &[Bar]) -> FusedDecision {
        let signals: Vec<Signal> = strategies
            .iter_mut()
            .map(|s| {
                self.stats.entry(s.name()).or_default();
                s.detect(bars)
            })
            .collect();
        self.combine(signals)
    }

    /// Weighted vote over `signals`
    pub fn combine(&self, signals: Vec<Signal>) -> FusedDecision {
        let mut buy = 0.0;
        let mut sell = 0.0;
        let mut voting_weight = 0.0;

        for s in signals.iter().filter(|s| !s.is_neutral()) {
            let w = self.weight(&s.source.name());
            voting_weight += w;
            match s.direction {
                Direction::Buy => buy += w * s.confidence(),
                Direction::Sell => sell += w * s.confidence(),
                Direction::Neutral => {}
            }
        }

        if voting_weight > 0.0 {
            buy /= voting_weight;
            sell /= voting_weight;
        }

        let (direction, score) = if buy > sell {
            (Direction::Buy, buy)
        } else if sell > buy {
            (Direction::Sell, sell)
        } else {
            (Direction::Neutral, 0.0)
        };

        let emitted = direction != Direction::Neutral && score > self.config.decision_threshold;
        FusedDecision {
            direction: if emitted { direction } else { Direction::Neutral },
            strength: if emitted { score * 100.0 } else { 0.0 },
            buy_score: buy,
            sell_score: sell,
            votes: signals,
        }
    }

    /// Queue the non-neutral votes of a decision for later scoring
    pub fn track(&mut self, bar_index: u64, price: f64, decision: &FusedDecision) {
        let votes: Vec<(String, Direction)> = decision
            .votes
            .iter()
            .filter(|s| !s.is_neutral())
            .map(|s| (s.source.name(), s.direction))
            .collect();
        if votes.is_empty() {
            return;
        }
        self.pending.push_back(PendingEvaluation {
            due_bar: bar_index + self.config.evaluation_window as u64,
            entry_price: price,
            votes,
        });
    }

    /// Score every queued vote whose window has elapsed
    pub fn resolve(&mut self, bar_index: u64, price: f64) {
        while self.pending.front().is_some_and(|p| p.due_bar <= bar_index) {
            let Some(p) = self.pending.pop_front() else {
                break;
            };
            let realized = price - p.entry_price;
            if realized.abs() <= self.config.dead_zone_points {
                continue;
            }
            let moved = if realized > 0.0 { Direction::Buy } else { Direction::Sell };
            for (name, voted) in p.votes {
                self.record_outcome(&name, voted == moved);
            }
        }
    }

    /// Update a strategy's accuracy and weight
    pub fn record_outcome(&mut self, name: &str, correct: bool) {
        let stats = self.stats.entry(name.to_string()).or_default();
        stats.evaluated += 1;
        if correct {
            stats.correct += 1;
        }
        if let Some(acc) = stats.accuracy() {
            stats.weight = 0.5 + acc;
        }
        debug!(
            "Fusion weight {} -> {:.2} ({}/{})",
            name, stats.weight, stats.correct, stats.evaluated
        );
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(source: SignalSource, direction: Direction, strength: f64) -> Signal {
        Signal::new(source, direction, strength, "test")
    }

    #[test]
    fn test_single_voter_normalised() {
        let fusion = FusionOptimizer::default();
        let decision = fusion.combine(vec![
            vote(SignalSource::Structure, Direction::Buy, 65.0),
            Signal::neutral(SignalSource::RangeBreakout, "quiet"),
        ]);
        assert_eq!(decision.direction, Direction::Buy);
        assert!((decision.strength - 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_below_threshold_holds() {
        let fusion = FusionOptimizer::default();
        let decision = fusion.combine(vec![
            vote(SignalSource::Structure, Direction::Buy, 60.0),
            vote(SignalSource::RangeBreakout, Direction::Sell, 40.0),
        ]);
        // buy 0.30, sell 0.20
        assert!(decision.is_hold());
        assert_eq!(decision.strength, 0.0);
    }

    #[test]
    fn test_all_neutral_holds() {
        let fusion = FusionOptimizer::default();
        let decision = fusion.combine(vec![Signal::neutral(SignalSource::Structure, "none")]);
        assert!(decision.is_hold());
    }

    #[test]
    fn test_weight_bounds() {
        let mut fusion = FusionOptimizer::default();
        for _ in 0..4 {
            fusion.record_outcome("always_wrong", false);
            fusion.record_outcome("always_right", true);
        }
        assert_eq!(fusion.weight("always_wrong"), 0.5);
        assert_eq!(fusion.weight("always_right"), 1.5);
        assert_eq!(fusion.weight("unseen"), 1.0);
    }

    #[test]
    fn test_pending_resolution_updates_weights() {
        let mut fusion = FusionOptimizer::new(FusionConfig {
            evaluation_window: 3,
            dead_zone_points: 0.5,
            ..Default::default()
        });
        let decision = fusion.combine(vec![
            vote(SignalSource::Structure, Direction::Buy, 80.0),
            vote(SignalSource::RangeBreakout, Direction::Sell, 30.0),
        ]);
        fusion.track(10, 100.0, &decision);

        fusion.resolve(12, 105.0);
        assert_eq!(fusion.pending_len(), 1);

        fusion.resolve(13, 105.0);
        assert_eq!(fusion.pending_len(), 0);
        assert_eq!(fusion.weight("structure"), 1.5);
        assert_eq!(fusion.weight("range_breakout"), 0.5);
    }

    #[test]
    fn test_dead_zone_not_scored() {
        let mut fusion = FusionOptimizer::new(FusionConfig {
            evaluation_window: 1,
            dead_zone_points: 1.0,
            ..Default::default()
        });
        let decision = fusion.combine(vec![vote(SignalSource::Structure, Direction::Buy, 80.0)]);
        fusion.track(0, 100.0, &decision);
        fusion.resolve(1, 100.4);
        assert_eq!(fusion.stats().get("structure").map(|s| s.evaluated), None);
    }

    #[test]
    fn test_advisory_opinion_consumed() {
        let mut strategies = vec![Strategy::Advisory {
            name: "llm".into(),
            opinion: Some(vote(SignalSource::Advisory("llm".into()), Direction::Sell, 90.0)),
        }];
        let mut fusion = FusionOptimizer::default();
        let first = fusion.evaluate(&mut strategies, &[]);
        assert_eq!(first.direction, Direction::Sell);
        let second = fusion.evaluate(&mut strategies, &[]);
        assert!(second.is_hold());
    }
}
