//! Market Structure Analysis
//!
//! Order-flow structure read from closed bars:
//! - Swing fractals of width K
//! - Order blocks (reversal candle + impulse candle)
//! - Fair-value gaps with mitigation and inversion tracking
//! - Break of structure (BOS) and change of character (CHoCH)
//! - Premium/discount zone and liquidity sweeps
//!
//! A composite sentiment score picks which detector is authoritative for the
//! pass. The other detectors only speak, scaled down, when the authoritative
//! one is silent.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bars::Bar;
use super::indicators;
use crate::types::{Direction, Signal, SignalSource};

pub const ORDER_BLOCK_STRENGTH: f64 = 65.0;
pub const FVG_MITIGATION_STRENGTH: f64 = 60.0;
pub const FVG_INVERSION_STRENGTH: f64 = 75.0;
pub const BOS_STRENGTH: f64 = 80.0;
pub const CHOCH_STRENGTH: f64 = 85.0;
pub const SWEEP_STRENGTH: f64 = 55.0;

/// What to do when the authoritative detector and a secondary disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Authoritative signal stands
    #[default]
    AuthoritativeWins,
    /// Highest (scaled) strength wins
    StrongestWins,
    /// A strong disagreement produces no signal
    NeutralOnConflict,
}

/// Structure analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    /// Minimum bars before any analysis happens
    pub min_bars: usize,
    /// Fractal half-width K
    pub swing_width: usize,
    /// Impulse body must be at least this multiple of the reversal body
    pub impulse_body_ratio: f64,
    /// Bars scanned back for order blocks
    pub order_block_lookback: usize,
    /// Minimum gap size in price points
    pub min_gap_points: f64,
    /// Bars scanned back for fair-value gaps
    pub fvg_lookback: usize,
    /// Bars used for the premium/discount midpoint
    pub premium_lookback: usize,
    /// Long SMA period for the higher-timeframe bias
    pub bias_ma_period: usize,
    /// Minimum fractional deviation from the SMA to count as biased
    pub bias_min_deviation: f64,
    /// Multiplier applied to non-authoritative detector strength
    pub secondary_scale: f64,
    pub conflict_policy: ConflictPolicy,
    /// Scaled secondary strength that counts as a real disagreement
    pub conflict_min_strength: f64,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            min_bars: 50,
            swing_width: 3,
            impulse_body_ratio: 1.5,
            order_block_lookback: 40,
            min_gap_points: 0.0,
            fvg_lookback: 40,
            premium_lookback: 50,
            bias_ma_period: 50,
            bias_min_deviation: 0.001, // 0.1%
            secondary_scale: 0.8,
            conflict_policy: ConflictPolicy::AuthoritativeWins,
            conflict_min_strength: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub price: f64,
    pub bar_index: usize,
    pub kind: SwingKind,
}

/// Polarity of an order block or gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Bullish,
    Bearish,
}

impl ZoneKind {
    pub fn direction(&self) -> Direction {
        match self {
            ZoneKind::Bullish => Direction::Buy,
            ZoneKind::Bearish => Direction::Sell,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBlock {
    pub kind: ZoneKind,
    pub top: f64,
    pub bottom: f64,
    pub origin_bar_index: usize,
    /// Price came back into the block on an earlier bar
    pub mitigated: bool,
    /// False once a close went through the far side
    pub valid: bool,
}

impl OrderBlock {
    fn observe(&mut self, bar: &Bar, count_mitigation: bool) {
        match self.kind {
            ZoneKind::Bullish => {
                if bar.close < self.bottom {
                    self.valid = false;
                }
                if count_mitigation && bar.low <= self.top {
                    self.mitigated = true;
                }
            }
            ZoneKind::Bearish => {
                if bar.close > self.top {
                    self.valid = false;
                }
                if count_mitigation && bar.high >= self.bottom {
                    self.mitigated = true;
                }
            }
        }
    }

    /// Bar traded into the block and closed without breaking it
    pub fn touched_by(&self, bar: &Bar) -> bool {
        match self.kind {
            ZoneKind::Bullish => bar.low <= self.top && bar.close >= self.bottom,
            ZoneKind::Bearish => bar.high >= self.bottom && bar.close <= self.top,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairValueGap {
    pub kind: ZoneKind,
    pub top: f64,
    pub bottom: f64,
    /// Middle bar of the three-bar pattern
    pub origin_bar_index: usize,
    pub mitigated: bool,
    pub inverted: bool,
    pub mitigated_at: Option<usize>,
    pub inverted_at: Option<usize>,
}

impl FairValueGap {
    /// Advance the gap state by one later bar. A bar can either mitigate or
    /// invert, never both, so inversion always lands on a later bar.
    pub fn update(&mut self, bar: &Bar, index: usize) {
        if self.inverted {
            return;
        }
        if self.mitigated {
            let through = match self.kind {
                ZoneKind::Bullish => bar.close < self.bottom,
                ZoneKind::Bearish => bar.close > self.top,
            };
            if through {
                self.inverted = true;
                self.inverted_at = Some(index);
            }
        } else {
            let entered = match self.kind {
                ZoneKind::Bullish => bar.low <= self.top,
                ZoneKind::Bearish => bar.high >= self.bottom,
            };
            if entered {
                self.mitigated = true;
                self.mitigated_at = Some(index);
            }
        }
    }

    pub fn touched_by(&self, bar: &Bar) -> bool {
        match self.kind {
            ZoneKind::Bullish => bar.low <= self.top && bar.close >= self.bottom,
            ZoneKind::Bearish => bar.high >= self.bottom && bar.close <= self.top,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakKind {
    Bos,
    Choch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureBreak {
    pub kind: BreakKind,
    pub direction: Direction,
    pub level: f64,
    pub bar_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySweep {
    /// Direction of the expected reversal
    pub direction: Direction,
    pub level: f64,
    pub bar_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceZone {
    Premium,
    Discount,
    Equilibrium,
}

/// The four structural detectors, in the order they can be ranked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    OrderBlock,
    FairValueGap,
    StructureBreak,
    LiquiditySweep,
}

/// Detector precedence for a sentiment score
pub fn detector_priority(sentiment_score: i8) -> [Detector; 4] {
    use Detector::*;
    match sentiment_score.unsigned_abs() {
        2 => [FairValueGap, StructureBreak, OrderBlock, LiquiditySweep],
        1 => [StructureBreak, FairValueGap, OrderBlock, LiquiditySweep],
        _ => [OrderBlock, FairValueGap, StructureBreak, LiquiditySweep],
    }
}

pub fn sentiment_label(score: i8) -> &'static str {
    match score {
        2 => "risk-on",
        1 => "bullish trend",
        -1 => "bearish trend",
        -2 => "risk-off",
        _ => "neutral",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureState {
    pub sentiment_score: i8,
    pub sentiment_label: String,
    pub active_strategy: Detector,
}

impl StructureState {
    fn from_score(score: i8) -> Self {
        Self {
            sentiment_score: score,
            sentiment_label: sentiment_label(score).to_string(),
            active_strategy: detector_priority(score)[0],
        }
    }
}

/// Full result of one analysis pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureAnalysis {
    pub signal: Signal,
    pub state: StructureState,
    pub swings: Vec<SwingPoint>,
    pub order_blocks: Vec<OrderBlock>,
    pub fair_value_gaps: Vec<FairValueGap>,
    pub structure_break: Option<StructureBreak>,
    pub sweep: Option<LiquiditySweep>,
    pub zone: PriceZone,
    pub equilibrium: Option<f64>,
    /// Raw (unscaled) output of each detector that fired on the last bar
    pub candidates: Vec<(Detector, Signal)>,
}

impl StructureAnalysis {
    pub fn neutral(reason: &str) -> Self {
        Self {
            signal: Signal::neutral(SignalSource::Structure, reason),
            state: StructureState::from_score(0),
            swings: Vec::new(),
            order_blocks: Vec::new(),
            fair_value_gaps: Vec::new(),
            structure_break: None,
            sweep: None,
            zone: PriceZone::Equilibrium,
            equilibrium: None,
            candidates: Vec::new(),
        }
    }

    /// High and low of the two most recent opposite swings, if any
    pub fn last_swing_range(&self) -> Option<(f64, f64)> {
        let high = self.swings.iter().rev().find(|s| s.kind == SwingKind::High)?;
        let low = self.swings.iter().rev().find(|s| s.kind == SwingKind::Low)?;
        (high.price > low.price).then_some((high.price, low.price))
    }
}

/// Stateless structure analyzer; every pass recomputes from the bar slice
#[derive(Debug, Clone, Default)]
pub struct StructureAnalyzer {
    config: StructureConfig,
}

impl StructureAnalyzer {
    pub fn new(config: StructureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StructureConfig {
        &self.config
    }

    pub fn analyze(&self, bars: &[Bar]) -> StructureAnalysis {
        let cfg = &self.config;
        let needed = cfg.min_bars.max(2 * cfg.swing_width + 2);
        if bars.len() < needed {
            return StructureAnalysis::neutral(&format!(
                "insufficient data: {} of {} bars",
                bars.len(),
                needed
            ));
        }

        let last = bars.len() - 1;
        let bar = &bars[last];

        let swings = detect_swings(bars, cfg.swing_width);
        let trend = micro_trend(&swings);
        let last_high = swings.iter().rev().find(|s| s.kind == SwingKind::High).copied();
        let last_low = swings.iter().rev().find(|s| s.kind == SwingKind::Low).copied();

        let order_blocks = detect_order_blocks(bars, cfg.impulse_body_ratio, cfg.order_block_lookback);
        let fair_value_gaps = detect_fair_value_gaps(bars, cfg.min_gap_points, cfg.fvg_lookback);
        let structure_break = detect_structure_break(bars, last_high, last_low, trend);
        let sweep = detect_sweep(bar, last, last_high, last_low);
        let (zone, equilibrium) = price_zone(bars, cfg.premium_lookback);

        let score = self.sentiment(bars, trend, last_high, last_low);
        let state = StructureState::from_score(score);

        let mut candidates = Vec::new();
        if let Some(sig) = order_block_signal(&order_blocks, bar) {
            candidates.push((Detector::OrderBlock, sig));
        }
        if let Some(sig) = fvg_signal(&fair_value_gaps, bar, last) {
            candidates.push((Detector::FairValueGap, sig));
        }
        if let Some(b) = &structure_break {
            let (strength, label) = match b.kind {
                BreakKind::Bos => (BOS_STRENGTH, "BOS"),
                BreakKind::Choch => (CHOCH_STRENGTH, "CHoCH"),
            };
            candidates.push((
                Detector::StructureBreak,
                Signal::new(
                    SignalSource::Structure,
                    b.direction,
                    strength,
                    format!("{} {} through {:.5}", label, b.direction, b.level),
                ),
            ));
        }
        if let Some(s) = &sweep {
            candidates.push((
                Detector::LiquiditySweep,
                Signal::new(
                    SignalSource::Structure,
                    s.direction,
                    SWEEP_STRENGTH,
                    format!("liquidity sweep of {:.5}", s.level),
                ),
            ));
        }

        let signal = self.select(score, &candidates);
        if !signal.is_neutral() {
            debug!(
                "Structure {} ({:.0}) | sentiment {} | {}",
                signal.direction, signal.strength, state.sentiment_label, signal.reason
            );
        }

        StructureAnalysis {
            signal,
            state,
            swings,
            order_blocks,
            fair_value_gaps,
            structure_break,
            sweep,
            zone,
            equilibrium,
            candidates,
        }
    }

    /// Composite sentiment in -2..=2
    fn sentiment(
        &self,
        bars: &[Bar],
        trend: i8,
        last_high: Option<SwingPoint>,
        last_low: Option<SwingPoint>,
    ) -> i8 {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let Some(ma) = indicators::sma(&closes, self.config.bias_ma_period) else {
            return 0;
        };
        if ma <= 0.0 {
            return 0;
        }
        let close = closes[closes.len() - 1];
        let deviation = (close - ma) / ma;
        let bias: i8 = if deviation > self.config.bias_min_deviation {
            1
        } else if deviation < -self.config.bias_min_deviation {
            -1
        } else {
            0
        };

        if bias == 0 || trend != bias {
            return 0;
        }

        let extreme_broken = match bias {
            1 => last_high.is_some_and(|h| close > h.price),
            _ => last_low.is_some_and(|l| close < l.price),
        };
        if extreme_broken {
            2 * bias
        } else {
            bias
        }
    }

    fn select(&self, score: i8, candidates: &[(Detector, Signal)]) -> Signal {
        let priority = detector_priority(score);
        let scale = self.config.secondary_scale;

        let ranked: Vec<(Detector, &Signal)> = priority
            .iter()
            .filter_map(|d| candidates.iter().find(|(c, _)| c == d).map(|(c, s)| (*c, s)))
            .collect();

        let scaled = |s: &Signal, reason_tag: &str| {
            Signal::new(
                SignalSource::Structure,
                s.direction,
                s.strength * scale,
                format!("{} ({})", s.reason, reason_tag),
            )
        };

        let primary = ranked.iter().find(|(d, _)| *d == priority[0]).map(|(_, s)| (*s).clone());
        let secondaries: Vec<Signal> = ranked
            .iter()
            .filter(|(d, _)| *d != priority[0])
            .map(|(_, s)| scaled(*s, "secondary"))
            .collect();

        match self.config.conflict_policy {
            ConflictPolicy::AuthoritativeWins => primary
                .or_else(|| secondaries.into_iter().next())
                .unwrap_or_else(|| Signal::neutral(SignalSource::Structure, "no structure signal")),
            ConflictPolicy::StrongestWins => {
                let mut best = primary;
                for s in secondaries {
                    if best.as_ref().map_or(true, |b| s.strength > b.strength) {
                        best = Some(s);
                    }
                }
                best.unwrap_or_else(|| Signal::neutral(SignalSource::Structure, "no structure signal"))
            }
            ConflictPolicy::NeutralOnConflict => {
                let chosen = primary.or_else(|| secondaries.first().cloned());
                let Some(chosen) = chosen else {
                    return Signal::neutral(SignalSource::Structure, "no structure signal");
                };
                let conflict = secondaries.iter().any(|s| {
                    s.direction == chosen.direction.opposite()
                        && s.strength >= self.config.conflict_min_strength
                });
                if conflict {
                    Signal::neutral(SignalSource::Structure, "detectors disagree")
                } else {
                    chosen
                }
            }
        }
    }
}

/// Fractal swings: a bar whose high (low) strictly exceeds the `k` bars on
/// each side. Only bars with a full right-hand window qualify.
pub fn detect_swings(bars: &[Bar], k: usize) -> Vec<SwingPoint> {
    let mut swings = Vec::new();
    if k == 0 || bars.len() < 2 * k + 1 {
        return swings;
    }
    for i in k..bars.len() - k {
        let neighbours = (i - k..=i + k).filter(|j| *j != i);
        let is_high = neighbours.clone().all(|j| bars[i].high > bars[j].high);
        let is_low = neighbours.into_iter().all(|j| bars[i].low < bars[j].low);
        if is_high {
            swings.push(SwingPoint {
                price: bars[i].high,
                bar_index: i,
                kind: SwingKind::High,
            });
        }
        if is_low {
            swings.push(SwingPoint {
                price: bars[i].low,
                bar_index: i,
                kind: SwingKind::Low,
            });
        }
    }
    swings
}

/// +1 for higher highs and higher lows, -1 for lower highs and lower lows
pub fn micro_trend(swings: &[SwingPoint]) -> i8 {
    let last_two = |kind: SwingKind| {
        let mut it = swings.iter().rev().filter(move |s| s.kind == kind);
        let newer = it.next()?;
        let older = it.next()?;
        Some((older.price, newer.price))
    };
    match (last_two(SwingKind::High), last_two(SwingKind::Low)) {
        (Some((h1, h2)), Some((l1, l2))) if h2 > h1 && l2 > l1 => 1,
        (Some((h1, h2)), Some((l1, l2))) if h2 < h1 && l2 < l1 => -1,
        _ => 0,
    }
}

/// Order blocks whose impulse candle closed before the last bar. Validity is
/// tracked through the last bar; mitigation only through the bar before it,
/// so the last bar can still count as the first retest.
pub fn detect_order_blocks(bars: &[Bar], body_ratio: f64, lookback: usize) -> Vec<OrderBlock> {
    let mut blocks = Vec::new();
    if bars.len() < 3 {
        return blocks;
    }
    let last = bars.len() - 1;
    let start = bars.len().saturating_sub(lookback).max(1);

    for i in start..last {
        let reversal = &bars[i - 1];
        let impulse = &bars[i];
        let reversal_body = reversal.body();
        if reversal_body <= 0.0 || impulse.body() < body_ratio * reversal_body {
            continue;
        }
        let kind = if reversal.is_bearish() && impulse.is_bullish() {
            ZoneKind::Bullish
        } else if reversal.is_bullish() && impulse.is_bearish() {
            ZoneKind::Bearish
        } else {
            continue;
        };

        let mut block = OrderBlock {
            kind,
            top: reversal.high,
            bottom: reversal.low,
            origin_bar_index: i - 1,
            mitigated: false,
            valid: true,
        };
        for (j, later) in bars.iter().enumerate().skip(i + 1) {
            block.observe(later, j < last);
        }
        blocks.push(block);
    }
    blocks
}

/// Three-bar gaps, each advanced through every later bar
pub fn detect_fair_value_gaps(bars: &[Bar], min_gap: f64, lookback: usize) -> Vec<FairValueGap> {
    let mut gaps = Vec::new();
    if bars.len() < 3 {
        return gaps;
    }
    let start = bars.len().saturating_sub(lookback).max(2);

    for i in start..bars.len() {
        let first = &bars[i - 2];
        let third = &bars[i];
        let gap = if third.low - first.high > min_gap {
            Some((ZoneKind::Bullish, third.low, first.high))
        } else if first.low - third.high > min_gap {
            Some((ZoneKind::Bearish, first.low, third.high))
        } else {
            None
        };
        let Some((kind, top, bottom)) = gap else {
            continue;
        };

        let mut fvg = FairValueGap {
            kind,
            top,
            bottom,
            origin_bar_index: i - 1,
            mitigated: false,
            inverted: false,
            mitigated_at: None,
            inverted_at: None,
        };
        for (j, later) in bars.iter().enumerate().skip(i + 1) {
            fvg.update(later, j);
        }
        gaps.push(fvg);
    }
    gaps
}

fn detect_structure_break(
    bars: &[Bar],
    last_high: Option<SwingPoint>,
    last_low: Option<SwingPoint>,
    trend: i8,
) -> Option<StructureBreak> {
    let last = bars.len() - 1;
    let close = bars[last].close;
    let prev = bars[last - 1].close;

    let crossed_up = last_high.filter(|h| prev <= h.price && close > h.price);
    let crossed_down = last_low.filter(|l| prev >= l.price && close < l.price);

    let make = |kind, direction, level: f64| StructureBreak {
        kind,
        direction,
        level,
        bar_index: last,
    };

    match trend {
        1 => crossed_up
            .map(|h| make(BreakKind::Bos, Direction::Buy, h.price))
            .or_else(|| crossed_down.map(|l| make(BreakKind::Choch, Direction::Sell, l.price))),
        -1 => crossed_down
            .map(|l| make(BreakKind::Bos, Direction::Sell, l.price))
            .or_else(|| crossed_up.map(|h| make(BreakKind::Choch, Direction::Buy, h.price))),
        _ => None,
    }
}

fn detect_sweep(
    bar: &Bar,
    index: usize,
    last_high: Option<SwingPoint>,
    last_low: Option<SwingPoint>,
) -> Option<LiquiditySweep> {
    let swept_high = last_high.filter(|h| bar.high > h.price && bar.close < h.price);
    let swept_low = last_low.filter(|l| bar.low < l.price && bar.close > l.price);
    match (swept_high, swept_low) {
        (Some(h), None) => Some(LiquiditySweep {
            direction: Direction::Sell,
            level: h.price,
            bar_index: index,
        }),
        (None, Some(l)) => Some(LiquiditySweep {
            direction: Direction::Buy,
            level: l.price,
            bar_index: index,
        }),
        _ => None,
    }
}

fn price_zone(bars: &[Bar], lookback: usize) -> (PriceZone, Option<f64>) {
    let window = &bars[bars.len().saturating_sub(lookback.max(1))..];
    let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if high <= low {
        return (PriceZone::Equilibrium, None);
    }
    let mid = (high + low) / 2.0;
    let close = bars[bars.len() - 1].close;
    let zone = if close > mid {
        PriceZone::Premium
    } else if close < mid {
        PriceZone::Discount
    } else {
        PriceZone::Equilibrium
    };
    (zone, Some(mid))
}

fn order_block_signal(blocks: &[OrderBlock], bar: &Bar) -> Option<Signal> {
    let block = blocks
        .iter()
        .rev()
        .find(|b| b.valid && !b.mitigated && b.touched_by(bar))?;
    Some(Signal::new(
        SignalSource::Structure,
        block.kind.direction(),
        ORDER_BLOCK_STRENGTH,
        format!(
            "retest of {:?} order block {:.5}-{:.5}",
            block.kind, block.bottom, block.top
        ),
    ))
}

fn fvg_signal(gaps: &[FairValueGap], bar: &Bar, index: usize) -> Option<Signal> {
    if let Some(g) = gaps.iter().rev().find(|g| g.inverted_at == Some(index)) {
        return Some(Signal::new(
            SignalSource::Structure,
            g.kind.direction().opposite(),
            FVG_INVERSION_STRENGTH,
            format!("inverted {:?} FVG {:.5}-{:.5}", g.kind, g.bottom, g.top),
        ));
    }
    let g = gaps
        .iter()
        .rev()
        .find(|g| g.mitigated_at == Some(index) && g.touched_by(bar))?;
    Some(Signal::new(
        SignalSource::Structure,
        g.kind.direction(),
        FVG_MITIGATION_STRENGTH,
        format!("mitigated {:?} FVG {:.5}-{:.5}", g.kind, g.bottom, g.top),
    ))
}
