//! Trade quality gate
//!
//! Scores a candidate entry across independent dimensions and accepts it only
//! when the time gate passes, volume or a fresh gap confirms it, and the total
//! clears the threshold.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::bars::Bar;
use super::indicators;
use super::structure::{PriceZone, StructureAnalysis};
use crate::types::Side;

/// A local-time window where entries earn the time award
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillZone {
    pub name: String,
    pub start_hour: u32,
    pub start_minute: u32,
    pub end_hour: u32,
    pub end_minute: u32,
}

impl KillZone {
    pub fn new(name: &str, start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            name: name.to_string(),
            start_hour: start.0,
            start_minute: start.1,
            end_hour: end.0,
            end_minute: end.1,
        }
    }

    /// Half-open [start, end) in minutes since local midnight
    pub fn contains(&self, minutes: u32) -> bool {
        let start = self.start_hour * 60 + self.start_minute;
        let end = self.end_hour * 60 + self.end_minute;
        minutes >= start && minutes < end
    }
}

/// Quality gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum total score to accept
    pub threshold: f64,
    /// IANA zone the kill zones are expressed in
    pub timezone: String,
    pub kill_zones: Vec<KillZone>,
    pub time_points: f64,
    /// Bars in the relative-volume baseline
    pub volume_lookback: usize,
    /// Relative volume for full credit
    pub volume_full_multiple: f64,
    pub volume_full_points: f64,
    pub volume_partial_points: f64,
    pub displacement_full: f64,
    pub displacement_partial: f64,
    /// Below this body/range ratio the bar is penalised
    pub displacement_weak: f64,
    pub displacement_full_points: f64,
    pub displacement_partial_points: f64,
    pub displacement_penalty: f64,
    pub gap_points: f64,
    pub zone_points: f64,
    pub proximity_points: f64,
    pub divergence_penalty: f64,
    /// Closes used for the overextension z-score
    pub extension_lookback: usize,
    pub extension_z: f64,
    /// Breakout strength at or above this is never penalised as overextended
    pub extreme_strength: f64,
    pub extension_penalty: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: 70.0,
            timezone: "America/New_York".to_string(),
            kill_zones: vec![
                KillZone::new("london", (2, 0), (5, 0)),
                KillZone::new("new_york", (8, 30), (11, 0)),
            ],
            time_points: 20.0,
            volume_lookback: 20,
            volume_full_multiple: 1.5,
            volume_full_points: 25.0,
            volume_partial_points: 12.0,
            displacement_full: 0.7,
            displacement_partial: 0.5,
            displacement_weak: 0.3,
            displacement_full_points: 20.0,
            displacement_partial_points: 10.0,
            displacement_penalty: 5.0,
            gap_points: 15.0,
            zone_points: 10.0,
            proximity_points: 10.0,
            divergence_penalty: 15.0,
            extension_lookback: 20,
            extension_z: 3.0,
            extreme_strength: 90.0,
            extension_penalty: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityComponent {
    pub dimension: String,
    pub points: f64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub accept: bool,
    pub total: f64,
    pub time_gate: bool,
    pub volume_gate: bool,
    pub gap_gate: bool,
    pub breakdown: Vec<QualityComponent>,
}

impl QualityScore {
    pub fn points(&self, dimension: &str) -> f64 {
        self.breakdown
            .iter()
            .filter(|c| c.dimension == dimension)
            .map(|c| c.points)
            .sum()
    }
}

/// Everything the gate looks at for one candidate
#[derive(Debug, Clone, Copy)]
pub struct QualityInput<'a> {
    pub side: Side,
    /// History ending with the signal bar
    pub bars: &'a [Bar],
    pub structure: &'a StructureAnalysis,
    /// Fused or breakout strength, 0..=100
    pub strength: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn evaluate(&self, input: &QualityInput<'_>) -> QualityScore {
        let cfg = &self.config;
        let mut breakdown = Vec::new();
        let mut add = |dimension: &str, points: f64, note: String| {
            breakdown.push(QualityComponent {
                dimension: dimension.to_string(),
                points,
                note,
            });
        };

        let Some(bar) = input.bars.last() else {
            return QualityScore {
                accept: false,
                total: 0.0,
                time_gate: false,
                volume_gate: false,
                gap_gate: false,
                breakdown: Vec::new(),
            };
        };

        // Time
        let zone = self.kill_zone(input.timestamp);
        let time_gate = zone.is_some();
        match zone {
            Some(name) => add("time", cfg.time_points, format!("inside {} kill zone", name)),
            None => add("time", 0.0, "outside kill zones".to_string()),
        }

        // Volume
        let volume_gate = match relative_volume(input.bars, cfg.volume_lookback) {
            Some(rvol) if rvol >= cfg.volume_full_multiple => {
                add("volume", cfg.volume_full_points, format!("rvol {:.2}", rvol));
                true
            }
            Some(rvol) if rvol > 1.0 => {
                add("volume", cfg.volume_partial_points, format!("rvol {:.2} partial", rvol));
                false
            }
            Some(rvol) => {
                add("volume", 0.0, format!("rvol {:.2}", rvol));
                false
            }
            None => {
                add("volume", 0.0, "no volume baseline".to_string());
                false
            }
        };

        // Displacement
        let range = bar.range();
        if range > 0.0 {
            let displacement = bar.body() / range;
            let points = if displacement >= cfg.displacement_full {
                cfg.displacement_full_points
            } else if displacement >= cfg.displacement_partial {
                cfg.displacement_partial_points
            } else if displacement < cfg.displacement_weak {
                -cfg.displacement_penalty
            } else {
                0.0
            };
            add("displacement", points, format!("body/range {:.2}", displacement));
        } else {
            add("displacement", 0.0, "zero-range bar".to_string());
        }

        // Gap formation: a gap in the trade direction completed on this bar
        let last_index = input.bars.len() - 1;
        let gap_gate = input.structure.fair_value_gaps.iter().any(|g| {
            g.kind.direction() == input.side.direction() && g.origin_bar_index + 1 == last_index
        });
        if gap_gate {
            add("gap", cfg.gap_points, "fresh fair-value gap".to_string());
        }

        // Premium/discount alignment
        let aligned = matches!(
            (input.side, input.structure.zone),
            (Side::Buy, PriceZone::Discount) | (Side::Sell, PriceZone::Premium)
        );
        if aligned {
            add("zone", cfg.zone_points, format!("{:?} entry", input.structure.zone));
        }

        // Proximity to a supporting order block or unfilled gap
        let supported = input
            .structure
            .order_blocks
            .iter()
            .any(|b| b.valid && b.kind.direction() == input.side.direction() && b.touched_by(bar))
            || input.structure.fair_value_gaps.iter().any(|g| {
                !g.inverted && g.kind.direction() == input.side.direction() && g.touched_by(bar)
            });
        if supported {
            add("proximity", cfg.proximity_points, "at supporting zone".to_string());
        }

        // Sentiment divergence
        let score = input.structure.state.sentiment_score;
        let diverges = (input.side == Side::Buy && score < 0) || (input.side == Side::Sell && score > 0);
        if diverges {
            add(
                "sentiment",
                -cfg.divergence_penalty,
                format!("against {} sentiment", input.structure.state.sentiment_label),
            );
        }

        // Overextension
        if input.strength < cfg.extreme_strength {
            if let Some(z) = close_z_score(input.bars, cfg.extension_lookback) {
                if z.abs() > cfg.extension_z {
                    add("extension", -cfg.extension_penalty, format!("close z {:.2}", z));
                }
            }
        }

        let total: f64 = breakdown.iter().map(|c| c.points).sum();
        let accept = time_gate && (volume_gate || gap_gate) && total >= cfg.threshold;

        QualityScore {
            accept,
            total,
            time_gate,
            volume_gate,
            gap_gate,
            breakdown,
        }
    }

    fn kill_zone(&self, timestamp: DateTime<Utc>) -> Option<&str> {
        let tz: Tz = self.config.timezone.parse().ok()?;
        let local = timestamp.with_timezone(&tz);
        let minutes = local.hour() * 60 + local.minute();
        self.config
            .kill_zones
            .iter()
            .find(|z| z.contains(minutes))
            .map(|z| z.name.as_str())
    }
}

/// Last bar volume over the mean of the `lookback` bars before it
pub fn relative_volume(bars: &[Bar], lookback: usize) -> Option<f64> {
    if lookback == 0 || bars.len() < lookback + 1 {
        return None;
    }
    let last = bars.len() - 1;
    let baseline: Vec<f64> = bars[last - lookback..last].iter().map(|b| b.volume).collect();
    let mean = indicators::sma(&baseline, lookback)?;
    if mean <= 0.0 {
        return None;
    }
    Some(bars[last].volume / mean)
}

/// z-score of the last close against the last `lookback` closes
pub fn close_z_score(bars: &[Bar], lookback: usize) -> Option<f64> {
    if lookback < 2 || bars.len() < lookback {
        return None;
    }
    let closes: Vec<f64> = bars[bars.len() - lookback..].iter().map(|b| b.close).collect();
    let (mean, std) = indicators::mean_std(&closes)?;
    if std <= 0.0 {
        return None;
    }
    Some((closes[closes.len() - 1] - mean) / std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::structure::{FairValueGap, StructureAnalyzer, ZoneKind};
    use crate::trading_core::test_support::{minute_bar, uptrend_with_retest};

    #[test]
    fn test_order_block_retest_accepted() {
        let bars = uptrend_with_retest();
        let window = &bars[..=55];
        let structure = StructureAnalyzer::default().analyze(window);
        let gate = QualityGate::default();

        let score = gate.evaluate(&QualityInput {
            side: Side::Buy,
            bars: window,
            structure: &structure,
            strength: 65.0,
            timestamp: window[55].open_time,
        });

        assert_eq!(score.points("time"), 20.0);
        assert_eq!(score.points("volume"), 25.0);
        assert_eq!(score.points("displacement"), 20.0);
        assert_eq!(score.points("proximity"), 10.0);
        assert_eq!(score.points("zone"), 0.0);
        assert!(score.total >= 70.0);
        assert!(score.accept);
    }

    #[test]
    fn test_outside_kill_zone_rejected() {
        let bars = uptrend_with_retest();
        let window = &bars[..=55];
        let structure = StructureAnalyzer::default().analyze(window);
        let gate = QualityGate::default();

        // 13:00 New York
        let afternoon = window[55].open_time + chrono::Duration::hours(4);
        let score = gate.evaluate(&QualityInput {
            side: Side::Buy,
            bars: window,
            structure: &structure,
            strength: 65.0,
            timestamp: afternoon,
        });
        assert!(!score.time_gate);
        assert!(!score.accept);
    }

    #[test]
    fn test_zero_range_and_flat_volume() {
        let bars: Vec<Bar> = (0..25)
            .map(|i| minute_bar(i, 100.0, 100.0, 100.0, 100.0, 0.0))
            .collect();
        let structure = StructureAnalysis::neutral("test");
        let score = QualityGate::default().evaluate(&QualityInput {
            side: Side::Sell,
            bars: &bars,
            structure: &structure,
            strength: 50.0,
            timestamp: bars[24].open_time,
        });
        assert_eq!(score.points("displacement"), 0.0);
        assert_eq!(score.points("volume"), 0.0);
        assert!(!score.volume_gate);
        assert!(!score.accept);
    }

    #[test]
    fn test_sentiment_divergence_penalised() {
        let bars = uptrend_with_retest();
        let window = &bars[..=55];
        let mut structure = StructureAnalyzer::default().analyze(window);
        structure.state.sentiment_score = 1;
        let score = QualityGate::default().evaluate(&QualityInput {
            side: Side::Sell,
            bars: window,
            structure: &structure,
            strength: 50.0,
            timestamp: window[55].open_time,
        });
        assert_eq!(score.points("sentiment"), -15.0);
    }

    fn bullish_gap(origin_bar_index: usize) -> FairValueGap {
        FairValueGap {
            kind: ZoneKind::Bullish,
            top: 100.0,
            bottom: 99.0,
            origin_bar_index,
            mitigated: false,
            inverted: false,
            mitigated_at: None,
            inverted_at: None,
        }
    }

    #[test]
    fn test_fresh_gap_stands_in_for_volume() {
        // flat volume, last bar at 08:39 New York
        let mut bars: Vec<Bar> = (0..39)
            .map(|i| minute_bar(i, 100.0, 100.5, 99.5, 100.0, 1.0))
            .collect();
        bars.push(minute_bar(39, 100.0, 101.1, 99.9, 101.0, 1.0));

        let mut structure = StructureAnalysis::neutral("test");
        structure.zone = PriceZone::Discount;
        structure.fair_value_gaps.push(bullish_gap(38));

        let gate = QualityGate::default();
        let input = QualityInput {
            side: Side::Buy,
            bars: &bars,
            structure: &structure,
            strength: 95.0,
            timestamp: bars[39].open_time,
        };
        let score = gate.evaluate(&input);
        assert!(!score.volume_gate);
        assert!(score.gap_gate);
        assert_eq!(score.points("gap"), 15.0);
        // time 20 + displacement 20 + gap 15 + zone 10 + proximity 10
        assert_eq!(score.total, 75.0);
        assert!(score.accept);

        // a gap against the trade does not count
        let score = gate.evaluate(&QualityInput {
            side: Side::Sell,
            ..input
        });
        assert!(!score.gap_gate);

        // nor does one that completed earlier
        structure.fair_value_gaps = vec![bullish_gap(30)];
        let score = gate.evaluate(&QualityInput {
            side: Side::Buy,
            bars: &bars,
            structure: &structure,
            strength: 95.0,
            timestamp: bars[39].open_time,
        });
        assert!(!score.gap_gate);
        assert!(!score.accept);
    }

    #[test]
    fn test_overextended_close_penalised_unless_extreme() {
        let mut bars: Vec<Bar> = (0..39)
            .map(|i| minute_bar(i, 100.0, 100.5, 99.5, 100.0, 10.0))
            .collect();
        bars.push(minute_bar(39, 100.0, 110.5, 99.9, 110.0, 10.0));
        let structure = StructureAnalysis::neutral("test");
        let gate = QualityGate::default();

        let input = QualityInput {
            side: Side::Buy,
            bars: &bars,
            structure: &structure,
            strength: 60.0,
            timestamp: bars[39].open_time,
        };
        // z = sqrt(19) for one outlier among twenty
        assert_eq!(gate.evaluate(&input).points("extension"), -10.0);

        let extreme = gate.evaluate(&QualityInput { strength: 95.0, ..input });
        assert!(extreme.breakdown.iter().all(|c| c.dimension != "extension"));

        // alternating 99/101 closes leave the last one at z = 1
        let swinging: Vec<Bar> = (0..40)
            .map(|i| {
                let close = if i % 2 == 0 { 99.0 } else { 101.0 };
                minute_bar(i, 100.0, 101.5, 98.5, close, 10.0)
            })
            .collect();
        let calm = gate.evaluate(&QualityInput {
            bars: &swinging,
            timestamp: swinging[39].open_time,
            ..input
        });
        assert_eq!(calm.points("extension"), 0.0);
    }

    #[test]
    fn test_kill_zone_bounds() {
        let zone = KillZone::new("new_york", (8, 30), (11, 0));
        assert!(zone.contains(8 * 60 + 30));
        assert!(!zone.contains(11 * 60));
        assert!(!zone.contains(8 * 60 + 29));
    }
}
