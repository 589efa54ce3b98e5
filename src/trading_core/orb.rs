//! Opening Range Breakout
//!
//! Daily state machine per symbol:
//! - NoRange: waiting for the first closed bar at/after the session open
//! - Expanding: range grows on body-confirmed extensions, counts contained bars
//! - Final: range locked for the day, closes beyond it are breakouts
//!
//! Conviction is the z-score of the breakout close against the closes seen
//! while the range consolidated.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::bars::Bar;
use super::indicators;
use crate::types::{Side, Signal, SignalSource};

/// Opening range configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// IANA zone for the session clock
    pub timezone: String,
    /// Session open hour (local, 24h format)
    pub session_hour: u32,
    /// Session open minute
    pub session_minute: u32,
    /// Longest wick kept beyond the body when building the range
    pub max_wick_points: f64,
    /// Contained bars needed to lock the range
    pub consolidation_bars: u32,
    /// Breakout signals allowed per day
    pub max_signals_per_day: u32,
    /// |z| that maps to full conviction
    pub full_conviction_z: f64,
    /// Std floor as a fraction of range width
    pub min_std_fraction: f64,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            session_hour: 9,
            session_minute: 30,
            max_wick_points: 5.0,
            consolidation_bars: 4,
            max_signals_per_day: 2,
            full_conviction_z: 3.0,
            min_std_fraction: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePhase {
    NoRange,
    Expanding,
    Final,
}

impl std::fmt::Display for RangePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangePhase::NoRange => write!(f, "NO_RANGE"),
            RangePhase::Expanding => write!(f, "EXPANDING"),
            RangePhase::Final => write!(f, "FINAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningRange {
    pub high: f64,
    pub low: f64,
    pub consolidation_count: u32,
    /// Closes since the last seed or extension
    pub closes: Vec<f64>,
}

impl OpeningRange {
    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakoutSignal {
    pub side: Side,
    pub close: f64,
    pub range_high: f64,
    pub range_low: f64,
    pub z_score: f64,
    /// 0..=100
    pub strength: f64,
}

impl BreakoutSignal {
    pub fn to_signal(&self) -> Signal {
        Signal::new(
            SignalSource::RangeBreakout,
            self.side.direction(),
            self.strength,
            format!(
                "close {:.5} beyond range {:.5}-{:.5} (z={:.2})",
                self.close, self.range_low, self.range_high, self.z_score
            ),
        )
    }
}

/// Opening range detector for one symbol
#[derive(Debug, Clone)]
pub struct RangeBreakoutDetector {
    config: RangeConfig,
    tz: Tz,
    day: Option<NaiveDate>,
    phase: RangePhase,
    range: Option<OpeningRange>,
    stats: Option<(f64, f64)>,
    fired_buy: bool,
    fired_sell: bool,
    signals_today: u32,
    last_seen: Option<DateTime<Utc>>,
}

impl RangeBreakoutDetector {
    pub fn new(config: RangeConfig) -> Self {
        let tz = config.timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!("Unknown session timezone {:?}, using America/New_York", config.timezone);
            chrono_tz::America::New_York
        });
        Self {
            config,
            tz,
            day: None,
            phase: RangePhase::NoRange,
            range: None,
            stats: None,
            fired_buy: false,
            fired_sell: false,
            signals_today: 0,
            last_seen: None,
        }
    }

    pub fn phase(&self) -> RangePhase {
        self.phase
    }

    pub fn range(&self) -> Option<&OpeningRange> {
        self.range.as_ref()
    }

    /// Mean and std of the consolidation closes, once Final
    pub fn stats(&self) -> Option<(f64, f64)> {
        self.stats
    }

    /// Swap parameters without losing the day's state
    pub fn set_config(&mut self, config: RangeConfig) {
        if let Ok(tz) = config.timezone.parse::<Tz>() {
            self.tz = tz;
        }
        self.config = config;
    }

    /// Feed every bar not yet seen and report a breakout on the last one
    pub fn detect(&mut self, bars: &[Bar]) -> Signal {
        let mut last_breakout = None;
        let last_time = bars.last().map(|b| b.open_time);
        for bar in bars {
            if let Some(signal) = self.on_bar(bar, true) {
                if Some(bar.open_time) == last_time {
                    last_breakout = Some(signal);
                }
            }
        }
        match last_breakout {
            Some(b) => b.to_signal(),
            None => Signal::neutral(SignalSource::RangeBreakout, format!("range {}", self.phase)),
        }
    }

    /// Process one bar. Forming bars and bars already seen change nothing.
    pub fn on_bar(&mut self, bar: &Bar, closed: bool) -> Option<BreakoutSignal> {
        if !closed {
            return None;
        }
        if self.last_seen.is_some_and(|seen| bar.open_time <= seen) {
            return None;
        }
        self.last_seen = Some(bar.open_time);

        let local = bar.open_time.with_timezone(&self.tz);
        let date = local.date_naive();
        if self.day != Some(date) {
            self.reset_day(date);
        }

        match self.phase {
            RangePhase::NoRange => {
                let minutes = local.hour() * 60 + local.minute();
                let session = self.config.session_hour * 60 + self.config.session_minute;
                if minutes >= session {
                    self.seed(bar);
                }
                None
            }
            RangePhase::Expanding => {
                self.extend(bar);
                None
            }
            RangePhase::Final => self.check_breakout(bar),
        }
    }

    fn reset_day(&mut self, date: NaiveDate) {
        debug!("ORB reset for {}", date);
        self.day = Some(date);
        self.phase = RangePhase::NoRange;
        self.range = None;
        self.stats = None;
        self.fired_buy = false;
        self.fired_sell = false;
        self.signals_today = 0;
    }

    fn clipped_extremes(&self, bar: &Bar) -> (f64, f64) {
        let high = bar.high.min(bar.body_top() + self.config.max_wick_points);
        let low = bar.low.max(bar.body_bottom() - self.config.max_wick_points);
        (high, low)
    }

    fn seed(&mut self, bar: &Bar) {
        let (high, low) = self.clipped_extremes(bar);
        debug!("ORB seeded {:.5}-{:.5} @ {}", low, high, bar.open_time);
        self.range = Some(OpeningRange {
            high,
            low,
            consolidation_count: 0,
            closes: vec![bar.close],
        });
        self.phase = RangePhase::Expanding;
        if self.config.consolidation_bars == 0 {
            self.finalize();
        }
    }

    fn extend(&mut self, bar: &Bar) {
        let (clip_high, clip_low) = self.clipped_extremes(bar);
        let Some(range) = self.range.as_mut() else {
            return;
        };

        let contained = bar.high <= range.high && bar.low >= range.low;
        if contained {
            range.consolidation_count += 1;
            range.closes.push(bar.close);
        } else if bar.body_top() > range.high || bar.body_bottom() < range.low {
            range.high = range.high.max(clip_high);
            range.low = range.low.min(clip_low);
            range.consolidation_count = 0;
            range.closes = vec![bar.close];
            debug!("ORB extended to {:.5}-{:.5}", range.low, range.high);
        }

        if range.consolidation_count >= self.config.consolidation_bars {
            self.finalize();
        }
    }

    fn finalize(&mut self) {
        let Some(range) = &self.range else {
            return;
        };
        self.stats = indicators::mean_std(&range.closes);
        self.phase = RangePhase::Final;
        info!(
            "ORB FINAL: {:.5}-{:.5} after {} contained bars",
            range.low, range.high, range.consolidation_count
        );
    }

    fn check_breakout(&mut self, bar: &Bar) -> Option<BreakoutSignal> {
        if self.signals_today >= self.config.max_signals_per_day {
            return None;
        }
        let range = self.range.as_ref()?;

        let side = if bar.close > range.high && bar.is_bullish() {
            Side::Buy
        } else if bar.close < range.low && bar.is_bearish() {
            Side::Sell
        } else {
            return None;
        };

        let already = match side {
            Side::Buy => self.fired_buy,
            Side::Sell => self.fired_sell,
        };
        if already {
            debug!("ORB {} breakout already taken today", side);
            return None;
        }

        let (mean, std) = self.stats?;
        let scale = std.max(range.width() * self.config.min_std_fraction);
        if scale <= 0.0 || self.config.full_conviction_z <= 0.0 {
            warn!("ORB degenerate range {:.5}-{:.5}, breakout ignored", range.low, range.high);
            return None;
        }
        let z_score = (bar.close - mean) / scale;
        let strength = (z_score.abs() / self.config.full_conviction_z).min(1.0) * 100.0;

        let signal = BreakoutSignal {
            side,
            close: bar.close,
            range_high: range.high,
            range_low: range.low,
            z_score,
            strength,
        };

        match side {
            Side::Buy => self.fired_buy = true,
            Side::Sell => self.fired_sell = true,
        }
        self.signals_today += 1;

        info!(
            "ORB BREAKOUT: {} @ {:.5} | range {:.5}-{:.5} | z={:.2} strength={:.0}",
            side, bar.close, range.low, range.high, z_score, strength
        );
        Some(signal)
    }
}

impl Default for RangeBreakoutDetector {
    fn default() -> Self {
        Self::new(RangeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::test_support::ny_bar;
    use crate::types::Direction;
    use chrono::Duration;

    fn consolidated() -> (RangeBreakoutDetector, Vec<Bar>) {
        let bars = vec![
            ny_bar(9, 30, 99.0, 105.0, 95.0, 101.0),
            ny_bar(9, 31, 100.0, 103.0, 97.0, 100.5),
            ny_bar(9, 32, 100.5, 102.0, 98.0, 101.0),
            ny_bar(9, 33, 101.0, 102.0, 99.0, 99.5),
            ny_bar(9, 34, 99.5, 101.0, 98.0, 100.0),
        ];
        let mut orb = RangeBreakoutDetector::default();
        for bar in &bars {
            assert!(orb.on_bar(bar, true).is_none());
        }
        (orb, bars)
    }

    #[test]
    fn test_range_locks_after_consolidation() {
        let (orb, _) = consolidated();
        assert_eq!(orb.phase(), RangePhase::Final);
        let range = orb.range().unwrap();
        assert_eq!((range.low, range.high), (95.0, 105.0));
        let (mean, _) = orb.stats().unwrap();
        assert!((mean - 100.4).abs() < 1e-9);
    }

    #[test]
    fn test_bullish_breakout_fires_once_per_day() {
        let (mut orb, _) = consolidated();

        let breakout = ny_bar(9, 35, 104.0, 108.5, 103.5, 108.0);
        let signal = orb.on_bar(&breakout, true).expect("breakout");
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.strength, 100.0);

        let repeat = ny_bar(9, 36, 104.0, 108.5, 103.5, 108.0);
        assert!(orb.on_bar(&repeat, true).is_none());
    }

    #[test]
    fn test_forming_bar_ignored() {
        let (mut orb, _) = consolidated();
        let breakout = ny_bar(9, 35, 104.0, 108.5, 103.5, 108.0);
        assert!(orb.on_bar(&breakout, false).is_none());
        // the same bar once closed still fires
        assert!(orb.on_bar(&breakout, true).is_some());
    }

    #[test]
    fn test_refeed_is_idempotent() {
        let (mut orb, bars) = consolidated();
        let mut all = bars.clone();
        all.push(ny_bar(9, 35, 104.0, 108.5, 103.5, 108.0));

        let first = orb.detect(&all);
        assert_eq!(first.direction, Direction::Buy);
        let second = orb.detect(&all);
        assert!(second.is_neutral());
        assert_eq!(orb.phase(), RangePhase::Final);
    }

    #[test]
    fn test_wick_clipped_at_seed() {
        let mut orb = RangeBreakoutDetector::default();
        orb.on_bar(&ny_bar(9, 30, 100.0, 120.0, 99.0, 101.0), true);
        let range = orb.range().unwrap();
        assert_eq!(range.high, 106.0);
        assert_eq!(range.low, 99.0);
    }

    #[test]
    fn test_wick_only_excursion_keeps_range() {
        let mut orb = RangeBreakoutDetector::default();
        orb.on_bar(&ny_bar(9, 30, 99.0, 105.0, 95.0, 101.0), true);
        orb.on_bar(&ny_bar(9, 31, 100.0, 103.0, 97.0, 100.5), true);
        // wick above 105 but body inside
        orb.on_bar(&ny_bar(9, 32, 101.0, 107.0, 99.0, 102.0), true);
        let range = orb.range().unwrap();
        assert_eq!(range.high, 105.0);
        assert_eq!(range.consolidation_count, 1);

        // body above 105 extends and resets the counter
        orb.on_bar(&ny_bar(9, 33, 104.0, 107.0, 103.0, 106.5), true);
        let range = orb.range().unwrap();
        assert_eq!(range.high, 107.0);
        assert_eq!(range.consolidation_count, 0);
    }

    #[test]
    fn test_bars_before_session_do_not_seed() {
        let mut orb = RangeBreakoutDetector::default();
        orb.on_bar(&ny_bar(9, 0, 99.0, 105.0, 95.0, 101.0), true);
        assert_eq!(orb.phase(), RangePhase::NoRange);
    }

    #[test]
    fn test_new_day_resets() {
        let (mut orb, _) = consolidated();
        let mut next_day = ny_bar(9, 0, 100.0, 101.0, 99.0, 100.5);
        next_day.open_time = next_day.open_time + Duration::days(1);
        orb.on_bar(&next_day, true);
        assert_eq!(orb.phase(), RangePhase::NoRange);
        assert!(orb.range().is_none());
    }
}
