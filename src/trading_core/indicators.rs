//! Rolling indicators over closed bars
//!
//! All functions are pure and return `None` when the window is not yet full.

use super::bars::Bar;

/// True range of `bar` given the previous close
pub fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    let hl = bar.high - bar.low;
    let hc = (bar.high - prev_close).abs();
    let lc = (bar.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Simple-average ATR over the last `period` true ranges
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let start = bars.len() - period;
    let sum: f64 = (start..bars.len())
        .map(|i| true_range(&bars[i], bars[i - 1].close))
        .sum();
    Some(sum / period as f64)
}

/// ATR value at every bar where the window is full, oldest first
pub fn atr_series(bars: &[Bar], period: usize) -> Vec<f64> {
    if period == 0 || bars.len() < period + 1 {
        return Vec::new();
    }
    let trs: Vec<f64> = (1..bars.len())
        .map(|i| true_range(&bars[i], bars[i - 1].close))
        .collect();

    let mut out = Vec::with_capacity(trs.len() + 1 - period);
    let mut window: f64 = trs[..period].iter().sum();
    out.push(window / period as f64);
    for i in period..trs.len() {
        window += trs[i] - trs[i - period];
        out.push(window / period as f64);
    }
    out
}

/// Mean of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Population mean and standard deviation
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// Fraction of `series` at or below `value`, in [0, 1]
pub fn percentile_rank(series: &[f64], value: f64) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let below = series.iter().filter(|v| **v <= value).count();
    below as f64 / series.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::test_support::minute_bar;

    #[test]
    fn test_atr_needs_full_window() {
        let bars: Vec<Bar> = (0..5).map(|i| minute_bar(i, 100.0, 101.0, 99.0, 100.0, 1.0)).collect();
        assert!(atr(&bars, 5).is_none());
        assert_eq!(atr(&bars, 4), Some(2.0));
    }

    #[test]
    fn test_atr_series_matches_atr() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + (i % 7) as f64;
                minute_bar(i, base, base + 1.5, base - 0.5, base + 0.5, 1.0)
            })
            .collect();
        let series = atr_series(&bars, 14);
        assert_eq!(series.len(), 30 - 14);
        let last = atr(&bars, 14).unwrap();
        assert!((series.last().unwrap() - last).abs() < 1e-9);
    }

    #[test]
    fn test_mean_std_and_rank() {
        let (mean, std) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(mean, 5.0);
        assert_eq!(std, 2.0);
        assert_eq!(percentile_rank(&[1.0, 2.0, 3.0, 4.0], 2.0), 0.5);
        assert!(mean_std(&[]).is_none());
    }
}
