//! Bar builders shared by unit tests

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::bars::Bar;

/// 2025-01-15 13:00 UTC, which is 08:00 in New York (EST)
pub fn session_base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 13, 0, 0).unwrap()
}

/// One-minute bar `index` minutes after [`session_base`]
pub fn minute_bar(index: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
    Bar::new(session_base() + Duration::minutes(index), open, high, low, close, volume)
}

/// Bar at an explicit New York wall-clock time on 2025-01-15
pub fn ny_bar(hour: u32, minute: u32, open: f64, high: f64, low: f64, close: f64) -> Bar {
    // EST is UTC-5 in January
    let t = Utc.with_ymd_and_hms(2025, 1, 15, hour + 5, minute, 0).unwrap();
    Bar::new(t, open, high, low, close, 100.0)
}

/// 60 one-minute bars: a steady advance, a bearish reversal candle at 50,
/// a bullish impulse at 51, a pullback, and a high-volume retest of the
/// order block at 55 (08:55 New York, inside the morning kill zone).
pub fn uptrend_with_retest() -> Vec<Bar> {
    let mut bars: Vec<Bar> = (0..50)
        .map(|i| {
            let o = 100.0 + i as f64;
            minute_bar(i, o, o + 1.8, o - 1.0, o + 0.8, 100.0)
        })
        .collect();

    bars.push(minute_bar(50, 150.5, 150.9, 149.6, 150.0, 100.0));
    bars.push(minute_bar(51, 150.0, 152.3, 149.8, 152.0, 100.0));
    bars.push(minute_bar(52, 152.0, 153.4, 151.7, 153.0, 100.0));
    bars.push(minute_bar(53, 153.0, 153.2, 151.8, 152.1, 100.0));
    bars.push(minute_bar(54, 152.1, 152.2, 151.0, 151.3, 100.0));
    bars.push(minute_bar(55, 150.8, 152.9, 150.5, 152.8, 200.0));

    for i in 56..60 {
        let o = 152.8 + (i - 56) as f64 * 0.5;
        bars.push(minute_bar(i, o, o + 0.9, o - 0.3, o + 0.5, 100.0));
    }
    bars
}
