//! CSV bar feed for replaying the decision loop
//!
//! One file per symbol, named `<SYMBOL>.csv`, with a header row:
//! `timestamp,open,high,low,close,volume`. Timestamps are RFC 3339 or Unix
//! seconds.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::trading_core::bars::Bar;

#[derive(Debug, Deserialize)]
struct CsvBarRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

/// A symbol and the file its bars come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarFeed {
    pub symbol: String,
    pub path: PathBuf,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0).with_context(|| format!("Timestamp out of range: {}", raw));
    }
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Failed to parse timestamp: {}", raw))?
        .with_timezone(&Utc))
}

/// Load bars in time order. Malformed OHLC rows and duplicate timestamps are skipped.
pub fn load_bars_csv(path: &Path) -> Result<Vec<Bar>> {
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("Failed to open bar file: {:?}", path))?;

    let mut bars = Vec::new();
    let mut skipped = 0u64;
    for (line, result) in reader.deserialize().enumerate() {
        let row: CsvBarRow = result.with_context(|| format!("Failed to parse CSV row {} in {:?}", line + 2, path))?;
        let open_time = parse_timestamp(&row.timestamp)?;
        let bar = Bar::new(open_time, row.open, row.high, row.low, row.close, row.volume);
        if !bar.is_well_formed() {
            skipped += 1;
            continue;
        }
        bars.push(bar);
    }

    bars.sort_by_key(|b| b.open_time);
    let before = bars.len();
    bars.dedup_by_key(|b| b.open_time);
    skipped += (before - bars.len()) as u64;

    if skipped > 0 {
        warn!("{:?}: skipped {} malformed or duplicate bars", path, skipped);
    }
    debug!("Loaded {} bars from {:?}", bars.len(), path);
    Ok(bars)
}

/// Every `*.csv` in `dir`, symbol taken from the file stem
pub fn discover_feeds(dir: &Path) -> Result<Vec<BarFeed>> {
    let mut feeds = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read directory: {:?}", dir))? {
        let path = entry?.path();
        if !path.extension().is_some_and(|ext| ext == "csv") {
            continue;
        }
        let Some(symbol) = path.file_stem().map(|s| s.to_string_lossy().to_uppercase()) else {
            continue;
        };
        feeds.push(BarFeed { symbol, path });
    }
    if feeds.is_empty() {
        bail!("No .csv bar files in {:?}", dir);
    }
    feeds.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    Ok(feeds)
}
