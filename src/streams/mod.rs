mod replay;

pub use replay::{discover_feeds, load_bars_csv, BarFeed};
