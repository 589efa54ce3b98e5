//! Engine configuration
//!
//! TOML file with a `[defaults]` symbol section and optional per-symbol
//! overrides under `[symbols.<NAME>]`. Every section has serde defaults so a
//! partial file is valid. `ConfigStore` holds the live copy and swaps it when
//! the file changes on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::advisory::AdvisoryConfig;
use crate::trading_core::fusion::FusionConfig;
use crate::trading_core::grid::{GridConfig, MAX_GRID_LEGS};
use crate::trading_core::orb::RangeConfig;
use crate::trading_core::quality::QualityConfig;
use crate::trading_core::risk::RiskConfig;
use crate::trading_core::structure::StructureConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything one symbol's trader needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolConfig {
    pub structure: StructureConfig,
    pub range: RangeConfig,
    pub quality: QualityConfig,
    pub fusion: FusionConfig,
    pub risk: RiskConfig,
    pub grid: GridConfig,
    /// Typical spread in price points
    pub spread: f64,
    /// Closed bars kept in memory
    pub history_bars: usize,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self {
            structure: StructureConfig::default(),
            range: RangeConfig::default(),
            quality: QualityConfig::default(),
            fusion: FusionConfig::default(),
            risk: RiskConfig::default(),
            grid: GridConfig::default(),
            spread: 0.0,
            history_bars: 500,
        }
    }
}

impl SymbolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tz in [&self.range.timezone, &self.quality.timezone] {
            tz.parse::<Tz>()
                .map_err(|_| ConfigError::Invalid(format!("unknown timezone {:?}", tz)))?;
        }
        self.risk
            .volume
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.risk.contract_size <= Decimal::ZERO {
            return Err(ConfigError::Invalid("risk.contract_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.fusion.decision_threshold) {
            return Err(ConfigError::Invalid(
                "fusion.decision_threshold must be within 0..=1".into(),
            ));
        }
        if self.structure.swing_width == 0 {
            return Err(ConfigError::Invalid("structure.swing_width must be at least 1".into()));
        }
        if self.grid.max_legs == 0 || self.grid.max_legs > MAX_GRID_LEGS {
            return Err(ConfigError::Invalid(format!(
                "grid.max_legs must be within 1..={}",
                MAX_GRID_LEGS
            )));
        }
        if self.grid.lot_multiplier <= Decimal::ZERO {
            return Err(ConfigError::Invalid("grid.lot_multiplier must be positive".into()));
        }
        if self.history_bars < self.structure.min_bars {
            return Err(ConfigError::Invalid(format!(
                "history_bars {} is below structure.min_bars {}",
                self.history_bars, self.structure.min_bars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Paper broker opening balance
    pub starting_balance: Decimal,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            starting_balance: dec!(10000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// SQLite file; no journal when unset
    pub path: Option<PathBuf>,
    pub queue_capacity: usize,
    /// Closed legs averaged for the basket target
    pub performance_window: usize,
    /// How long a bar waits for the performance query before keeping the last value
    pub performance_timeout_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: None,
            queue_capacity: 1024,
            performance_window: 20,
            performance_timeout_ms: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub cache_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            cache_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub account: AccountConfig,
    pub journal: JournalConfig,
    pub server: ServerConfig,
    pub advisory: Option<AdvisoryConfig>,
    pub defaults: SymbolConfig,
    pub symbols: HashMap<String, SymbolConfig>,
}

impl EngineConfig {
    /// Parse a config file. Each `[symbols.<NAME>]` section is layered over
    /// `[defaults]`, so a symbol only spells out what it changes.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table = text.parse()?;
        if let Some(toml::Value::Table(symbols)) = table.get("symbols") {
            let defaults = match table.get("defaults") {
                Some(toml::Value::Table(d)) => d.clone(),
                _ => toml::Table::new(),
            };
            let merged: toml::Table = symbols
                .iter()
                .map(|(name, section)| {
                    let value = match section {
                        toml::Value::Table(overrides) => {
                            let mut base = defaults.clone();
                            merge_tables(&mut base, overrides.clone());
                            toml::Value::Table(base)
                        }
                        other => other.clone(),
                    };
                    (name.clone(), value)
                })
                .collect();
            table.insert("symbols".to_string(), toml::Value::Table(merged));
        }
        let config: EngineConfig = toml::Value::Table(table).try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate()?;
        for (name, symbol) in &self.symbols {
            symbol
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("[symbols.{}] {}", name, e)))?;
        }
        if self.account.starting_balance <= Decimal::ZERO {
            return Err(ConfigError::Invalid("account.starting_balance must be positive".into()));
        }
        Ok(())
    }

    /// Per-symbol section, or the defaults
    pub fn symbol(&self, name: &str) -> SymbolConfig {
        self.symbols
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

/// Overlay `overrides` onto `base`, descending into nested tables
fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match value {
            toml::Value::Table(inner) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, inner),
                _ => {
                    base.insert(key, toml::Value::Table(inner));
                }
            },
            other => {
                base.insert(key, other);
            }
        }
    }
}

/// Live, hot-reloadable configuration
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<EngineConfig>>,
    path: Option<PathBuf>,
    modified: Arc<std::sync::Mutex<Option<SystemTime>>>,
}

impl ConfigStore {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: None,
            modified: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = EngineConfig::load(&path)?;
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        info!("Loaded config from {}", path.display());
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
            path: Some(path),
            modified: Arc::new(std::sync::Mutex::new(modified)),
        })
    }

    pub async fn snapshot(&self) -> EngineConfig {
        self.inner.read().await.clone()
    }

    pub async fn symbol(&self, name: &str) -> SymbolConfig {
        self.inner.read().await.symbol(name)
    }

    /// Reload when the file's mtime moved. Returns whether a swap happened.
    pub async fn reload_if_changed(&self) -> Result<bool, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let current = std::fs::metadata(path)?.modified()?;
        let previous = self.modified.lock().ok().and_then(|m| *m);
        if previous == Some(current) {
            return Ok(false);
        }
        self.reload().await?;
        if let Ok(mut m) = self.modified.lock() {
            *m = Some(current);
        }
        Ok(true)
    }

    /// Re-read the file unconditionally. On error the old config stays live.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let config = EngineConfig::load(path)?;
        *self.inner.write().await = config;
        info!("Config reloaded from {}", path.display());
        Ok(())
    }

    /// Poll the file every `interval` and swap in valid changes
    pub fn spawn_watcher(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = store.reload_if_changed().await {
                    warn!("Config reload rejected, keeping previous: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[account]
starting_balance = 5000

[defaults.grid]
max_legs = 3

[defaults.risk]
risk_percent = 0.5

[symbols.XAUUSD]
spread = 0.3

[symbols.XAUUSD.risk]
contract_size = 100
"#;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = EngineConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.account.starting_balance, dec!(5000));
        assert_eq!(config.defaults.grid.max_legs, 3);
        assert_eq!(config.defaults.quality.threshold, 70.0);

        let gold = config.symbol("XAUUSD");
        assert_eq!(gold.risk.contract_size, dec!(100));
        assert_eq!(gold.spread, 0.3);
        // untouched sections and keys come from [defaults], not built-ins
        assert_eq!(gold.grid.max_legs, 3);
        assert_eq!(gold.risk.risk_percent, dec!(0.5));
        // unknown symbols fall back to defaults
        assert_eq!(config.symbol("EURUSD").grid.max_legs, 3);
    }

    #[test]
    fn test_invalid_volume_rejected() {
        let text = r#"
[defaults.risk.volume]
min = 0.015
max = 1
step = 0.01
"#;
        assert!(matches!(EngineConfig::from_toml(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_symbol_override_replaces_only_its_keys() {
        let text = r#"
[defaults.grid]
max_legs = 4
step_points = 2.5
hedging = true

[symbols.EURUSD.grid]
max_legs = 6
"#;
        let config = EngineConfig::from_toml(text).unwrap();
        let eur = config.symbol("EURUSD");
        assert_eq!(eur.grid.max_legs, 6);
        assert_eq!(eur.grid.step_points, 2.5);
        assert!(eur.grid.hedging);
        assert_eq!(config.defaults.grid.max_legs, 4);
    }

    #[test]
    fn test_oversized_grid_rejected() {
        let text = "[defaults.grid]\nmax_legs = 200\n";
        assert!(matches!(EngineConfig::from_toml(text), Err(ConfigError::Invalid(_))));
        let text = "[symbols.XAUUSD.grid]\nmax_legs = 200\n";
        assert!(matches!(EngineConfig::from_toml(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let text = r#"
[defaults.range]
timezone = "Mars/Olympus"
"#;
        assert!(EngineConfig::from_toml(text).is_err());
    }

    #[tokio::test]
    async fn test_reload_keeps_old_config_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();
        let store = ConfigStore::open(file.path()).unwrap();
        assert_eq!(store.symbol("XAUUSD").await.risk.contract_size, dec!(100));

        std::fs::write(file.path(), "[symbols.XAUUSD.risk]\ncontract_size = 50\n").unwrap();
        store.reload().await.unwrap();
        assert_eq!(store.symbol("XAUUSD").await.risk.contract_size, dec!(50));

        std::fs::write(file.path(), "this is not toml = = =").unwrap();
        assert!(store.reload().await.is_err());
        assert_eq!(store.symbol("XAUUSD").await.risk.contract_size, dec!(50));
    }
}
