//! Per-symbol state arena
//!
//! Each symbol's trader sits behind its own async mutex. Holding the guard is
//! what makes a task the single writer for that symbol's grid and orders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::trader::SymbolTrader;

pub type TraderHandle = Arc<AsyncMutex<SymbolTrader>>;

#[derive(Default)]
pub struct SymbolBook {
    traders: Mutex<HashMap<String, TraderHandle>>,
}

impl SymbolBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `symbol`, creating the trader on first use
    pub fn handle(&self, symbol: &str, make: impl FnOnce() -> SymbolTrader) -> TraderHandle {
        let mut traders = match self.traders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        traders
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(make())))
            .clone()
    }

    pub fn get(&self, symbol: &str) -> Option<TraderHandle> {
        self.traders.lock().ok()?.get(symbol).cloned()
    }

    /// Exclusive access to one symbol's trader
    pub async fn lock(
        &self,
        symbol: &str,
        make: impl FnOnce() -> SymbolTrader,
    ) -> OwnedMutexGuard<SymbolTrader> {
        self.handle(symbol, make).lock_owned().await
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .traders
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
