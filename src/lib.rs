// Library crate - decision core plus the services around it

pub mod advisory;
pub mod api;
pub mod config;
pub mod execution;
pub mod persistence;
pub mod streams;
pub mod trading;
pub mod trading_core;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigStore, EngineConfig, SymbolConfig};
pub use trading::DecisionLoop;
pub use types::*;
