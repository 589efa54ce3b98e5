//! Trading Core - decision logic shared by the live loop and the request server
//!
//! This module contains the strategy components:
//! - Bars and rolling indicators
//! - Market structure analysis (order blocks, gaps, structure breaks)
//! - Opening range breakout detection
//! - Quality gate, adaptive fusion, risk sizing
//! - Martingale grid and basket management
//! - Per-symbol trader and state arena

pub mod bars;
pub mod cache;
pub mod fusion;
pub mod grid;
pub mod indicators;
pub mod orb;
pub mod quality;
pub mod risk;
pub mod smoother;
pub mod structure;
pub mod symbol_state;
pub mod trader;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use bars::Bar;
pub use cache::SignalCache;
pub use fusion::{FusedDecision, FusionConfig, FusionOptimizer, Strategy};
pub use grid::{Basket, GridConfig, GridError, GridManager, GridState, TradeAction};
pub use orb::{RangeBreakoutDetector, RangeConfig, RangePhase};
pub use quality::{QualityConfig, QualityGate, QualityScore};
pub use risk::{RiskConfig, RiskError, RiskProfile, RiskSizer, VolumeConstraints};
pub use structure::{StructureAnalysis, StructureAnalyzer, StructureConfig};
pub use symbol_state::SymbolBook;
pub use trader::{CycleOutcome, SymbolTrader};
