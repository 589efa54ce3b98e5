//! Advisory service request/response types

use serde::{Deserialize, Serialize};

use crate::trading_core::bars::Bar;
use crate::types::{Direction, Signal, SignalSource};

/// Market context sent to the advisory service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpinionRequest {
    pub symbol: String,
    pub bars: Vec<Bar>,
    /// Latest strategy votes, for context
    #[serde(default)]
    pub signals: Vec<Signal>,
}

/// One advisory opinion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryOpinion {
    pub direction: Direction,
    #[serde(default)]
    pub entry_hint: Option<f64>,
    #[serde(default)]
    pub exit_hint: Option<f64>,
    #[serde(default)]
    pub rationale: String,
    /// 0..=1
    pub confidence: f64,
}

impl AdvisoryOpinion {
    /// Convert to a fusion vote for the strategy called `name`
    pub fn into_signal(self, name: &str) -> Signal {
        let mut reason = self.rationale;
        if let Some(entry) = self.entry_hint {
            reason.push_str(&format!(" [entry {:.5}]", entry));
        }
        if let Some(exit) = self.exit_hint {
            reason.push_str(&format!(" [exit {:.5}]", exit));
        }
        Signal::new(
            SignalSource::Advisory(name.to_string()),
            self.direction,
            self.confidence.clamp(0.0, 1.0) * 100.0,
            reason.trim().to_string(),
        )
    }
}
