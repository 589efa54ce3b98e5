use serde::{Deserialize, Serialize};

/// Direction of a strategy vote or fused decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
    Neutral,
}

impl Direction {
    /// Tradeable side, if any
    pub fn side(&self) -> Option<Side> {
        match self {
            Direction::Buy => Some(Side::Buy),
            Direction::Sell => Some(Side::Sell),
            Direction::Neutral => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
            Direction::Neutral => Direction::Neutral,
        }
    }

    /// +1 for buy, -1 for sell, 0 for neutral
    pub fn sign(&self) -> i8 {
        match self {
            Direction::Buy => 1,
            Direction::Sell => -1,
            Direction::Neutral => 0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
            Direction::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Side of a grid leg or basket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Price-move multiplier: long profits when price rises
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Side::Buy => Direction::Buy,
            Side::Sell => Direction::Sell,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Which strategy produced a signal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum SignalSource {
    Structure,
    RangeBreakout,
    Advisory(String),
}

impl SignalSource {
    /// Stable key used for fusion weights and the journal
    pub fn name(&self) -> String {
        match self {
            SignalSource::Structure => "structure".to_string(),
            SignalSource::RangeBreakout => "range_breakout".to_string(),
            SignalSource::Advisory(name) => format!("advisory:{}", name),
        }
    }
}

/// One strategy's opinion for one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub source: SignalSource,
    pub direction: Direction,
    /// 0..=100
    pub strength: f64,
    pub reason: String,
}

impl Signal {
    pub fn new(source: SignalSource, direction: Direction, strength: f64, reason: impl Into<String>) -> Self {
        Self {
            source,
            direction,
            strength: strength.clamp(0.0, 100.0),
            reason: reason.into(),
        }
    }

    pub fn neutral(source: SignalSource, reason: impl Into<String>) -> Self {
        Self::new(source, Direction::Neutral, 0.0, reason)
    }

    pub fn is_neutral(&self) -> bool {
        self.direction == Direction::Neutral
    }

    /// Strength as a 0..=1 confidence
    pub fn confidence(&self) -> f64 {
        (self.strength / 100.0).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_strength_clamped() {
        let s = Signal::new(SignalSource::Structure, Direction::Buy, 140.0, "too strong");
        assert_eq!(s.strength, 100.0);
        assert_eq!(s.confidence(), 1.0);
    }

    #[test]
    fn test_source_names() {
        assert_eq!(SignalSource::Structure.name(), "structure");
        assert_eq!(SignalSource::Advisory("llm".into()).name(), "advisory:llm");
    }
}
