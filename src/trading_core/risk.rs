//! Risk sizing
//!
//! Stop distance from ATR scaled by the volatility regime, take-profit from a
//! reward:risk ratio, and position size from account risk. All money and
//! volume values are `Decimal`.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bars::Bar;
use super::indicators;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskError {
    #[error("stop distance is zero")]
    ZeroStopDistance,
    #[error("contract size must be positive, got {0}")]
    InvalidContractSize(Decimal),
    #[error("account balance must be positive, got {0}")]
    NonPositiveBalance(Decimal),
    #[error("not enough bars for ATR({period}): have {have}")]
    InsufficientData { period: usize, have: usize },
    #[error("invalid volume constraints: {0}")]
    InvalidVolume(String),
    #[error("value {0} cannot be represented as a decimal")]
    NotRepresentable(f64),
}

/// Convert a finite price quantity into a `Decimal`
pub fn to_decimal(value: f64) -> Result<Decimal, RiskError> {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(8))
        .ok_or(RiskError::NotRepresentable(value))
}

/// Broker volume limits for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConstraints {
    pub min: Decimal,
    pub max: Decimal,
    pub step: Decimal,
}

impl Default for VolumeConstraints {
    fn default() -> Self {
        Self {
            min: dec!(0.01),
            max: dec!(100),
            step: dec!(0.01),
        }
    }
}

impl VolumeConstraints {
    /// Min and max must be positive multiples of a positive step
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.step <= Decimal::ZERO {
            return Err(RiskError::InvalidVolume(format!("step {} must be positive", self.step)));
        }
        if self.min <= Decimal::ZERO || self.max < self.min {
            return Err(RiskError::InvalidVolume(format!(
                "range {}..{} is empty or non-positive",
                self.min, self.max
            )));
        }
        if !(self.min % self.step).is_zero() || !(self.max % self.step).is_zero() {
            return Err(RiskError::InvalidVolume(format!(
                "min {} and max {} must be multiples of step {}",
                self.min, self.max, self.step
            )));
        }
        Ok(())
    }

    /// Floor to the step, then clamp into [min, max]
    pub fn normalize(&self, raw: Decimal) -> Decimal {
        let stepped = raw
            .checked_div(self.step)
            .and_then(|q| q.floor().checked_mul(self.step))
            .unwrap_or(self.max);
        stepped.max(self.min).min(self.max).normalize()
    }
}

/// Risk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub atr_period: usize,
    /// ATR values ranked to find the volatility percentile
    pub volatility_lookback: usize,
    pub min_sl_multiplier: f64,
    pub max_sl_multiplier: f64,
    pub base_reward_risk: Decimal,
    /// Spread/ATR above this raises reward:risk
    pub spread_atr_threshold: f64,
    pub spread_rr_bump: Decimal,
    /// Volatility percentile above this raises reward:risk
    pub high_volatility_percentile: f64,
    pub volatility_rr_bump: Decimal,
    /// Percent of balance risked per entry
    pub risk_percent: Decimal,
    /// Account currency per point per lot
    pub contract_size: Decimal,
    pub volume: VolumeConstraints,
    pub basket_tp_floor: Decimal,
    pub basket_tp_atr_multiple: Decimal,
    pub basket_mfe_fraction: Decimal,
    pub basket_tp_min: Decimal,
    pub basket_tp_max: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            volatility_lookback: 100,
            min_sl_multiplier: 1.0,
            max_sl_multiplier: 2.5,
            base_reward_risk: dec!(1.5),
            spread_atr_threshold: 0.1,
            spread_rr_bump: dec!(0.5),
            high_volatility_percentile: 0.8,
            volatility_rr_bump: dec!(0.5),
            risk_percent: dec!(1.0),
            contract_size: dec!(1),
            volume: VolumeConstraints::default(),
            basket_tp_floor: dec!(10),
            basket_tp_atr_multiple: dec!(0.5),
            basket_mfe_fraction: dec!(0.8),
            basket_tp_min: dec!(5),
            basket_tp_max: dec!(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub sl_distance: Decimal,
    pub tp_distance: Decimal,
    pub position_size: Decimal,
    pub reward_risk: Decimal,
    pub atr: f64,
    pub volatility_percentile: f64,
    pub sl_multiplier: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RiskSizer {
    config: RiskConfig,
}

impl RiskSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Full profile for an entry on the last bar
    pub fn assess(&self, bars: &[Bar], balance: Decimal, spread: f64) -> Result<RiskProfile, RiskError> {
        let cfg = &self.config;
        let atr = indicators::atr(bars, cfg.atr_period).ok_or(RiskError::InsufficientData {
            period: cfg.atr_period,
            have: bars.len(),
        })?;
        if atr <= 0.0 {
            return Err(RiskError::ZeroStopDistance);
        }

        let series = indicators::atr_series(bars, cfg.atr_period);
        let window = &series[series.len().saturating_sub(cfg.volatility_lookback)..];
        let percentile = indicators::percentile_rank(window, atr);
        let sl_multiplier =
            cfg.min_sl_multiplier + (cfg.max_sl_multiplier - cfg.min_sl_multiplier) * percentile;

        let mut reward_risk = cfg.base_reward_risk;
        if spread / atr > cfg.spread_atr_threshold {
            reward_risk += cfg.spread_rr_bump;
        }
        if percentile > cfg.high_volatility_percentile {
            reward_risk += cfg.volatility_rr_bump;
        }

        let sl_distance = to_decimal(atr * sl_multiplier)?;
        let tp_distance = sl_distance * reward_risk;
        let position_size = self.position_size(balance, sl_distance)?;

        Ok(RiskProfile {
            sl_distance,
            tp_distance,
            position_size,
            reward_risk,
            atr,
            volatility_percentile: percentile,
            sl_multiplier,
        })
    }

    /// `(balance × risk%) / (stop × contract size)`, stepped and clamped
    pub fn position_size(&self, balance: Decimal, sl_distance: Decimal) -> Result<Decimal, RiskError> {
        let cfg = &self.config;
        if sl_distance <= Decimal::ZERO {
            return Err(RiskError::ZeroStopDistance);
        }
        if cfg.contract_size <= Decimal::ZERO {
            return Err(RiskError::InvalidContractSize(cfg.contract_size));
        }
        if balance <= Decimal::ZERO {
            return Err(RiskError::NonPositiveBalance(balance));
        }
        cfg.volume.validate()?;

        let risk_amount = balance * cfg.risk_percent / dec!(100);
        let raw = risk_amount / (sl_distance * cfg.contract_size);
        Ok(cfg.volume.normalize(raw))
    }

    /// Synthetic basket take-profit in account currency
    pub fn basket_target(
        &self,
        total_volume: Decimal,
        atr: f64,
        avg_favourable_excursion: Option<Decimal>,
    ) -> Result<Decimal, RiskError> {
        let cfg = &self.config;
        let per_lot =
            total_volume * cfg.contract_size * to_decimal(atr)? * cfg.basket_tp_atr_multiple;
        let from_history = avg_favourable_excursion
            .map(|mfe| mfe * cfg.basket_mfe_fraction)
            .unwrap_or(Decimal::ZERO);

        let target = cfg.basket_tp_floor.max(per_lot).max(from_history);
        Ok(target.max(cfg.basket_tp_min).min(cfg.basket_tp_max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::test_support::uptrend_with_retest;

    #[test]
    fn test_zero_stop_distance_is_error() {
        let sizer = RiskSizer::default();
        assert_eq!(
            sizer.position_size(dec!(10000), Decimal::ZERO),
            Err(RiskError::ZeroStopDistance)
        );
    }

    #[test]
    fn test_position_size_formula() {
        let sizer = RiskSizer::default();
        // 1% of 10_000 = 100; 100 / (2.5 × 1) = 40
        assert_eq!(sizer.position_size(dec!(10000), dec!(2.5)).unwrap(), dec!(40));
        // 100 / 3 = 33.333.. floors to 33.33
        assert_eq!(sizer.position_size(dec!(10000), dec!(3)).unwrap(), dec!(33.33));
    }

    #[test]
    fn test_size_always_stepped_and_clamped() {
        let sizer = RiskSizer::new(RiskConfig {
            volume: VolumeConstraints {
                min: dec!(0.1),
                max: dec!(5),
                step: dec!(0.1),
            },
            ..Default::default()
        });
        let balances = [dec!(50), dec!(1000), dec!(12345.67), dec!(1000000)];
        let stops = [dec!(0.0001), dec!(0.37), dec!(2), dec!(150)];
        for balance in balances {
            for stop in stops {
                let size = sizer.position_size(balance, stop).unwrap();
                assert!(size >= dec!(0.1) && size <= dec!(5), "{} out of range", size);
                assert!((size % dec!(0.1)).is_zero(), "{} not a step multiple", size);
            }
        }
    }

    #[test]
    fn test_normalize_huge_volume_clamps_to_max() {
        let volume = VolumeConstraints::default();
        assert_eq!(volume.normalize(Decimal::MAX), volume.max);
    }

    #[test]
    fn test_invalid_inputs() {
        let sizer = RiskSizer::new(RiskConfig {
            contract_size: Decimal::ZERO,
            ..Default::default()
        });
        assert!(matches!(
            sizer.position_size(dec!(1000), dec!(1)),
            Err(RiskError::InvalidContractSize(_))
        ));
        assert!(matches!(
            RiskSizer::default().position_size(dec!(-5), dec!(1)),
            Err(RiskError::NonPositiveBalance(_))
        ));
    }

    #[test]
    fn test_volume_constraints_validation() {
        let bad = VolumeConstraints {
            min: dec!(0.015),
            max: dec!(1),
            step: dec!(0.01),
        };
        assert!(bad.validate().is_err());
        assert!(VolumeConstraints::default().validate().is_ok());
    }

    #[test]
    fn test_assess_on_uptrend() {
        let bars = uptrend_with_retest();
        let profile = RiskSizer::default()
            .assess(&bars[..=55], dec!(10000), 0.0)
            .unwrap();
        assert!(profile.sl_distance > Decimal::ZERO);
        assert!(profile.sl_multiplier >= 1.0 && profile.sl_multiplier <= 2.5);
        assert!(profile.tp_distance >= profile.sl_distance * dec!(1.5));
        assert!(profile.position_size >= dec!(0.01));
    }

    #[test]
    fn test_spread_raises_reward_risk() {
        let bars = uptrend_with_retest();
        let sizer = RiskSizer::default();
        let tight = sizer.assess(&bars[..=55], dec!(10000), 0.0).unwrap();
        let wide = sizer.assess(&bars[..=55], dec!(10000), 100.0).unwrap();
        assert_eq!(wide.reward_risk - tight.reward_risk, dec!(0.5));
    }

    #[test]
    fn test_assess_needs_history() {
        let bars = uptrend_with_retest();
        assert!(matches!(
            RiskSizer::default().assess(&bars[..10], dec!(10000), 0.0),
            Err(RiskError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_basket_target_clamps() {
        let sizer = RiskSizer::default();
        // floor wins with tiny volume
        assert_eq!(sizer.basket_target(dec!(0.01), 1.0, None).unwrap(), dec!(10));
        // history dominates: 0.8 × 200 = 160
        assert_eq!(sizer.basket_target(dec!(1), 2.0, Some(dec!(200))).unwrap(), dec!(160));
        // capped at max
        assert_eq!(sizer.basket_target(dec!(100), 100.0, None).unwrap(), dec!(1000));
    }
}
