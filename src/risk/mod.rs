//! Risk steering - Operator-controlled price steering
//!
//! Implements:
//! - The per-instrument `RiskTarget` directive
//! - Randomised, step-bounded walking of the published price toward a target
//! - Reverting back to the market price
//! - `RiskDesk`, the operator handle the local quote source reads from

use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::bcmath::{self, DecimalResult};
use crate::types::{Instrument, Kline, RiskMode};

/// Fractional digits used for published prices
pub const PRICE_PRECISION: u32 = 4;

/// 10^PRICE_PRECISION, the number of price units per whole unit
const UNIT_SCALE: &str = "10000";
const UNIT_SCALE_U64: u64 = 10_000;

/// Operator directive for one instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskTarget {
    /// Target close price
    pub target: String,
    pub mode: RiskMode,
    /// Number of ticks the transition should take
    pub total_steps: u32,
    /// Ticks already taken
    pub step: u32,
}

impl RiskTarget {
    pub fn new(target: impl Into<String>, mode: RiskMode, total_steps: u32) -> Self {
        Self {
            target: target.into(),
            mode,
            total_steps,
            step: 0,
        }
    }

    /// Read a directive back out of a local-source sample
    pub fn from_sample(sample: &Kline) -> Self {
        Self {
            target: sample.close.clone(),
            mode: sample.risk_mode,
            total_steps: sample.total_steps,
            step: sample.step,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.step >= self.total_steps
    }
}

/// Result of one steering decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteeredPrice {
    pub price: String,
    pub mode: RiskMode,
    pub total_steps: u32,
    pub step: u32,
}

impl SteeredPrice {
    /// Market price with the risk fields zeroed
    pub fn market(price: &str) -> Self {
        Self {
            price: price.to_string(),
            mode: RiskMode::None,
            total_steps: 0,
            step: 0,
        }
    }
}

/// Decide the published price for this tick.
///
/// `current` is the previously published close. Without it, or without a
/// directive, the market price is used unchanged.
pub fn steer<R: Rng + ?Sized>(
    rng: &mut R,
    directive: Option<&RiskTarget>,
    current: Option<&str>,
    market: &str,
) -> DecimalResult<SteeredPrice> {
    let (directive, current) = match (directive, current) {
        (Some(d), Some(c)) => (d, c),
        _ => return Ok(SteeredPrice::market(market)),
    };

    let price = match directive.mode {
        RiskMode::None => market.to_string(),
        RiskMode::Steer => control_price(
            rng,
            current,
            &directive.target,
            directive.total_steps,
            directive.step,
        )?,
        RiskMode::Revert => {
            control_price(rng, current, market, directive.total_steps, directive.step)?
        }
    };

    Ok(SteeredPrice {
        price,
        mode: directive.mode,
        total_steps: directive.total_steps,
        step: directive.step,
    })
}

/// Move `current` one randomised step toward `target`.
///
/// The increment is k·u·2 / (10^8 · left) where k is uniform over the
/// distance in price units and u is uniform over [0, 10^4). The final step,
/// a sub-unit distance, or an overshoot all land exactly on the target.
pub fn control_price<R: Rng + ?Sized>(
    rng: &mut R,
    current: &str,
    target: &str,
    total_steps: u32,
    step: u32,
) -> DecimalResult<String> {
    if step >= total_steps {
        return bcmath::add(target, "0", PRICE_PRECISION);
    }

    let direction = bcmath::cmp(current, target)?;
    if direction == Ordering::Equal {
        return bcmath::add(current, "0", PRICE_PRECISION);
    }

    let distance = bcmath::abs_sub(target, current, PRICE_PRECISION)?;
    let units = bcmath::parse(&bcmath::mul(&distance, UNIT_SCALE, 0)?)?;
    let units = rust_decimal::prelude::ToPrimitive::to_u64(&units).unwrap_or(u64::MAX);
    if units == 0 {
        return bcmath::add(target, "0", PRICE_PRECISION);
    }

    let k = rng.gen_range(0..units);
    let u = rng.gen_range(0..UNIT_SCALE_U64);
    let left = (total_steps - step).to_string();

    let numerator = bcmath::mul(
        &bcmath::mul(&k.to_string(), &u.to_string(), 0)?,
        "2",
        0,
    )?;
    let denominator = bcmath::mul(&bcmath::mul(UNIT_SCALE, UNIT_SCALE, 0)?, &left, 0)?;
    let increment = bcmath::div(&numerator, &denominator, PRICE_PRECISION)?;

    let candidate = if direction == Ordering::Less {
        let next = bcmath::add(current, &increment, PRICE_PRECISION)?;
        if bcmath::cmp(&next, target)? == Ordering::Greater {
            return bcmath::add(target, "0", PRICE_PRECISION);
        }
        next
    } else {
        let next = bcmath::sub(current, &increment, PRICE_PRECISION)?;
        if bcmath::cmp(&next, target)? == Ordering::Less {
            return bcmath::add(target, "0", PRICE_PRECISION);
        }
        next
    };

    Ok(candidate)
}

/// Operator handle for per-instrument risk directives.
///
/// Cloned into the local quote source, which reads the active directive
/// once per tick through `next_directive`.
#[derive(Debug, Clone, Default)]
pub struct RiskDesk {
    targets: Arc<RwLock<HashMap<Instrument, RiskTarget>>>,
}

impl RiskDesk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a directive, replacing any active one. The target must be a
    /// valid decimal.
    pub fn set_target(
        &self,
        instrument: Instrument,
        target: &str,
        mode: RiskMode,
        total_steps: u32,
    ) -> DecimalResult<()> {
        let target = bcmath::add(target, "0", PRICE_PRECISION)?;
        tracing::info!(
            instrument = %instrument,
            target = %target,
            mode = %mode,
            total_steps,
            "Risk directive set"
        );
        if let Ok(mut targets) = self.targets.write() {
            targets.insert(instrument, RiskTarget::new(target, mode, total_steps));
        }
        Ok(())
    }

    pub fn clear(&self, instrument: &Instrument) -> Option<RiskTarget> {
        let removed = self.targets.write().ok()?.remove(instrument);
        if removed.is_some() {
            tracing::info!(instrument = %instrument, "Risk directive cleared");
        }
        removed
    }

    pub fn get(&self, instrument: &Instrument) -> Option<RiskTarget> {
        self.targets.read().ok()?.get(instrument).cloned()
    }

    pub fn all(&self) -> Vec<(Instrument, RiskTarget)> {
        self.targets
            .read()
            .map(|t| t.iter().map(|(i, r)| (i.clone(), r.clone())).collect())
            .unwrap_or_default()
    }

    /// Advance the directive by one tick and return the snapshot to publish.
    /// A finished `Revert` is removed once it has been handed out.
    pub fn next_directive(&self, instrument: &Instrument) -> Option<RiskTarget> {
        let mut targets = self.targets.write().ok()?;
        let entry = targets.get_mut(instrument)?;
        if entry.step < entry.total_steps {
            entry.step += 1;
        }
        let snapshot = entry.clone();
        if snapshot.mode == RiskMode::Revert && snapshot.is_complete() {
            targets.remove(instrument);
            tracing::info!(instrument = %instrument, "Revert complete, directive released");
        }
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_final_step_snaps_to_target() {
        let price = control_price(&mut rng(), "100", "105.5", 10, 10).unwrap();
        assert_eq!(price, "105.5000");
    }

    #[test]
    fn test_equal_price_is_kept() {
        let price = control_price(&mut rng(), "105.5", "105.50", 10, 3).unwrap();
        assert_eq!(price, "105.5000");
    }

    #[test]
    fn test_sub_unit_distance_snaps() {
        let price = control_price(&mut rng(), "100.00001", "100.00002", 10, 1).unwrap();
        assert_eq!(price, "100.0000");
    }

    #[test]
    fn test_steering_moves_toward_target_without_overshoot() {
        let mut rng = rng();
        let mut current = "100.0000".to_string();
        for step in 1..=20u32 {
            let next = control_price(&mut rng, &current, "110", 20, step).unwrap();
            assert!(bcmath::cmp(&next, &current).unwrap() != Ordering::Less);
            assert!(bcmath::cmp(&next, "110").unwrap() != Ordering::Greater);
            current = next;
        }
        assert_eq!(current, "110.0000");
    }

    #[test]
    fn test_steering_downward() {
        let mut rng = rng();
        let mut current = "50.0000".to_string();
        for step in 1..=5u32 {
            let next = control_price(&mut rng, &current, "45", 5, step).unwrap();
            assert!(bcmath::cmp(&next, &current).unwrap() != Ordering::Greater);
            assert!(bcmath::cmp(&next, "45").unwrap() != Ordering::Less);
            current = next;
        }
        assert_eq!(current, "45.0000");
    }

    #[test]
    fn test_steer_without_previous_point_uses_market() {
        let directive = RiskTarget::new("120", RiskMode::Steer, 10);
        let out = steer(&mut rng(), Some(&directive), None, "100.1667").unwrap();
        assert_eq!(out, SteeredPrice::market("100.1667"));

        let out = steer(&mut rng(), None, Some("99"), "100.1667").unwrap();
        assert_eq!(out.mode, RiskMode::None);
        assert_eq!(out.price, "100.1667");
    }

    #[test]
    fn test_revert_targets_market_price() {
        let mut directive = RiskTarget::new("120", RiskMode::Revert, 4);
        directive.step = 4;
        let out = steer(&mut rng(), Some(&directive), Some("118"), "100.5").unwrap();
        assert_eq!(out.price, "100.5000");
        assert_eq!(out.mode, RiskMode::Revert);
        assert_eq!(out.step, 4);
    }

    #[test]
    fn test_revert_steps_toward_market_not_target() {
        let mut rng = rng();
        let mut directive = RiskTarget::new("120", RiskMode::Revert, 4);
        let mut current = "118.0000".to_string();
        for step in 1..4u32 {
            directive.step = step;
            let out = steer(&mut rng, Some(&directive), Some(&current), "100.5").unwrap();
            assert_eq!(out.mode, RiskMode::Revert);
            assert_eq!(out.step, step);
            assert!(bcmath::cmp(&out.price, &current).unwrap() != Ordering::Greater);
            assert!(bcmath::cmp(&out.price, "100.5").unwrap() != Ordering::Less);
            current = out.price;
        }

        directive.step = 4;
        let out = steer(&mut rng, Some(&directive), Some(&current), "100.5").unwrap();
        assert_eq!(out.price, "100.5000");
    }

    #[test]
    fn test_desk_advances_and_releases_revert() {
        let desk = RiskDesk::new();
        let btc = Instrument::new("BTC/USDT");
        desk.set_target(btc.clone(), "65000", RiskMode::Revert, 2).unwrap();

        assert_eq!(desk.next_directive(&btc).unwrap().step, 1);
        let last = desk.next_directive(&btc).unwrap();
        assert_eq!(last.step, 2);
        assert_eq!(last.target, "65000.0000");
        assert!(desk.get(&btc).is_none());
        assert!(desk.next_directive(&btc).is_none());
    }

    #[test]
    fn test_desk_holds_completed_steer() {
        let desk = RiskDesk::new();
        let eth = Instrument::new("ETH/USDT");
        desk.set_target(eth.clone(), "3000", RiskMode::Steer, 1).unwrap();
        desk.next_directive(&eth);
        let held = desk.next_directive(&eth).unwrap();
        assert_eq!(held.step, 1);
        assert!(held.is_complete());
        assert!(desk.clear(&eth).is_some());
        assert!(desk.set_target(eth, "abc", RiskMode::Steer, 1).is_err());
    }
}
