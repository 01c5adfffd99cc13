//! Flat-tier USD → points mapping.
//!
//! Tiers come from a JSON file: an array of contiguous `[min_usd, max_usd)`
//! ranges where the last range has `max_usd: null`. The whole transaction
//! amount uses the single tier its USD value lands in. A zero-multiplier
//! first tier swallows dust.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
pub struct Tier {
    pub min_usd: Decimal,
    /// `None` only on the final, open-ended tier.
    pub max_usd: Option<Decimal>,
    pub multiplier: Decimal,
}

#[derive(Debug, thiserror::Error)]
pub enum TierError {
    #[error("tier file {0} is not readable: {1}")]
    Unreadable(String, std::io::Error),
    #[error("tier file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tier config needs at least two tiers")]
    TooFew,
    #[error("tier {index}: multiplier must be >= 0")]
    NegativeMultiplier { index: usize },
    #[error("tier config needs a zero-multiplier tier for dust")]
    NoDustTier,
    #[error("tier {index}: ranges must be contiguous ({prev_max} != {min})")]
    Gap {
        index: usize,
        prev_max: Decimal,
        min: Decimal,
    },
    #[error("only the last tier may have max_usd = null")]
    EarlyOpenEnd,
    #[error("the last tier must have max_usd = null")]
    ClosedEnd,
    #[error("the first tier must start at 0")]
    NonZeroStart,
}

/// A validated tier schedule.
#[derive(Clone, Debug)]
pub struct TierSchedule {
    tiers: Vec<Tier>,
}

impl TierSchedule {
    pub fn load(path: &Path) -> Result<Self, TierError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TierError::Unreadable(path.display().to_string(), e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, TierError> {
        let tiers: Vec<Tier> = serde_json::from_str(raw)?;
        Self::validate(tiers)
    }

    fn validate(tiers: Vec<Tier>) -> Result<Self, TierError> {
        if tiers.len() < 2 {
            return Err(TierError::TooFew);
        }
        if tiers[0].min_usd != Decimal::ZERO {
            return Err(TierError::NonZeroStart);
        }
        if !tiers.iter().any(|t| t.multiplier == Decimal::ZERO) {
            return Err(TierError::NoDustTier);
        }
        let last = tiers.len() - 1;
        for (index, tier) in tiers.iter().enumerate() {
            if tier.multiplier < Decimal::ZERO {
                return Err(TierError::NegativeMultiplier { index });
            }
            match (&tier.max_usd, index == last) {
                (None, false) => return Err(TierError::EarlyOpenEnd),
                (Some(_), true) => return Err(TierError::ClosedEnd),
                _ => {}
            }
            if index > 0 {
                let prev_max = tiers[index - 1].max_usd.expect("checked above");
                if prev_max != tier.min_usd {
                    return Err(TierError::Gap {
                        index,
                        prev_max,
                        min: tier.min_usd,
                    });
                }
            }
        }
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    fn multiplier_for(&self, usd: Decimal) -> Decimal {
        for tier in &self.tiers {
            let above = usd >= tier.min_usd;
            let below = tier.max_usd.map(|max| usd < max).unwrap_or(true);
            if above && below {
                return tier.multiplier;
            }
        }
        Decimal::ZERO
    }

    /// `round(floor(usd × 100) × multiplier)`.
    pub fn points_for(&self, usd: Decimal) -> i64 {
        if usd <= Decimal::ZERO {
            return 0;
        }
        let cents = (usd * Decimal::from(100)).floor();
        let points = (cents * self.multiplier_for(usd)).round();
        points.to_i64().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const SCHEDULE: &str = r#"[
        {"min_usd": "0",  "max_usd": "1",  "multiplier": "0"},
        {"min_usd": "1",  "max_usd": "10", "multiplier": "1.0"},
        {"min_usd": "10", "max_usd": "25", "multiplier": "1.1"},
        {"min_usd": "25", "max_usd": null, "multiplier": "1.2"}
    ]"#;

    #[test]
    fn schedule_parses_and_maps_points() {
        let schedule = TierSchedule::parse(SCHEDULE).unwrap();
        // $5 in the 1.0 tier: 500 cents * 1.0.
        assert_eq!(schedule.points_for(Decimal::from(5)), 500);
        // $50 in the 1.2 tier: 5000 cents * 1.2.
        assert_eq!(schedule.points_for(Decimal::from(50)), 6_000);
        // $20 in the 1.1 tier.
        assert_eq!(schedule.points_for(Decimal::from(20)), 2_200);
        // Dust maps to zero.
        assert_eq!(schedule.points_for(Decimal::from_str("0.99").unwrap()), 0);
        assert_eq!(schedule.points_for(Decimal::ZERO), 0);
    }

    #[test]
    fn fractional_cents_floor_before_multiplying() {
        let schedule = TierSchedule::parse(SCHEDULE).unwrap();
        // $5.679 -> 567 cents -> 567 points in the 1.0 tier.
        assert_eq!(schedule.points_for(Decimal::from_str("5.679").unwrap()), 567);
    }

    #[test]
    fn boundaries_are_half_open() {
        let schedule = TierSchedule::parse(SCHEDULE).unwrap();
        assert_eq!(schedule.points_for(Decimal::from(1)), 100);
        assert_eq!(schedule.points_for(Decimal::from(10)), 1_100);
        assert_eq!(schedule.points_for(Decimal::from(25)), 3_000);
    }

    #[test]
    fn validation_rejects_gaps() {
        let gapped = r#"[
            {"min_usd": "0", "max_usd": "1", "multiplier": "0"},
            {"min_usd": "2", "max_usd": null, "multiplier": "1"}
        ]"#;
        assert!(matches!(
            TierSchedule::parse(gapped),
            Err(TierError::Gap { .. })
        ));
    }

    #[test]
    fn validation_rejects_missing_dust_tier() {
        let no_dust = r#"[
            {"min_usd": "0", "max_usd": "1", "multiplier": "0.5"},
            {"min_usd": "1", "max_usd": null, "multiplier": "1"}
        ]"#;
        assert!(matches!(
            TierSchedule::parse(no_dust),
            Err(TierError::NoDustTier)
        ));
    }

    #[test]
    fn validation_rejects_closed_final_tier() {
        let closed = r#"[
            {"min_usd": "0", "max_usd": "1", "multiplier": "0"},
            {"min_usd": "1", "max_usd": "2", "multiplier": "1"}
        ]"#;
        assert!(matches!(
            TierSchedule::parse(closed),
            Err(TierError::ClosedEnd)
        ));
    }

    #[test]
    fn validation_rejects_single_tier() {
        let single = r#"[{"min_usd": "0", "max_usd": null, "multiplier": "0"}]"#;
        assert!(matches!(TierSchedule::parse(single), Err(TierError::TooFew)));
    }
}
