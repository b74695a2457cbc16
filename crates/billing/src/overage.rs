//! Overage pricing
//!
//! Time beyond a tier's daily allowance is billed in fixed-size blocks. All
//! amounts are in cents; one 30-minute block costs 2500 cents by default.
//!
//! When usage is evaluated more than once for the same day (before and after
//! a session, or across recomputes) callers must charge the *difference*
//! `overage(before + added) - overage(before)`. See [`OverageRates::incremental`].

use serde::{Deserialize, Serialize};

use clubhouse_shared::UNLIMITED_MINUTES_SENTINEL;

/// Default block size for overage billing
pub const OVERAGE_BLOCK_MINUTES: u32 = 30;
/// Default price of one overage block ($25)
pub const OVERAGE_RATE_PER_BLOCK_CENTS: i64 = 2500;
/// Flat fee for a guest who doesn't use a guest pass ($25)
pub const GUEST_FEE_CENTS: i64 = 2500;

/// Result of an overage calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverageFee {
    pub has_overage: bool,
    pub overage_minutes: u32,
    pub overage_fee_cents: i64,
}

impl OverageFee {
    pub const NONE: OverageFee = OverageFee {
        has_overage: false,
        overage_minutes: 0,
        overage_fee_cents: 0,
    };
}

/// Block size and prices used by the fee engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverageRates {
    pub block_minutes: u32,
    pub rate_per_block_cents: i64,
    pub guest_fee_cents: i64,
}

impl Default for OverageRates {
    fn default() -> Self {
        Self {
            block_minutes: OVERAGE_BLOCK_MINUTES,
            rate_per_block_cents: OVERAGE_RATE_PER_BLOCK_CENTS,
            guest_fee_cents: GUEST_FEE_CENTS,
        }
    }
}

impl OverageRates {
    /// Load rates from environment or use defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            block_minutes: std::env::var("OVERAGE_BLOCK_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &u32| *v > 0)
                .unwrap_or(defaults.block_minutes),
            rate_per_block_cents: std::env::var("OVERAGE_RATE_PER_BLOCK_CENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rate_per_block_cents),
            guest_fee_cents: std::env::var("GUEST_FEE_CENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.guest_fee_cents),
        }
    }

    /// Overage for `minutes_used` against a daily allowance
    pub fn calculate(&self, minutes_used: u32, tier_allowance: u32) -> OverageFee {
        if tier_allowance >= UNLIMITED_MINUTES_SENTINEL || minutes_used <= tier_allowance {
            return OverageFee::NONE;
        }

        let overage_minutes = minutes_used - tier_allowance;
        // Round up to whole blocks
        let blocks = overage_minutes.div_ceil(self.block_minutes.max(1));

        OverageFee {
            has_overage: true,
            overage_minutes,
            overage_fee_cents: i64::from(blocks).saturating_mul(self.rate_per_block_cents),
        }
    }

    /// Overage attributable to `added` minutes on top of `already_used`
    ///
    /// Minutes and cents already charged by the `already_used` portion are
    /// subtracted out, so sequential recomputes never double-bill.
    pub fn incremental(&self, already_used: u32, added: u32, tier_allowance: u32) -> OverageFee {
        let before = self.calculate(already_used, tier_allowance);
        let after = self.calculate(already_used.saturating_add(added), tier_allowance);

        let overage_minutes = after.overage_minutes - before.overage_minutes;
        let overage_fee_cents = after.overage_fee_cents - before.overage_fee_cents;

        OverageFee {
            has_overage: overage_fee_cents > 0,
            overage_minutes,
            overage_fee_cents,
        }
    }
}

/// Overage at the default block size and rate
pub fn calculate_overage_fee(minutes_used: u32, tier_allowance: u32) -> OverageFee {
    OverageRates::default().calculate(minutes_used, tier_allowance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_allowance_is_free() {
        assert_eq!(calculate_overage_fee(60, 60), OverageFee::NONE);
        assert_eq!(calculate_overage_fee(0, 60), OverageFee::NONE);
    }

    #[test]
    fn test_unlimited_sentinel_is_free() {
        assert_eq!(calculate_overage_fee(10_000, 999), OverageFee::NONE);
        assert_eq!(calculate_overage_fee(10_000, 1_500), OverageFee::NONE);
    }

    #[test]
    fn test_partial_block_rounds_up() {
        let fee = calculate_overage_fee(61, 60);
        assert!(fee.has_overage);
        assert_eq!(fee.overage_minutes, 1);
        assert_eq!(fee.overage_fee_cents, 2500);

        let fee = calculate_overage_fee(91, 60);
        assert_eq!(fee.overage_minutes, 31);
        assert_eq!(fee.overage_fee_cents, 5000);
    }

    #[test]
    fn test_core_tier_ninety_minutes() {
        let fee = calculate_overage_fee(90, 60);
        assert_eq!(fee.overage_minutes, 30);
        assert_eq!(fee.overage_fee_cents, 2500);
    }

    #[test]
    fn test_zero_allowance_bills_everything() {
        let fee = calculate_overage_fee(45, 0);
        assert_eq!(fee.overage_minutes, 45);
        assert_eq!(fee.overage_fee_cents, 5000);
    }

    #[test]
    fn test_monotonic_in_minutes_used() {
        for allowance in [0u32, 30, 45, 60, 90, 120, 999] {
            let mut previous = 0i64;
            for minutes in 0..=400u32 {
                let fee = calculate_overage_fee(minutes, allowance).overage_fee_cents;
                assert!(
                    fee >= previous,
                    "fee decreased at minutes={minutes} allowance={allowance}"
                );
                previous = fee;
            }
        }
    }

    #[test]
    fn test_incremental_never_double_counts() {
        let rates = OverageRates::default();
        for allowance in [0u32, 30, 60, 90] {
            for before in (0..=240u32).step_by(7) {
                for added in (0..=180u32).step_by(11) {
                    let delta = rates.incremental(before, added, allowance);
                    let direct = rates.calculate(before + added, allowance).overage_fee_cents
                        - rates.calculate(before, allowance).overage_fee_cents;
                    assert_eq!(delta.overage_fee_cents, direct);

                    // Two sequential increments sum to the same total as one
                    let split = added / 2;
                    let first = rates.incremental(before, split, allowance);
                    let second = rates.incremental(before + split, added - split, allowance);
                    assert_eq!(
                        first.overage_fee_cents + second.overage_fee_cents,
                        delta.overage_fee_cents
                    );
                }
            }
        }
    }

    #[test]
    fn test_incremental_after_prior_usage() {
        let rates = OverageRates::default();
        // 45 min already used on a 60 min tier; another 30 crosses by 15
        let fee = rates.incremental(45, 30, 60);
        assert!(fee.has_overage);
        assert_eq!(fee.overage_minutes, 15);
        assert_eq!(fee.overage_fee_cents, 2500);

        // Already 70 over; another 10 stays within the same block
        let fee = rates.incremental(70, 10, 60);
        assert_eq!(fee.overage_minutes, 10);
        assert_eq!(fee.overage_fee_cents, 0);
        assert!(!fee.has_overage);
    }

    #[test]
    fn test_custom_rates() {
        let rates = OverageRates {
            block_minutes: 15,
            rate_per_block_cents: 1000,
            guest_fee_cents: 3000,
        };
        let fee = rates.calculate(76, 60);
        assert_eq!(fee.overage_fee_cents, 2000);
    }
}
