//! Membership tier catalog
//!
//! Immutable per-tier limits looked up by tier name. The billing core only
//! ever reads these values.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Daily minute allowance at or above this value means "unlimited"
pub const UNLIMITED_MINUTES_SENTINEL: u32 = 999;

/// Limits attached to a membership tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Simulator minutes included per day (999 = unlimited)
    pub daily_sim_minutes: u32,
    /// Guest passes granted per calendar month
    pub guest_passes_per_month: u32,
    /// Tier bypasses daily minute limits entirely
    pub unlimited_access: bool,
    /// Tier may book simulator bays at all
    pub can_book_simulators: bool,
}

impl TierLimits {
    /// Whether overage never applies to this tier
    pub fn has_unlimited_minutes(&self) -> bool {
        self.unlimited_access || self.daily_sim_minutes >= UNLIMITED_MINUTES_SENTINEL
    }

    /// Daily allowance to feed into overage pricing
    ///
    /// Unlimited tiers report the sentinel so pricing short-circuits.
    pub fn daily_allowance(&self) -> u32 {
        if self.unlimited_access {
            UNLIMITED_MINUTES_SENTINEL
        } else {
            self.daily_sim_minutes
        }
    }

    /// Whether the tier carries a guest-pass benefit
    pub fn grants_guest_passes(&self) -> bool {
        self.guest_passes_per_month > 0
    }
}

/// Row type for loading tiers from the database
#[derive(Debug, sqlx::FromRow)]
struct TierRow {
    name: String,
    daily_sim_minutes: i32,
    guest_passes_per_month: i32,
    unlimited_access: bool,
    can_book_simulators: bool,
}

/// Lookup table of tier name -> limits
#[derive(Debug, Clone, Default)]
pub struct TierCatalog {
    tiers: HashMap<String, TierLimits>,
}

impl TierCatalog {
    /// Build a catalog from explicit entries
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, TierLimits)>,
        S: AsRef<str>,
    {
        let tiers = entries
            .into_iter()
            .map(|(name, limits)| (name.as_ref().trim().to_lowercase(), limits))
            .collect();
        Self { tiers }
    }

    /// The club's standard tier table
    pub fn standard() -> Self {
        Self::from_entries([
            (
                "social",
                TierLimits {
                    daily_sim_minutes: 0,
                    guest_passes_per_month: 0,
                    unlimited_access: false,
                    can_book_simulators: false,
                },
            ),
            (
                "core",
                TierLimits {
                    daily_sim_minutes: 60,
                    guest_passes_per_month: 4,
                    unlimited_access: false,
                    can_book_simulators: true,
                },
            ),
            (
                "premium",
                TierLimits {
                    daily_sim_minutes: 90,
                    guest_passes_per_month: 8,
                    unlimited_access: false,
                    can_book_simulators: true,
                },
            ),
            (
                "corporate",
                TierLimits {
                    daily_sim_minutes: 90,
                    guest_passes_per_month: 15,
                    unlimited_access: false,
                    can_book_simulators: true,
                },
            ),
            (
                "vip",
                TierLimits {
                    daily_sim_minutes: UNLIMITED_MINUTES_SENTINEL,
                    guest_passes_per_month: 15,
                    unlimited_access: true,
                    can_book_simulators: true,
                },
            ),
        ])
    }

    /// Load tiers from `membership_tiers`, falling back to the standard table
    /// when the table is empty.
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows: Vec<TierRow> = sqlx::query_as(
            r#"
            SELECT name, daily_sim_minutes, guest_passes_per_month,
                   unlimited_access, can_book_simulators
            FROM membership_tiers
            "#,
        )
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            tracing::warn!("membership_tiers is empty, using standard tier catalog");
            return Ok(Self::standard());
        }

        tracing::info!(tiers = rows.len(), "Loaded membership tier catalog");

        Ok(Self::from_entries(rows.into_iter().map(|row| {
            (
                row.name,
                TierLimits {
                    daily_sim_minutes: row.daily_sim_minutes.max(0) as u32,
                    guest_passes_per_month: row.guest_passes_per_month.max(0) as u32,
                    unlimited_access: row.unlimited_access,
                    can_book_simulators: row.can_book_simulators,
                },
            )
        })))
    }

    /// Look up a tier by name (case-insensitive)
    pub fn get(&self, tier: &str) -> Option<TierLimits> {
        self.tiers.get(&tier.trim().to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

/// Outcome of the social tier booking rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocialTierCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SocialTierCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Social members cannot bring guests when their tier has no guest passes
pub fn enforce_social_tier_rules(
    tier: &str,
    limits: &TierLimits,
    guest_count: usize,
) -> SocialTierCheck {
    if !tier.trim().eq_ignore_ascii_case("social") {
        return SocialTierCheck::allowed();
    }

    if guest_count > 0 && limits.guest_passes_per_month == 0 {
        return SocialTierCheck::denied(
            "Social tier members cannot bring guests to simulator bookings",
        );
    }

    SocialTierCheck::allowed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_lookup_is_case_insensitive() {
        let catalog = TierCatalog::standard();
        let core = catalog.get("Core").unwrap();
        assert_eq!(core.daily_sim_minutes, 60);
        assert!(catalog.get(" PREMIUM ").is_some());
        assert!(catalog.get("platinum").is_none());
    }

    #[test]
    fn test_unlimited_detection() {
        let catalog = TierCatalog::standard();
        assert!(catalog.get("vip").unwrap().has_unlimited_minutes());
        assert!(!catalog.get("core").unwrap().has_unlimited_minutes());

        let sentinel_only = TierLimits {
            daily_sim_minutes: UNLIMITED_MINUTES_SENTINEL,
            guest_passes_per_month: 0,
            unlimited_access: false,
            can_book_simulators: true,
        };
        assert!(sentinel_only.has_unlimited_minutes());
        assert_eq!(sentinel_only.daily_allowance(), UNLIMITED_MINUTES_SENTINEL);
    }

    #[test]
    fn test_social_tier_guest_rejected() {
        let catalog = TierCatalog::standard();
        let social = catalog.get("social").unwrap();

        let check = enforce_social_tier_rules("social", &social, 1);
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("guest"));
    }

    #[test]
    fn test_social_tier_without_guests_allowed() {
        let catalog = TierCatalog::standard();
        let social = catalog.get("social").unwrap();
        assert!(enforce_social_tier_rules("Social", &social, 0).allowed);
    }

    #[test]
    fn test_other_tiers_unaffected() {
        let catalog = TierCatalog::standard();
        let core = catalog.get("core").unwrap();
        assert!(enforce_social_tier_rules("core", &core, 3).allowed);
    }
}
