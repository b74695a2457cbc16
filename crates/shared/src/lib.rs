#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clubhouse shared types
//!
//! Leaf-level building blocks used by the billing core and the worker:
//! the membership tier catalog, email normalization and database pool setup.

pub mod db;
pub mod tiers;

pub use db::{create_pool, run_migrations};
pub use tiers::{
    enforce_social_tier_rules, SocialTierCheck, TierCatalog, TierLimits,
    UNLIMITED_MINUTES_SENTINEL,
};

/// Normalize an email for lookups (trimmed, lowercase)
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Pat@Example.COM "), "pat@example.com");
        assert_eq!(normalize_email(""), "");
    }
}
