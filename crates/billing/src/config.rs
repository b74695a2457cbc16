//! Ledger configuration loaded from the environment

use std::str::FromStr;
use std::time::Duration;

use crate::model::StaffActor;
use crate::overage::OverageRates;

/// Hard ceiling on rows handled per sweep tick
pub const MAX_RECONCILE_BATCH: i64 = 50;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Timing and batch bounds for the reconciliation sweeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationSettings {
    pub interval: Duration,
    /// Delay before the first run after startup
    pub initial_delay: Duration,
    pub batch_size: i64,
    pub stale_pending_after: time::Duration,
    pub abandoned_after: time::Duration,
    pub long_pending_after: time::Duration,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            initial_delay: Duration::from_secs(60),
            batch_size: MAX_RECONCILE_BATCH,
            stale_pending_after: time::Duration::minutes(5),
            abandoned_after: time::Duration::hours(2),
            long_pending_after: time::Duration::days(7),
        }
    }
}

impl ReconciliationSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: Duration::from_secs(env_or(
                "RECONCILE_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )),
            initial_delay: Duration::from_secs(env_or(
                "RECONCILE_INITIAL_DELAY_SECS",
                defaults.initial_delay.as_secs(),
            )),
            batch_size: env_or("RECONCILE_BATCH_SIZE", defaults.batch_size)
                .clamp(1, MAX_RECONCILE_BATCH),
            stale_pending_after: time::Duration::minutes(env_or(
                "RECONCILE_STALE_PENDING_MINUTES",
                5,
            )),
            abandoned_after: time::Duration::hours(env_or("RECONCILE_ABANDONED_HOURS", 2)),
            long_pending_after: time::Duration::days(env_or("RECONCILE_LONG_PENDING_DAYS", 7)),
        }
    }
}

/// Everything the ledger services read from the environment
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub reconciliation: ReconciliationSettings,
    pub rates: OverageRates,
    pub hold_ttl: time::Duration,
    pub hold_cleanup_interval: Duration,
    pub invariant_check_interval: Duration,
    pub member_cache_ttl: Duration,
    pub member_cache_max_entries: usize,
    /// Actor recorded on audit rows written by the scheduler and webhooks
    pub system_actor: StaffActor,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reconciliation: ReconciliationSettings::default(),
            rates: OverageRates::default(),
            hold_ttl: time::Duration::minutes(30),
            hold_cleanup_interval: Duration::from_secs(300),
            invariant_check_interval: Duration::from_secs(3600),
            member_cache_ttl: Duration::from_secs(300),
            member_cache_max_entries: 1000,
            system_actor: StaffActor::new("system@clubhouse.local", Some("Reconciliation".into())),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reconciliation: ReconciliationSettings::from_env(),
            rates: OverageRates::from_env(),
            hold_ttl: time::Duration::minutes(env_or("GUEST_PASS_HOLD_TTL_MINUTES", 30)),
            hold_cleanup_interval: Duration::from_secs(env_or(
                "GUEST_PASS_CLEANUP_INTERVAL_SECS",
                defaults.hold_cleanup_interval.as_secs(),
            )),
            invariant_check_interval: Duration::from_secs(env_or(
                "INVARIANT_CHECK_INTERVAL_SECS",
                defaults.invariant_check_interval.as_secs(),
            )),
            member_cache_ttl: Duration::from_secs(env_or(
                "MEMBER_CACHE_TTL_SECS",
                defaults.member_cache_ttl.as_secs(),
            )),
            member_cache_max_entries: env_or(
                "MEMBER_CACHE_MAX_ENTRIES",
                defaults.member_cache_max_entries,
            )
            .max(1),
            system_actor: StaffActor::new(
                std::env::var("RECONCILE_ACTOR_EMAIL")
                    .unwrap_or_else(|_| defaults.system_actor.email.clone()),
                std::env::var("RECONCILE_ACTOR_NAME")
                    .ok()
                    .or(defaults.system_actor.name),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ReconciliationSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(900));
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.stale_pending_after, time::Duration::minutes(5));
        assert_eq!(settings.long_pending_after, time::Duration::days(7));

        let config = LedgerConfig::default();
        assert_eq!(config.hold_ttl, time::Duration::minutes(30));
        assert_eq!(config.member_cache_max_entries, 1000);
    }

    #[test]
    fn test_missing_env_falls_back() {
        assert_eq!(env_or("CLUBHOUSE_TEST_UNSET_VARIABLE", 17u64), 17);
    }
}
