// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries processor messages
#![allow(clippy::too_many_arguments)] // Service constructors take every seam explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::new_without_default))]

//! Clubhouse booking billing ledger
//!
//! Computes simulator booking fees, allocates guest passes, guards roster
//! edits, and keeps fee snapshots in step with Stripe payment intents.
//!
//! ## Features
//!
//! - **Fee breakdown**: per-participant minutes, overage blocks and guest fees
//! - **Guest passes**: monthly allowance with expiring holds
//! - **Roster guard**: optimistic concurrency on session rosters
//! - **Payment ledger**: idempotent snapshot transitions with an audit trail
//! - **Reconciliation**: sweeps for stale, abandoned and long-pending intents
//! - **Webhooks**: Stripe event verification and dispatch

pub mod client;
pub mod config;
pub mod error;
pub mod fees;
pub mod guest_passes;
pub mod health;
pub mod intents;
pub mod invariants;
pub mod ledger;
pub mod member_cache;
pub mod model;
pub mod notify;
pub mod overage;
pub mod processor;
pub mod reconcile;
pub mod roster;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use sqlx::PgPool;

use clubhouse_shared::TierCatalog;

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::{LedgerConfig, ReconciliationSettings};

// Error
pub use error::{BillingError, BillingResult, ProcessorErrorCode};

// Fees
pub use fees::{
    ComputeOptions, FeeBreakdown, FeeBreakdownComputer, FeeLineItem, FeePreviewRequest,
    FeeSource, FeeTotals, PreviewParticipant,
};

// Guest passes
pub use guest_passes::GuestPassAllocator;

// Health
pub use health::{InMemoryJobHealth, JobHealth, JobHealthRecorder, PgJobHealthRecorder};

// Issuance
pub use intents::{BookingPaymentService, IssuedPayment};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantViolation, LedgerInvariantChecker, ViolationSeverity,
};

// Ledger
pub use ledger::{PaymentStatusLedger, SyncResult};

// Member cache
pub use member_cache::{MemberTierCache, ResolvedTier, TierResolver};

// Model
pub use model::{
    BookingSession, BookingStatus, FeeSnapshot, FeeSnapshotStatus, NewParticipant, Participant,
    ParticipantPaymentStatus, ParticipantType, RosterVersion, StaffActor,
};

// Events
pub use notify::{BookingEventSink, BookingLedgerEvent, BroadcastEventSink, NoopEventSink};

// Overage
pub use overage::{calculate_overage_fee, OverageFee, OverageRates};

// Processor
pub use processor::{PaymentProcessor, ProcessorIntent, ProcessorIntentStatus};

// Reconciliation
pub use reconcile::{
    ReconciliationService, SweepSummary, JOB_ABANDONED_INTENTS, JOB_HOLD_CLEANUP,
    JOB_INVARIANT_CHECK, JOB_LONG_PENDING, JOB_STALE_PENDING,
};

// Roster
pub use roster::{RosterGuard, RosterMutationResult, RosterSnapshot};

// Storage
pub use store::{InMemoryLedgerStore, LedgerStore, PgLedgerStore};

// Webhooks
pub use webhooks::{LedgerWebhookEvent, WebhookHandler};

/// Every ledger service wired to one storage backend
#[derive(Clone)]
pub struct BillingLedger {
    pub tiers: TierResolver,
    pub fees: FeeBreakdownComputer,
    pub guest_passes: GuestPassAllocator,
    pub roster: RosterGuard,
    pub ledger: PaymentStatusLedger,
    pub payments: BookingPaymentService,
    pub reconcile: ReconciliationService,
    pub webhooks: WebhookHandler,
}

impl BillingLedger {
    /// Postgres-backed ledger with Stripe and settings from environment variables
    pub fn from_env(pool: PgPool, catalog: TierCatalog) -> BillingResult<Self> {
        Self::from_config(pool, catalog, &LedgerConfig::from_env())
    }

    /// Postgres-backed ledger with Stripe credentials from the environment
    pub fn from_config(
        pool: PgPool,
        catalog: TierCatalog,
        config: &LedgerConfig,
    ) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();

        Ok(Self::with_store(
            Arc::new(PgLedgerStore::new(pool.clone())),
            Arc::new(stripe),
            Arc::new(PgJobHealthRecorder::new(pool)),
            Arc::new(NoopEventSink),
            catalog,
            config,
            webhook_secret,
        ))
    }

    pub fn with_store<S>(
        store: Arc<S>,
        processor: Arc<dyn PaymentProcessor>,
        health: Arc<dyn JobHealthRecorder>,
        events: Arc<dyn BookingEventSink>,
        catalog: TierCatalog,
        config: &LedgerConfig,
        webhook_secret: impl Into<String>,
    ) -> Self
    where
        S: LedgerStore + 'static,
    {
        let tiers = TierResolver::new(
            store.clone(),
            Arc::new(catalog),
            MemberTierCache::new(config.member_cache_ttl, config.member_cache_max_entries),
        );
        let fees = FeeBreakdownComputer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            tiers.clone(),
            config.rates,
            events.clone(),
        );
        let guest_passes =
            GuestPassAllocator::new(store.clone(), tiers.clone(), config.hold_ttl, events.clone());
        let roster = RosterGuard::new(
            store.clone(),
            store.clone(),
            tiers.clone(),
            fees.clone(),
            events.clone(),
        );
        let ledger = PaymentStatusLedger::new(store.clone(), guest_passes.clone(), events);
        let payments = BookingPaymentService::new(
            fees.clone(),
            guest_passes.clone(),
            processor.clone(),
            store.clone(),
        );
        let reconcile = ReconciliationService::new(
            store.clone(),
            processor,
            ledger.clone(),
            guest_passes.clone(),
            health,
            config.reconciliation.clone(),
            config.system_actor.clone(),
        );
        let webhooks = WebhookHandler::new(
            webhook_secret,
            ledger.clone(),
            store,
            config.system_actor.clone(),
        );

        Self {
            tiers,
            fees,
            guest_passes,
            roster,
            ledger,
            payments,
            reconcile,
            webhooks,
        }
    }
}
