//! Storage seams for the billing ledger
//!
//! Every financial mutation is a single trait call so the implementation can
//! wrap it in one transaction with the right row lock:
//!
//! - `PaymentStore::apply_transition` locks the fee snapshot row
//! - `GuestPassStore::create_hold` / `convert_holds` lock the member's
//!   guest-pass row
//! - `RosterStore` mutations lock the booking session row
//!
//! [`postgres::PgLedgerStore`] is the production backend;
//! [`memory::InMemoryLedgerStore`] serializes everything behind one mutex.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::model::{
    BookingSession, BookingStatus, FeeSnapshot, FeeSnapshotStatus, GuestPassHold,
    GuestPassUsage, NewParticipant, PaymentAuditEntry, PaymentIntentRecord, RosterVersion,
    SnapshotParticipantFee, StaffActor,
};

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// Fee and usage values written back onto a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantFeeUpdate {
    pub participant_id: Uuid,
    pub cached_fee_cents: i64,
    pub usage_minutes: u32,
}

/// Result of a committed roster mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RosterChange {
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub roster_version: RosterVersion,
}

/// Guest-pass hold to create if the allowance permits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldRequest {
    pub member_email: String,
    pub booking_id: Uuid,
    pub passes: u32,
    pub allowance: u32,
    pub period_start: Date,
    pub expires_at: OffsetDateTime,
}

/// Mirror row for a freshly issued processor intent
#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentIntent {
    pub stripe_payment_intent_id: String,
    pub booking_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub amount_cents: i64,
    pub status: String,
}

/// Fee snapshot to record alongside a new intent
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeeSnapshot {
    pub booking_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub total_cents: i64,
    pub participant_fees: Vec<SnapshotParticipantFee>,
}

/// Target of a payment status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerTransition {
    Succeeded,
    Refunded,
    Cancelled { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub payment_intent_id: String,
    pub transition: LedgerTransition,
    pub actor: StaffActor,
}

/// How a transition request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionDisposition {
    /// Snapshot moved to the target status
    Applied,
    /// Snapshot was already in the target status; nothing changed
    AlreadyApplied,
    /// Snapshot is in a terminal status that forbids the target; nothing changed
    Conflict,
    /// No snapshot for this intent (non-booking payment); only the intent mirror changed
    NoSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub payment_intent_id: String,
    pub disposition: TransitionDisposition,
    pub previous_status: Option<FeeSnapshotStatus>,
    pub snapshot_status: Option<FeeSnapshotStatus>,
    pub participants_updated: usize,
    pub booking_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
}

/// Pending snapshot candidate for reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSnapshotRef {
    pub snapshot_id: Uuid,
    pub payment_intent_id: String,
    pub booking_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

/// Intent mirror row in a pending-like processor state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRef {
    pub payment_intent_id: String,
    pub booking_id: Option<Uuid>,
    pub status: String,
    pub created_at: OffsetDateTime,
}

/// Long-pending intent with the state of its linked booking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongPendingIntent {
    pub payment_intent_id: String,
    pub booking_id: Option<Uuid>,
    pub booking_status: Option<BookingStatus>,
    pub created_at: OffsetDateTime,
}

/// Processor statuses that mean "still waiting on the customer"
pub const PENDING_INTENT_STATUSES: &[&str] = &[
    "pending",
    "requires_payment_method",
    "requires_confirmation",
    "requires_action",
];

/// Mirrored intent statuses no later non-terminal update may overwrite
pub const TERMINAL_INTENT_STATUSES: &[&str] = &["succeeded", "canceled", "refunded"];

/// Statuses the long-pending sweep looks at
pub const LONG_PENDING_INTENT_STATUSES: &[&str] = &[
    "pending",
    "requires_payment_method",
    "requires_confirmation",
    "requires_action",
    "processing",
];

#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Tier name for a member, if the member exists and has one
    async fn member_tier(&self, email: &str) -> BillingResult<Option<String>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Minutes a member has already been billed for on `date`, across
    /// non-cancelled bookings, optionally ignoring one session
    async fn minutes_used_on(
        &self,
        email: &str,
        date: Date,
        exclude_session: Option<Uuid>,
    ) -> BillingResult<u32>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, session_id: Uuid) -> BillingResult<Option<BookingSession>>;

    async fn load_session_by_booking(
        &self,
        booking_id: Uuid,
    ) -> BillingResult<Option<BookingSession>>;

    /// Write every update or none of them
    async fn apply_participant_fees(
        &self,
        session_id: Uuid,
        updates: &[ParticipantFeeUpdate],
    ) -> BillingResult<usize>;
}

#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn add_participant(
        &self,
        session_id: Uuid,
        participant: NewParticipant,
        client_version: Option<RosterVersion>,
    ) -> BillingResult<RosterChange>;

    async fn remove_participant(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
        client_version: Option<RosterVersion>,
    ) -> BillingResult<RosterChange>;
}

#[async_trait]
pub trait GuestPassStore: Send + Sync {
    /// Current position for a member's month; holds for `exclude_booking`
    /// are not counted
    async fn usage(
        &self,
        member_email: &str,
        period_start: Date,
        allowance: u32,
        exclude_booking: Option<Uuid>,
    ) -> BillingResult<GuestPassUsage>;

    /// Fails with `InsufficientPasses` (holding nothing) when the allowance
    /// can't cover the request
    async fn create_hold(&self, request: &HoldRequest) -> BillingResult<GuestPassHold>;

    async fn release_holds(&self, booking_id: Uuid) -> BillingResult<u64>;

    /// Every hold tied to a booking, expired or not
    async fn booking_holds(&self, booking_id: Uuid) -> BillingResult<Vec<GuestPassHold>>;

    /// Move a booking's held passes into permanent usage
    async fn convert_holds(
        &self,
        booking_id: Uuid,
        member_email: &str,
        period_start: Date,
        allowance: u32,
    ) -> BillingResult<u32>;

    async fn delete_expired_holds(&self, now: OffsetDateTime) -> BillingResult<u64>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Record an intent mirror and its pending snapshot; returns the
    /// existing snapshot if the intent was already recorded
    async fn record_payment_intent(
        &self,
        intent: &NewPaymentIntent,
        snapshot: &NewFeeSnapshot,
    ) -> BillingResult<FeeSnapshot>;

    async fn apply_transition(&self, request: &TransitionRequest)
        -> BillingResult<TransitionOutcome>;

    /// Update only the mirrored processor status; returns false when no
    /// intent row exists. A mirror already in a terminal status
    /// (`TERMINAL_INTENT_STATUSES`) is left as is.
    async fn mirror_intent_status(
        &self,
        payment_intent_id: &str,
        status: &str,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool>;

    async fn fee_snapshot(&self, payment_intent_id: &str) -> BillingResult<Option<FeeSnapshot>>;

    async fn payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>>;

    async fn audit_trail(&self, booking_id: Uuid) -> BillingResult<Vec<PaymentAuditEntry>>;
}

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn stale_pending_snapshots(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PendingSnapshotRef>>;

    async fn abandoned_intents(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<IntentRef>>;

    async fn long_pending_intents(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<LongPendingIntent>>;
}

/// Claim log for processor webhook deliveries
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Atomically claim an event; false when another delivery already owns
    /// it or it already succeeded. Deliveries that finished with an error
    /// are claimable again.
    async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}

/// Everything the ledger services need from one backend
pub trait LedgerStore:
    MemberStore
    + UsageStore
    + SessionStore
    + RosterStore
    + GuestPassStore
    + PaymentStore
    + ReconciliationStore
    + WebhookEventStore
{
}

impl<T> LedgerStore for T where
    T: MemberStore
        + UsageStore
        + SessionStore
        + RosterStore
        + GuestPassStore
        + PaymentStore
        + ReconciliationStore
        + WebhookEventStore
{
}
