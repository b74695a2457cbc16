//! Core ledger records
//!
//! Sessions, participants, fee snapshots, payment intents, guest-pass holds
//! and the audit trail. Status enums round-trip through their database string
//! form via `as_str` / `FromStr`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingError;

/// Optimistic-concurrency token for a session's roster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RosterVersion(u64);

impl RosterVersion {
    pub const INITIAL: RosterVersion = RosterVersion(0);

    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// The version after one successful mutation
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub(crate) fn from_db(version: i32) -> Self {
        Self(version.max(0) as u64)
    }
}

impl std::fmt::Display for RosterVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reject a mutation whose client version doesn't match the server's
///
/// Legacy callers that send no version are let through.
pub fn check_roster_version(
    current: RosterVersion,
    client: Option<RosterVersion>,
) -> Result<(), BillingError> {
    match client {
        Some(expected) if expected != current => Err(BillingError::RosterConflict {
            current_version: current,
        }),
        _ => Ok(()),
    }
}

/// Kind of attendee; drives which pricing rule applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    Owner,
    Member,
    Guest,
}

impl ParticipantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantType::Owner => "owner",
            ParticipantType::Member => "member",
            ParticipantType::Guest => "guest",
        }
    }
}

impl FromStr for ParticipantType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(ParticipantType::Owner),
            "member" => Ok(ParticipantType::Member),
            "guest" => Ok(ParticipantType::Guest),
            other => Err(BillingError::InvalidInput(format!(
                "unknown participant type '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ParticipantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantPaymentStatus {
    Pending,
    Paid,
    Refunded,
}

impl ParticipantPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantPaymentStatus::Pending => "pending",
            ParticipantPaymentStatus::Paid => "paid",
            ParticipantPaymentStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for ParticipantPaymentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ParticipantPaymentStatus::Pending),
            "paid" => Ok(ParticipantPaymentStatus::Paid),
            "refunded" => Ok(ParticipantPaymentStatus::Refunded),
            other => Err(BillingError::Database(format!(
                "unknown participant payment status '{}'",
                other
            ))),
        }
    }
}

/// One attendee of a booking session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub display_name: String,
    pub participant_type: ParticipantType,
    pub cached_fee_cents: i64,
    pub payment_status: ParticipantPaymentStatus,
}

/// Participant to append to a roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewParticipant {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub display_name: String,
    pub participant_type: ParticipantType,
}

/// One bay/time reservation with its ordered roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingSession {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub session_date: Date,
    pub duration_minutes: u32,
    pub declared_player_count: Option<u32>,
    pub host_email: String,
    pub roster_version: RosterVersion,
    pub participants: Vec<Participant>,
}

/// Lifecycle of a booking, as far as reconciliation cares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Confirmed,
    Attended,
    Cancelled,
    Declined,
    Expired,
    Other(String),
}

impl BookingStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => BookingStatus::Pending,
            "approved" => BookingStatus::Approved,
            "confirmed" => BookingStatus::Confirmed,
            "attended" => BookingStatus::Attended,
            "cancelled" => BookingStatus::Cancelled,
            "declined" => BookingStatus::Declined,
            "expired" => BookingStatus::Expired,
            other => BookingStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Attended => "attended",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Declined => "declined",
            BookingStatus::Expired => "expired",
            BookingStatus::Other(s) => s,
        }
    }

    /// Booking ended without play; any open charge is moot
    pub fn is_terminal_negative(&self) -> bool {
        matches!(
            self,
            BookingStatus::Cancelled | BookingStatus::Declined | BookingStatus::Expired
        )
    }

    /// Booking went ahead; the processor decides the charge outcome
    pub fn is_terminal_positive(&self) -> bool {
        matches!(self, BookingStatus::Attended | BookingStatus::Confirmed)
    }
}

/// Status of a fee snapshot
///
/// Moves `Pending -> {Paid, Refunded, Cancelled}` and `Paid -> Refunded`;
/// never back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeSnapshotStatus {
    Pending,
    Paid,
    Refunded,
    Cancelled,
}

impl FeeSnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeSnapshotStatus::Pending => "pending",
            FeeSnapshotStatus::Paid => "paid",
            FeeSnapshotStatus::Refunded => "refunded",
            FeeSnapshotStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: FeeSnapshotStatus) -> bool {
        use FeeSnapshotStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Pending, Refunded) | (Pending, Cancelled) | (Paid, Refunded)
        )
    }
}

impl FromStr for FeeSnapshotStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FeeSnapshotStatus::Pending),
            "paid" => Ok(FeeSnapshotStatus::Paid),
            "refunded" => Ok(FeeSnapshotStatus::Refunded),
            "cancelled" => Ok(FeeSnapshotStatus::Cancelled),
            other => Err(BillingError::Database(format!(
                "unknown fee snapshot status '{}'",
                other
            ))),
        }
    }
}

/// Serialized per-participant line stored on a fee snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotParticipantFee {
    pub participant_id: Option<Uuid>,
    pub display_name: String,
    pub amount_cents: i64,
}

/// Persisted invoice tied to one payment intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSnapshot {
    pub id: Uuid,
    pub stripe_payment_intent_id: String,
    pub booking_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub status: FeeSnapshotStatus,
    pub total_cents: i64,
    pub participant_fees: Vec<SnapshotParticipantFee>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Local mirror of a processor payment intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentRecord {
    pub id: Uuid,
    pub stripe_payment_intent_id: String,
    pub booking_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub amount_cents: i64,
    pub status: String,
    pub failure_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Audit row written for every participant payment-status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAuditEntry {
    pub booking_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub participant_id: Option<Uuid>,
    pub action: String,
    pub staff_email: String,
    pub staff_name: Option<String>,
    pub amount_affected_cents: i64,
    pub previous_status: Option<String>,
    pub new_status: String,
    pub stripe_payment_intent_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Who performed a payment transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffActor {
    pub email: String,
    pub name: Option<String>,
}

impl StaffActor {
    pub fn new(email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            email: email.into(),
            name,
        }
    }
}

/// Provisional reservation of guest passes for a booking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestPassHold {
    pub id: Uuid,
    pub member_email: String,
    pub booking_id: Uuid,
    pub passes_held: u32,
    pub expires_at: OffsetDateTime,
}

/// A member's guest-pass position for one calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestPassUsage {
    pub allowance: u32,
    pub used: u32,
    pub held: u32,
}

impl GuestPassUsage {
    pub fn available(&self) -> u32 {
        self.allowance.saturating_sub(self.used.saturating_add(self.held))
    }
}

/// First day of the calendar month containing `date`
pub fn month_start(date: Date) -> Date {
    date.replace_day(1).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_roster_version_check() {
        let current = RosterVersion::new(5);
        assert!(check_roster_version(current, Some(RosterVersion::new(5))).is_ok());
        assert!(check_roster_version(current, None).is_ok());

        let err = check_roster_version(current, Some(RosterVersion::new(4))).unwrap_err();
        match err {
            BillingError::RosterConflict { current_version } => {
                assert_eq!(current_version, current)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(check_roster_version(current, Some(RosterVersion::new(6))).is_err());
    }

    #[test]
    fn test_snapshot_transitions_never_go_backward() {
        use FeeSnapshotStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Paid.can_transition_to(Refunded));
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Paid.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Paid));
        assert!(!Refunded.can_transition_to(Paid));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in ["pending", "paid", "refunded", "cancelled"] {
            assert_eq!(FeeSnapshotStatus::from_str(status).unwrap().as_str(), status);
        }
        assert!(FeeSnapshotStatus::from_str("void").is_err());
        assert!(ParticipantType::from_str("coach").is_err());
    }

    #[test]
    fn test_booking_status_classification() {
        assert!(BookingStatus::parse("declined").is_terminal_negative());
        assert!(BookingStatus::parse("attended").is_terminal_positive());
        let other = BookingStatus::parse("no_show");
        assert!(!other.is_terminal_negative() && !other.is_terminal_positive());
        assert_eq!(other.as_str(), "no_show");
    }

    #[test]
    fn test_guest_pass_available_saturates() {
        let usage = GuestPassUsage {
            allowance: 4,
            used: 3,
            held: 3,
        };
        assert_eq!(usage.available(), 0);
    }

    #[test]
    fn test_month_start() {
        assert_eq!(month_start(date!(2026 - 10 - 16)), date!(2026 - 10 - 01));
    }
}
