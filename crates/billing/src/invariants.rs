//! Ledger invariant checks
//!
//! Read-only consistency queries over the billing tables. Run them after a
//! reconciliation pass or a webhook replay; a violation carries enough context
//! to find the offending rows.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::model::FeeSnapshotStatus;

const GUEST_PASS_CONSERVATION: &str = "guest_pass_conservation";
const PAID_SNAPSHOT_PENDING_PARTICIPANTS: &str = "paid_snapshot_pending_participants";
const SNAPSHOT_INTENT_STATUS_MISMATCH: &str = "snapshot_intent_status_mismatch";
const ROSTER_VERSION_SANITY: &str = "roster_version_sanity";
const SINGLE_SESSION_OWNER: &str = "single_session_owner";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Bookings or sessions the violation points at
    pub subject_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or passes are being miscounted
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    pub fn critical_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Critical)
            .count()
    }
}

/// Intent status a settled snapshot implies
fn expected_intent_status(snapshot_status: FeeSnapshotStatus) -> Option<&'static str> {
    match snapshot_status {
        FeeSnapshotStatus::Pending => None,
        FeeSnapshotStatus::Paid => Some("succeeded"),
        FeeSnapshotStatus::Refunded => Some("refunded"),
        FeeSnapshotStatus::Cancelled => Some("canceled"),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OverdrawnPassesRow {
    member_email: String,
    period_start: time::Date,
    passes_used: i32,
    passes_total: i32,
    passes_held: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidPendingRow {
    snapshot_id: Uuid,
    stripe_payment_intent_id: String,
    booking_id: Option<Uuid>,
    pending_participants: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StatusMismatchRow {
    stripe_payment_intent_id: String,
    booking_id: Option<Uuid>,
    snapshot_status: String,
    intent_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct RosterVersionRow {
    session_id: Uuid,
    booking_id: Uuid,
    roster_version: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct OwnerCountRow {
    session_id: Uuid,
    booking_id: Uuid,
    owner_count: i64,
}

/// Runs the ledger consistency queries
pub struct LedgerInvariantChecker {
    pool: PgPool,
}

impl LedgerInvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let summary =
            InvariantCheckSummary::from_violations(Self::available_checks().len(), violations);
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Ledger invariants hold");
        } else {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                critical = summary.critical_count(),
                "Ledger invariant violations found"
            );
        }
        Ok(summary)
    }

    /// Run a single invariant check by name; unknown names find nothing
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            GUEST_PASS_CONSERVATION => self.check_guest_pass_conservation().await,
            PAID_SNAPSHOT_PENDING_PARTICIPANTS => self.check_paid_snapshot_participants().await,
            SNAPSHOT_INTENT_STATUS_MISMATCH => self.check_snapshot_intent_status().await,
            ROSTER_VERSION_SANITY => self.check_roster_versions().await,
            SINGLE_SESSION_OWNER => self.check_single_owner().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            GUEST_PASS_CONSERVATION,
            PAID_SNAPSHOT_PENDING_PARTICIPANTS,
            SNAPSHOT_INTENT_STATUS_MISMATCH,
            ROSTER_VERSION_SANITY,
            SINGLE_SESSION_OWNER,
        ]
    }

    /// used + live holds never exceeds the monthly allowance
    async fn check_guest_pass_conservation(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverdrawnPassesRow> = sqlx::query_as(
            r#"
            SELECT
                gp.member_email,
                gp.period_start,
                gp.passes_used,
                gp.passes_total,
                COALESCE(SUM(h.passes_held) FILTER (WHERE h.live), 0)::BIGINT
                    AS passes_held
            FROM guest_passes gp
            LEFT JOIN LATERAL (
                SELECT gh.passes_held,
                       gh.expires_at > NOW() OR EXISTS (
                           SELECT 1 FROM fee_snapshots f
                           WHERE f.booking_id = gh.booking_id AND f.status = 'pending'
                       ) AS live
                FROM guest_pass_holds gh
                WHERE gh.member_email = gp.member_email
            ) h ON TRUE
            WHERE gp.period_start = DATE_TRUNC('month', NOW() AT TIME ZONE 'UTC')::DATE
            GROUP BY gp.member_email, gp.period_start, gp.passes_used, gp.passes_total
            HAVING gp.passes_used
                + COALESCE(SUM(h.passes_held) FILTER (WHERE h.live), 0)
                > gp.passes_total
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: GUEST_PASS_CONSERVATION.to_string(),
                subject_ids: vec![],
                description: format!(
                    "Member {} has {} used + {} held guest passes against an allowance of {}",
                    row.member_email, row.passes_used, row.passes_held, row.passes_total
                ),
                context: serde_json::json!({
                    "member_email": row.member_email,
                    "period_start": row.period_start.to_string(),
                    "passes_used": row.passes_used,
                    "passes_held": row.passes_held,
                    "passes_total": row.passes_total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A paid snapshot leaves none of its participants pending
    async fn check_paid_snapshot_participants(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidPendingRow> = sqlx::query_as(
            r#"
            SELECT
                fs.id AS snapshot_id,
                fs.stripe_payment_intent_id,
                fs.booking_id,
                COUNT(bp.id) AS pending_participants
            FROM fee_snapshots fs
            CROSS JOIN LATERAL jsonb_array_elements(fs.participant_fees) AS line
            JOIN booking_participants bp
                ON bp.id = NULLIF(line->>'participant_id', '')::UUID
            WHERE fs.status = 'paid'
              AND bp.payment_status = 'pending'
            GROUP BY fs.id, fs.stripe_payment_intent_id, fs.booking_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: PAID_SNAPSHOT_PENDING_PARTICIPANTS.to_string(),
                subject_ids: row.booking_id.into_iter().collect(),
                description: format!(
                    "Paid snapshot for {} still has {} pending participant(s)",
                    row.stripe_payment_intent_id, row.pending_participants
                ),
                context: serde_json::json!({
                    "snapshot_id": row.snapshot_id,
                    "stripe_payment_intent_id": row.stripe_payment_intent_id,
                    "pending_participants": row.pending_participants,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Settled snapshots agree with the mirrored intent status
    async fn check_snapshot_intent_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                fs.stripe_payment_intent_id,
                fs.booking_id,
                fs.status AS snapshot_status,
                pi.status AS intent_status
            FROM fee_snapshots fs
            JOIN payment_intents pi
                ON pi.stripe_payment_intent_id = fs.stripe_payment_intent_id
            WHERE fs.status <> 'pending'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| {
                let expected = row
                    .snapshot_status
                    .parse::<FeeSnapshotStatus>()
                    .ok()
                    .and_then(expected_intent_status);
                expected.is_some_and(|status| status != row.intent_status)
            })
            .map(|row| InvariantViolation {
                invariant: SNAPSHOT_INTENT_STATUS_MISMATCH.to_string(),
                subject_ids: row.booking_id.into_iter().collect(),
                description: format!(
                    "Snapshot for {} is '{}' but the intent mirror says '{}'",
                    row.stripe_payment_intent_id, row.snapshot_status, row.intent_status
                ),
                context: serde_json::json!({
                    "stripe_payment_intent_id": row.stripe_payment_intent_id,
                    "snapshot_status": row.snapshot_status,
                    "intent_status": row.intent_status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_roster_versions(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RosterVersionRow> = sqlx::query_as(
            r#"
            SELECT id AS session_id, booking_id, roster_version
            FROM booking_sessions
            WHERE roster_version < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: ROSTER_VERSION_SANITY.to_string(),
                subject_ids: vec![row.booking_id, row.session_id],
                description: format!("Session has negative roster version {}", row.roster_version),
                context: serde_json::json!({ "roster_version": row.roster_version }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_single_owner(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OwnerCountRow> = sqlx::query_as(
            r#"
            SELECT s.id AS session_id, s.booking_id, COUNT(bp.id) AS owner_count
            FROM booking_sessions s
            JOIN booking_participants bp
                ON bp.session_id = s.id AND bp.participant_type = 'owner'
            GROUP BY s.id, s.booking_id
            HAVING COUNT(bp.id) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: SINGLE_SESSION_OWNER.to_string(),
                subject_ids: vec![row.booking_id, row.session_id],
                description: format!("Session has {} owners (expected 1)", row.owner_count),
                context: serde_json::json!({ "owner_count": row.owner_count }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}
