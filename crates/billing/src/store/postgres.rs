//! Postgres ledger store
//!
//! Financial mutations open a transaction, lock the contended row with
//! `SELECT ... FOR UPDATE`, and commit. Returning early with an error drops
//! the transaction, which rolls it back.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use clubhouse_shared::normalize_email;

use super::{
    GuestPassStore, HoldRequest, IntentRef, LongPendingIntent, MemberStore, NewFeeSnapshot,
    NewPaymentIntent, ParticipantFeeUpdate, PaymentStore, PendingSnapshotRef,
    ReconciliationStore, RosterChange, RosterStore, SessionStore, TransitionOutcome,
    TransitionRequest, UsageStore, WebhookEventStore, LONG_PENDING_INTENT_STATUSES,
    PENDING_INTENT_STATUSES, TERMINAL_INTENT_STATUSES,
};
use crate::error::{BillingError, BillingResult};
use crate::guest_passes::{check_conversion, check_hold_available};
use crate::ledger::plan_transition;
use crate::model::{
    check_roster_version, BookingSession, BookingStatus, FeeSnapshot, FeeSnapshotStatus,
    GuestPassHold, GuestPassUsage, NewParticipant, Participant, ParticipantPaymentStatus,
    ParticipantType, PaymentAuditEntry, PaymentIntentRecord, RosterVersion,
    SnapshotParticipantFee,
};
use crate::roster::{validate_addition, validate_removal};

/// Webhook claims stuck in `processing` longer than this can be re-claimed
const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i32 = 30;

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    booking_id: Uuid,
    session_date: Date,
    duration_minutes: i32,
    declared_player_count: Option<i32>,
    host_email: String,
    roster_version: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct ParticipantRow {
    id: Uuid,
    user_id: Option<Uuid>,
    email: Option<String>,
    display_name: String,
    participant_type: String,
    cached_fee_cents: i64,
    payment_status: String,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = BillingError;

    fn try_from(row: ParticipantRow) -> Result<Self, Self::Error> {
        Ok(Participant {
            id: row.id,
            user_id: row.user_id,
            email: row.email,
            display_name: row.display_name,
            participant_type: ParticipantType::from_str(&row.participant_type)
                .map_err(|e| BillingError::Database(e.to_string()))?,
            cached_fee_cents: row.cached_fee_cents,
            payment_status: ParticipantPaymentStatus::from_str(&row.payment_status)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    id: Uuid,
    stripe_payment_intent_id: String,
    booking_id: Option<Uuid>,
    session_id: Option<Uuid>,
    status: String,
    total_cents: i64,
    participant_fees: Json<Vec<SnapshotParticipantFee>>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SnapshotRow> for FeeSnapshot {
    type Error = BillingError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(FeeSnapshot {
            id: row.id,
            stripe_payment_intent_id: row.stripe_payment_intent_id,
            booking_id: row.booking_id,
            session_id: row.session_id,
            status: FeeSnapshotStatus::from_str(&row.status)?,
            total_cents: row.total_cents,
            participant_fees: row.participant_fees.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IntentRow {
    id: Uuid,
    stripe_payment_intent_id: String,
    booking_id: Option<Uuid>,
    session_id: Option<Uuid>,
    amount_cents: i64,
    status: String,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<IntentRow> for PaymentIntentRecord {
    fn from(row: IntentRow) -> Self {
        PaymentIntentRecord {
            id: row.id,
            stripe_payment_intent_id: row.stripe_payment_intent_id,
            booking_id: row.booking_id,
            session_id: row.session_id,
            amount_cents: row.amount_cents,
            status: row.status,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    booking_id: Option<Uuid>,
    session_id: Option<Uuid>,
    participant_id: Option<Uuid>,
    action: String,
    staff_email: String,
    staff_name: Option<String>,
    amount_affected: i64,
    previous_status: Option<String>,
    new_status: String,
    stripe_payment_intent_id: Option<String>,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingSnapshotRow {
    id: Uuid,
    stripe_payment_intent_id: String,
    booking_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct IntentRefRow {
    stripe_payment_intent_id: String,
    booking_id: Option<Uuid>,
    status: String,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct LongPendingRow {
    stripe_payment_intent_id: String,
    booking_id: Option<Uuid>,
    booking_status: Option<String>,
    created_at: OffsetDateTime,
}

const SNAPSHOT_COLUMNS: &str = "id, stripe_payment_intent_id, booking_id, session_id, status, \
     total_cents, participant_fees, created_at, updated_at";

const PARTICIPANT_COLUMNS: &str = "id, user_id, email, display_name, participant_type, \
     cached_fee_cents, payment_status";

/// Ledger storage on Postgres
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_participants(
        executor: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
    ) -> BillingResult<Vec<Participant>> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(&format!(
            "SELECT {} FROM booking_participants WHERE session_id = $1 \
             ORDER BY position, created_at",
            PARTICIPANT_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&mut **executor)
        .await?;

        rows.into_iter().map(Participant::try_from).collect()
    }

    /// Lock the session row and return its current roster version
    async fn lock_session(
        tx: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
    ) -> BillingResult<RosterVersion> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT roster_version FROM booking_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|(version,)| RosterVersion::from_db(version))
            .ok_or_else(|| BillingError::NotFound(format!("Booking session {}", session_id)))
    }

    async fn bump_roster_version(
        tx: &mut Transaction<'_, Postgres>,
        session_id: Uuid,
    ) -> BillingResult<RosterVersion> {
        let (version,): (i32,) = sqlx::query_as(
            r#"
            UPDATE booking_sessions
            SET roster_version = roster_version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING roster_version
            "#,
        )
        .bind(session_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(RosterVersion::from_db(version))
    }

    /// Upsert and lock the member's guest-pass row; returns passes used
    async fn lock_guest_pass_row(
        tx: &mut Transaction<'_, Postgres>,
        email: &str,
        period_start: Date,
        allowance: u32,
    ) -> BillingResult<u32> {
        sqlx::query(
            r#"
            INSERT INTO guest_passes (member_email, period_start, passes_used, passes_total)
            VALUES ($1, $2, 0, $3)
            ON CONFLICT (member_email, period_start) DO UPDATE
                SET passes_total = EXCLUDED.passes_total, updated_at = NOW()
            "#,
        )
        .bind(email)
        .bind(period_start)
        .bind(to_i32(allowance))
        .execute(&mut **tx)
        .await?;

        let (used,): (i32,) = sqlx::query_as(
            r#"
            SELECT passes_used FROM guest_passes
            WHERE member_email = $1 AND period_start = $2
            FOR UPDATE
            "#,
        )
        .bind(email)
        .bind(period_start)
        .fetch_one(&mut **tx)
        .await?;

        Ok(to_u32(i64::from(used)))
    }

    async fn active_holds(
        executor: &mut Transaction<'_, Postgres>,
        email: &str,
        exclude_booking: Option<Uuid>,
    ) -> BillingResult<u32> {
        let (held,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(passes_held), 0)::BIGINT
            FROM guest_pass_holds
            WHERE member_email = $1
              AND (expires_at > NOW() OR EXISTS (
                  SELECT 1 FROM fee_snapshots f
                  WHERE f.booking_id = guest_pass_holds.booking_id AND f.status = 'pending'
              ))
              AND ($2::uuid IS NULL OR booking_id <> $2)
            "#,
        )
        .bind(email)
        .bind(exclude_booking)
        .fetch_one(&mut **executor)
        .await?;

        Ok(to_u32(held))
    }
}

#[async_trait]
impl MemberStore for PgLedgerStore {
    async fn member_tier(&self, email: &str) -> BillingResult<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT tier FROM members WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(tier,)| tier))
    }
}

#[async_trait]
impl UsageStore for PgLedgerStore {
    async fn minutes_used_on(
        &self,
        email: &str,
        date: Date,
        exclude_session: Option<Uuid>,
    ) -> BillingResult<u32> {
        let (minutes,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(p.usage_minutes), 0)::BIGINT
            FROM booking_participants p
            JOIN booking_sessions s ON s.id = p.session_id
            JOIN bookings b ON b.id = s.booking_id
            WHERE LOWER(p.email) = LOWER($1)
              AND s.session_date = $2
              AND p.participant_type <> 'guest'
              AND b.status NOT IN ('cancelled', 'declined', 'expired')
              AND ($3::uuid IS NULL OR s.id <> $3)
            "#,
        )
        .bind(email)
        .bind(date)
        .bind(exclude_session)
        .fetch_one(&self.pool)
        .await?;

        Ok(to_u32(minutes))
    }
}

#[async_trait]
impl SessionStore for PgLedgerStore {
    async fn load_session(&self, session_id: Uuid) -> BillingResult<Option<BookingSession>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, booking_id, session_date, duration_minutes, declared_player_count,
                   host_email, roster_version
            FROM booking_sessions
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let participants = Self::load_participants(&mut tx, row.id).await?;
        tx.commit().await?;

        Ok(Some(BookingSession {
            id: row.id,
            booking_id: row.booking_id,
            session_date: row.session_date,
            duration_minutes: to_u32(i64::from(row.duration_minutes)),
            declared_player_count: row.declared_player_count.map(|c| to_u32(i64::from(c))),
            host_email: row.host_email,
            roster_version: RosterVersion::from_db(row.roster_version),
            participants,
        }))
    }

    async fn load_session_by_booking(
        &self,
        booking_id: Uuid,
    ) -> BillingResult<Option<BookingSession>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM booking_sessions
            WHERE booking_id = $1
            ORDER BY session_date, id
            LIMIT 1
            "#,
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((session_id,)) => self.load_session(session_id).await,
            None => Ok(None),
        }
    }

    async fn apply_participant_fees(
        &self,
        session_id: Uuid,
        updates: &[ParticipantFeeUpdate],
    ) -> BillingResult<usize> {
        let mut tx = self.pool.begin().await?;
        Self::lock_session(&mut tx, session_id).await?;

        for update in updates {
            let result = sqlx::query(
                r#"
                UPDATE booking_participants
                SET cached_fee_cents = $1, usage_minutes = $2
                WHERE id = $3 AND session_id = $4
                "#,
            )
            .bind(update.cached_fee_cents)
            .bind(to_i32(update.usage_minutes))
            .bind(update.participant_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(BillingError::NotFound(format!(
                    "Participant {} in session {}",
                    update.participant_id, session_id
                )));
            }
        }

        tx.commit().await?;
        Ok(updates.len())
    }
}

#[async_trait]
impl RosterStore for PgLedgerStore {
    async fn add_participant(
        &self,
        session_id: Uuid,
        participant: NewParticipant,
        client_version: Option<RosterVersion>,
    ) -> BillingResult<RosterChange> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_session(&mut tx, session_id).await?;
        check_roster_version(current, client_version)?;

        let existing = Self::load_participants(&mut tx, session_id).await?;
        validate_addition(&existing, &participant)?;

        let participant_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO booking_participants
                (id, session_id, user_id, email, display_name, participant_type, position)
            VALUES ($1, $2, $3, $4, $5, $6,
                    (SELECT COALESCE(MAX(position), -1) + 1
                     FROM booking_participants WHERE session_id = $2))
            "#,
        )
        .bind(participant_id)
        .bind(session_id)
        .bind(participant.user_id)
        .bind(participant.email.as_deref().map(normalize_email))
        .bind(&participant.display_name)
        .bind(participant.participant_type.as_str())
        .execute(&mut *tx)
        .await?;

        let roster_version = Self::bump_roster_version(&mut tx, session_id).await?;
        tx.commit().await?;

        Ok(RosterChange {
            session_id,
            participant_id,
            roster_version,
        })
    }

    async fn remove_participant(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
        client_version: Option<RosterVersion>,
    ) -> BillingResult<RosterChange> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_session(&mut tx, session_id).await?;
        check_roster_version(current, client_version)?;

        let existing = Self::load_participants(&mut tx, session_id).await?;
        validate_removal(&existing, participant_id)?;

        sqlx::query("DELETE FROM booking_participants WHERE id = $1 AND session_id = $2")
            .bind(participant_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        let roster_version = Self::bump_roster_version(&mut tx, session_id).await?;
        tx.commit().await?;

        Ok(RosterChange {
            session_id,
            participant_id,
            roster_version,
        })
    }
}

#[async_trait]
impl GuestPassStore for PgLedgerStore {
    async fn usage(
        &self,
        member_email: &str,
        period_start: Date,
        allowance: u32,
        exclude_booking: Option<Uuid>,
    ) -> BillingResult<GuestPassUsage> {
        let email = normalize_email(member_email);
        let mut tx = self.pool.begin().await?;

        let used: Option<(i32,)> = sqlx::query_as(
            "SELECT passes_used FROM guest_passes WHERE member_email = $1 AND period_start = $2",
        )
        .bind(&email)
        .bind(period_start)
        .fetch_optional(&mut *tx)
        .await?;
        let held = Self::active_holds(&mut tx, &email, exclude_booking).await?;
        tx.commit().await?;

        Ok(GuestPassUsage {
            allowance,
            used: used.map(|(u,)| to_u32(i64::from(u))).unwrap_or(0),
            held,
        })
    }

    async fn create_hold(&self, request: &HoldRequest) -> BillingResult<GuestPassHold> {
        let email = normalize_email(&request.member_email);
        let mut tx = self.pool.begin().await?;

        let used =
            Self::lock_guest_pass_row(&mut tx, &email, request.period_start, request.allowance)
                .await?;
        let held = Self::active_holds(&mut tx, &email, None).await?;

        check_hold_available(
            &GuestPassUsage {
                allowance: request.allowance,
                used,
                held,
            },
            request.passes,
        )?;

        let hold = GuestPassHold {
            id: Uuid::new_v4(),
            member_email: email,
            booking_id: request.booking_id,
            passes_held: request.passes,
            expires_at: request.expires_at,
        };

        sqlx::query(
            r#"
            INSERT INTO guest_pass_holds (id, member_email, booking_id, passes_held, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(hold.id)
        .bind(&hold.member_email)
        .bind(hold.booking_id)
        .bind(to_i32(hold.passes_held))
        .bind(hold.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(hold)
    }

    async fn release_holds(&self, booking_id: Uuid) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM guest_pass_holds WHERE booking_id = $1")
            .bind(booking_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn booking_holds(&self, booking_id: Uuid) -> BillingResult<Vec<GuestPassHold>> {
        let rows: Vec<(Uuid, String, Uuid, i32, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT id, member_email, booking_id, passes_held, expires_at
            FROM guest_pass_holds
            WHERE booking_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, member_email, booking_id, passes, expires_at)| GuestPassHold {
                id,
                member_email,
                booking_id,
                passes_held: to_u32(i64::from(passes)),
                expires_at,
            })
            .collect())
    }

    async fn convert_holds(
        &self,
        booking_id: Uuid,
        member_email: &str,
        period_start: Date,
        allowance: u32,
    ) -> BillingResult<u32> {
        let email = normalize_email(member_email);
        let mut tx = self.pool.begin().await?;

        let used = Self::lock_guest_pass_row(&mut tx, &email, period_start, allowance).await?;

        let released: Vec<(i32,)> = sqlx::query_as(
            r#"
            DELETE FROM guest_pass_holds
            WHERE booking_id = $1 AND member_email = $2
            RETURNING passes_held
            "#,
        )
        .bind(booking_id)
        .bind(&email)
        .fetch_all(&mut *tx)
        .await?;

        let converting: u32 = released
            .iter()
            .map(|(passes,)| to_u32(i64::from(*passes)))
            .sum();
        if converting == 0 {
            tx.commit().await?;
            return Ok(0);
        }

        check_conversion(used, allowance, converting)?;

        sqlx::query(
            r#"
            UPDATE guest_passes
            SET passes_used = passes_used + $3, updated_at = NOW()
            WHERE member_email = $1 AND period_start = $2
            "#,
        )
        .bind(&email)
        .bind(period_start)
        .bind(to_i32(converting))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(converting)
    }

    async fn delete_expired_holds(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM guest_pass_holds h
            WHERE h.expires_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM fee_snapshots f
                  WHERE f.booking_id = h.booking_id AND f.status = 'pending'
              )
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PaymentStore for PgLedgerStore {
    async fn record_payment_intent(
        &self,
        intent: &NewPaymentIntent,
        snapshot: &NewFeeSnapshot,
    ) -> BillingResult<FeeSnapshot> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payment_intents
                (id, stripe_payment_intent_id, booking_id, session_id, amount_cents, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (stripe_payment_intent_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&intent.stripe_payment_intent_id)
        .bind(intent.booking_id)
        .bind(intent.session_id)
        .bind(intent.amount_cents)
        .bind(&intent.status)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO fee_snapshots
                (id, stripe_payment_intent_id, booking_id, session_id, status,
                 total_cents, participant_fees)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            ON CONFLICT (stripe_payment_intent_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&intent.stripe_payment_intent_id)
        .bind(snapshot.booking_id)
        .bind(snapshot.session_id)
        .bind(snapshot.total_cents)
        .bind(Json(&snapshot.participant_fees))
        .execute(&mut *tx)
        .await?;

        let row: SnapshotRow = sqlx::query_as(&format!(
            "SELECT {} FROM fee_snapshots WHERE stripe_payment_intent_id = $1",
            SNAPSHOT_COLUMNS
        ))
        .bind(&intent.stripe_payment_intent_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn apply_transition(
        &self,
        request: &TransitionRequest,
    ) -> BillingResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;

        let row: Option<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT {} FROM fee_snapshots WHERE stripe_payment_intent_id = $1 FOR UPDATE",
            SNAPSHOT_COLUMNS
        ))
        .bind(&request.payment_intent_id)
        .fetch_optional(&mut *tx)
        .await?;
        let snapshot = row.map(FeeSnapshot::try_from).transpose()?;

        let mut statuses = HashMap::new();
        if let Some(snapshot) = &snapshot {
            let ids: Vec<Uuid> = snapshot
                .participant_fees
                .iter()
                .filter_map(|line| line.participant_id)
                .collect();

            if !ids.is_empty() {
                let rows: Vec<(Uuid, String)> = sqlx::query_as(
                    r#"
                    SELECT id, payment_status FROM booking_participants
                    WHERE id = ANY($1)
                    ORDER BY id
                    FOR UPDATE
                    "#,
                )
                .bind(&ids)
                .fetch_all(&mut *tx)
                .await?;

                for (id, status) in rows {
                    statuses.insert(id, ParticipantPaymentStatus::from_str(&status)?);
                }
            }
        }

        let plan = plan_transition(snapshot.as_ref(), &statuses, &request.transition);

        if let (Some(status), Some(current)) = (plan.snapshot_status, &snapshot) {
            sqlx::query("UPDATE fee_snapshots SET status = $1, updated_at = NOW() WHERE id = $2")
                .bind(status.as_str())
                .bind(current.id)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(intent_status) = plan.intent_status {
            sqlx::query(
                r#"
                UPDATE payment_intents
                SET status = $1,
                    failure_reason = COALESCE($2, failure_reason),
                    updated_at = NOW()
                WHERE stripe_payment_intent_id = $3
                "#,
            )
            .bind(intent_status)
            .bind(plan.failure_reason.as_deref())
            .bind(&request.payment_intent_id)
            .execute(&mut *tx)
            .await?;
        }

        for change in &plan.participant_changes {
            sqlx::query("UPDATE booking_participants SET payment_status = $1 WHERE id = $2")
                .bind(change.next.as_str())
                .bind(change.participant_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO booking_payment_audit
                    (booking_id, session_id, participant_id, action, staff_email, staff_name,
                     amount_affected, previous_status, new_status, stripe_payment_intent_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(snapshot.as_ref().and_then(|s| s.booking_id))
            .bind(snapshot.as_ref().and_then(|s| s.session_id))
            .bind(change.participant_id)
            .bind(plan.audit_action)
            .bind(&request.actor.email)
            .bind(request.actor.name.as_deref())
            .bind(change.amount_cents)
            .bind(change.previous.as_str())
            .bind(change.next.as_str())
            .bind(&request.payment_intent_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(|e| {
            BillingError::TransactionFailure(format!(
                "commit for {} failed: {}",
                request.payment_intent_id, e
            ))
        })?;

        Ok(plan.outcome(request, snapshot.as_ref()))
    }

    async fn mirror_intent_status(
        &self,
        payment_intent_id: &str,
        status: &str,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool> {
        let found: Option<(bool,)> = sqlx::query_as(
            r#"
            WITH target AS (
                SELECT id, status FROM payment_intents
                WHERE stripe_payment_intent_id = $3
                FOR UPDATE
            ),
            updated AS (
                UPDATE payment_intents p
                SET status = $1,
                    failure_reason = COALESCE($2, p.failure_reason),
                    updated_at = NOW()
                FROM target
                WHERE p.id = target.id AND NOT (target.status = ANY($4))
                RETURNING p.id
            )
            SELECT EXISTS (SELECT 1 FROM updated) FROM target
            "#,
        )
        .bind(status)
        .bind(failure_reason)
        .bind(payment_intent_id)
        .bind(status_list(TERMINAL_INTENT_STATUSES))
        .fetch_optional(&self.pool)
        .await?;

        if let Some((false,)) = found {
            tracing::debug!(
                payment_intent_id = %payment_intent_id,
                status = %status,
                "Intent mirror already terminal, keeping it"
            );
        }
        Ok(found.is_some())
    }

    async fn fee_snapshot(&self, payment_intent_id: &str) -> BillingResult<Option<FeeSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT {} FROM fee_snapshots WHERE stripe_payment_intent_id = $1",
            SNAPSHOT_COLUMNS
        ))
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FeeSnapshot::try_from).transpose()
    }

    async fn payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>> {
        let row: Option<IntentRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_payment_intent_id, booking_id, session_id, amount_cents,
                   status, failure_reason, created_at, updated_at
            FROM payment_intents
            WHERE stripe_payment_intent_id = $1
            "#,
        )
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PaymentIntentRecord::from))
    }

    async fn audit_trail(&self, booking_id: Uuid) -> BillingResult<Vec<PaymentAuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT booking_id, session_id, participant_id, action, staff_email, staff_name,
                   amount_affected, previous_status, new_status, stripe_payment_intent_id,
                   created_at
            FROM booking_payment_audit
            WHERE booking_id = $1
            ORDER BY id
            "#,
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PaymentAuditEntry {
                booking_id: row.booking_id,
                session_id: row.session_id,
                participant_id: row.participant_id,
                action: row.action,
                staff_email: row.staff_email,
                staff_name: row.staff_name,
                amount_affected_cents: row.amount_affected,
                previous_status: row.previous_status,
                new_status: row.new_status,
                stripe_payment_intent_id: row.stripe_payment_intent_id,
                created_at: row.created_at,
            })
            .collect())
    }
}

fn status_list(statuses: &[&str]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ReconciliationStore for PgLedgerStore {
    async fn stale_pending_snapshots(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PendingSnapshotRef>> {
        let rows: Vec<PendingSnapshotRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_payment_intent_id, booking_id, created_at
            FROM fee_snapshots
            WHERE status = 'pending'
              AND stripe_payment_intent_id IS NOT NULL
              AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PendingSnapshotRef {
                snapshot_id: row.id,
                payment_intent_id: row.stripe_payment_intent_id,
                booking_id: row.booking_id,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn abandoned_intents(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<IntentRef>> {
        let rows: Vec<IntentRefRow> = sqlx::query_as(
            r#"
            SELECT stripe_payment_intent_id, booking_id, status, created_at
            FROM payment_intents
            WHERE status = ANY($1)
              AND created_at < $2
            ORDER BY created_at
            LIMIT $3
            "#,
        )
        .bind(status_list(PENDING_INTENT_STATUSES))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| IntentRef {
                payment_intent_id: row.stripe_payment_intent_id,
                booking_id: row.booking_id,
                status: row.status,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn long_pending_intents(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<LongPendingIntent>> {
        let rows: Vec<LongPendingRow> = sqlx::query_as(
            r#"
            SELECT pi.stripe_payment_intent_id, pi.booking_id,
                   b.status AS booking_status, pi.created_at
            FROM payment_intents pi
            LEFT JOIN bookings b ON b.id = pi.booking_id
            WHERE pi.status = ANY($1)
              AND pi.created_at < $2
            ORDER BY pi.created_at
            LIMIT $3
            "#,
        )
        .bind(status_list(LONG_PENDING_INTENT_STATUSES))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LongPendingIntent {
                payment_intent_id: row.stripe_payment_intent_id,
                booking_id: row.booking_id,
                booking_status: row.booking_status.as_deref().map(BookingStatus::parse),
                created_at: row.created_at,
            })
            .collect())
    }
}

#[async_trait]
impl WebhookEventStore for PgLedgerStore {
    async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Reclaimed from ', stripe_webhook_events.processing_result, ' at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $3))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(if success { "success" } else { "error" })
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
