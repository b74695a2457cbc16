//! In-memory ledger store
//!
//! One mutex guards all state, so every trait call is atomic and calls are
//! serialized exactly the way row locks serialize them in Postgres. Seeding
//! and inspection helpers exist for tests and local tooling.

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
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
};
use crate::roster::{validate_addition, validate_removal};

#[derive(Debug, Clone)]
struct BookingRecord {
    status: BookingStatus,
}

#[derive(Debug, Clone, Copy, Default)]
struct PassRow {
    used: u32,
    total: u32,
}

/// Unexpired, or backing a payment that hasn't resolved yet
fn hold_is_live(
    hold: &GuestPassHold,
    snapshots: &HashMap<String, FeeSnapshot>,
    now: OffsetDateTime,
) -> bool {
    hold.expires_at > now
        || snapshots.values().any(|s| {
            s.booking_id == Some(hold.booking_id) && s.status == FeeSnapshotStatus::Pending
        })
}

#[derive(Debug, Default)]
struct MemoryState {
    member_tiers: HashMap<String, String>,
    bookings: HashMap<Uuid, BookingRecord>,
    sessions: HashMap<Uuid, BookingSession>,
    participant_usage: HashMap<Uuid, u32>,
    snapshots: HashMap<String, FeeSnapshot>,
    intents: HashMap<String, PaymentIntentRecord>,
    audit: Vec<PaymentAuditEntry>,
    guest_passes: HashMap<(String, Date), PassRow>,
    holds: Vec<GuestPassHold>,
    webhook_events: HashMap<String, String>,
}

impl MemoryState {
    fn session_mut(&mut self, session_id: Uuid) -> BillingResult<&mut BookingSession> {
        self.sessions
            .get_mut(&session_id)
            .ok_or_else(|| BillingError::NotFound(format!("Booking session {}", session_id)))
    }

    fn booking_is_live(&self, booking_id: Uuid) -> bool {
        self.bookings
            .get(&booking_id)
            .map(|b| !b.status.is_terminal_negative())
            .unwrap_or(true)
    }

    fn active_holds(&self, email: &str, now: OffsetDateTime, exclude_booking: Option<Uuid>) -> u32 {
        self.holds
            .iter()
            .filter(|h| h.member_email == email && hold_is_live(h, &self.snapshots, now))
            .filter(|h| Some(h.booking_id) != exclude_booking)
            .map(|h| h.passes_held)
            .sum()
    }

    fn participant_statuses(
        &self,
        session_id: Option<Uuid>,
    ) -> HashMap<Uuid, ParticipantPaymentStatus> {
        self.sessions
            .values()
            .filter(|s| session_id.map_or(true, |id| s.id == id))
            .flat_map(|s| s.participants.iter())
            .map(|p| (p.id, p.payment_status))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_member_tier(&self, email: &str, tier: &str) {
        self.state
            .lock()
            .await
            .member_tiers
            .insert(normalize_email(email), tier.to_string());
    }

    pub async fn insert_booking(&self, booking_id: Uuid, status: BookingStatus) {
        self.state
            .lock()
            .await
            .bookings
            .insert(booking_id, BookingRecord { status });
    }

    pub async fn set_booking_status(&self, booking_id: Uuid, status: BookingStatus) {
        self.insert_booking(booking_id, status).await;
    }

    pub async fn insert_session(&self, session: BookingSession) {
        let mut state = self.state.lock().await;
        state
            .bookings
            .entry(session.booking_id)
            .or_insert(BookingRecord {
                status: BookingStatus::Approved,
            });
        state.sessions.insert(session.id, session);
    }

    /// Billed minutes recorded on a participant (seeds prior daily usage)
    pub async fn set_participant_usage(&self, participant_id: Uuid, minutes: u32) {
        self.state
            .lock()
            .await
            .participant_usage
            .insert(participant_id, minutes);
    }

    pub async fn participant_usage(&self, participant_id: Uuid) -> Option<u32> {
        self.state
            .lock()
            .await
            .participant_usage
            .get(&participant_id)
            .copied()
    }

    pub async fn set_guest_passes_used(&self, email: &str, period_start: Date, used: u32) {
        let mut state = self.state.lock().await;
        state
            .guest_passes
            .entry((normalize_email(email), period_start))
            .or_default()
            .used = used;
    }

    pub async fn participant(&self, participant_id: Uuid) -> Option<Participant> {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .flat_map(|s| s.participants.iter())
            .find(|p| p.id == participant_id)
            .cloned()
    }

    pub async fn audit_entries(&self) -> Vec<PaymentAuditEntry> {
        self.state.lock().await.audit.clone()
    }

    pub async fn holds_for(&self, email: &str) -> Vec<GuestPassHold> {
        let email = normalize_email(email);
        self.state
            .lock()
            .await
            .holds
            .iter()
            .filter(|h| h.member_email == email)
            .cloned()
            .collect()
    }

    /// Move a recorded intent and its snapshot back in time
    pub async fn backdate_payment(&self, payment_intent_id: &str, created_at: OffsetDateTime) {
        let mut state = self.state.lock().await;
        if let Some(snapshot) = state.snapshots.get_mut(payment_intent_id) {
            snapshot.created_at = created_at;
        }
        if let Some(intent) = state.intents.get_mut(payment_intent_id) {
            intent.created_at = created_at;
        }
    }

    /// Push a booking's holds past their expiry
    pub async fn expire_holds(&self, booking_id: Uuid) {
        let expired = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        for hold in self.state.lock().await.holds.iter_mut() {
            if hold.booking_id == booking_id {
                hold.expires_at = expired;
            }
        }
    }

    /// Insert a bare intent mirror row with no snapshot
    pub async fn insert_intent(&self, record: PaymentIntentRecord) {
        self.state
            .lock()
            .await
            .intents
            .insert(record.stripe_payment_intent_id.clone(), record);
    }

    /// Force a snapshot status, bypassing the ledger (for drift scenarios)
    pub async fn force_snapshot_status(&self, payment_intent_id: &str, status: FeeSnapshotStatus) {
        if let Some(snapshot) = self.state.lock().await.snapshots.get_mut(payment_intent_id) {
            snapshot.status = status;
        }
    }
}

#[async_trait]
impl MemberStore for InMemoryLedgerStore {
    async fn member_tier(&self, email: &str) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .member_tiers
            .get(&normalize_email(email))
            .cloned())
    }
}

#[async_trait]
impl UsageStore for InMemoryLedgerStore {
    async fn minutes_used_on(
        &self,
        email: &str,
        date: Date,
        exclude_session: Option<Uuid>,
    ) -> BillingResult<u32> {
        let state = self.state.lock().await;
        let email = normalize_email(email);

        let minutes = state
            .sessions
            .values()
            .filter(|s| s.session_date == date && Some(s.id) != exclude_session)
            .filter(|s| state.booking_is_live(s.booking_id))
            .flat_map(|s| s.participants.iter())
            .filter(|p| p.participant_type != ParticipantType::Guest)
            .filter(|p| p.email.as_deref().map(normalize_email).as_deref() == Some(email.as_str()))
            .map(|p| state.participant_usage.get(&p.id).copied().unwrap_or(0))
            .sum();

        Ok(minutes)
    }
}

#[async_trait]
impl SessionStore for InMemoryLedgerStore {
    async fn load_session(&self, session_id: Uuid) -> BillingResult<Option<BookingSession>> {
        Ok(self.state.lock().await.sessions.get(&session_id).cloned())
    }

    async fn load_session_by_booking(
        &self,
        booking_id: Uuid,
    ) -> BillingResult<Option<BookingSession>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.booking_id == booking_id)
            .min_by_key(|s| (s.session_date, s.id))
            .cloned())
    }

    async fn apply_participant_fees(
        &self,
        session_id: Uuid,
        updates: &[ParticipantFeeUpdate],
    ) -> BillingResult<usize> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;

        // Validate everything before writing anything
        if let Some(missing) = updates
            .iter()
            .find(|u| !session.participants.iter().any(|p| p.id == u.participant_id))
        {
            return Err(BillingError::NotFound(format!(
                "Participant {} in session {}",
                missing.participant_id, session_id
            )));
        }

        for update in updates {
            if let Some(p) = session
                .participants
                .iter_mut()
                .find(|p| p.id == update.participant_id)
            {
                p.cached_fee_cents = update.cached_fee_cents;
            }
        }
        for update in updates {
            state
                .participant_usage
                .insert(update.participant_id, update.usage_minutes);
        }

        Ok(updates.len())
    }
}

#[async_trait]
impl RosterStore for InMemoryLedgerStore {
    async fn add_participant(
        &self,
        session_id: Uuid,
        participant: NewParticipant,
        client_version: Option<RosterVersion>,
    ) -> BillingResult<RosterChange> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;

        check_roster_version(session.roster_version, client_version)?;
        validate_addition(&session.participants, &participant)?;

        let participant_id = Uuid::new_v4();
        session.participants.push(Participant {
            id: participant_id,
            user_id: participant.user_id,
            email: participant.email.map(|e| normalize_email(&e)),
            display_name: participant.display_name,
            participant_type: participant.participant_type,
            cached_fee_cents: 0,
            payment_status: ParticipantPaymentStatus::Pending,
        });
        session.roster_version = session.roster_version.next();

        Ok(RosterChange {
            session_id,
            participant_id,
            roster_version: session.roster_version,
        })
    }

    async fn remove_participant(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
        client_version: Option<RosterVersion>,
    ) -> BillingResult<RosterChange> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;

        check_roster_version(session.roster_version, client_version)?;
        validate_removal(&session.participants, participant_id)?;

        session.participants.retain(|p| p.id != participant_id);
        session.roster_version = session.roster_version.next();
        let roster_version = session.roster_version;
        state.participant_usage.remove(&participant_id);

        Ok(RosterChange {
            session_id,
            participant_id,
            roster_version,
        })
    }
}

#[async_trait]
impl GuestPassStore for InMemoryLedgerStore {
    async fn usage(
        &self,
        member_email: &str,
        period_start: Date,
        allowance: u32,
        exclude_booking: Option<Uuid>,
    ) -> BillingResult<GuestPassUsage> {
        let state = self.state.lock().await;
        let email = normalize_email(member_email);
        let used = state
            .guest_passes
            .get(&(email.clone(), period_start))
            .map(|row| row.used)
            .unwrap_or(0);

        Ok(GuestPassUsage {
            allowance,
            used,
            held: state.active_holds(&email, OffsetDateTime::now_utc(), exclude_booking),
        })
    }

    async fn create_hold(&self, request: &HoldRequest) -> BillingResult<GuestPassHold> {
        let mut state = self.state.lock().await;
        let email = normalize_email(&request.member_email);
        let now = OffsetDateTime::now_utc();

        let held = state.active_holds(&email, now, None);
        let row = state
            .guest_passes
            .entry((email.clone(), request.period_start))
            .or_default();
        row.total = request.allowance;

        let usage = GuestPassUsage {
            allowance: request.allowance,
            used: row.used,
            held,
        };
        check_hold_available(&usage, request.passes)?;

        let hold = GuestPassHold {
            id: Uuid::new_v4(),
            member_email: email,
            booking_id: request.booking_id,
            passes_held: request.passes,
            expires_at: request.expires_at,
        };
        state.holds.push(hold.clone());
        Ok(hold)
    }

    async fn release_holds(&self, booking_id: Uuid) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.holds.len();
        state.holds.retain(|h| h.booking_id != booking_id);
        Ok((before - state.holds.len()) as u64)
    }

    async fn booking_holds(&self, booking_id: Uuid) -> BillingResult<Vec<GuestPassHold>> {
        Ok(self
            .state
            .lock()
            .await
            .holds
            .iter()
            .filter(|h| h.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn convert_holds(
        &self,
        booking_id: Uuid,
        member_email: &str,
        period_start: Date,
        allowance: u32,
    ) -> BillingResult<u32> {
        let mut state = self.state.lock().await;
        let email = normalize_email(member_email);

        let converting: u32 = state
            .holds
            .iter()
            .filter(|h| h.booking_id == booking_id && h.member_email == email)
            .map(|h| h.passes_held)
            .sum();
        if converting == 0 {
            return Ok(0);
        }

        let row = state
            .guest_passes
            .entry((email.clone(), period_start))
            .or_default();
        check_conversion(row.used, allowance, converting)?;
        row.used += converting;
        row.total = allowance;

        state
            .holds
            .retain(|h| !(h.booking_id == booking_id && h.member_email == email));
        Ok(converting)
    }

    async fn delete_expired_holds(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let before = state.holds.len();
        let snapshots = &state.snapshots;
        state.holds.retain(|h| hold_is_live(h, snapshots, now));
        Ok((before - state.holds.len()) as u64)
    }
}

#[async_trait]
impl PaymentStore for InMemoryLedgerStore {
    async fn record_payment_intent(
        &self,
        intent: &NewPaymentIntent,
        snapshot: &NewFeeSnapshot,
    ) -> BillingResult<FeeSnapshot> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.snapshots.get(&intent.stripe_payment_intent_id) {
            return Ok(existing.clone());
        }

        let now = OffsetDateTime::now_utc();
        state
            .intents
            .entry(intent.stripe_payment_intent_id.clone())
            .or_insert_with(|| PaymentIntentRecord {
                id: Uuid::new_v4(),
                stripe_payment_intent_id: intent.stripe_payment_intent_id.clone(),
                booking_id: intent.booking_id,
                session_id: intent.session_id,
                amount_cents: intent.amount_cents,
                status: intent.status.clone(),
                failure_reason: None,
                created_at: now,
                updated_at: now,
            });

        let record = FeeSnapshot {
            id: Uuid::new_v4(),
            stripe_payment_intent_id: intent.stripe_payment_intent_id.clone(),
            booking_id: snapshot.booking_id,
            session_id: snapshot.session_id,
            status: FeeSnapshotStatus::Pending,
            total_cents: snapshot.total_cents,
            participant_fees: snapshot.participant_fees.clone(),
            created_at: now,
            updated_at: now,
        };
        state
            .snapshots
            .insert(intent.stripe_payment_intent_id.clone(), record.clone());
        Ok(record)
    }

    async fn apply_transition(
        &self,
        request: &TransitionRequest,
    ) -> BillingResult<TransitionOutcome> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        let snapshot = state.snapshots.get(&request.payment_intent_id).cloned();
        let statuses = state.participant_statuses(snapshot.as_ref().and_then(|s| s.session_id));
        let plan = plan_transition(snapshot.as_ref(), &statuses, &request.transition);

        if let (Some(status), Some(current)) = (
            plan.snapshot_status,
            state.snapshots.get_mut(&request.payment_intent_id),
        ) {
            current.status = status;
            current.updated_at = now;
        }

        if let Some(intent_status) = plan.intent_status {
            if let Some(intent) = state.intents.get_mut(&request.payment_intent_id) {
                intent.status = intent_status.to_string();
                if plan.failure_reason.is_some() {
                    intent.failure_reason = plan.failure_reason.clone();
                }
                intent.updated_at = now;
            }
        }

        for change in &plan.participant_changes {
            if let Some(p) = state
                .sessions
                .values_mut()
                .flat_map(|s| s.participants.iter_mut())
                .find(|p| p.id == change.participant_id)
            {
                p.payment_status = change.next;
            }

            state.audit.push(PaymentAuditEntry {
                booking_id: snapshot.as_ref().and_then(|s| s.booking_id),
                session_id: snapshot.as_ref().and_then(|s| s.session_id),
                participant_id: Some(change.participant_id),
                action: plan.audit_action.to_string(),
                staff_email: request.actor.email.clone(),
                staff_name: request.actor.name.clone(),
                amount_affected_cents: change.amount_cents,
                previous_status: Some(change.previous.as_str().to_string()),
                new_status: change.next.as_str().to_string(),
                stripe_payment_intent_id: Some(request.payment_intent_id.clone()),
                created_at: now,
            });
        }

        Ok(plan.outcome(request, snapshot.as_ref()))
    }

    async fn mirror_intent_status(
        &self,
        payment_intent_id: &str,
        status: &str,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.intents.get_mut(payment_intent_id) {
            Some(intent) if TERMINAL_INTENT_STATUSES.contains(&intent.status.as_str()) => Ok(true),
            Some(intent) => {
                intent.status = status.to_string();
                if let Some(reason) = failure_reason {
                    intent.failure_reason = Some(reason.to_string());
                }
                intent.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fee_snapshot(&self, payment_intent_id: &str) -> BillingResult<Option<FeeSnapshot>> {
        Ok(self.state.lock().await.snapshots.get(payment_intent_id).cloned())
    }

    async fn payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<PaymentIntentRecord>> {
        Ok(self.state.lock().await.intents.get(payment_intent_id).cloned())
    }

    async fn audit_trail(&self, booking_id: Uuid) -> BillingResult<Vec<PaymentAuditEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .audit
            .iter()
            .filter(|a| a.booking_id == Some(booking_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReconciliationStore for InMemoryLedgerStore {
    async fn stale_pending_snapshots(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PendingSnapshotRef>> {
        let state = self.state.lock().await;
        let mut rows: Vec<PendingSnapshotRef> = state
            .snapshots
            .values()
            .filter(|s| s.status == FeeSnapshotStatus::Pending && s.created_at < created_before)
            .map(|s| PendingSnapshotRef {
                snapshot_id: s.id,
                payment_intent_id: s.stripe_payment_intent_id.clone(),
                booking_id: s.booking_id,
                created_at: s.created_at,
            })
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn abandoned_intents(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<IntentRef>> {
        let state = self.state.lock().await;
        let mut rows: Vec<IntentRef> = state
            .intents
            .values()
            .filter(|i| {
                PENDING_INTENT_STATUSES.contains(&i.status.as_str()) && i.created_at < created_before
            })
            .map(|i| IntentRef {
                payment_intent_id: i.stripe_payment_intent_id.clone(),
                booking_id: i.booking_id,
                status: i.status.clone(),
                created_at: i.created_at,
            })
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn long_pending_intents(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<LongPendingIntent>> {
        let state = self.state.lock().await;
        let mut rows: Vec<LongPendingIntent> = state
            .intents
            .values()
            .filter(|i| {
                LONG_PENDING_INTENT_STATUSES.contains(&i.status.as_str())
                    && i.created_at < created_before
            })
            .map(|i| LongPendingIntent {
                payment_intent_id: i.stripe_payment_intent_id.clone(),
                booking_id: i.booking_id,
                booking_status: i
                    .booking_id
                    .and_then(|id| state.bookings.get(&id))
                    .map(|b| b.status.clone()),
                created_at: i.created_at,
            })
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryLedgerStore {
    async fn claim_webhook_event(&self, event_id: &str, _event_type: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if let Some(result) = state.webhook_events.get(event_id) {
            if result != "error" {
                return Ok(false);
            }
        }
        state
            .webhook_events
            .insert(event_id.to_string(), "processing".to_string());
        Ok(true)
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        success: bool,
        _error_message: Option<&str>,
    ) -> BillingResult<()> {
        let result = if success { "success" } else { "error" };
        self.state
            .lock()
            .await
            .webhook_events
            .insert(event_id.to_string(), result.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn session_with(participants: Vec<Participant>) -> BookingSession {
        BookingSession {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            session_date: date!(2026 - 10 - 16),
            duration_minutes: 60,
            declared_player_count: None,
            host_email: "host@club.test".into(),
            roster_version: RosterVersion::INITIAL,
            participants,
        }
    }

    fn participant(email: &str, kind: ParticipantType) -> Participant {
        Participant {
            id: Uuid::new_v4(),
            user_id: None,
            email: Some(email.into()),
            display_name: email.into(),
            participant_type: kind,
            cached_fee_cents: 0,
            payment_status: ParticipantPaymentStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_usage_excludes_session_and_cancelled_bookings() {
        let store = InMemoryLedgerStore::new();
        let owner = participant("host@club.test", ParticipantType::Owner);
        let first = session_with(vec![owner.clone()]);
        store.insert_session(first.clone()).await;
        store.set_participant_usage(owner.id, 60).await;

        let other_owner = participant("HOST@club.test", ParticipantType::Owner);
        let cancelled = session_with(vec![other_owner.clone()]);
        store.insert_session(cancelled.clone()).await;
        store.set_participant_usage(other_owner.id, 45).await;
        store
            .set_booking_status(cancelled.booking_id, BookingStatus::Cancelled)
            .await;

        let day = date!(2026 - 10 - 16);
        assert_eq!(store.minutes_used_on("host@club.test", day, None).await.unwrap(), 60);
        assert_eq!(
            store
                .minutes_used_on("host@club.test", day, Some(first.id))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_fee_write_is_all_or_nothing() {
        let store = InMemoryLedgerStore::new();
        let owner = participant("host@club.test", ParticipantType::Owner);
        let session = session_with(vec![owner.clone()]);
        store.insert_session(session.clone()).await;

        let updates = [
            ParticipantFeeUpdate {
                participant_id: owner.id,
                cached_fee_cents: 2500,
                usage_minutes: 60,
            },
            ParticipantFeeUpdate {
                participant_id: Uuid::new_v4(),
                cached_fee_cents: 100,
                usage_minutes: 0,
            },
        ];
        let err = store
            .apply_participant_fees(session.id, &updates)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert_eq!(store.participant(owner.id).await.unwrap().cached_fee_cents, 0);
        assert_eq!(store.participant_usage(owner.id).await, None);
    }

    #[tokio::test]
    async fn test_release_without_holds_returns_zero() {
        let store = InMemoryLedgerStore::new();
        assert_eq!(store.release_holds(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_webhook_claim_is_exclusive() {
        let store = InMemoryLedgerStore::new();
        assert!(store.claim_webhook_event("evt_1", "payment_intent.succeeded").await.unwrap());
        assert!(!store.claim_webhook_event("evt_1", "payment_intent.succeeded").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_webhook_event_can_be_reclaimed() {
        let store = InMemoryLedgerStore::new();
        assert!(store.claim_webhook_event("evt_1", "charge.refunded").await.unwrap());
        store
            .finish_webhook_event("evt_1", false, Some("database unavailable"))
            .await
            .unwrap();
        assert!(store.claim_webhook_event("evt_1", "charge.refunded").await.unwrap());

        store.finish_webhook_event("evt_1", true, None).await.unwrap();
        assert!(!store.claim_webhook_event("evt_1", "charge.refunded").await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_intent_mirror_is_not_overwritten() {
        let store = InMemoryLedgerStore::new();
        let now = OffsetDateTime::now_utc();
        store
            .insert_intent(PaymentIntentRecord {
                id: Uuid::new_v4(),
                stripe_payment_intent_id: "pi_done".into(),
                booking_id: None,
                session_id: None,
                amount_cents: 2500,
                status: "succeeded".into(),
                failure_reason: None,
                created_at: now,
                updated_at: now,
            })
            .await;

        let found = store
            .mirror_intent_status("pi_done", "requires_payment_method", Some("card_declined"))
            .await
            .unwrap();
        assert!(found);
        let intent = store.payment_intent("pi_done").await.unwrap().unwrap();
        assert_eq!(intent.status, "succeeded");
        assert_eq!(intent.failure_reason, None);
    }
}
