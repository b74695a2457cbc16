//! Shared fixtures for unit and scenario tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use clubhouse_shared::TierCatalog;

use crate::config::ReconciliationSettings;
use crate::error::{BillingError, BillingResult, ProcessorErrorCode};
use crate::fees::FeeBreakdownComputer;
use crate::guest_passes::GuestPassAllocator;
use crate::health::InMemoryJobHealth;
use crate::intents::BookingPaymentService;
use crate::ledger::PaymentStatusLedger;
use crate::member_cache::{MemberTierCache, TierResolver};
use crate::model::{
    BookingSession, NewParticipant, Participant, ParticipantPaymentStatus, ParticipantType,
    RosterVersion, StaffActor,
};
use crate::notify::{BookingEventSink, NoopEventSink};
use crate::overage::OverageRates;
use crate::processor::{CreateIntentRequest, PaymentProcessor, ProcessorIntent, ProcessorIntentStatus};
use crate::reconcile::ReconciliationService;
use crate::roster::RosterGuard;
use crate::store::{
    InMemoryLedgerStore, IntentRef, LongPendingIntent, PendingSnapshotRef, ReconciliationStore,
};
use crate::webhooks::WebhookHandler;

#[derive(Default)]
struct FakeProcessorState {
    intents: HashMap<String, ProcessorIntent>,
    by_idempotency_key: HashMap<String, String>,
    retrieve_failures: HashMap<String, ProcessorErrorCode>,
    cancel_failures: HashMap<String, ProcessorErrorCode>,
    created: Vec<CreateIntentRequest>,
    retrieve_calls: usize,
    cancel_calls: usize,
}

/// Scripted stand-in for the Stripe adapter
#[derive(Default)]
pub struct FakeProcessor {
    state: Mutex<FakeProcessorState>,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_requests(&self) -> Vec<CreateIntentRequest> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn fail_retrieve(&self, payment_intent_id: &str, code: ProcessorErrorCode) {
        self.state
            .lock()
            .unwrap()
            .retrieve_failures
            .insert(payment_intent_id.to_string(), code);
    }

    pub fn fail_cancel(&self, payment_intent_id: &str, code: ProcessorErrorCode) {
        self.state
            .lock()
            .unwrap()
            .cancel_failures
            .insert(payment_intent_id.to_string(), code);
    }

    pub fn set_status(&self, payment_intent_id: &str, status: ProcessorIntentStatus) {
        let mut state = self.state.lock().unwrap();
        let intent = state
            .intents
            .entry(payment_intent_id.to_string())
            .or_insert_with(|| ProcessorIntent {
                id: payment_intent_id.to_string(),
                status: ProcessorIntentStatus::RequiresPaymentMethod,
                amount_cents: 0,
            });
        intent.status = status;
    }

    pub fn retrieve_calls(&self) -> usize {
        self.state.lock().unwrap().retrieve_calls
    }

    pub fn cancel_calls(&self) -> usize {
        self.state.lock().unwrap().cancel_calls
    }
}

fn scripted_error(code: &ProcessorErrorCode, payment_intent_id: &str) -> BillingError {
    BillingError::processor(code.clone(), format!("scripted failure for {}", payment_intent_id))
}

fn missing(payment_intent_id: &str) -> BillingError {
    BillingError::processor(
        ProcessorErrorCode::ResourceMissing,
        format!("No such payment_intent: '{}'", payment_intent_id),
    )
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<ProcessorIntent> {
        let mut state = self.state.lock().unwrap();
        state.retrieve_calls += 1;
        if let Some(code) = state.retrieve_failures.get(payment_intent_id) {
            return Err(scripted_error(code, payment_intent_id));
        }
        state
            .intents
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| missing(payment_intent_id))
    }

    async fn cancel_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<ProcessorIntent> {
        let mut state = self.state.lock().unwrap();
        state.cancel_calls += 1;
        if let Some(code) = state.cancel_failures.get(payment_intent_id) {
            return Err(scripted_error(code, payment_intent_id));
        }
        let intent = state
            .intents
            .get_mut(payment_intent_id)
            .ok_or_else(|| missing(payment_intent_id))?;
        intent.status = ProcessorIntentStatus::Canceled;
        Ok(intent.clone())
    }

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> BillingResult<ProcessorIntent> {
        let mut state = self.state.lock().unwrap();
        state.created.push(request.clone());

        if let Some(existing) = state
            .by_idempotency_key
            .get(&request.idempotency_key)
            .and_then(|id| state.intents.get(id))
        {
            return Ok(existing.clone());
        }

        let id = format!("pi_test_{}", state.by_idempotency_key.len() + 1);
        let intent = ProcessorIntent {
            id: id.clone(),
            status: ProcessorIntentStatus::RequiresPaymentMethod,
            amount_cents: request.amount_cents,
        };
        state
            .by_idempotency_key
            .insert(request.idempotency_key.clone(), id.clone());
        state.intents.insert(id, intent.clone());
        Ok(intent)
    }
}

/// Reconciliation queries that always fail, for health bookkeeping tests
struct FailingReconciliationStore;

#[async_trait]
impl ReconciliationStore for FailingReconciliationStore {
    async fn stale_pending_snapshots(
        &self,
        _created_before: OffsetDateTime,
        _limit: i64,
    ) -> BillingResult<Vec<PendingSnapshotRef>> {
        Err(BillingError::Database("connection refused".into()))
    }

    async fn abandoned_intents(
        &self,
        _created_before: OffsetDateTime,
        _limit: i64,
    ) -> BillingResult<Vec<IntentRef>> {
        Err(BillingError::Database("connection refused".into()))
    }

    async fn long_pending_intents(
        &self,
        _created_before: OffsetDateTime,
        _limit: i64,
    ) -> BillingResult<Vec<LongPendingIntent>> {
        Err(BillingError::Database("connection refused".into()))
    }
}

pub fn owner(email: &str) -> Participant {
    participant(Some(email), email, ParticipantType::Owner)
}

pub fn member(email: &str) -> Participant {
    participant(Some(email), email, ParticipantType::Member)
}

pub fn guest(name: &str) -> Participant {
    participant(None, name, ParticipantType::Guest)
}

fn participant(email: Option<&str>, name: &str, kind: ParticipantType) -> Participant {
    Participant {
        id: Uuid::new_v4(),
        user_id: None,
        email: email.map(str::to_string),
        display_name: name.to_string(),
        participant_type: kind,
        cached_fee_cents: 0,
        payment_status: ParticipantPaymentStatus::Pending,
    }
}

pub fn new_guest(name: &str) -> NewParticipant {
    NewParticipant {
        user_id: None,
        email: None,
        display_name: name.to_string(),
        participant_type: ParticipantType::Guest,
    }
}

pub fn new_member(email: &str) -> NewParticipant {
    NewParticipant {
        user_id: Some(Uuid::new_v4()),
        email: Some(email.to_string()),
        display_name: email.to_string(),
        participant_type: ParticipantType::Member,
    }
}

pub fn system_actor() -> StaffActor {
    StaffActor::new("system@clubhouse.local", Some("Reconciliation".into()))
}

/// Every ledger service wired to one in-memory store
pub struct Fixture {
    pub store: Arc<InMemoryLedgerStore>,
    pub processor: Arc<FakeProcessor>,
    pub health: Arc<InMemoryJobHealth>,
    pub fees: FeeBreakdownComputer,
    pub guest_passes: GuestPassAllocator,
    pub roster: RosterGuard,
    pub ledger: PaymentStatusLedger,
    pub payments: BookingPaymentService,
    pub reconcile: ReconciliationService,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn failing_reconciliation() -> Self {
        Self::build(Some(Arc::new(FailingReconciliationStore)))
    }

    fn build(reconciliation: Option<Arc<dyn ReconciliationStore>>) -> Self {
        let events: Arc<dyn BookingEventSink> = Arc::new(NoopEventSink);
        let store = Arc::new(InMemoryLedgerStore::new());
        let processor = Arc::new(FakeProcessor::new());
        let health = Arc::new(InMemoryJobHealth::new());

        let tiers = TierResolver::new(
            store.clone(),
            Arc::new(TierCatalog::standard()),
            MemberTierCache::new(Duration::from_secs(300), 100),
        );
        let fees = FeeBreakdownComputer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            tiers.clone(),
            OverageRates::default(),
            events.clone(),
        );
        let guest_passes = GuestPassAllocator::new(
            store.clone(),
            tiers.clone(),
            time::Duration::minutes(30),
            events.clone(),
        );
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
        let reconciliation: Arc<dyn ReconciliationStore> = match reconciliation {
            Some(failing) => failing,
            None => store.clone(),
        };
        let reconcile = ReconciliationService::new(
            reconciliation,
            processor.clone(),
            ledger.clone(),
            guest_passes.clone(),
            health.clone(),
            ReconciliationSettings::default(),
            system_actor(),
        );

        Self {
            store,
            processor,
            health,
            fees,
            guest_passes,
            roster,
            ledger,
            payments,
            reconcile,
        }
    }

    pub fn webhook_handler(&self, secret: &str) -> WebhookHandler {
        WebhookHandler::new(secret, self.ledger.clone(), self.store.clone(), system_actor())
    }

    /// Store a session with a fresh booking; the host is the owner if present
    pub async fn seed_session(
        &self,
        session_date: Date,
        duration_minutes: u32,
        participants: Vec<Participant>,
    ) -> BookingSession {
        let host_email = participants
            .iter()
            .find(|p| p.participant_type == ParticipantType::Owner)
            .and_then(|p| p.email.clone())
            .unwrap_or_else(|| "host@club.test".to_string());

        let session = BookingSession {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            session_date,
            duration_minutes,
            declared_player_count: None,
            host_email,
            roster_version: RosterVersion::INITIAL,
            participants,
        };
        self.store.insert_session(session.clone()).await;
        session
    }
}
