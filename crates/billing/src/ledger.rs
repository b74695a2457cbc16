//! Payment Status Ledger
//!
//! The only code path allowed to move a fee snapshot, its participants or
//! the mirrored intent status. Each transition runs in one storage
//! transaction holding the snapshot row lock, so replays and concurrent
//! deliveries for the same intent serialize and the loser takes the
//! idempotent branch.
//!
//! ```text
//! pending ──► paid ──► refunded
//!    │
//!    ├──► refunded
//!    └──► cancelled
//! ```
//!
//! Once a booking's snapshot is paid its guest-pass holds become usage;
//! once it is cancelled or refunded they are released. Both steps also run
//! on an idempotent replay, so a retry finishes a settlement that failed
//! after the snapshot committed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::guest_passes::GuestPassAllocator;
use crate::model::{
    FeeSnapshot, FeeSnapshotStatus, ParticipantPaymentStatus, StaffActor,
};
use crate::notify::{publish_non_critical, BookingEventSink, BookingLedgerEvent};
use crate::store::{
    LedgerTransition, PaymentStore, TransitionDisposition, TransitionOutcome, TransitionRequest,
};

/// One participant flip decided by [`plan_transition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParticipantStatusChange {
    pub participant_id: Uuid,
    pub previous: ParticipantPaymentStatus,
    pub next: ParticipantPaymentStatus,
    pub amount_cents: i64,
}

/// Writes a store must perform, all inside one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransitionPlan {
    pub disposition: TransitionDisposition,
    pub snapshot_status: Option<FeeSnapshotStatus>,
    pub intent_status: Option<&'static str>,
    pub failure_reason: Option<String>,
    pub participant_changes: Vec<ParticipantStatusChange>,
    pub audit_action: &'static str,
}

impl TransitionPlan {
    fn unchanged(disposition: TransitionDisposition, audit_action: &'static str) -> Self {
        Self {
            disposition,
            snapshot_status: None,
            intent_status: None,
            failure_reason: None,
            participant_changes: Vec::new(),
            audit_action,
        }
    }

    pub fn outcome(&self, request: &TransitionRequest, snapshot: Option<&FeeSnapshot>) -> TransitionOutcome {
        let previous_status = snapshot.map(|s| s.status);
        TransitionOutcome {
            payment_intent_id: request.payment_intent_id.clone(),
            disposition: self.disposition,
            previous_status,
            snapshot_status: self.snapshot_status.or(previous_status),
            participants_updated: self.participant_changes.len(),
            booking_id: snapshot.and_then(|s| s.booking_id),
            session_id: snapshot.and_then(|s| s.session_id),
        }
    }
}

fn target_status(transition: &LedgerTransition) -> FeeSnapshotStatus {
    match transition {
        LedgerTransition::Succeeded => FeeSnapshotStatus::Paid,
        LedgerTransition::Refunded => FeeSnapshotStatus::Refunded,
        LedgerTransition::Cancelled { .. } => FeeSnapshotStatus::Cancelled,
    }
}

fn mirrored_intent_status(transition: &LedgerTransition) -> &'static str {
    match transition {
        LedgerTransition::Succeeded => "succeeded",
        LedgerTransition::Refunded => "refunded",
        LedgerTransition::Cancelled { .. } => "canceled",
    }
}

fn audit_action(transition: &LedgerTransition) -> &'static str {
    match transition {
        LedgerTransition::Succeeded => "payment_confirmed",
        LedgerTransition::Refunded => "payment_refunded",
        LedgerTransition::Cancelled { .. } => "payment_cancelled",
    }
}

/// Decide what a transition does given the locked snapshot and the current
/// payment status of its participants.
///
/// Lines whose participant id is missing or no longer on the roster are
/// skipped. Succeeded only flips `pending` participants; refunds flip every
/// resolvable participant regardless of prior status.
pub(crate) fn plan_transition(
    snapshot: Option<&FeeSnapshot>,
    participant_statuses: &HashMap<Uuid, ParticipantPaymentStatus>,
    transition: &LedgerTransition,
) -> TransitionPlan {
    let action = audit_action(transition);
    let failure_reason = match transition {
        LedgerTransition::Cancelled { reason } => reason.clone(),
        _ => None,
    };

    let Some(snapshot) = snapshot else {
        return TransitionPlan {
            disposition: TransitionDisposition::NoSnapshot,
            snapshot_status: None,
            intent_status: Some(mirrored_intent_status(transition)),
            failure_reason,
            participant_changes: Vec::new(),
            audit_action: action,
        };
    };

    let target = target_status(transition);
    if snapshot.status == target {
        return TransitionPlan::unchanged(TransitionDisposition::AlreadyApplied, action);
    }
    if !snapshot.status.can_transition_to(target) {
        return TransitionPlan::unchanged(TransitionDisposition::Conflict, action);
    }

    let mut statuses = participant_statuses.clone();
    let mut participant_changes = Vec::new();

    let next = match transition {
        LedgerTransition::Succeeded => Some(ParticipantPaymentStatus::Paid),
        LedgerTransition::Refunded => Some(ParticipantPaymentStatus::Refunded),
        // A cancelled intent never reached payment
        LedgerTransition::Cancelled { .. } => None,
    };

    if let Some(next) = next {
        for line in &snapshot.participant_fees {
            let Some(participant_id) = line.participant_id else {
                continue;
            };
            let Some(previous) = statuses.get(&participant_id).copied() else {
                continue;
            };

            let eligible = match transition {
                LedgerTransition::Succeeded => previous == ParticipantPaymentStatus::Pending,
                _ => true,
            };
            if !eligible {
                continue;
            }

            statuses.insert(participant_id, next);
            participant_changes.push(ParticipantStatusChange {
                participant_id,
                previous,
                next,
                amount_cents: line.amount_cents,
            });
        }
    }

    TransitionPlan {
        disposition: TransitionDisposition::Applied,
        snapshot_status: Some(target),
        intent_status: Some(mirrored_intent_status(transition)),
        failure_reason,
        participant_changes,
        audit_action: action,
    }
}

/// What `sync_from_stripe` ended up doing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncResult {
    Transitioned(TransitionOutcome),
    /// Non-terminal processor status copied onto the intent mirror
    Mirrored { status: String, intent_found: bool },
}

/// Applies payment processor outcomes to snapshots, participants and the audit log
#[derive(Clone)]
pub struct PaymentStatusLedger {
    store: Arc<dyn PaymentStore>,
    guest_passes: GuestPassAllocator,
    events: Arc<dyn BookingEventSink>,
}

impl PaymentStatusLedger {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        guest_passes: GuestPassAllocator,
        events: Arc<dyn BookingEventSink>,
    ) -> Self {
        Self {
            store,
            guest_passes,
            events,
        }
    }

    pub async fn mark_succeeded(
        &self,
        payment_intent_id: &str,
        actor: &StaffActor,
    ) -> BillingResult<TransitionOutcome> {
        self.transition(payment_intent_id, LedgerTransition::Succeeded, actor)
            .await
    }

    pub async fn mark_refunded(
        &self,
        payment_intent_id: &str,
        actor: &StaffActor,
    ) -> BillingResult<TransitionOutcome> {
        self.transition(payment_intent_id, LedgerTransition::Refunded, actor)
            .await
    }

    pub async fn mark_cancelled(
        &self,
        payment_intent_id: &str,
        reason: Option<&str>,
        actor: &StaffActor,
    ) -> BillingResult<TransitionOutcome> {
        self.transition(
            payment_intent_id,
            LedgerTransition::Cancelled {
                reason: reason.map(str::to_string),
            },
            actor,
        )
        .await
    }

    /// Apply whatever the processor says about an intent
    pub async fn sync_from_stripe(
        &self,
        payment_intent_id: &str,
        external_status: &str,
        actor: &StaffActor,
    ) -> BillingResult<SyncResult> {
        let outcome = match external_status {
            "succeeded" => self.mark_succeeded(payment_intent_id, actor).await?,
            "canceled" | "cancelled" => {
                self.mark_cancelled(payment_intent_id, Some("Canceled at processor"), actor)
                    .await?
            }
            "refunded" => self.mark_refunded(payment_intent_id, actor).await?,
            other => {
                let intent_found = self
                    .store
                    .mirror_intent_status(payment_intent_id, other, None)
                    .await?;
                tracing::debug!(
                    payment_intent_id = %payment_intent_id,
                    status = %other,
                    "Mirrored non-terminal processor status"
                );
                return Ok(SyncResult::Mirrored {
                    status: other.to_string(),
                    intent_found,
                });
            }
        };

        Ok(SyncResult::Transitioned(outcome))
    }

    /// Record a failed charge attempt without touching the snapshot
    pub async fn record_payment_failure(
        &self,
        payment_intent_id: &str,
        processor_status: &str,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool> {
        let found = self
            .store
            .mirror_intent_status(payment_intent_id, processor_status, failure_reason)
            .await?;

        tracing::info!(
            payment_intent_id = %payment_intent_id,
            status = %processor_status,
            failure_reason = ?failure_reason,
            "Recorded payment failure"
        );
        Ok(found)
    }

    async fn transition(
        &self,
        payment_intent_id: &str,
        transition: LedgerTransition,
        actor: &StaffActor,
    ) -> BillingResult<TransitionOutcome> {
        let request = TransitionRequest {
            payment_intent_id: payment_intent_id.to_string(),
            transition,
            actor: actor.clone(),
        };

        let outcome = self.store.apply_transition(&request).await.map_err(|e| {
            tracing::error!(
                payment_intent_id = %payment_intent_id,
                transition = ?request.transition,
                error = %e,
                "Payment status transition rolled back"
            );
            e
        })?;

        match outcome.disposition {
            TransitionDisposition::Applied => {
                tracing::info!(
                    payment_intent_id = %payment_intent_id,
                    previous_status = ?outcome.previous_status,
                    new_status = ?outcome.snapshot_status,
                    participants_updated = outcome.participants_updated,
                    actor = %actor.email,
                    "Applied payment status transition"
                );

                if let Some(status) = outcome.snapshot_status {
                    publish_non_critical(
                        self.events.as_ref(),
                        BookingLedgerEvent::PaymentStatusChanged {
                            payment_intent_id: payment_intent_id.to_string(),
                            booking_id: outcome.booking_id,
                            status,
                        },
                    )
                    .await;
                }
            }
            TransitionDisposition::AlreadyApplied => {
                tracing::info!(
                    payment_intent_id = %payment_intent_id,
                    status = ?outcome.snapshot_status,
                    "Payment status already applied, skipping"
                );
            }
            TransitionDisposition::Conflict => {
                tracing::warn!(
                    payment_intent_id = %payment_intent_id,
                    current_status = ?outcome.previous_status,
                    requested = ?request.transition,
                    "Ignoring transition out of a terminal snapshot status"
                );
            }
            TransitionDisposition::NoSnapshot => {
                tracing::info!(
                    payment_intent_id = %payment_intent_id,
                    "No fee snapshot for intent, mirrored intent status only"
                );
            }
        }

        self.settle_guest_passes(&request.transition, &outcome)
            .await
            .map_err(|e| {
                tracing::error!(
                    payment_intent_id = %payment_intent_id,
                    booking_id = ?outcome.booking_id,
                    error = %e,
                    "Failed to settle guest pass holds"
                );
                e
            })?;

        Ok(outcome)
    }

    async fn settle_guest_passes(
        &self,
        transition: &LedgerTransition,
        outcome: &TransitionOutcome,
    ) -> BillingResult<()> {
        let Some(booking_id) = outcome.booking_id else {
            return Ok(());
        };
        if !matches!(
            outcome.disposition,
            TransitionDisposition::Applied | TransitionDisposition::AlreadyApplied
        ) {
            return Ok(());
        }

        match transition {
            LedgerTransition::Succeeded => {
                self.guest_passes.convert_booking_holds(booking_id).await?;
            }
            LedgerTransition::Refunded | LedgerTransition::Cancelled { .. } => {
                self.guest_passes.release_hold(booking_id).await?;
            }
        }
        Ok(())
    }
}
