//! Reconciliation sweeps
//!
//! Three independent sweeps repair drift between the local ledger and the
//! processor: stale pending snapshots, abandoned intents and long-pending
//! intents. Each tick handles a bounded batch. A failing row is logged and
//! counted and the batch carries on; the row is retried on the next tick.
//! Every sweep reports to the job health recorder on its own.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::ReconciliationSettings;
use crate::error::{BillingResult, ProcessorErrorCode};
use crate::guest_passes::GuestPassAllocator;
use crate::health::{record_job_outcome, JobHealthRecorder};
use crate::ledger::PaymentStatusLedger;
use crate::model::StaffActor;
use crate::processor::{PaymentProcessor, ProcessorIntentStatus};
use crate::store::{IntentRef, LongPendingIntent, PendingSnapshotRef, ReconciliationStore};

pub const JOB_STALE_PENDING: &str = "reconcile_stale_pending_snapshots";
pub const JOB_ABANDONED_INTENTS: &str = "reconcile_abandoned_intents";
pub const JOB_LONG_PENDING: &str = "reconcile_long_pending_intents";
pub const JOB_HOLD_CLEANUP: &str = "guest_pass_hold_cleanup";
pub const JOB_INVARIANT_CHECK: &str = "ledger_invariant_check";

/// Counters for one sweep tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub job: &'static str,
    pub examined: usize,
    pub synced: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl SweepSummary {
    fn new(job: &'static str, examined: usize) -> Self {
        Self {
            job,
            examined,
            ..Default::default()
        }
    }

    fn count(&mut self, outcome: &BillingResult<RowOutcome>) {
        match outcome {
            Ok(RowOutcome::Synced) => self.synced += 1,
            Ok(RowOutcome::Cancelled) => self.cancelled += 1,
            Ok(RowOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    /// Processor state was applied through the ledger
    Synced,
    /// Cancelled locally or at the processor
    Cancelled,
    /// Nothing to do yet
    Skipped,
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn ReconciliationStore>,
    processor: Arc<dyn PaymentProcessor>,
    ledger: PaymentStatusLedger,
    guest_passes: GuestPassAllocator,
    health: Arc<dyn JobHealthRecorder>,
    settings: ReconciliationSettings,
    actor: StaffActor,
}

impl ReconciliationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ReconciliationStore>,
        processor: Arc<dyn PaymentProcessor>,
        ledger: PaymentStatusLedger,
        guest_passes: GuestPassAllocator,
        health: Arc<dyn JobHealthRecorder>,
        settings: ReconciliationSettings,
        actor: StaffActor,
    ) -> Self {
        Self {
            store,
            processor,
            ledger,
            guest_passes,
            health,
            settings,
            actor,
        }
    }

    pub fn settings(&self) -> &ReconciliationSettings {
        &self.settings
    }

    /// Pending snapshots older than the stale threshold
    pub async fn reconcile_stale_pending_snapshots(&self) -> BillingResult<SweepSummary> {
        let result = self.sweep_stale_pending().await;
        record_job_outcome(self.health.as_ref(), JOB_STALE_PENDING, &result).await;
        result
    }

    /// Customer never finished paying; cancel at the processor
    pub async fn reconcile_abandoned_intents(&self) -> BillingResult<SweepSummary> {
        let result = self.sweep_abandoned().await;
        record_job_outcome(self.health.as_ref(), JOB_ABANDONED_INTENTS, &result).await;
        result
    }

    /// Intents pending for days; the booking's fate decides
    pub async fn reconcile_long_pending_intents(&self) -> BillingResult<SweepSummary> {
        let result = self.sweep_long_pending().await;
        record_job_outcome(self.health.as_ref(), JOB_LONG_PENDING, &result).await;
        result
    }

    pub async fn cleanup_expired_holds(&self) -> BillingResult<u64> {
        let result = self.guest_passes.cleanup_expired_holds().await;
        record_job_outcome(self.health.as_ref(), JOB_HOLD_CLEANUP, &result).await;
        result
    }

    /// Run the three sweeps back to back; one failing doesn't stop the rest
    pub async fn run_all(&self) -> Vec<BillingResult<SweepSummary>> {
        vec![
            self.reconcile_stale_pending_snapshots().await,
            self.reconcile_abandoned_intents().await,
            self.reconcile_long_pending_intents().await,
        ]
    }

    fn cutoff(&self, age: time::Duration) -> OffsetDateTime {
        OffsetDateTime::now_utc() - age
    }

    async fn sweep_stale_pending(&self) -> BillingResult<SweepSummary> {
        let rows = self
            .store
            .stale_pending_snapshots(
                self.cutoff(self.settings.stale_pending_after),
                self.settings.batch_size,
            )
            .await?;

        let mut summary = SweepSummary::new(JOB_STALE_PENDING, rows.len());
        for row in &rows {
            let outcome = self.reconcile_pending_snapshot(row).await;
            if let Err(e) = &outcome {
                tracing::error!(
                    payment_intent_id = %row.payment_intent_id,
                    snapshot_id = %row.snapshot_id,
                    error = %e,
                    "Failed to reconcile pending snapshot"
                );
            }
            summary.count(&outcome);
        }

        log_summary(&summary);
        Ok(summary)
    }

    async fn reconcile_pending_snapshot(&self, row: &PendingSnapshotRef) -> BillingResult<RowOutcome> {
        let intent = match self.processor.retrieve_payment_intent(&row.payment_intent_id).await {
            Ok(intent) => intent,
            Err(e) if e.processor_code() == Some(&ProcessorErrorCode::ResourceMissing) => {
                tracing::warn!(
                    payment_intent_id = %row.payment_intent_id,
                    "Payment intent missing at processor, cancelling orphaned snapshot"
                );
                self.ledger
                    .mark_cancelled(
                        &row.payment_intent_id,
                        Some("Orphaned: payment intent not found at processor"),
                        &self.actor,
                    )
                    .await?;
                return Ok(RowOutcome::Cancelled);
            }
            Err(e) => return Err(e),
        };

        match intent.status {
            ProcessorIntentStatus::Succeeded => {
                self.ledger
                    .mark_succeeded(&row.payment_intent_id, &self.actor)
                    .await?;
                Ok(RowOutcome::Synced)
            }
            ProcessorIntentStatus::Canceled => {
                self.ledger
                    .mark_cancelled(
                        &row.payment_intent_id,
                        Some("Canceled at processor"),
                        &self.actor,
                    )
                    .await?;
                Ok(RowOutcome::Synced)
            }
            _ => Ok(RowOutcome::Skipped),
        }
    }

    async fn sweep_abandoned(&self) -> BillingResult<SweepSummary> {
        let rows = self
            .store
            .abandoned_intents(
                self.cutoff(self.settings.abandoned_after),
                self.settings.batch_size,
            )
            .await?;

        let mut summary = SweepSummary::new(JOB_ABANDONED_INTENTS, rows.len());
        for row in &rows {
            let outcome = self.cancel_abandoned(row).await;
            if let Err(e) = &outcome {
                tracing::error!(
                    payment_intent_id = %row.payment_intent_id,
                    status = %row.status,
                    error = %e,
                    "Failed to cancel abandoned intent, will retry next run"
                );
            }
            summary.count(&outcome);
        }

        log_summary(&summary);
        Ok(summary)
    }

    async fn cancel_abandoned(&self, row: &IntentRef) -> BillingResult<RowOutcome> {
        match self.processor.cancel_payment_intent(&row.payment_intent_id).await {
            Ok(_) => {
                self.ledger
                    .mark_cancelled(
                        &row.payment_intent_id,
                        Some("Abandoned: payment not completed"),
                        &self.actor,
                    )
                    .await?;
                tracing::info!(
                    payment_intent_id = %row.payment_intent_id,
                    "Cancelled abandoned payment intent"
                );
                Ok(RowOutcome::Cancelled)
            }
            Err(e) => match e.processor_code() {
                Some(ProcessorErrorCode::UnexpectedState) => {
                    // Already terminal at the processor; adopt its answer
                    let intent = self
                        .processor
                        .retrieve_payment_intent(&row.payment_intent_id)
                        .await?;
                    tracing::info!(
                        payment_intent_id = %row.payment_intent_id,
                        status = %intent.status,
                        "Abandoned intent already terminal at processor, syncing"
                    );
                    self.ledger
                        .sync_from_stripe(&row.payment_intent_id, intent.status.as_str(), &self.actor)
                        .await?;
                    Ok(RowOutcome::Synced)
                }
                Some(ProcessorErrorCode::ResourceMissing) => {
                    self.ledger
                        .mark_cancelled(
                            &row.payment_intent_id,
                            Some("Orphaned: payment intent not found at processor"),
                            &self.actor,
                        )
                        .await?;
                    Ok(RowOutcome::Cancelled)
                }
                _ => Err(e),
            },
        }
    }

    async fn sweep_long_pending(&self) -> BillingResult<SweepSummary> {
        let rows = self
            .store
            .long_pending_intents(
                self.cutoff(self.settings.long_pending_after),
                self.settings.batch_size,
            )
            .await?;

        let mut summary = SweepSummary::new(JOB_LONG_PENDING, rows.len());
        for row in &rows {
            let outcome = self.resolve_long_pending(row).await;
            if let Err(e) = &outcome {
                tracing::error!(
                    payment_intent_id = %row.payment_intent_id,
                    booking_id = ?row.booking_id,
                    error = %e,
                    "Failed to resolve long-pending intent"
                );
            }
            summary.count(&outcome);
        }

        log_summary(&summary);
        Ok(summary)
    }

    async fn resolve_long_pending(&self, row: &LongPendingIntent) -> BillingResult<RowOutcome> {
        let reason = match &row.booking_status {
            None => "Orphaned: no linked booking".to_string(),
            Some(status) if status.is_terminal_negative() => {
                format!("Booking {}", status.as_str())
            }
            Some(status) if status.is_terminal_positive() => {
                let intent = self
                    .processor
                    .retrieve_payment_intent(&row.payment_intent_id)
                    .await?;
                self.ledger
                    .sync_from_stripe(&row.payment_intent_id, intent.status.as_str(), &self.actor)
                    .await?;
                return Ok(RowOutcome::Synced);
            }
            Some(_) => return Ok(RowOutcome::Skipped),
        };

        // The booking already decided the outcome; no processor call needed
        self.ledger
            .mark_cancelled(&row.payment_intent_id, Some(&reason), &self.actor)
            .await?;
        tracing::info!(
            payment_intent_id = %row.payment_intent_id,
            reason = %reason,
            "Force-cancelled long-pending intent"
        );
        Ok(RowOutcome::Cancelled)
    }
}

fn log_summary(summary: &SweepSummary) {
    if summary.examined == 0 {
        tracing::debug!(job = summary.job, "Nothing to reconcile");
        return;
    }
    tracing::info!(
        job = summary.job,
        examined = summary.examined,
        synced = summary.synced,
        cancelled = summary.cancelled,
        skipped = summary.skipped,
        errors = summary.errors,
        "Reconciliation sweep finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::model::{BookingStatus, FeeSnapshotStatus, PaymentIntentRecord};
    use crate::store::PaymentStore;
    use crate::test_support::{owner, system_actor, Fixture};
    use uuid::Uuid;
    use time::macros::date;

    async fn issued_intent(fx: &Fixture, age: time::Duration) -> (String, uuid::Uuid) {
        let session = fx
            .seed_session(date!(2026 - 10 - 16), 90, vec![owner("host@club.test")])
            .await;
        let issued = fx.payments.issue_booking_payment(session.id, None).await.unwrap();
        fx.store
            .backdate_payment(&issued.payment_intent_id, OffsetDateTime::now_utc() - age)
            .await;
        (issued.payment_intent_id, session.booking_id)
    }

    #[tokio::test]
    async fn test_fresh_snapshots_are_left_alone() {
        let fx = Fixture::new();
        issued_intent(&fx, time::Duration::minutes(1)).await;

        let summary = fx.reconcile.reconcile_stale_pending_snapshots().await.unwrap();
        assert_eq!(summary.examined, 0);
    }

    #[tokio::test]
    async fn test_missing_intent_cancels_orphan() {
        let fx = Fixture::new();
        let (pi, _) = issued_intent(&fx, time::Duration::minutes(10)).await;
        fx.processor.fail_retrieve(&pi, ProcessorErrorCode::ResourceMissing);

        let summary = fx.reconcile.reconcile_stale_pending_snapshots().await.unwrap();
        assert_eq!(summary.cancelled, 1);
        let snapshot = fx.store.fee_snapshot(&pi).await.unwrap().unwrap();
        assert_eq!(snapshot.status, FeeSnapshotStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_one_bad_row_does_not_abort_batch() {
        let fx = Fixture::new();
        let (bad, _) = issued_intent(&fx, time::Duration::minutes(20)).await;
        let (good, _) = issued_intent(&fx, time::Duration::minutes(10)).await;
        fx.processor
            .fail_retrieve(&bad, ProcessorErrorCode::Other("http_500".into()));
        fx.processor.set_status(&good, ProcessorIntentStatus::Succeeded);

        let summary = fx.reconcile.reconcile_stale_pending_snapshots().await.unwrap();
        assert_eq!(summary.examined, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.synced, 1);

        let health = fx.health.get(JOB_STALE_PENDING).await.unwrap();
        assert!(health.last_success);
    }

    #[tokio::test]
    async fn test_abandoned_already_terminal_syncs() {
        let fx = Fixture::new();
        let (pi, _) = issued_intent(&fx, time::Duration::hours(3)).await;
        fx.processor
            .fail_cancel(&pi, ProcessorErrorCode::UnexpectedState);
        fx.processor.set_status(&pi, ProcessorIntentStatus::Succeeded);

        let summary = fx.reconcile.reconcile_abandoned_intents().await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(
            fx.store.fee_snapshot(&pi).await.unwrap().unwrap().status,
            FeeSnapshotStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_abandoned_cancel_failure_left_for_next_tick() {
        let fx = Fixture::new();
        let (pi, _) = issued_intent(&fx, time::Duration::hours(3)).await;
        fx.processor
            .fail_cancel(&pi, ProcessorErrorCode::Other("timeout".into()));

        let summary = fx.reconcile.reconcile_abandoned_intents().await.unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(
            fx.store.fee_snapshot(&pi).await.unwrap().unwrap().status,
            FeeSnapshotStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_long_pending_with_cancelled_booking_skips_processor() {
        let fx = Fixture::new();
        let (pi, booking_id) = issued_intent(&fx, time::Duration::days(8)).await;
        fx.store
            .set_booking_status(booking_id, BookingStatus::Cancelled)
            .await;

        let summary = fx.reconcile.reconcile_long_pending_intents().await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert_eq!(fx.processor.retrieve_calls(), 0);
        assert_eq!(fx.processor.cancel_calls(), 0);

        let intent = fx.store.payment_intent(&pi).await.unwrap().unwrap();
        assert_eq!(intent.status, "canceled");
        assert_eq!(intent.failure_reason.as_deref(), Some("Booking cancelled"));
    }

    #[tokio::test]
    async fn test_abandoned_intent_cancelled_at_processor() {
        let fx = Fixture::new();
        let (pi, _) = issued_intent(&fx, time::Duration::hours(3)).await;

        let summary = fx.reconcile.reconcile_abandoned_intents().await.unwrap();
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(fx.processor.cancel_calls(), 1);

        assert_eq!(
            fx.store.fee_snapshot(&pi).await.unwrap().unwrap().status,
            FeeSnapshotStatus::Cancelled
        );
        let intent = fx.store.payment_intent(&pi).await.unwrap().unwrap();
        assert_eq!(intent.status, "canceled");
        assert_eq!(
            intent.failure_reason.as_deref(),
            Some("Abandoned: payment not completed")
        );
    }

    #[tokio::test]
    async fn test_long_pending_with_attended_booking_syncs_from_processor() {
        let fx = Fixture::new();
        let (pi, booking_id) = issued_intent(&fx, time::Duration::days(8)).await;
        fx.store
            .set_booking_status(booking_id, BookingStatus::Attended)
            .await;
        fx.processor.set_status(&pi, ProcessorIntentStatus::Succeeded);

        let summary = fx.reconcile.reconcile_long_pending_intents().await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(fx.processor.retrieve_calls(), 1);
        assert_eq!(fx.processor.cancel_calls(), 0);
        assert_eq!(
            fx.store.fee_snapshot(&pi).await.unwrap().unwrap().status,
            FeeSnapshotStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_long_pending_orphan_is_force_cancelled() {
        let fx = Fixture::new();
        let created_at = OffsetDateTime::now_utc() - time::Duration::days(8);
        fx.store
            .insert_intent(PaymentIntentRecord {
                id: Uuid::new_v4(),
                stripe_payment_intent_id: "pi_orphan".into(),
                booking_id: None,
                session_id: None,
                amount_cents: 2500,
                status: "requires_payment_method".into(),
                failure_reason: None,
                created_at,
                updated_at: created_at,
            })
            .await;

        let summary = fx.reconcile.reconcile_long_pending_intents().await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert_eq!(fx.processor.retrieve_calls(), 0);

        let intent = fx.store.payment_intent("pi_orphan").await.unwrap().unwrap();
        assert_eq!(intent.status, "canceled");
        assert_eq!(
            intent.failure_reason.as_deref(),
            Some("Orphaned: no linked booking")
        );
    }

    #[tokio::test]
    async fn test_hold_cleanup_removes_only_expired_holds() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "premium").await;
        let expired = Uuid::new_v4();
        let live = Uuid::new_v4();
        fx.guest_passes
            .create_hold("host@club.test", expired, 2)
            .await
            .unwrap();
        fx.guest_passes
            .create_hold("host@club.test", live, 1)
            .await
            .unwrap();
        fx.store.expire_holds(expired).await;

        assert_eq!(fx.reconcile.cleanup_expired_holds().await.unwrap(), 1);
        let holds = fx.store.holds_for("host@club.test").await;
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].booking_id, live);

        let health = fx.health.get(JOB_HOLD_CLEANUP).await.unwrap();
        assert!(health.last_success);
    }

    #[tokio::test]
    async fn test_late_failure_event_does_not_reopen_paid_intent() {
        let fx = Fixture::new();
        let (pi, _) = issued_intent(&fx, time::Duration::minutes(1)).await;
        fx.ledger
            .mark_succeeded(&pi, &system_actor())
            .await
            .unwrap();

        let found = fx
            .ledger
            .record_payment_failure(&pi, "requires_payment_method", Some("card_declined"))
            .await
            .unwrap();
        assert!(found);
        let intent = fx.store.payment_intent(&pi).await.unwrap().unwrap();
        assert_eq!(intent.status, "succeeded");

        fx.store
            .backdate_payment(&pi, OffsetDateTime::now_utc() - time::Duration::hours(3))
            .await;
        for _ in 0..2 {
            let summary = fx.reconcile.reconcile_abandoned_intents().await.unwrap();
            assert_eq!(summary.examined, 0);
        }
        assert_eq!(fx.processor.cancel_calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_marks_job_unhealthy() {
        let fx = Fixture::failing_reconciliation();
        let err = fx.reconcile.reconcile_long_pending_intents().await.unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));

        let health = fx.health.get(JOB_LONG_PENDING).await.unwrap();
        assert!(!health.last_success);
        assert_eq!(health.consecutive_failures, 1);
        assert!(fx.health.get(JOB_STALE_PENDING).await.is_none());
    }
}
