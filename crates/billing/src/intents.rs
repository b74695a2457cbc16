//! Booking payment issuance
//!
//! Creates the processor intent for a session's current fees and records the
//! local mirror plus a pending fee snapshot. The processor idempotency key is
//! derived from the session and amount, so a retried issue for unchanged fees
//! returns the same intent and the same snapshot.
//!
//! Guest passes the breakdown relies on are held for the booking before the
//! processor is called; the payment ledger converts or releases the hold
//! once the intent resolves.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::fees::{FeeBreakdown, FeeBreakdownComputer};
use crate::guest_passes::GuestPassAllocator;
use crate::model::FeeSnapshot;
use crate::processor::{CreateIntentRequest, PaymentProcessor, ProcessorIntentStatus};
use crate::store::{NewFeeSnapshot, NewPaymentIntent, PaymentStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedPayment {
    pub payment_intent_id: String,
    pub amount_cents: i64,
    pub processor_status: ProcessorIntentStatus,
    pub snapshot: FeeSnapshot,
    pub breakdown: FeeBreakdown,
}

fn idempotency_key(session_id: Uuid, total_cents: i64) -> String {
    format!("booking-fee-{}-{}", session_id, total_cents)
}

#[derive(Clone)]
pub struct BookingPaymentService {
    fees: FeeBreakdownComputer,
    guest_passes: GuestPassAllocator,
    processor: Arc<dyn PaymentProcessor>,
    payments: Arc<dyn PaymentStore>,
}

impl BookingPaymentService {
    pub fn new(
        fees: FeeBreakdownComputer,
        guest_passes: GuestPassAllocator,
        processor: Arc<dyn PaymentProcessor>,
        payments: Arc<dyn PaymentStore>,
    ) -> Self {
        Self {
            fees,
            guest_passes,
            processor,
            payments,
        }
    }

    /// Charge the session's freshly recomputed fees
    pub async fn issue_booking_payment(
        &self,
        session_id: Uuid,
        customer_id: Option<&str>,
    ) -> BillingResult<IssuedPayment> {
        let breakdown = self.fees.recalculate_session_fees(session_id).await?;
        let amount_cents = breakdown.totals.total_cents;
        if amount_cents <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "session {} has nothing to charge",
                session_id
            )));
        }

        // Fails with InsufficientPasses if another booking took them meanwhile
        if let Some(booking_id) = breakdown.booking_id {
            self.guest_passes
                .reserve_for_booking(
                    &breakdown.host_email,
                    booking_id,
                    breakdown.totals.guest_passes_used,
                )
                .await?;
        }

        let mut metadata = HashMap::new();
        metadata.insert("session_id".to_string(), session_id.to_string());
        if let Some(booking_id) = breakdown.booking_id {
            metadata.insert("booking_id".to_string(), booking_id.to_string());
        }
        metadata.insert("type".to_string(), "booking_fee".to_string());

        let request = CreateIntentRequest {
            amount_cents,
            description: format!(
                "Booking fees for {} ({} players)",
                breakdown.session_date, breakdown.effective_player_count
            ),
            metadata,
            idempotency_key: idempotency_key(session_id, amount_cents),
            customer_id: customer_id.map(str::to_string),
        };

        let intent = self.processor.create_payment_intent(&request).await?;

        let snapshot = self
            .payments
            .record_payment_intent(
                &NewPaymentIntent {
                    stripe_payment_intent_id: intent.id.clone(),
                    booking_id: breakdown.booking_id,
                    session_id: Some(session_id),
                    amount_cents,
                    status: intent.status.as_str().to_string(),
                },
                &NewFeeSnapshot {
                    booking_id: breakdown.booking_id,
                    session_id: Some(session_id),
                    total_cents: amount_cents,
                    participant_fees: breakdown.snapshot_lines(),
                },
            )
            .await?;

        tracing::info!(
            payment_intent_id = %intent.id,
            session_id = %session_id,
            amount_cents,
            guest_passes_held = breakdown.totals.guest_passes_used,
            "Issued booking payment"
        );

        Ok(IssuedPayment {
            payment_intent_id: intent.id,
            amount_cents,
            processor_status: intent.status,
            snapshot,
            breakdown,
        })
    }

    /// Confirm a session whose fees come to zero
    ///
    /// No intent is created, so the guest passes it relies on are spent
    /// here instead of on payment success.
    pub async fn confirm_free_booking(&self, session_id: Uuid) -> BillingResult<FeeBreakdown> {
        let breakdown = self.fees.recalculate_session_fees(session_id).await?;
        if breakdown.totals.total_cents > 0 {
            return Err(BillingError::InvalidInput(format!(
                "session {} owes {} cents; issue a payment instead",
                session_id, breakdown.totals.total_cents
            )));
        }

        if let Some(booking_id) = breakdown.booking_id {
            self.guest_passes
                .reserve_for_booking(
                    &breakdown.host_email,
                    booking_id,
                    breakdown.totals.guest_passes_used,
                )
                .await?;
            self.guest_passes.convert_booking_holds(booking_id).await?;
        }

        tracing::info!(
            session_id = %session_id,
            guest_passes_used = breakdown.totals.guest_passes_used,
            "Confirmed booking with nothing to charge"
        );
        Ok(breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeeSnapshotStatus;
    use crate::test_support::{guest, owner, Fixture};
    use time::macros::date;

    #[tokio::test]
    async fn test_issue_records_pending_snapshot() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "social").await;
        let session = fx
            .seed_session(
                date!(2026 - 10 - 16),
                30,
                vec![owner("host@club.test"), guest("Pat")],
            )
            .await;

        let issued = fx
            .payments
            .issue_booking_payment(session.id, Some("cus_123"))
            .await
            .unwrap();

        // Social tier has no included minutes: one overage block plus a guest fee
        assert_eq!(issued.amount_cents, 5000);
        assert_eq!(issued.snapshot.status, FeeSnapshotStatus::Pending);
        assert_eq!(issued.snapshot.participant_fees.len(), 2);

        let created = fx.processor.created_requests();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].idempotency_key, idempotency_key(session.id, 5000));
        assert_eq!(created[0].customer_id.as_deref(), Some("cus_123"));
    }

    #[tokio::test]
    async fn test_reissue_returns_same_snapshot() {
        let fx = Fixture::new();
        let session = fx
            .seed_session(date!(2026 - 10 - 16), 30, vec![owner("host@club.test")])
            .await;

        let first = fx.payments.issue_booking_payment(session.id, None).await.unwrap();
        let second = fx.payments.issue_booking_payment(session.id, None).await.unwrap();
        assert_eq!(first.payment_intent_id, second.payment_intent_id);
        assert_eq!(first.snapshot.id, second.snapshot.id);
    }

    #[tokio::test]
    async fn test_issue_holds_passes_once_per_booking() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "core").await;
        let session = fx
            .seed_session(
                date!(2026 - 10 - 16),
                90,
                vec![owner("host@club.test"), guest("Pat"), guest("Sam")],
            )
            .await;

        fx.payments.issue_booking_payment(session.id, None).await.unwrap();
        let issued = fx.payments.issue_booking_payment(session.id, None).await.unwrap();
        assert_eq!(issued.breakdown.totals.guest_passes_used, 2);

        let holds = fx.store.holds_for("host@club.test").await;
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].booking_id, session.booking_id);
        assert_eq!(holds[0].passes_held, 2);
    }

    #[tokio::test]
    async fn test_zero_total_is_not_charged() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "vip").await;
        let session = fx
            .seed_session(date!(2026 - 10 - 16), 240, vec![owner("host@club.test")])
            .await;

        let err = fx
            .payments
            .issue_booking_payment(session.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(fx.processor.created_requests().is_empty());
    }

    #[tokio::test]
    async fn test_free_booking_spends_guest_passes() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "core").await;
        let session = fx
            .seed_session(
                date!(2026 - 10 - 16),
                60,
                vec![owner("host@club.test"), guest("Pat")],
            )
            .await;

        let breakdown = fx.payments.confirm_free_booking(session.id).await.unwrap();
        assert_eq!(breakdown.totals.total_cents, 0);
        assert_eq!(breakdown.totals.guest_passes_used, 1);

        let usage = fx.guest_passes.usage("host@club.test", None).await.unwrap();
        assert_eq!((usage.used, usage.held), (1, 0));
        assert!(fx.processor.created_requests().is_empty());
    }

    #[tokio::test]
    async fn test_free_booking_rejects_chargeable_session() {
        let fx = Fixture::new();
        let session = fx
            .seed_session(date!(2026 - 10 - 16), 30, vec![owner("host@club.test")])
            .await;

        let err = fx.payments.confirm_free_booking(session.id).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
}
