//! Stripe webhook handling
//!
//! Verifies deliveries and maps booking payment events onto the payment
//! status ledger. Every delivery is claimed in the webhook event log first so
//! replays and concurrent deliveries of the same event are processed once.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Expandable, Webhook};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::PaymentStatusLedger;
use crate::model::StaffActor;
use crate::store::WebhookEventStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Check a `Stripe-Signature` header (`t=...,v1=...`) against the payload
fn verify_signature_header(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if !signatures.iter().any(|sig| *sig == computed) {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Booking payment events the ledger acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerWebhookEvent {
    PaymentSucceeded {
        payment_intent_id: String,
    },
    PaymentCanceled {
        payment_intent_id: String,
    },
    /// A charge attempt failed; the intent can still be retried
    PaymentFailed {
        payment_intent_id: String,
        status: String,
        failure_reason: Option<String>,
    },
    ChargeRefunded {
        charge_id: String,
        payment_intent_id: Option<String>,
        full_refund: bool,
    },
    Ignored {
        event_type: String,
    },
}

impl LedgerWebhookEvent {
    pub fn classify(event: &Event) -> BillingResult<Self> {
        match event.type_ {
            EventType::PaymentIntentSucceeded => {
                let pi = payment_intent_object(event)?;
                Ok(Self::PaymentSucceeded {
                    payment_intent_id: pi.id.to_string(),
                })
            }
            EventType::PaymentIntentCanceled => {
                let pi = payment_intent_object(event)?;
                Ok(Self::PaymentCanceled {
                    payment_intent_id: pi.id.to_string(),
                })
            }
            EventType::PaymentIntentPaymentFailed => {
                let pi = payment_intent_object(event)?;
                Ok(Self::PaymentFailed {
                    payment_intent_id: pi.id.to_string(),
                    status: pi.status.as_str().to_string(),
                    failure_reason: pi
                        .last_payment_error
                        .as_ref()
                        .and_then(|e| e.message.clone()),
                })
            }
            EventType::ChargeRefunded => {
                let EventObject::Charge(charge) = &event.data.object else {
                    return Err(BillingError::WebhookEventNotSupported(
                        "Expected Charge".to_string(),
                    ));
                };
                let payment_intent_id = match &charge.payment_intent {
                    Some(Expandable::Id(id)) => Some(id.to_string()),
                    Some(Expandable::Object(pi)) => Some(pi.id.to_string()),
                    None => None,
                };
                Ok(Self::ChargeRefunded {
                    charge_id: charge.id.to_string(),
                    payment_intent_id,
                    full_refund: charge.refunded,
                })
            }
            _ => Ok(Self::Ignored {
                event_type: event.type_.to_string(),
            }),
        }
    }
}

fn payment_intent_object(event: &Event) -> BillingResult<&stripe::PaymentIntent> {
    match &event.data.object {
        EventObject::PaymentIntent(pi) => Ok(pi),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected PaymentIntent".to_string(),
        )),
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    webhook_secret: String,
    ledger: PaymentStatusLedger,
    events_log: Arc<dyn WebhookEventStore>,
    actor: StaffActor,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: impl Into<String>,
        ledger: PaymentStatusLedger,
        events_log: Arc<dyn WebhookEventStore>,
        actor: StaffActor,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            ledger,
            events_log,
            actor,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Tries the library parser first; events from API versions it can't
    /// deserialize strictly are verified by hand and parsed with serde.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        if self.webhook_secret.is_empty() {
            tracing::error!("Webhook secret not configured, rejecting delivery");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        match Webhook::construct_event(payload, signature, &self.webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        verify_signature_header(
            payload,
            signature,
            &self.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Verify, claim and process one delivery
    pub async fn handle_payload(&self, payload: &str, signature: &str) -> BillingResult<()> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(event).await
    }

    /// Handle a verified Stripe event exactly once
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        self.handle_claimed(&event_id, &event_type, LedgerWebhookEvent::classify(&event))
            .await
    }

    /// Claim, dispatch and record the result of one classified delivery
    ///
    /// A delivery that failed is recorded as an error and can be claimed again
    /// when Stripe redelivers it.
    async fn handle_claimed(
        &self,
        event_id: &str,
        event_type: &str,
        classified: BillingResult<LedgerWebhookEvent>,
    ) -> BillingResult<()> {
        if !self
            .events_log
            .claim_webhook_event(event_id, event_type)
            .await?
        {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, already claimed"
            );
            return Ok(());
        }

        tracing::info!(event_id = %event_id, event_type = %event_type, "Processing webhook event");

        let result = match classified {
            Ok(classified) => self.dispatch(classified).await,
            Err(e) => Err(e),
        };

        let error_message = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .events_log
            .finish_webhook_event(event_id, result.is_ok(), error_message.as_deref())
            .await
        {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook result, retrying"
            );
            if let Err(retry_err) = self
                .events_log
                .finish_webhook_event(event_id, result.is_ok(), error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    error = %retry_err,
                    "Webhook event may stay in processing state until the claim times out"
                );
            }
        }

        result
    }

    /// Apply a classified event to the ledger
    pub async fn dispatch(&self, event: LedgerWebhookEvent) -> BillingResult<()> {
        match event {
            LedgerWebhookEvent::PaymentSucceeded { payment_intent_id } => {
                self.ledger
                    .mark_succeeded(&payment_intent_id, &self.actor)
                    .await?;
            }
            LedgerWebhookEvent::PaymentCanceled { payment_intent_id } => {
                self.ledger
                    .mark_cancelled(&payment_intent_id, Some("Canceled at processor"), &self.actor)
                    .await?;
            }
            LedgerWebhookEvent::PaymentFailed {
                payment_intent_id,
                status,
                failure_reason,
            } => {
                self.ledger
                    .record_payment_failure(&payment_intent_id, &status, failure_reason.as_deref())
                    .await?;
            }
            LedgerWebhookEvent::ChargeRefunded {
                charge_id,
                payment_intent_id,
                full_refund,
            } => match (payment_intent_id, full_refund) {
                (Some(payment_intent_id), true) => {
                    self.ledger
                        .mark_refunded(&payment_intent_id, &self.actor)
                        .await?;
                }
                (Some(payment_intent_id), false) => {
                    tracing::info!(
                        charge_id = %charge_id,
                        payment_intent_id = %payment_intent_id,
                        "Partial refund, leaving fee snapshot unchanged"
                    );
                }
                (None, _) => {
                    tracing::warn!(charge_id = %charge_id, "Refunded charge has no payment intent");
                }
            },
            LedgerWebhookEvent::Ignored { event_type } => {
                tracing::info!(event_type = %event_type, "Received unhandled Stripe event type");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_passes::current_period;
    use crate::model::{FeeSnapshotStatus, ParticipantPaymentStatus};
    use crate::store::PaymentStore;
    use crate::test_support::{guest, owner, Fixture};
    use time::macros::date;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let now = 1_760_000_000;
        let header = sign("{}", now);
        assert!(verify_signature_header("{}", &header, SECRET, now + 10).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_760_000_000;
        let header = sign("{\"amount\":100}", now);
        let err = verify_signature_header("{\"amount\":1}", &header, SECRET, now).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let signed_at = 1_760_000_000;
        let header = sign("{}", signed_at);
        assert!(verify_signature_header("{}", &header, SECRET, signed_at + 301).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature_header("{}", "garbage", SECRET, 0).is_err());
        assert!(verify_signature_header("{}", "t=5", SECRET, 5).is_err());
    }

    #[test]
    fn test_unverifiable_payload_rejected() {
        let fx = Fixture::new();
        let handler = fx.webhook_handler(SECRET);
        let err = handler
            .verify_event("not json", "t=1,v1=deadbeef")
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn test_dispatch_success_and_full_refund() {
        let fx = Fixture::new();
        let session = fx
            .seed_session(date!(2026 - 10 - 16), 90, vec![owner("host@club.test")])
            .await;
        let issued = fx.payments.issue_booking_payment(session.id, None).await.unwrap();
        let handler = fx.webhook_handler(SECRET);

        handler
            .dispatch(LedgerWebhookEvent::PaymentSucceeded {
                payment_intent_id: issued.payment_intent_id.clone(),
            })
            .await
            .unwrap();
        let owner_id = session.participants[0].id;
        assert_eq!(
            fx.store.participant(owner_id).await.unwrap().payment_status,
            ParticipantPaymentStatus::Paid
        );

        // Partial refunds leave everything alone
        handler
            .dispatch(LedgerWebhookEvent::ChargeRefunded {
                charge_id: "ch_1".into(),
                payment_intent_id: Some(issued.payment_intent_id.clone()),
                full_refund: false,
            })
            .await
            .unwrap();
        assert_eq!(
            fx.store
                .fee_snapshot(&issued.payment_intent_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            FeeSnapshotStatus::Paid
        );

        handler
            .dispatch(LedgerWebhookEvent::ChargeRefunded {
                charge_id: "ch_1".into(),
                payment_intent_id: Some(issued.payment_intent_id.clone()),
                full_refund: true,
            })
            .await
            .unwrap();
        assert_eq!(
            fx.store.participant(owner_id).await.unwrap().payment_status,
            ParticipantPaymentStatus::Refunded
        );
    }

    #[tokio::test]
    async fn test_payment_failure_only_mirrors_intent() {
        let fx = Fixture::new();
        let session = fx
            .seed_session(date!(2026 - 10 - 16), 90, vec![owner("host@club.test")])
            .await;
        let issued = fx.payments.issue_booking_payment(session.id, None).await.unwrap();

        fx.webhook_handler(SECRET)
            .dispatch(LedgerWebhookEvent::PaymentFailed {
                payment_intent_id: issued.payment_intent_id.clone(),
                status: "requires_payment_method".into(),
                failure_reason: Some("Your card was declined.".into()),
            })
            .await
            .unwrap();

        let intent = fx
            .store
            .payment_intent(&issued.payment_intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.failure_reason.as_deref(), Some("Your card was declined."));
        let snapshot = fx
            .store
            .fee_snapshot(&issued.payment_intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, FeeSnapshotStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_processed_on_redelivery() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "core").await;
        let session = fx
            .seed_session(
                date!(2026 - 10 - 16),
                90,
                vec![owner("host@club.test"), guest("Pat"), guest("Sam")],
            )
            .await;
        let issued = fx.payments.issue_booking_payment(session.id, None).await.unwrap();
        let handler = fx.webhook_handler(SECRET);
        let succeeded = || {
            Ok(LedgerWebhookEvent::PaymentSucceeded {
                payment_intent_id: issued.payment_intent_id.clone(),
            })
        };

        // Passes spent elsewhere meanwhile: converting the hold fails
        fx.store
            .set_guest_passes_used("host@club.test", current_period(), 3)
            .await;
        let err = handler
            .handle_claimed("evt_1", "payment_intent.succeeded", succeeded())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InsufficientPasses { .. }));

        fx.store
            .set_guest_passes_used("host@club.test", current_period(), 0)
            .await;
        handler
            .handle_claimed("evt_1", "payment_intent.succeeded", succeeded())
            .await
            .unwrap();
        let usage = fx.guest_passes.usage("host@club.test", None).await.unwrap();
        assert_eq!((usage.used, usage.held), (2, 0));

        // Once processed, further redeliveries are duplicates
        let audit_rows = fx.store.audit_entries().await.len();
        handler
            .handle_claimed("evt_1", "payment_intent.succeeded", succeeded())
            .await
            .unwrap();
        assert_eq!(fx.store.audit_entries().await.len(), audit_rows);
    }
}
