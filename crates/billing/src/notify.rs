//! Booking ledger events for the push layer
//!
//! Publishing is never on the critical path: a failed publish is logged and
//! the ledger operation still succeeds.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::model::{FeeSnapshotStatus, RosterVersion};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingLedgerEvent {
    FeesUpdated {
        session_id: Uuid,
        booking_id: Option<Uuid>,
        total_cents: i64,
    },
    RosterChanged {
        session_id: Uuid,
        roster_version: RosterVersion,
    },
    PaymentStatusChanged {
        payment_intent_id: String,
        booking_id: Option<Uuid>,
        status: FeeSnapshotStatus,
    },
    GuestPassesChanged {
        member_email: String,
        booking_id: Option<Uuid>,
    },
}

impl BookingLedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BookingLedgerEvent::FeesUpdated { .. } => "fees_updated",
            BookingLedgerEvent::RosterChanged { .. } => "roster_changed",
            BookingLedgerEvent::PaymentStatusChanged { .. } => "payment_status_changed",
            BookingLedgerEvent::GuestPassesChanged { .. } => "guest_passes_changed",
        }
    }
}

#[async_trait]
pub trait BookingEventSink: Send + Sync {
    async fn publish(&self, event: BookingLedgerEvent) -> BillingResult<()>;
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl BookingEventSink for NoopEventSink {
    async fn publish(&self, _event: BookingLedgerEvent) -> BillingResult<()> {
        Ok(())
    }
}

/// Fans events out to in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<BookingLedgerEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookingLedgerEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl BookingEventSink for BroadcastEventSink {
    async fn publish(&self, event: BookingLedgerEvent) -> BillingResult<()> {
        // No subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Publish and swallow failures
pub(crate) async fn publish_non_critical(sink: &dyn BookingEventSink, event: BookingLedgerEvent) {
    let kind = event.kind();
    if let Err(e) = sink.publish(event).await {
        tracing::warn!(event = kind, error = %e, "Failed to publish booking ledger event");
    }
}
