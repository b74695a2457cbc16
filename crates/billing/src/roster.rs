//! Roster mutation guard
//!
//! Optimistic concurrency on `BookingSession::roster_version`. The store
//! checks the client's version under the session row lock; a successful
//! mutation bumps the version by one and triggers a fee recompute before the
//! caller hears back.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use clubhouse_shared::enforce_social_tier_rules;

use crate::error::{BillingError, BillingResult};
use crate::fees::{FeeBreakdown, FeeBreakdownComputer};
use crate::member_cache::TierResolver;
use crate::model::{NewParticipant, Participant, ParticipantType, RosterVersion};
use crate::notify::{publish_non_critical, BookingEventSink, BookingLedgerEvent};
use crate::store::{RosterChange, RosterStore, SessionStore};

/// Shape rules for adding a participant to an existing roster
pub(crate) fn validate_addition(
    existing: &[Participant],
    participant: &NewParticipant,
) -> BillingResult<()> {
    if participant.display_name.trim().is_empty() {
        return Err(BillingError::InvalidInput(
            "participant display_name is required".to_string(),
        ));
    }

    if participant.participant_type == ParticipantType::Owner
        && existing
            .iter()
            .any(|p| p.participant_type == ParticipantType::Owner)
    {
        return Err(BillingError::InvalidInput(
            "session already has an owner".to_string(),
        ));
    }

    Ok(())
}

pub(crate) fn validate_removal(existing: &[Participant], participant_id: Uuid) -> BillingResult<()> {
    let participant = existing
        .iter()
        .find(|p| p.id == participant_id)
        .ok_or_else(|| BillingError::NotFound(format!("Participant {}", participant_id)))?;

    if participant.participant_type == ParticipantType::Owner {
        return Err(BillingError::InvalidInput(
            "the session owner cannot be removed".to_string(),
        ));
    }

    Ok(())
}

/// Participant list as read by a client, with the version to echo back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterSnapshot {
    pub session_id: Uuid,
    pub roster_version: RosterVersion,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterMutationResult {
    pub change: RosterChange,
    pub breakdown: FeeBreakdown,
}

#[derive(Clone)]
pub struct RosterGuard {
    roster: Arc<dyn RosterStore>,
    sessions: Arc<dyn SessionStore>,
    tiers: TierResolver,
    fees: FeeBreakdownComputer,
    events: Arc<dyn BookingEventSink>,
}

impl RosterGuard {
    pub fn new(
        roster: Arc<dyn RosterStore>,
        sessions: Arc<dyn SessionStore>,
        tiers: TierResolver,
        fees: FeeBreakdownComputer,
        events: Arc<dyn BookingEventSink>,
    ) -> Self {
        Self {
            roster,
            sessions,
            tiers,
            fees,
            events,
        }
    }

    pub async fn roster(&self, session_id: Uuid) -> BillingResult<RosterSnapshot> {
        let session = self
            .sessions
            .load_session(session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Booking session {}", session_id)))?;

        Ok(RosterSnapshot {
            session_id: session.id,
            roster_version: session.roster_version,
            participants: session.participants,
        })
    }

    /// Add a participant; `client_version` of `None` skips the version check
    ///
    /// The roster change commits before fees are recomputed. If the recompute
    /// fails the error is returned but the version has already advanced, so
    /// callers should reload the roster rather than retry with their old
    /// version.
    pub async fn add_participant(
        &self,
        session_id: Uuid,
        participant: NewParticipant,
        client_version: Option<RosterVersion>,
    ) -> BillingResult<RosterMutationResult> {
        if participant.participant_type == ParticipantType::Guest {
            self.check_guest_allowed(session_id).await?;
        }

        let change = self
            .roster
            .add_participant(session_id, participant, client_version)
            .await
            .map_err(|e| log_conflict(session_id, client_version, e))?;

        self.after_mutation(change, "added").await
    }

    /// Remove a non-owner participant
    ///
    /// Commits before the fee recompute, like `add_participant`: a recompute
    /// error still leaves the roster at the new version.
    pub async fn remove_participant(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
        client_version: Option<RosterVersion>,
    ) -> BillingResult<RosterMutationResult> {
        let change = self
            .roster
            .remove_participant(session_id, participant_id, client_version)
            .await
            .map_err(|e| log_conflict(session_id, client_version, e))?;

        self.after_mutation(change, "removed").await
    }

    async fn check_guest_allowed(&self, session_id: Uuid) -> BillingResult<()> {
        let session = self
            .sessions
            .load_session(session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Booking session {}", session_id)))?;

        let Some(host_tier) = self.tiers.resolve(&session.host_email).await? else {
            return Ok(());
        };

        let guest_count = session
            .participants
            .iter()
            .filter(|p| p.participant_type == ParticipantType::Guest)
            .count()
            + 1;

        let check = enforce_social_tier_rules(&host_tier.name, &host_tier.limits, guest_count);
        if !check.allowed {
            let reason = check
                .reason
                .unwrap_or_else(|| "guests are not allowed for this tier".to_string());
            return Err(BillingError::InvalidInput(reason));
        }
        Ok(())
    }

    async fn after_mutation(
        &self,
        change: RosterChange,
        verb: &'static str,
    ) -> BillingResult<RosterMutationResult> {
        tracing::info!(
            session_id = %change.session_id,
            participant_id = %change.participant_id,
            roster_version = %change.roster_version,
            "Participant {}",
            verb
        );

        let breakdown = self
            .fees
            .recalculate_session_fees(change.session_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    session_id = %change.session_id,
                    error = %e,
                    "Fee recompute failed after roster change"
                );
                e
            })?;

        publish_non_critical(
            self.events.as_ref(),
            BookingLedgerEvent::RosterChanged {
                session_id: change.session_id,
                roster_version: change.roster_version,
            },
        )
        .await;

        Ok(RosterMutationResult { change, breakdown })
    }
}

fn log_conflict(
    session_id: Uuid,
    client_version: Option<RosterVersion>,
    error: BillingError,
) -> BillingError {
    if let BillingError::RosterConflict { current_version } = &error {
        tracing::info!(
            session_id = %session_id,
            client_version = ?client_version.map(RosterVersion::value),
            current_version = %current_version,
            "Rejected stale roster mutation"
        );
    }
    error
}
