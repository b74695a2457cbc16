//! Fee breakdown computer
//!
//! Turns a booking session (persisted or previewed) into per-participant
//! charges. Both sources are normalized into the same [`PricingInput`] before
//! any arithmetic runs, so a preview and the persisted session it describes
//! always price identically.
//!
//! Time allocation:
//! - `effective_player_count = max(declared || 1, participants, 1)`
//! - everyone is allocated `duration / effective_player_count` minutes and the
//!   remainder goes to the owner (or the first participant without one), so
//!   allocations always sum to the session duration
//! - for overage the owner is billed the full session duration; members are
//!   billed their share

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

use clubhouse_shared::normalize_email;

use crate::error::{BillingError, BillingResult};
use crate::guest_passes::current_period;
use crate::member_cache::{ResolvedTier, TierResolver};
use crate::model::{BookingSession, ParticipantType, SnapshotParticipantFee};
use crate::notify::{publish_non_critical, BookingEventSink, BookingLedgerEvent};
use crate::overage::OverageRates;
use crate::store::{GuestPassStore, ParticipantFeeUpdate, SessionStore, UsageStore};

/// Attendee of a previewed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewParticipant {
    #[serde(default)]
    pub participant_id: Option<Uuid>,
    #[serde(default)]
    pub email: Option<String>,
    pub display_name: String,
    pub participant_type: ParticipantType,
    /// Explicit tier for this participant instead of a member lookup
    #[serde(default)]
    pub tier: Option<String>,
}

/// Unsaved session to price
///
/// Fields are optional so a half-filled request reports which field is
/// missing instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePreviewRequest {
    pub session_date: Option<Date>,
    pub session_duration: Option<u32>,
    pub host_email: Option<String>,
    pub participants: Option<Vec<PreviewParticipant>>,
    pub declared_player_count: Option<u32>,
    pub booking_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
}

/// Where the session being priced comes from
#[derive(Debug, Clone)]
pub enum FeeSource {
    Session(Uuid),
    Booking(Uuid),
    Preview(FeePreviewRequest),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeOptions {
    /// Leave the priced session out of the member's daily usage lookup
    pub exclude_session_from_usage: bool,
}

/// Charge for one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeLineItem {
    pub participant_id: Option<Uuid>,
    pub display_name: String,
    pub participant_type: ParticipantType,
    pub email: Option<String>,
    /// Share of the session; sums to the duration across the roster
    pub minutes_allocated: u32,
    /// Minutes counted against the daily allowance
    pub billed_minutes: u32,
    pub overage_minutes: u32,
    pub overage_cents: i64,
    pub guest_cents: i64,
    pub total_cents: i64,
    pub guest_pass_used: bool,
    pub tier_name: Option<String>,
    pub daily_allowance: Option<u32>,
    pub minutes_used_before: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeeTotals {
    pub total_cents: i64,
    pub overage_cents: i64,
    pub guest_cents: i64,
    pub guest_passes_used: u32,
    /// Host's passes available before this session consumed any
    pub guest_passes_available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    pub session_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub session_date: Date,
    pub duration_minutes: u32,
    pub effective_player_count: u32,
    pub minutes_per_participant: u32,
    /// Normalized; guest passes are drawn from this member
    pub host_email: String,
    pub host_tier: Option<String>,
    pub line_items: Vec<FeeLineItem>,
    pub totals: FeeTotals,
}

impl FeeBreakdown {
    /// Lines to store on a fee snapshot
    pub fn snapshot_lines(&self) -> Vec<SnapshotParticipantFee> {
        self.line_items
            .iter()
            .map(|item| SnapshotParticipantFee {
                participant_id: item.participant_id,
                display_name: item.display_name.clone(),
                amount_cents: item.total_cents,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct PricingParticipant {
    participant_id: Option<Uuid>,
    email: Option<String>,
    display_name: String,
    participant_type: ParticipantType,
    tier_override: Option<String>,
}

/// Normalized form both sources are reduced to
#[derive(Debug, Clone)]
struct PricingInput {
    session_id: Option<Uuid>,
    booking_id: Option<Uuid>,
    session_date: Date,
    duration_minutes: u32,
    declared_player_count: Option<u32>,
    host_email: String,
    participants: Vec<PricingParticipant>,
}

impl PricingInput {
    fn from_session(session: BookingSession) -> Self {
        Self {
            session_id: Some(session.id),
            booking_id: Some(session.booking_id),
            session_date: session.session_date,
            duration_minutes: session.duration_minutes,
            declared_player_count: session.declared_player_count,
            host_email: normalize_email(&session.host_email),
            participants: session
                .participants
                .into_iter()
                .map(|p| PricingParticipant {
                    participant_id: Some(p.id),
                    email: p.email.as_deref().map(normalize_email),
                    display_name: p.display_name,
                    participant_type: p.participant_type,
                    tier_override: None,
                })
                .collect(),
        }
    }

    fn from_preview(request: FeePreviewRequest) -> BillingResult<Self> {
        fn required<T>(value: Option<T>, field: &str) -> BillingResult<T> {
            value.ok_or_else(|| BillingError::InvalidInput(format!("{} is required", field)))
        }

        let host_email = required(request.host_email, "host_email")?;
        if host_email.trim().is_empty() {
            return Err(BillingError::InvalidInput("host_email is required".to_string()));
        }

        Ok(Self {
            session_id: request.session_id,
            booking_id: request.booking_id,
            session_date: required(request.session_date, "session_date")?,
            duration_minutes: required(request.session_duration, "session_duration")?,
            declared_player_count: request.declared_player_count,
            host_email: normalize_email(&host_email),
            participants: required(request.participants, "participants")?
                .into_iter()
                .map(|p| PricingParticipant {
                    participant_id: p.participant_id,
                    email: p.email.as_deref().map(normalize_email),
                    display_name: p.display_name,
                    participant_type: p.participant_type,
                    tier_override: p.tier,
                })
                .collect(),
        })
    }
}

/// Per-session allocation shared by every line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeAllocation {
    effective_player_count: u32,
    minutes_per_participant: u32,
    /// Index of the participant who absorbs the remainder
    remainder_index: usize,
    remainder: u32,
}

fn allocate_time(
    duration_minutes: u32,
    declared_player_count: Option<u32>,
    participant_types: &[ParticipantType],
) -> TimeAllocation {
    let actual = u32::try_from(participant_types.len()).unwrap_or(u32::MAX);
    let effective_player_count = declared_player_count.unwrap_or(1).max(actual).max(1);
    let minutes_per_participant = duration_minutes / effective_player_count;

    let remainder = duration_minutes - minutes_per_participant.saturating_mul(actual);
    let remainder_index = participant_types
        .iter()
        .position(|t| *t == ParticipantType::Owner)
        .unwrap_or(0);

    TimeAllocation {
        effective_player_count,
        minutes_per_participant,
        remainder_index,
        remainder,
    }
}

/// Running guest-pass state while walking the roster in order
#[derive(Debug, Clone, Copy)]
struct GuestPassBudget {
    benefit: bool,
    remaining: u32,
}

impl GuestPassBudget {
    fn try_consume(&mut self) -> bool {
        if self.benefit && self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct FeeBreakdownComputer {
    sessions: Arc<dyn SessionStore>,
    usage: Arc<dyn UsageStore>,
    guest_passes: Arc<dyn GuestPassStore>,
    tiers: TierResolver,
    rates: OverageRates,
    events: Arc<dyn BookingEventSink>,
}

impl FeeBreakdownComputer {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        usage: Arc<dyn UsageStore>,
        guest_passes: Arc<dyn GuestPassStore>,
        tiers: TierResolver,
        rates: OverageRates,
        events: Arc<dyn BookingEventSink>,
    ) -> Self {
        Self {
            sessions,
            usage,
            guest_passes,
            tiers,
            rates,
            events,
        }
    }

    pub fn rates(&self) -> &OverageRates {
        &self.rates
    }

    pub async fn compute(
        &self,
        source: FeeSource,
        options: ComputeOptions,
    ) -> BillingResult<FeeBreakdown> {
        let input = match source {
            FeeSource::Session(session_id) => {
                let session = self
                    .sessions
                    .load_session(session_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::NotFound(format!("Booking session {}", session_id))
                    })?;
                PricingInput::from_session(session)
            }
            FeeSource::Booking(booking_id) => {
                let session = self
                    .sessions
                    .load_session_by_booking(booking_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::NotFound(format!("Session for booking {}", booking_id))
                    })?;
                PricingInput::from_session(session)
            }
            FeeSource::Preview(request) => PricingInput::from_preview(request)?,
        };

        self.price(input, options).await
    }

    async fn price(&self, input: PricingInput, options: ComputeOptions) -> BillingResult<FeeBreakdown> {
        if input.participants.is_empty() {
            return Err(BillingError::InvalidInput(
                "session has no participants".to_string(),
            ));
        }
        if input.duration_minutes == 0 {
            return Err(BillingError::InvalidInput(
                "session duration must be positive".to_string(),
            ));
        }

        let types: Vec<ParticipantType> = input
            .participants
            .iter()
            .map(|p| p.participant_type)
            .collect();
        let allocation = allocate_time(input.duration_minutes, input.declared_player_count, &types);

        let host_tier = self.tiers.resolve(&input.host_email).await?;
        let guest_passes_available = self.host_passes_available(&input, host_tier.as_ref()).await?;
        let mut budget = GuestPassBudget {
            benefit: host_tier
                .as_ref()
                .is_some_and(|t| t.limits.grants_guest_passes()),
            remaining: guest_passes_available,
        };

        let exclude_session = if options.exclude_session_from_usage {
            input.session_id
        } else {
            None
        };

        let mut line_items = Vec::with_capacity(input.participants.len());
        for (index, participant) in input.participants.iter().enumerate() {
            let minutes_allocated = if index == allocation.remainder_index {
                allocation.minutes_per_participant + allocation.remainder
            } else {
                allocation.minutes_per_participant
            };

            let item = match participant.participant_type {
                ParticipantType::Guest => self.price_guest(participant, minutes_allocated, &mut budget),
                ParticipantType::Owner => {
                    self.price_owner(
                        participant,
                        &input,
                        host_tier.as_ref(),
                        minutes_allocated,
                        exclude_session,
                    )
                    .await?
                }
                ParticipantType::Member => {
                    self.price_member(
                        participant,
                        &input,
                        minutes_allocated,
                        allocation.minutes_per_participant,
                        exclude_session,
                    )
                    .await?
                }
            };
            line_items.push(item);
        }

        let totals = FeeTotals {
            total_cents: line_items.iter().map(|i| i.total_cents).sum(),
            overage_cents: line_items.iter().map(|i| i.overage_cents).sum(),
            guest_cents: line_items.iter().map(|i| i.guest_cents).sum(),
            guest_passes_used: line_items.iter().filter(|i| i.guest_pass_used).count() as u32,
            guest_passes_available,
        };

        Ok(FeeBreakdown {
            session_id: input.session_id,
            booking_id: input.booking_id,
            session_date: input.session_date,
            duration_minutes: input.duration_minutes,
            effective_player_count: allocation.effective_player_count,
            minutes_per_participant: allocation.minutes_per_participant,
            host_email: input.host_email,
            host_tier: host_tier.map(|t| t.name),
            line_items,
            totals,
        })
    }

    /// Passes the host can still spend, ignoring this booking's own holds
    async fn host_passes_available(
        &self,
        input: &PricingInput,
        host_tier: Option<&ResolvedTier>,
    ) -> BillingResult<u32> {
        let Some(tier) = host_tier.filter(|t| t.limits.grants_guest_passes()) else {
            return Ok(0);
        };

        let usage = self
            .guest_passes
            .usage(
                &input.host_email,
                current_period(),
                tier.limits.guest_passes_per_month,
                input.booking_id,
            )
            .await?;
        Ok(usage.available())
    }

    fn price_guest(
        &self,
        participant: &PricingParticipant,
        minutes_allocated: u32,
        budget: &mut GuestPassBudget,
    ) -> FeeLineItem {
        let guest_pass_used = budget.try_consume();
        let guest_cents = if guest_pass_used {
            0
        } else {
            self.rates.guest_fee_cents
        };

        FeeLineItem {
            participant_id: participant.participant_id,
            display_name: participant.display_name.clone(),
            participant_type: ParticipantType::Guest,
            email: participant.email.clone(),
            minutes_allocated,
            billed_minutes: 0,
            overage_minutes: 0,
            overage_cents: 0,
            guest_cents,
            total_cents: guest_cents,
            guest_pass_used,
            tier_name: None,
            daily_allowance: None,
            minutes_used_before: 0,
        }
    }

    async fn price_owner(
        &self,
        participant: &PricingParticipant,
        input: &PricingInput,
        host_tier: Option<&ResolvedTier>,
        minutes_allocated: u32,
        exclude_session: Option<Uuid>,
    ) -> BillingResult<FeeLineItem> {
        let email = participant
            .email
            .clone()
            .unwrap_or_else(|| input.host_email.clone());

        let tier = match &participant.tier_override {
            Some(name) => self.tiers.resolve_tier_name(name),
            None if email == input.host_email => host_tier.cloned(),
            None => self.tiers.resolve(&email).await?,
        };

        self.price_member_time(
            participant,
            Some(email),
            tier,
            input.session_date,
            minutes_allocated,
            input.duration_minutes,
            exclude_session,
        )
        .await
    }

    async fn price_member(
        &self,
        participant: &PricingParticipant,
        input: &PricingInput,
        minutes_allocated: u32,
        minutes_per_participant: u32,
        exclude_session: Option<Uuid>,
    ) -> BillingResult<FeeLineItem> {
        let tier = match (&participant.tier_override, &participant.email) {
            (Some(name), _) => self.tiers.resolve_tier_name(name),
            (None, Some(email)) => self.tiers.resolve(email).await?,
            (None, None) => None,
        };

        self.price_member_time(
            participant,
            participant.email.clone(),
            tier,
            input.session_date,
            minutes_allocated,
            minutes_per_participant,
            exclude_session,
        )
        .await
    }

    /// Incremental overage for `billed_minutes` on top of the day's prior usage
    #[allow(clippy::too_many_arguments)]
    async fn price_member_time(
        &self,
        participant: &PricingParticipant,
        email: Option<String>,
        tier: Option<ResolvedTier>,
        session_date: Date,
        minutes_allocated: u32,
        billed_minutes: u32,
        exclude_session: Option<Uuid>,
    ) -> BillingResult<FeeLineItem> {
        let minutes_used_before = match &email {
            Some(email) => {
                self.usage
                    .minutes_used_on(email, session_date, exclude_session)
                    .await?
            }
            None => 0,
        };

        // Unknown tier means no included minutes
        let daily_allowance = tier.as_ref().map(|t| t.limits.daily_allowance()).unwrap_or(0);
        let overage = self
            .rates
            .incremental(minutes_used_before, billed_minutes, daily_allowance);

        Ok(FeeLineItem {
            participant_id: participant.participant_id,
            display_name: participant.display_name.clone(),
            participant_type: participant.participant_type,
            email,
            minutes_allocated,
            billed_minutes,
            overage_minutes: overage.overage_minutes,
            overage_cents: overage.overage_fee_cents,
            guest_cents: 0,
            total_cents: overage.overage_fee_cents,
            guest_pass_used: false,
            tier_name: tier.as_ref().map(|t| t.name.clone()),
            daily_allowance: tier.map(|t| t.limits.daily_allowance()),
            minutes_used_before,
        })
    }

    /// Persist each line's total and billed minutes onto its participant
    ///
    /// All rows are written in one transaction or none are.
    pub async fn apply_fee_breakdown_to_participants(
        &self,
        breakdown: &FeeBreakdown,
    ) -> BillingResult<usize> {
        let session_id = breakdown.session_id.ok_or_else(|| {
            BillingError::InvalidInput("breakdown is not tied to a session".to_string())
        })?;

        let updates: Vec<ParticipantFeeUpdate> = breakdown
            .line_items
            .iter()
            .filter_map(|item| {
                item.participant_id.map(|participant_id| ParticipantFeeUpdate {
                    participant_id,
                    cached_fee_cents: item.total_cents,
                    usage_minutes: match item.participant_type {
                        ParticipantType::Guest => 0,
                        ParticipantType::Owner | ParticipantType::Member => item.billed_minutes,
                    },
                })
            })
            .collect();

        let updated = self
            .sessions
            .apply_participant_fees(session_id, &updates)
            .await?;

        tracing::debug!(
            session_id = %session_id,
            participants = updated,
            total_cents = breakdown.totals.total_cents,
            "Applied fee breakdown"
        );
        Ok(updated)
    }

    /// Recompute and persist a session's fees after it changed
    pub async fn recalculate_session_fees(&self, session_id: Uuid) -> BillingResult<FeeBreakdown> {
        let breakdown = self
            .compute(
                FeeSource::Session(session_id),
                ComputeOptions {
                    exclude_session_from_usage: true,
                },
            )
            .await?;

        self.apply_fee_breakdown_to_participants(&breakdown).await?;

        tracing::info!(
            session_id = %session_id,
            total_cents = breakdown.totals.total_cents,
            guest_passes_used = breakdown.totals.guest_passes_used,
            "Recalculated session fees"
        );

        publish_non_critical(
            self.events.as_ref(),
            BookingLedgerEvent::FeesUpdated {
                session_id,
                booking_id: breakdown.booking_id,
                total_cents: breakdown.totals.total_cents,
            },
        )
        .await;

        Ok(breakdown)
    }
}
