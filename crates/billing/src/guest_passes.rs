//! Guest-pass allocator
//!
//! Per member and calendar month: `allowance` comes from the tier, `used` is
//! permanent, `held` is provisional. `used + held` never exceeds `allowance`;
//! the store re-reads all three under the member's row lock before writing.

use std::sync::Arc;

use time::{Date, OffsetDateTime};
use uuid::Uuid;

use clubhouse_shared::normalize_email;

use crate::error::{BillingError, BillingResult};
use crate::member_cache::TierResolver;
use crate::model::{month_start, GuestPassHold, GuestPassUsage};
use crate::notify::{publish_non_critical, BookingEventSink, BookingLedgerEvent};
use crate::store::{GuestPassStore, HoldRequest};

/// Fail unless `requested` passes fit in what is left
pub(crate) fn check_hold_available(usage: &GuestPassUsage, requested: u32) -> BillingResult<()> {
    let available = usage.available();
    if requested > available {
        return Err(BillingError::InsufficientPasses {
            available,
            requested,
        });
    }
    Ok(())
}

/// Converting held passes must not push permanent usage past the allowance
pub(crate) fn check_conversion(used: u32, allowance: u32, converting: u32) -> BillingResult<()> {
    if used.saturating_add(converting) > allowance {
        return Err(BillingError::InsufficientPasses {
            available: allowance.saturating_sub(used),
            requested: converting,
        });
    }
    Ok(())
}

/// Month bucket that guest-pass activity right now falls into
pub fn current_period() -> Date {
    month_start(OffsetDateTime::now_utc().date())
}

#[derive(Clone)]
pub struct GuestPassAllocator {
    store: Arc<dyn GuestPassStore>,
    tiers: TierResolver,
    hold_ttl: time::Duration,
    events: Arc<dyn BookingEventSink>,
}

impl GuestPassAllocator {
    pub fn new(
        store: Arc<dyn GuestPassStore>,
        tiers: TierResolver,
        hold_ttl: time::Duration,
        events: Arc<dyn BookingEventSink>,
    ) -> Self {
        Self {
            store,
            tiers,
            hold_ttl,
            events,
        }
    }

    /// Monthly allowance for a member; unknown members and tiers get none
    pub async fn allowance_for(&self, member_email: &str) -> BillingResult<u32> {
        Ok(self
            .tiers
            .resolve(member_email)
            .await?
            .map(|tier| tier.limits.guest_passes_per_month)
            .unwrap_or(0))
    }

    /// Current month position, optionally ignoring one booking's holds
    pub async fn usage(
        &self,
        member_email: &str,
        exclude_booking: Option<Uuid>,
    ) -> BillingResult<GuestPassUsage> {
        let allowance = self.allowance_for(member_email).await?;
        self.store
            .usage(member_email, current_period(), allowance, exclude_booking)
            .await
    }

    /// Reserve passes for a booking
    ///
    /// Fails with `InsufficientPasses` carrying the available count, and holds
    /// nothing, when the allowance can't cover the request.
    pub async fn create_hold(
        &self,
        member_email: &str,
        booking_id: Uuid,
        passes_needed: u32,
    ) -> BillingResult<GuestPassHold> {
        if passes_needed == 0 {
            return Err(BillingError::InvalidInput(
                "passes_needed must be at least 1".to_string(),
            ));
        }

        let email = normalize_email(member_email);
        let allowance = self.allowance_for(&email).await?;

        let request = HoldRequest {
            member_email: email.clone(),
            booking_id,
            passes: passes_needed,
            allowance,
            period_start: current_period(),
            expires_at: OffsetDateTime::now_utc() + self.hold_ttl,
        };

        let hold = self.store.create_hold(&request).await.map_err(|e| {
            if let BillingError::InsufficientPasses { available, .. } = &e {
                tracing::info!(
                    member_email = %email,
                    booking_id = %booking_id,
                    available = available,
                    requested = passes_needed,
                    "Guest pass hold rejected"
                );
            }
            e
        })?;

        tracing::info!(
            member_email = %email,
            booking_id = %booking_id,
            passes = passes_needed,
            expires_at = %hold.expires_at,
            "Created guest pass hold"
        );

        self.publish(email, Some(booking_id)).await;
        Ok(hold)
    }

    /// Drop every hold for a booking; zero holds is not an error
    pub async fn release_hold(&self, booking_id: Uuid) -> BillingResult<u64> {
        let released = self.store.release_holds(booking_id).await?;
        if released > 0 {
            tracing::info!(booking_id = %booking_id, released, "Released guest pass holds");
        }
        Ok(released)
    }

    /// Swap a booking's holds for one covering `passes_needed`
    ///
    /// Called each time a booking's payment is issued, so a repriced
    /// booking never holds passes twice. Zero passes just releases.
    pub async fn reserve_for_booking(
        &self,
        member_email: &str,
        booking_id: Uuid,
        passes_needed: u32,
    ) -> BillingResult<Option<GuestPassHold>> {
        self.store.release_holds(booking_id).await?;
        if passes_needed == 0 {
            return Ok(None);
        }
        self.create_hold(member_email, booking_id, passes_needed)
            .await
            .map(Some)
    }

    /// Convert every hold on a paid booking, whoever holds it
    pub async fn convert_booking_holds(&self, booking_id: Uuid) -> BillingResult<u32> {
        let mut members: Vec<String> = self
            .store
            .booking_holds(booking_id)
            .await?
            .into_iter()
            .map(|hold| hold.member_email)
            .collect();
        members.sort();
        members.dedup();

        let mut converted = 0;
        for email in members {
            converted += self.convert_hold_to_usage(booking_id, &email).await?;
        }
        Ok(converted)
    }

    /// Turn a confirmed booking's holds into permanent usage
    pub async fn convert_hold_to_usage(
        &self,
        booking_id: Uuid,
        member_email: &str,
    ) -> BillingResult<u32> {
        let email = normalize_email(member_email);
        let allowance = self.allowance_for(&email).await?;

        let converted = self
            .store
            .convert_holds(booking_id, &email, current_period(), allowance)
            .await?;

        if converted > 0 {
            tracing::info!(
                member_email = %email,
                booking_id = %booking_id,
                converted,
                "Converted guest pass holds to usage"
            );
            self.publish(email, Some(booking_id)).await;
        }
        Ok(converted)
    }

    pub async fn cleanup_expired_holds(&self) -> BillingResult<u64> {
        let cleaned = self
            .store
            .delete_expired_holds(OffsetDateTime::now_utc())
            .await?;
        if cleaned > 0 {
            tracing::info!(cleaned, "Cleaned up expired guest pass holds");
        }
        Ok(cleaned)
    }

    async fn publish(&self, member_email: String, booking_id: Option<Uuid>) {
        publish_non_critical(
            self.events.as_ref(),
            BookingLedgerEvent::GuestPassesChanged {
                member_email,
                booking_id,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    #[test]
    fn test_check_hold_available_reports_remaining() {
        let usage = GuestPassUsage {
            allowance: 4,
            used: 2,
            held: 1,
        };
        assert!(check_hold_available(&usage, 1).is_ok());
        match check_hold_available(&usage, 2).unwrap_err() {
            BillingError::InsufficientPasses {
                available,
                requested,
            } => {
                assert_eq!(available, 1);
                assert_eq!(requested, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_conversion_never_exceeds_allowance() {
        assert!(check_conversion(3, 4, 1).is_ok());
        assert!(check_conversion(4, 4, 1).is_err());
    }

    #[tokio::test]
    async fn test_hold_then_convert() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "core").await;
        let booking = Uuid::new_v4();

        fx.guest_passes
            .create_hold("Host@Club.test", booking, 2)
            .await
            .unwrap();
        let usage = fx.guest_passes.usage("host@club.test", None).await.unwrap();
        assert_eq!((usage.used, usage.held, usage.available()), (0, 2, 2));

        let converted = fx
            .guest_passes
            .convert_hold_to_usage(booking, "host@club.test")
            .await
            .unwrap();
        assert_eq!(converted, 2);
        let usage = fx.guest_passes.usage("host@club.test", None).await.unwrap();
        assert_eq!((usage.used, usage.held), (2, 0));
    }

    #[tokio::test]
    async fn test_hold_rejected_when_exhausted() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "core").await;
        fx.store
            .set_guest_passes_used("host@club.test", current_period(), 3)
            .await;

        let err = fx
            .guest_passes
            .create_hold("host@club.test", Uuid::new_v4(), 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientPasses {
                available: 1,
                requested: 2
            }
        ));
        assert!(fx.store.holds_for("host@club.test").await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_member_has_no_allowance() {
        let fx = Fixture::new();
        let err = fx
            .guest_passes
            .create_hold("stranger@club.test", Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_PASSES");
    }

    #[tokio::test]
    async fn test_zero_pass_hold_is_invalid() {
        let fx = Fixture::new();
        let err = fx
            .guest_passes
            .create_hold("host@club.test", Uuid::new_v4(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_reserve_replaces_previous_hold() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "core").await;
        let booking = Uuid::new_v4();

        fx.guest_passes
            .reserve_for_booking("host@club.test", booking, 3)
            .await
            .unwrap();
        fx.guest_passes
            .reserve_for_booking("host@club.test", booking, 2)
            .await
            .unwrap();
        let usage = fx.guest_passes.usage("host@club.test", None).await.unwrap();
        assert_eq!((usage.used, usage.held), (0, 2));

        let none = fx
            .guest_passes
            .reserve_for_booking("host@club.test", booking, 0)
            .await
            .unwrap();
        assert!(none.is_none());
        assert!(fx.store.holds_for("host@club.test").await.is_empty());
    }

    #[tokio::test]
    async fn test_convert_booking_holds_finds_holder() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "premium").await;
        let booking = Uuid::new_v4();
        fx.guest_passes
            .create_hold("host@club.test", booking, 2)
            .await
            .unwrap();

        assert_eq!(fx.guest_passes.convert_booking_holds(booking).await.unwrap(), 2);
        assert_eq!(fx.guest_passes.convert_booking_holds(booking).await.unwrap(), 0);
        let usage = fx.guest_passes.usage("host@club.test", None).await.unwrap();
        assert_eq!((usage.used, usage.held), (2, 0));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let fx = Fixture::new();
        fx.store.set_member_tier("host@club.test", "premium").await;
        let booking = Uuid::new_v4();
        fx.guest_passes
            .create_hold("host@club.test", booking, 1)
            .await
            .unwrap();

        assert_eq!(fx.guest_passes.release_hold(booking).await.unwrap(), 1);
        assert_eq!(fx.guest_passes.release_hold(booking).await.unwrap(), 0);
    }
}
