//! Reservations (holds) on product stock.
//!
//! A reservation is created `ACTIVE` by the coordinator when a RESERVE event is
//! applied and moves forward exactly once, to `CONFIRMED`, `RELEASED` or
//! `EXPIRED`. Terminal reservations are never reused.

use crate::types::{CorrelationId, ProductId, ReservationId, UnknownVariant, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Stock is held and the hold can still be confirmed or released
    Active,
    /// The purchase completed; the held stock left the system
    Confirmed,
    /// The hold was given back to available stock
    Released,
    /// The hold lapsed
    Expired,
}

impl ReservationStatus {
    /// Convert status to its stored string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Confirmed => "CONFIRMED",
            Self::Released => "RELEASED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse status from its stored string.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownVariant`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "CONFIRMED" => Ok(Self::Confirmed),
            "RELEASED" => Ok(Self::Released),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(UnknownVariant {
                kind: "reservation status",
                value: s.to_string(),
            }),
        }
    }

    /// Terminal statuses accept no further transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Whether `self -> next` is a legal forward transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(self, Self::Active) && !matches!(next, Self::Active)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's time-bounded hold on a quantity of one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    /// Row identity
    pub id: ReservationId,
    /// Owning user
    pub user_id: UserId,
    /// Product the stock belongs to
    pub product_id: ProductId,
    /// Units held, always > 0
    pub quantity: u32,
    /// When the hold was granted
    pub reserved_at: DateTime<Utc>,
    /// `reserved_at + reservation timeout`
    pub expires_at: DateTime<Utc>,
    /// Current lifecycle status
    pub status: ReservationStatus,
    /// The order identifier the caller uses for confirm/release
    pub correlation_id: CorrelationId,
}

impl Reservation {
    /// A new `ACTIVE` hold granted at `reserved_at`, lapsing after `timeout`.
    #[must_use]
    pub fn active(
        correlation_id: CorrelationId,
        user_id: UserId,
        product_id: ProductId,
        quantity: u32,
        reserved_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            user_id,
            product_id,
            quantity,
            reserved_at,
            expires_at: reserved_at + timeout,
            status: ReservationStatus::Active,
            correlation_id,
        }
    }

    /// An `ACTIVE` hold whose expiry is strictly before `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at < now
    }

    /// Whether `user` owns this hold.
    #[must_use]
    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.user_id == user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            ReservationStatus::Active,
            ReservationStatus::Confirmed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            assert_eq!(ReservationStatus::parse(status.as_str()), Ok(status));
        }
        assert!(ReservationStatus::parse("active").is_err());
    }

    #[test]
    fn only_active_moves_forward() {
        use ReservationStatus::{Active, Confirmed, Expired, Released};
        assert!(Active.can_transition_to(Confirmed));
        assert!(Active.can_transition_to(Released));
        assert!(Active.can_transition_to(Expired));
        assert!(!Active.can_transition_to(Active));
        assert!(!Confirmed.can_transition_to(Released));
        assert!(!Released.can_transition_to(Confirmed));
        assert!(Expired.is_terminal());
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let now = Utc::now();
        let hold = Reservation::active(
            CorrelationId::new(),
            UserId::new("alice"),
            ProductId::new("sku-1"),
            2,
            now,
            Duration::minutes(15),
        );
        assert_eq!(hold.expires_at, now + Duration::minutes(15));
        assert!(!hold.is_expired(hold.expires_at));
        assert!(hold.is_expired(hold.expires_at + Duration::seconds(1)));
        assert!(hold.is_owned_by(&UserId::new("alice")));
    }
}
