use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::gateway::{Mailer, Messenger, PaymentGateway};
use crate::store::Store;

/// Tags covered by one paid subscription at the same time.
pub const MAX_VERIFIED_PER_SUBSCRIPTION: i64 = 5;
/// Points needed to unlock the tier-1 reward.
pub const TIER1_THRESHOLD: i64 = 1000;
/// Points needed to unlock the tier-2 reward. Reaching it closes the cycle.
pub const TIER2_THRESHOLD: i64 = 2000;

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The persistence backend.
    pub store: Arc<dyn Store>,
    /// The card payment provider.
    pub payments: Arc<dyn PaymentGateway>,
    /// The SMS provider.
    pub messenger: Arc<dyn Messenger>,
    /// The transactional email sender.
    pub mailer: Arc<dyn Mailer>,
    /// The application configuration.
    pub config: Config,
}

/// A customer account.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    /// The ID of the user.
    pub id: Uuid,
    /// The user's email address.
    pub email: String,
    /// The user's display name.
    pub full_name: String,
    /// The user's phone number, used for finder contact.
    pub phone: Option<String>,
    /// The user's loyalty points balance.
    pub loyalty_points: i64,
    /// The user's own referral code.
    pub referral_code: String,
    /// The user who referred this one.
    pub referred_by: Option<Uuid>,
    /// The timestamp when the user was created.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub loyalty_points: i64,
    pub referral_code: String,
}

/// Where an order came from. Copied onto the pet it provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Placed by a signed-in user from their account.
    UserPetTagOrder,
    /// Placed through the public tag checkout.
    PetTagOrder,
}

#[derive(Debug, Clone)]
pub struct NewPet {
    pub user_id: Uuid,
    pub pet_name: String,
    pub breed: Option<String>,
    pub order_id: Option<Uuid>,
    pub order_type: Option<OrderType>,
}

/// A pet profile.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Pet {
    /// The ID of the pet.
    pub id: Uuid,
    /// The owner of the pet.
    pub user_id: Uuid,
    /// The name of the pet.
    pub pet_name: String,
    /// The breed of the pet.
    pub breed: Option<String>,
    /// The hosted profile picture.
    pub image_url: Option<String>,
    /// The order the pet's current tag came from.
    pub user_pet_tag_order_id: Option<Uuid>,
    /// The source of that order.
    pub order_type: Option<OrderType>,
    /// The timestamp when the pet was created.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "qr_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QrStatus {
    Unassigned,
    Assigned,
    Verified,
    Lost,
    Revoked,
}

/// One physical tag.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QrCode {
    pub id: Uuid,
    /// The printed code.
    pub code: String,
    pub status: QrStatus,
    /// Set once the tag has been handed to a customer.
    pub has_given: bool,
    /// Set once the owner's coverage has been applied to the tag.
    pub has_verified: bool,
    pub assigned_user_id: Option<Uuid>,
    pub assigned_order_id: Option<Uuid>,
    pub assigned_pet_id: Option<Uuid>,
    pub scanned_count: i64,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub is_downloaded: bool,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QrCode {
    pub fn is_verified(&self) -> bool {
        self.has_verified && self.status == QrStatus::Verified
    }
}

/// Links written onto a tag when it is handed out.
#[derive(Debug, Clone, Copy)]
pub struct Assignment {
    pub user_id: Uuid,
    pub pet_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
}

/// Result of the capped verification flip.
#[derive(Debug, Clone)]
pub enum CapOutcome {
    Verified { qr: QrCode, verified_count: i64 },
    LimitExceeded { current: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    Monthly,
    Yearly,
    Lifetime,
}

impl SubscriptionType {
    /// End of a coverage window starting at `start`.
    ///
    /// Lifetime plans get a fixed hundred-year window so expiry comparisons
    /// keep working on a concrete date.
    pub fn end_date(self, start: DateTime<Utc>) -> DateTime<Utc> {
        let months = match self {
            SubscriptionType::Monthly => 1,
            SubscriptionType::Yearly => 12,
            SubscriptionType::Lifetime => 12 * 100,
        };
        start
            .checked_add_months(Months::new(months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_recurring(self) -> bool {
        !matches!(self, SubscriptionType::Lifetime)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

/// A paid coverage window.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    /// The tag verified by the payment that created this record.
    pub qr_code_id: Option<Uuid>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Amount paid in minor currency units.
    pub amount_paid: i64,
    pub currency: String,
    pub auto_renew: bool,
    /// The payment intent or recurring subscription id at the provider.
    pub external_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether this record grants coverage at `now`.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end_date > now && self.amount_paid > 0
    }
}

/// Values written by a payment confirmation.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub user_id: Uuid,
    pub qr_code_id: Option<Uuid>,
    pub subscription_type: SubscriptionType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub amount_paid: i64,
    pub currency: String,
    pub auto_renew: bool,
    pub external_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(into = "i16", try_from = "i16")]
pub enum RewardTier {
    One = 1,
    Two = 2,
}

impl RewardTier {
    pub fn threshold(self) -> i64 {
        match self {
            RewardTier::One => TIER1_THRESHOLD,
            RewardTier::Two => TIER2_THRESHOLD,
        }
    }

    /// Whether a balance of `points` earns this tier, given the user's latest
    /// redemption of each tier. Tier 2 opens again once the previous one is
    /// completed; tier 1 is earned once per cycle.
    pub fn is_earned(
        self,
        points: i64,
        latest_tier1: Option<&RewardRedemption>,
        latest_tier2: Option<&RewardRedemption>,
    ) -> bool {
        match self {
            RewardTier::Two => {
                points >= TIER2_THRESHOLD
                    && latest_tier2.is_none_or(|r| r.status == RedemptionStatus::Completed)
            }
            RewardTier::One => {
                (TIER1_THRESHOLD..TIER2_THRESHOLD).contains(&points)
                    && match (latest_tier1, latest_tier2) {
                        (None, _) => true,
                        (Some(t1), Some(t2)) => {
                            t2.status == RedemptionStatus::Completed && t1.created_at < t2.created_at
                        }
                        (Some(_), None) => false,
                    }
            }
        }
    }
}

impl From<RewardTier> for i16 {
    fn from(tier: RewardTier) -> Self {
        tier as i16
    }
}

impl TryFrom<i16> for RewardTier {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RewardTier::One),
            2 => Ok(RewardTier::Two),
            other => Err(format!("unknown reward tier {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "redemption_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RedemptionStatus {
    Pending,
    Shipped,
    Completed,
}

impl RedemptionStatus {
    /// Redemptions only move forward.
    pub fn can_become(self, next: RedemptionStatus) -> bool {
        matches!(
            (self, next),
            (RedemptionStatus::Pending, RedemptionStatus::Shipped)
                | (RedemptionStatus::Pending, RedemptionStatus::Completed)
                | (RedemptionStatus::Shipped, RedemptionStatus::Completed)
        )
    }
}

/// A loyalty reward claimed by a user.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RewardRedemption {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reward_tier: RewardTier,
    pub points_at_redemption: i64,
    pub status: RedemptionStatus,
    pub created_at: DateTime<Utc>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub order_type: OrderType,
    pub pet_name: String,
    pub is_replacement: bool,
    pub amount: i64,
    pub currency: String,
    pub payment_intent_id: Option<String>,
}

/// A tag purchase.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_type: OrderType,
    pub pet_name: String,
    /// Swaps the tag of an existing pet instead of creating one.
    pub is_replacement: bool,
    /// Amount in minor currency units.
    pub amount: i64,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn end_date_follows_plan_length() {
        let start = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();

        assert_eq!(
            SubscriptionType::Monthly.end_date(start),
            Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap()
        );
        assert_eq!(
            SubscriptionType::Yearly.end_date(start),
            Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap()
        );
        assert_eq!(
            SubscriptionType::Lifetime.end_date(start),
            Utc.with_ymd_and_hms(2125, 1, 31, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn redemptions_only_move_forward() {
        assert!(RedemptionStatus::Pending.can_become(RedemptionStatus::Shipped));
        assert!(RedemptionStatus::Shipped.can_become(RedemptionStatus::Completed));
        assert!(!RedemptionStatus::Completed.can_become(RedemptionStatus::Pending));
        assert!(!RedemptionStatus::Shipped.can_become(RedemptionStatus::Shipped));
    }

    #[test]
    fn reward_tier_serializes_as_number() {
        assert_eq!(serde_json::to_string(&RewardTier::Two).unwrap(), "2");
        let tier: RewardTier = serde_json::from_str("1").unwrap();
        assert_eq!(tier, RewardTier::One);
        assert!(serde_json::from_str::<RewardTier>("3").is_err());
    }
}
