//! Persistence seams for the tag, subscription, loyalty and order ledgers.
//!
//! Operations that guard a state transition (assigning a free tag, the
//! verified-tag cap, the tier-2 points reset, subscription upserts) are
//! single store calls so every backend can make them atomic.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::Result;
use crate::types::{
    Assignment, CapOutcome, NewOrder, NewPet, NewUser, Order, PaymentStatus, Pet, QrCode,
    RedemptionStatus, RewardRedemption, RewardTier, Subscription, SubscriptionUpsert, User,
};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn insert_user(&self, user: NewUser) -> Result<User>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>>;
    /// Adds `delta` unless the balance would go negative. `None` means refused.
    async fn add_loyalty_points(&self, id: Uuid, delta: i64) -> Result<Option<User>>;
    async fn set_loyalty_points(&self, id: Uuid, points: i64) -> Result<Option<User>>;
    /// Sets `referred_by` only if it is still empty.
    async fn set_referred_by(&self, id: Uuid, referrer_id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait PetRepository: Send + Sync {
    async fn insert_pet(&self, pet: NewPet) -> Result<Pet>;
    async fn get_pet(&self, id: Uuid) -> Result<Option<Pet>>;
    async fn find_pet_by_name(&self, user_id: Uuid, pet_name: &str) -> Result<Option<Pet>>;
    async fn find_pet_by_order(&self, order_id: Uuid) -> Result<Option<Pet>>;
    /// Oldest first.
    async fn list_pets_for_user(&self, user_id: Uuid) -> Result<Vec<Pet>>;
    async fn set_pet_order(&self, pet_id: Uuid, order_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait QrCodeRepository: Send + Sync {
    async fn insert_qr_codes(&self, codes: &[String]) -> Result<Vec<QrCode>>;
    async fn get_qr(&self, id: Uuid) -> Result<Option<QrCode>>;
    async fn get_qr_by_code(&self, code: &str) -> Result<Option<QrCode>>;
    /// Bumps the scan counter and returns the updated tag.
    async fn record_scan(&self, code: &str, at: DateTime<Utc>) -> Result<Option<QrCode>>;
    /// Assigns the tag only while it is still unassigned.
    async fn assign_if_unassigned(&self, id: Uuid, assignment: Assignment)
    -> Result<Option<QrCode>>;
    /// Assigns the oldest free tag, skipping `exclude`.
    async fn claim_unassigned(
        &self,
        assignment: Assignment,
        exclude: Option<Uuid>,
    ) -> Result<Option<QrCode>>;
    /// Counts the user's verified tags and flips this one to verified if
    /// the count is below `max`, as one atomic step.
    async fn verify_within_cap(&self, id: Uuid, user_id: Uuid, max: i64) -> Result<CapOutcome>;
    async fn count_verified_for_user(&self, user_id: Uuid) -> Result<i64>;
    /// The tag currently linked to the pet, if any.
    async fn find_qr_for_pet(&self, pet_id: Uuid) -> Result<Option<QrCode>>;
    async fn list_qr_for_user(&self, user_id: Uuid) -> Result<Vec<QrCode>>;
    /// Clears every link and flag, back to unassigned.
    async fn reset_qr(&self, id: Uuid) -> Result<Option<QrCode>>;
    async fn reset_qr_for_user(&self, user_id: Uuid) -> Result<u64>;
    /// Marks up to `limit` unused, undownloaded tags as downloaded.
    async fn take_undownloaded(&self, limit: i64, at: DateTime<Utc>) -> Result<Vec<QrCode>>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Inserts, or updates the record with the same `(user_id, external_ref)`.
    /// The flag is true when a new record was created.
    async fn upsert_subscription(&self, sub: SubscriptionUpsert) -> Result<(Subscription, bool)>;
    /// Only subscriptions of `user_id`; links from earlier owners of the tag
    /// never count.
    async fn find_covering_by_qr(
        &self,
        qr_code_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;
    async fn find_covering_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;
    async fn list_subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>>;
}

#[async_trait]
pub trait RedemptionRepository: Send + Sync {
    /// Oldest first.
    async fn list_redemptions(&self, user_id: Uuid) -> Result<Vec<RewardRedemption>>;
    async fn latest_redemption(
        &self,
        user_id: Uuid,
        tier: RewardTier,
    ) -> Result<Option<RewardRedemption>>;
    /// Creates a pending redemption, zeroing the user's points in the same
    /// step when `reset_points` is set. Eligibility is checked again under a
    /// lock on the user; `None` when the tier is no longer earned.
    async fn create_redemption(
        &self,
        user_id: Uuid,
        tier: RewardTier,
        points_at_redemption: i64,
        reset_points: bool,
    ) -> Result<Option<RewardRedemption>>;
    async fn get_redemption(&self, id: Uuid) -> Result<Option<RewardRedemption>>;
    async fn set_redemption_status(
        &self,
        id: Uuid,
        status: RedemptionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<RewardRedemption>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert_order(&self, order: NewOrder) -> Result<Order>;
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>>;
    async fn set_payment_status(&self, id: Uuid, status: PaymentStatus) -> Result<Option<Order>>;
}

#[async_trait]
pub trait ReferralRepository: Send + Sync {
    /// Records the one bonus a referee can earn. False if already recorded.
    async fn insert_referral_reward(
        &self,
        referee_id: Uuid,
        referrer_id: Uuid,
        order_id: Uuid,
        points: i64,
    ) -> Result<bool>;
}

/// Everything the service needs from a backend.
pub trait Store:
    UserRepository
    + PetRepository
    + QrCodeRepository
    + SubscriptionRepository
    + RedemptionRepository
    + OrderRepository
    + ReferralRepository
{
}

impl<T> Store for T where
    T: UserRepository
        + PetRepository
        + QrCodeRepository
        + SubscriptionRepository
        + RedemptionRepository
        + OrderRepository
        + ReferralRepository
{
}
