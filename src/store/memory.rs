use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    OrderRepository, PetRepository, QrCodeRepository, RedemptionRepository, ReferralRepository,
    SubscriptionRepository, UserRepository,
};
use crate::error::{Error, Result};
use crate::types::{
    Assignment, CapOutcome, NewOrder, NewPet, NewUser, Order, PaymentStatus, Pet, QrCode,
    QrStatus, RedemptionStatus, RewardRedemption, RewardTier, Subscription, SubscriptionStatus,
    SubscriptionUpsert, User,
};

/// Store kept entirely in process memory.
///
/// One lock guards every table, so each call is atomic with respect to the
/// others.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    pets: HashMap<Uuid, Pet>,
    qr_codes: HashMap<Uuid, QrCode>,
    subscriptions: HashMap<Uuid, Subscription>,
    redemptions: HashMap<Uuid, RewardRedemption>,
    orders: HashMap<Uuid, Order>,
    referral_rewards: HashSet<Uuid>,
    clock: Option<DateTime<Utc>>,
}

impl State {
    /// Strictly increasing timestamps, so creation order is never ambiguous.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn qr_by_code_mut(&mut self, code: &str) -> Option<&mut QrCode> {
        self.qr_codes.values_mut().find(|q| q.code == code)
    }

    fn verified_count(&self, user_id: Uuid) -> i64 {
        self.qr_codes
            .values()
            .filter(|q| q.assigned_user_id == Some(user_id) && q.status == QrStatus::Verified)
            .count() as i64
    }

    fn covering(
        &self,
        now: DateTime<Utc>,
        pred: impl Fn(&Subscription) -> bool,
    ) -> Option<Subscription> {
        self.subscriptions
            .values()
            .filter(|s| pred(s) && s.covers(now))
            .max_by_key(|s| s.end_date)
            .cloned()
    }
}

fn sorted_by_created<T: Clone>(items: impl Iterator<Item = T>, key: fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_by_key(key);
    out
}

fn assign(qr: &mut QrCode, assignment: Assignment) {
    qr.status = QrStatus::Assigned;
    qr.has_given = true;
    qr.has_verified = false;
    qr.assigned_user_id = Some(assignment.user_id);
    qr.assigned_pet_id = assignment.pet_id;
    qr.assigned_order_id = assignment.order_id;
}

fn reset(qr: &mut QrCode) {
    qr.status = QrStatus::Unassigned;
    qr.has_given = false;
    qr.has_verified = false;
    qr.assigned_user_id = None;
    qr.assigned_order_id = None;
    qr.assigned_pet_id = None;
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let mut st = self.state.lock().await;
        if st
            .users
            .values()
            .any(|u| u.email == user.email || u.referral_code == user.referral_code)
        {
            return Err(Error::Validation("user already exists".into()));
        }
        let created_at = st.tick();
        let row = User {
            id: Uuid::new_v4(),
            email: user.email,
            full_name: user.full_name,
            phone: user.phone,
            loyalty_points: user.loyalty_points,
            referral_code: user.referral_code,
            referred_by: None,
            created_at,
        };
        st.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        let st = self.state.lock().await;
        Ok(st.users.values().find(|u| u.referral_code == code).cloned())
    }

    async fn add_loyalty_points(&self, id: Uuid, delta: i64) -> Result<Option<User>> {
        let mut st = self.state.lock().await;
        let Some(user) = st.users.get_mut(&id) else {
            return Ok(None);
        };
        match user.loyalty_points.checked_add(delta) {
            Some(points) if points >= 0 => {
                user.loyalty_points = points;
                Ok(Some(user.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_loyalty_points(&self, id: Uuid, points: i64) -> Result<Option<User>> {
        let mut st = self.state.lock().await;
        match st.users.get_mut(&id) {
            Some(user) if points >= 0 => {
                user.loyalty_points = points;
                Ok(Some(user.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_referred_by(&self, id: Uuid, referrer_id: Uuid) -> Result<bool> {
        let mut st = self.state.lock().await;
        match st.users.get_mut(&id) {
            Some(user) if user.referred_by.is_none() => {
                user.referred_by = Some(referrer_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl PetRepository for MemoryStore {
    async fn insert_pet(&self, pet: NewPet) -> Result<Pet> {
        let mut st = self.state.lock().await;
        let created_at = st.tick();
        let row = Pet {
            id: Uuid::new_v4(),
            user_id: pet.user_id,
            pet_name: pet.pet_name,
            breed: pet.breed,
            image_url: None,
            user_pet_tag_order_id: pet.order_id,
            order_type: pet.order_type,
            created_at,
        };
        st.pets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_pet(&self, id: Uuid) -> Result<Option<Pet>> {
        Ok(self.state.lock().await.pets.get(&id).cloned())
    }

    async fn find_pet_by_name(&self, user_id: Uuid, pet_name: &str) -> Result<Option<Pet>> {
        let st = self.state.lock().await;
        Ok(st
            .pets
            .values()
            .filter(|p| p.user_id == user_id && p.pet_name == pet_name)
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn find_pet_by_order(&self, order_id: Uuid) -> Result<Option<Pet>> {
        let st = self.state.lock().await;
        Ok(st
            .pets
            .values()
            .filter(|p| p.user_pet_tag_order_id == Some(order_id))
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn list_pets_for_user(&self, user_id: Uuid) -> Result<Vec<Pet>> {
        let st = self.state.lock().await;
        Ok(sorted_by_created(
            st.pets.values().filter(|p| p.user_id == user_id).cloned(),
            |p| p.created_at,
        ))
    }

    async fn set_pet_order(&self, pet_id: Uuid, order_id: Uuid) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(pet) = st.pets.get_mut(&pet_id) {
            pet.user_pet_tag_order_id = Some(order_id);
        }
        Ok(())
    }
}

#[async_trait]
impl QrCodeRepository for MemoryStore {
    async fn insert_qr_codes(&self, codes: &[String]) -> Result<Vec<QrCode>> {
        let mut st = self.state.lock().await;
        if codes
            .iter()
            .any(|c| st.qr_codes.values().any(|q| &q.code == c))
        {
            return Err(Error::Validation("QR code already exists".into()));
        }
        let mut inserted = Vec::with_capacity(codes.len());
        for code in codes {
            let created_at = st.tick();
            let row = QrCode {
                id: Uuid::new_v4(),
                code: code.clone(),
                status: QrStatus::Unassigned,
                has_given: false,
                has_verified: false,
                assigned_user_id: None,
                assigned_order_id: None,
                assigned_pet_id: None,
                scanned_count: 0,
                last_scanned_at: None,
                is_downloaded: false,
                downloaded_at: None,
                created_at,
            };
            st.qr_codes.insert(row.id, row.clone());
            inserted.push(row);
        }
        Ok(inserted)
    }

    async fn get_qr(&self, id: Uuid) -> Result<Option<QrCode>> {
        Ok(self.state.lock().await.qr_codes.get(&id).cloned())
    }

    async fn get_qr_by_code(&self, code: &str) -> Result<Option<QrCode>> {
        let st = self.state.lock().await;
        Ok(st.qr_codes.values().find(|q| q.code == code).cloned())
    }

    async fn record_scan(&self, code: &str, at: DateTime<Utc>) -> Result<Option<QrCode>> {
        let mut st = self.state.lock().await;
        Ok(st.qr_by_code_mut(code).map(|qr| {
            qr.scanned_count += 1;
            qr.last_scanned_at = Some(at);
            qr.clone()
        }))
    }

    async fn assign_if_unassigned(
        &self,
        id: Uuid,
        assignment: Assignment,
    ) -> Result<Option<QrCode>> {
        let mut st = self.state.lock().await;
        match st.qr_codes.get_mut(&id) {
            Some(qr) if qr.status == QrStatus::Unassigned => {
                assign(qr, assignment);
                Ok(Some(qr.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn claim_unassigned(
        &self,
        assignment: Assignment,
        exclude: Option<Uuid>,
    ) -> Result<Option<QrCode>> {
        let mut st = self.state.lock().await;
        let candidate = st
            .qr_codes
            .values()
            .filter(|q| q.status == QrStatus::Unassigned && Some(q.id) != exclude)
            .min_by(|a, b| (a.created_at, &a.code).cmp(&(b.created_at, &b.code)))
            .map(|q| q.id);
        Ok(candidate.and_then(|id| {
            st.qr_codes.get_mut(&id).map(|qr| {
                assign(qr, assignment);
                qr.clone()
            })
        }))
    }

    async fn verify_within_cap(&self, id: Uuid, user_id: Uuid, max: i64) -> Result<CapOutcome> {
        let mut st = self.state.lock().await;
        let current = st.verified_count(user_id);
        if current >= max {
            return Ok(CapOutcome::LimitExceeded { current });
        }
        match st.qr_codes.get_mut(&id) {
            Some(qr) if qr.assigned_user_id == Some(user_id) => {
                qr.status = QrStatus::Verified;
                qr.has_verified = true;
                Ok(CapOutcome::Verified {
                    qr: qr.clone(),
                    verified_count: current + 1,
                })
            }
            _ => Err(Error::AlreadyAssigned),
        }
    }

    async fn count_verified_for_user(&self, user_id: Uuid) -> Result<i64> {
        Ok(self.state.lock().await.verified_count(user_id))
    }

    async fn find_qr_for_pet(&self, pet_id: Uuid) -> Result<Option<QrCode>> {
        let st = self.state.lock().await;
        Ok(st
            .qr_codes
            .values()
            .filter(|q| {
                q.assigned_pet_id == Some(pet_id)
                    && matches!(q.status, QrStatus::Assigned | QrStatus::Verified)
            })
            .min_by_key(|q| q.created_at)
            .cloned())
    }

    async fn list_qr_for_user(&self, user_id: Uuid) -> Result<Vec<QrCode>> {
        let st = self.state.lock().await;
        Ok(sorted_by_created(
            st.qr_codes
                .values()
                .filter(|q| q.assigned_user_id == Some(user_id))
                .cloned(),
            |q| q.created_at,
        ))
    }

    async fn reset_qr(&self, id: Uuid) -> Result<Option<QrCode>> {
        let mut st = self.state.lock().await;
        Ok(st.qr_codes.get_mut(&id).map(|qr| {
            reset(qr);
            qr.clone()
        }))
    }

    async fn reset_qr_for_user(&self, user_id: Uuid) -> Result<u64> {
        let mut st = self.state.lock().await;
        let mut count = 0;
        for qr in st
            .qr_codes
            .values_mut()
            .filter(|q| q.assigned_user_id == Some(user_id))
        {
            reset(qr);
            count += 1;
        }
        Ok(count)
    }

    async fn take_undownloaded(&self, limit: i64, at: DateTime<Utc>) -> Result<Vec<QrCode>> {
        let mut st = self.state.lock().await;
        let mut ids: Vec<(DateTime<Utc>, String, Uuid)> = st
            .qr_codes
            .values()
            .filter(|q| q.status == QrStatus::Unassigned && !q.is_downloaded)
            .map(|q| (q.created_at, q.code.clone(), q.id))
            .collect();
        ids.sort();
        ids.truncate(limit.max(0) as usize);

        let mut taken = Vec::with_capacity(ids.len());
        for (_, _, id) in ids {
            if let Some(qr) = st.qr_codes.get_mut(&id) {
                qr.is_downloaded = true;
                qr.downloaded_at = Some(at);
                taken.push(qr.clone());
            }
        }
        Ok(taken)
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn upsert_subscription(&self, sub: SubscriptionUpsert) -> Result<(Subscription, bool)> {
        let mut st = self.state.lock().await;
        let now = st.tick();
        if let Some(existing) = st
            .subscriptions
            .values_mut()
            .find(|s| s.user_id == sub.user_id && s.external_ref == sub.external_ref)
        {
            existing.subscription_type = sub.subscription_type;
            existing.status = SubscriptionStatus::Active;
            existing.start_date = sub.start_date;
            existing.end_date = sub.end_date;
            existing.amount_paid = sub.amount_paid;
            existing.currency = sub.currency;
            existing.auto_renew = sub.auto_renew;
            existing.updated_at = now;
            return Ok((existing.clone(), false));
        }

        let row = Subscription {
            id: Uuid::new_v4(),
            user_id: sub.user_id,
            qr_code_id: sub.qr_code_id,
            subscription_type: sub.subscription_type,
            status: SubscriptionStatus::Active,
            start_date: sub.start_date,
            end_date: sub.end_date,
            amount_paid: sub.amount_paid,
            currency: sub.currency,
            auto_renew: sub.auto_renew,
            external_ref: sub.external_ref,
            created_at: now,
            updated_at: now,
        };
        st.subscriptions.insert(row.id, row.clone());
        Ok((row, true))
    }

    async fn find_covering_by_qr(
        &self,
        qr_code_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let st = self.state.lock().await;
        Ok(st.covering(now, |s| {
            s.qr_code_id == Some(qr_code_id) && s.user_id == user_id
        }))
    }

    async fn find_covering_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let st = self.state.lock().await;
        Ok(st.covering(now, |s| s.user_id == user_id))
    }

    async fn list_subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>> {
        let st = self.state.lock().await;
        Ok(sorted_by_created(
            st.subscriptions
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned(),
            |s| s.created_at,
        ))
    }
}

#[async_trait]
impl RedemptionRepository for MemoryStore {
    async fn list_redemptions(&self, user_id: Uuid) -> Result<Vec<RewardRedemption>> {
        let st = self.state.lock().await;
        Ok(sorted_by_created(
            st.redemptions
                .values()
                .filter(|r| r.user_id == user_id)
                .cloned(),
            |r| r.created_at,
        ))
    }

    async fn latest_redemption(
        &self,
        user_id: Uuid,
        tier: RewardTier,
    ) -> Result<Option<RewardRedemption>> {
        let st = self.state.lock().await;
        Ok(st
            .redemptions
            .values()
            .filter(|r| r.user_id == user_id && r.reward_tier == tier)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn create_redemption(
        &self,
        user_id: Uuid,
        tier: RewardTier,
        points_at_redemption: i64,
        reset_points: bool,
    ) -> Result<Option<RewardRedemption>> {
        let mut st = self.state.lock().await;
        let points = st
            .users
            .get(&user_id)
            .ok_or(Error::NotFound("user"))?
            .loyalty_points;
        let latest = |tier: RewardTier| {
            st.redemptions
                .values()
                .filter(|r| r.user_id == user_id && r.reward_tier == tier)
                .max_by_key(|r| r.created_at)
        };
        if !tier.is_earned(points, latest(RewardTier::One), latest(RewardTier::Two)) {
            return Ok(None);
        }
        let created_at = st.tick();
        let row = RewardRedemption {
            id: Uuid::new_v4(),
            user_id,
            reward_tier: tier,
            points_at_redemption,
            status: RedemptionStatus::Pending,
            created_at,
            shipped_at: None,
            completed_at: None,
        };
        st.redemptions.insert(row.id, row.clone());
        if reset_points {
            if let Some(user) = st.users.get_mut(&user_id) {
                user.loyalty_points = 0;
            }
        }
        Ok(Some(row))
    }

    async fn get_redemption(&self, id: Uuid) -> Result<Option<RewardRedemption>> {
        Ok(self.state.lock().await.redemptions.get(&id).cloned())
    }

    async fn set_redemption_status(
        &self,
        id: Uuid,
        status: RedemptionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<RewardRedemption>> {
        let mut st = self.state.lock().await;
        Ok(st.redemptions.get_mut(&id).map(|r| {
            r.status = status;
            match status {
                RedemptionStatus::Shipped => r.shipped_at = Some(at),
                RedemptionStatus::Completed => r.completed_at = Some(at),
                RedemptionStatus::Pending => {}
            }
            r.clone()
        }))
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert_order(&self, order: NewOrder) -> Result<Order> {
        let mut st = self.state.lock().await;
        let now = st.tick();
        let row = Order {
            id: Uuid::new_v4(),
            user_id: order.user_id,
            order_type: order.order_type,
            pet_name: order.pet_name,
            is_replacement: order.is_replacement,
            amount: order.amount,
            currency: order.currency,
            payment_status: PaymentStatus::Pending,
            payment_intent_id: order.payment_intent_id,
            created_at: now,
            updated_at: now,
        };
        st.orders.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn set_payment_status(&self, id: Uuid, status: PaymentStatus) -> Result<Option<Order>> {
        let mut st = self.state.lock().await;
        let now = st.tick();
        Ok(st.orders.get_mut(&id).map(|o| {
            o.payment_status = status;
            o.updated_at = now;
            o.clone()
        }))
    }
}

#[async_trait]
impl ReferralRepository for MemoryStore {
    async fn insert_referral_reward(
        &self,
        referee_id: Uuid,
        _referrer_id: Uuid,
        _order_id: Uuid,
        _points: i64,
    ) -> Result<bool> {
        Ok(self.state.lock().await.referral_rewards.insert(referee_id))
    }
}
