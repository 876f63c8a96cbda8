use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction, postgres::PgPoolOptions};
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

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl UserRepository for PgStore {
    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let row = sqlx::query_as::<_, User>(
            r#"INSERT INTO users (id, email, full_name, phone, loyalty_points, referral_code, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.phone)
        .bind(user.loyalty_points)
        .bind(&user.referral_code)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>(r#"SELECT * FROM users WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_user_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>(r#"SELECT * FROM users WHERE referral_code = $1"#)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn add_loyalty_points(&self, id: Uuid, delta: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"UPDATE users SET loyalty_points = loyalty_points + $2
               WHERE id = $1 AND loyalty_points + $2 >= 0
               RETURNING *"#,
        )
        .bind(id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_loyalty_points(&self, id: Uuid, points: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"UPDATE users SET loyalty_points = $2 WHERE id = $1 AND $2 >= 0 RETURNING *"#,
        )
        .bind(id)
        .bind(points)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_referred_by(&self, id: Uuid, referrer_id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE users SET referred_by = $2 WHERE id = $1 AND referred_by IS NULL"#,
        )
        .bind(id)
        .bind(referrer_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl PetRepository for PgStore {
    async fn insert_pet(&self, pet: NewPet) -> Result<Pet> {
        let row = sqlx::query_as::<_, Pet>(
            r#"INSERT INTO pets (id, user_id, pet_name, breed, user_pet_tag_order_id, order_type, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(pet.user_id)
        .bind(&pet.pet_name)
        .bind(&pet.breed)
        .bind(pet.order_id)
        .bind(pet.order_type)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_pet(&self, id: Uuid) -> Result<Option<Pet>> {
        let row = sqlx::query_as::<_, Pet>(r#"SELECT * FROM pets WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_pet_by_name(&self, user_id: Uuid, pet_name: &str) -> Result<Option<Pet>> {
        let row = sqlx::query_as::<_, Pet>(
            r#"SELECT * FROM pets WHERE user_id = $1 AND pet_name = $2
               ORDER BY created_at LIMIT 1"#,
        )
        .bind(user_id)
        .bind(pet_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_pet_by_order(&self, order_id: Uuid) -> Result<Option<Pet>> {
        let row = sqlx::query_as::<_, Pet>(
            r#"SELECT * FROM pets WHERE user_pet_tag_order_id = $1 ORDER BY created_at LIMIT 1"#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_pets_for_user(&self, user_id: Uuid) -> Result<Vec<Pet>> {
        let rows =
            sqlx::query_as::<_, Pet>(r#"SELECT * FROM pets WHERE user_id = $1 ORDER BY created_at"#)
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn set_pet_order(&self, pet_id: Uuid, order_id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE pets SET user_pet_tag_order_id = $2 WHERE id = $1"#)
            .bind(pet_id)
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QrCodeRepository for PgStore {
    async fn insert_qr_codes(&self, codes: &[String]) -> Result<Vec<QrCode>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(codes.len());
        let now = Utc::now();
        for code in codes {
            let row = sqlx::query_as::<_, QrCode>(
                r#"INSERT INTO qr_codes (id, code, created_at) VALUES ($1, $2, $3) RETURNING *"#,
            )
            .bind(Uuid::new_v4())
            .bind(code)
            .bind(now)
            .fetch_one(tx.as_mut())
            .await?;
            inserted.push(row);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_qr(&self, id: Uuid) -> Result<Option<QrCode>> {
        let row = sqlx::query_as::<_, QrCode>(r#"SELECT * FROM qr_codes WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_qr_by_code(&self, code: &str) -> Result<Option<QrCode>> {
        let row = sqlx::query_as::<_, QrCode>(r#"SELECT * FROM qr_codes WHERE code = $1"#)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn record_scan(&self, code: &str, at: DateTime<Utc>) -> Result<Option<QrCode>> {
        let row = sqlx::query_as::<_, QrCode>(
            r#"UPDATE qr_codes SET scanned_count = scanned_count + 1, last_scanned_at = $2
               WHERE code = $1
               RETURNING *"#,
        )
        .bind(code)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn assign_if_unassigned(
        &self,
        id: Uuid,
        assignment: Assignment,
    ) -> Result<Option<QrCode>> {
        let row = sqlx::query_as::<_, QrCode>(
            r#"UPDATE qr_codes
               SET status = 'assigned', has_given = TRUE, has_verified = FALSE,
                   assigned_user_id = $2, assigned_pet_id = $3, assigned_order_id = $4
               WHERE id = $1 AND status = 'unassigned'
               RETURNING *"#,
        )
        .bind(id)
        .bind(assignment.user_id)
        .bind(assignment.pet_id)
        .bind(assignment.order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn claim_unassigned(
        &self,
        assignment: Assignment,
        exclude: Option<Uuid>,
    ) -> Result<Option<QrCode>> {
        let row = sqlx::query_as::<_, QrCode>(
            r#"UPDATE qr_codes
               SET status = 'assigned', has_given = TRUE, has_verified = FALSE,
                   assigned_user_id = $1, assigned_pet_id = $2, assigned_order_id = $3
               WHERE id = (
                   SELECT id FROM qr_codes
                   WHERE status = 'unassigned' AND ($4::uuid IS NULL OR id <> $4)
                   ORDER BY created_at, code
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING *"#,
        )
        .bind(assignment.user_id)
        .bind(assignment.pet_id)
        .bind(assignment.order_id)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn verify_within_cap(&self, id: Uuid, user_id: Uuid, max: i64) -> Result<CapOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent verifications for the same owner.
        sqlx::query(r#"SELECT id FROM users WHERE id = $1 FOR UPDATE"#)
            .bind(user_id)
            .fetch_optional(tx.as_mut())
            .await?;

        let current = count_verified(&mut tx, user_id).await?;
        if current >= max {
            tx.commit().await?;
            return Ok(CapOutcome::LimitExceeded { current });
        }

        let qr = sqlx::query_as::<_, QrCode>(
            r#"UPDATE qr_codes SET status = 'verified', has_verified = TRUE
               WHERE id = $1 AND assigned_user_id = $2
               RETURNING *"#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(Error::AlreadyAssigned)?;

        tx.commit().await?;
        Ok(CapOutcome::Verified {
            qr,
            verified_count: current + 1,
        })
    }

    async fn count_verified_for_user(&self, user_id: Uuid) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let count = count_verified(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn find_qr_for_pet(&self, pet_id: Uuid) -> Result<Option<QrCode>> {
        let row = sqlx::query_as::<_, QrCode>(
            r#"SELECT * FROM qr_codes
               WHERE assigned_pet_id = $1 AND status IN ('assigned', 'verified')
               ORDER BY created_at LIMIT 1"#,
        )
        .bind(pet_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_qr_for_user(&self, user_id: Uuid) -> Result<Vec<QrCode>> {
        let rows = sqlx::query_as::<_, QrCode>(
            r#"SELECT * FROM qr_codes WHERE assigned_user_id = $1 ORDER BY created_at, code"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn reset_qr(&self, id: Uuid) -> Result<Option<QrCode>> {
        let row = sqlx::query_as::<_, QrCode>(
            r#"UPDATE qr_codes
               SET status = 'unassigned', has_given = FALSE, has_verified = FALSE,
                   assigned_user_id = NULL, assigned_order_id = NULL, assigned_pet_id = NULL
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn reset_qr_for_user(&self, user_id: Uuid) -> Result<u64> {
        let res = sqlx::query(
            r#"UPDATE qr_codes
               SET status = 'unassigned', has_given = FALSE, has_verified = FALSE,
                   assigned_user_id = NULL, assigned_order_id = NULL, assigned_pet_id = NULL
               WHERE assigned_user_id = $1"#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn take_undownloaded(&self, limit: i64, at: DateTime<Utc>) -> Result<Vec<QrCode>> {
        let mut rows = sqlx::query_as::<_, QrCode>(
            r#"UPDATE qr_codes SET is_downloaded = TRUE, downloaded_at = $2
               WHERE id IN (
                   SELECT id FROM qr_codes
                   WHERE status = 'unassigned' AND NOT is_downloaded
                   ORDER BY created_at, code
                   LIMIT $1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING *"#,
        )
        .bind(limit)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.sort_by(|a, b| (a.created_at, &a.code).cmp(&(b.created_at, &b.code)));
        Ok(rows)
    }
}

async fn count_verified(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM qr_codes WHERE assigned_user_id = $1 AND status = $2"#,
    )
    .bind(user_id)
    .bind(QrStatus::Verified)
    .fetch_one(tx.as_mut())
    .await?;
    Ok(count)
}

async fn latest_redemption_in(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    tier: RewardTier,
) -> Result<Option<RewardRedemption>> {
    let row = sqlx::query_as::<_, RewardRedemption>(
        r#"SELECT * FROM reward_redemptions
           WHERE user_id = $1 AND reward_tier = $2
           ORDER BY created_at DESC LIMIT 1"#,
    )
    .bind(user_id)
    .bind(tier)
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(row)
}

#[async_trait]
impl SubscriptionRepository for PgStore {
    async fn upsert_subscription(&self, sub: SubscriptionUpsert) -> Result<(Subscription, bool)> {
        let now = Utc::now();
        // xmax = 0 only for rows created by this statement.
        let row = sqlx::query_as::<_, SubscriptionWithFlag>(
            r#"INSERT INTO subscriptions
                   (id, user_id, qr_code_id, type, status, start_date, end_date,
                    amount_paid, currency, auto_renew, external_ref, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
               ON CONFLICT (user_id, external_ref) DO UPDATE SET
                   type = EXCLUDED.type,
                   status = EXCLUDED.status,
                   start_date = EXCLUDED.start_date,
                   end_date = EXCLUDED.end_date,
                   amount_paid = EXCLUDED.amount_paid,
                   currency = EXCLUDED.currency,
                   auto_renew = EXCLUDED.auto_renew,
                   updated_at = EXCLUDED.updated_at
               RETURNING *, (xmax = 0) AS inserted"#,
        )
        .bind(Uuid::new_v4())
        .bind(sub.user_id)
        .bind(sub.qr_code_id)
        .bind(sub.subscription_type)
        .bind(SubscriptionStatus::Active)
        .bind(sub.start_date)
        .bind(sub.end_date)
        .bind(sub.amount_paid)
        .bind(&sub.currency)
        .bind(sub.auto_renew)
        .bind(&sub.external_ref)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.subscription, row.inserted))
    }

    async fn find_covering_by_qr(
        &self,
        qr_code_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"SELECT * FROM subscriptions
               WHERE qr_code_id = $1 AND user_id = $2
                 AND status = 'active' AND end_date > $3 AND amount_paid > 0
               ORDER BY end_date DESC LIMIT 1"#,
        )
        .bind(qr_code_id)
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_covering_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"SELECT * FROM subscriptions
               WHERE user_id = $1 AND status = 'active' AND end_date > $2 AND amount_paid > 0
               ORDER BY end_date DESC LIMIT 1"#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_subscriptions_for_user(&self, user_id: Uuid) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, Subscription>(
            r#"SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY created_at"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionWithFlag {
    #[sqlx(flatten)]
    subscription: Subscription,
    inserted: bool,
}

#[async_trait]
impl RedemptionRepository for PgStore {
    async fn list_redemptions(&self, user_id: Uuid) -> Result<Vec<RewardRedemption>> {
        let rows = sqlx::query_as::<_, RewardRedemption>(
            r#"SELECT * FROM reward_redemptions WHERE user_id = $1 ORDER BY created_at"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn latest_redemption(
        &self,
        user_id: Uuid,
        tier: RewardTier,
    ) -> Result<Option<RewardRedemption>> {
        let row = sqlx::query_as::<_, RewardRedemption>(
            r#"SELECT * FROM reward_redemptions
               WHERE user_id = $1 AND reward_tier = $2
               ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(user_id)
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_redemption(
        &self,
        user_id: Uuid,
        tier: RewardTier,
        points_at_redemption: i64,
        reset_points: bool,
    ) -> Result<Option<RewardRedemption>> {
        let mut tx = self.pool.begin().await?;

        // Serializes tier evaluation for the same user.
        let points: i64 =
            sqlx::query_scalar(r#"SELECT loyalty_points FROM users WHERE id = $1 FOR UPDATE"#)
                .bind(user_id)
                .fetch_optional(tx.as_mut())
                .await?
                .ok_or(Error::NotFound("user"))?;
        let latest_tier1 = latest_redemption_in(&mut tx, user_id, RewardTier::One).await?;
        let latest_tier2 = latest_redemption_in(&mut tx, user_id, RewardTier::Two).await?;
        if !tier.is_earned(points, latest_tier1.as_ref(), latest_tier2.as_ref()) {
            tx.commit().await?;
            return Ok(None);
        }

        let row = sqlx::query_as::<_, RewardRedemption>(
            r#"INSERT INTO reward_redemptions (id, user_id, reward_tier, points_at_redemption, status, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(tier)
        .bind(points_at_redemption)
        .bind(RedemptionStatus::Pending)
        .bind(Utc::now())
        .fetch_one(tx.as_mut())
        .await?;

        if reset_points {
            sqlx::query(r#"UPDATE users SET loyalty_points = 0 WHERE id = $1"#)
                .bind(user_id)
                .execute(tx.as_mut())
                .await?;
        }

        tx.commit().await?;
        Ok(Some(row))
    }

    async fn get_redemption(&self, id: Uuid) -> Result<Option<RewardRedemption>> {
        let row =
            sqlx::query_as::<_, RewardRedemption>(r#"SELECT * FROM reward_redemptions WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn set_redemption_status(
        &self,
        id: Uuid,
        status: RedemptionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<RewardRedemption>> {
        let row = sqlx::query_as::<_, RewardRedemption>(
            r#"UPDATE reward_redemptions SET
                   status = $2,
                   shipped_at = CASE WHEN $2 = 'shipped'::redemption_status THEN $3 ELSE shipped_at END,
                   completed_at = CASE WHEN $2 = 'completed'::redemption_status THEN $3 ELSE completed_at END
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(status)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn insert_order(&self, order: NewOrder) -> Result<Order> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, Order>(
            r#"INSERT INTO orders
                   (id, user_id, order_type, pet_name, is_replacement, amount, currency,
                    payment_status, payment_intent_id, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(order.user_id)
        .bind(order.order_type)
        .bind(&order.pet_name)
        .bind(order.is_replacement)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(PaymentStatus::Pending)
        .bind(&order.payment_intent_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, Order>(r#"SELECT * FROM orders WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn set_payment_status(&self, id: Uuid, status: PaymentStatus) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, Order>(
            r#"UPDATE orders SET payment_status = $2, updated_at = $3 WHERE id = $1 RETURNING *"#,
        )
        .bind(id)
        .bind(status)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl ReferralRepository for PgStore {
    async fn insert_referral_reward(
        &self,
        referee_id: Uuid,
        referrer_id: Uuid,
        order_id: Uuid,
        points: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"INSERT INTO referral_rewards (referee_id, referrer_id, order_id, points, created_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (referee_id) DO NOTHING"#,
        )
        .bind(referee_id)
        .bind(referrer_id)
        .bind(order_id)
        .bind(points)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}
