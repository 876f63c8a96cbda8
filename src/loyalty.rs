//! Loyalty points and the two-tier reward cycle.
//!
//! A cycle is tier 1 at 1000 points followed by tier 2 at 2000 points.
//! Creating the tier-2 redemption zeroes the balance; the next cycle opens
//! once that redemption is completed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{
    Order, RedemptionStatus, RewardRedemption, RewardTier, TIER1_THRESHOLD, TIER2_THRESHOLD, User,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointsMode {
    Add,
    Set,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointsUpdate {
    pub user: User,
    /// Redemption created by this change, if any.
    pub redemption: Option<RewardRedemption>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CurrentReward {
    pub tier: RewardTier,
    pub threshold: i64,
    pub redemption_id: Option<Uuid>,
    pub status: Option<RedemptionStatus>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NextReward {
    pub tier: RewardTier,
    pub threshold: i64,
    pub points_needed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewardStatus {
    pub points: i64,
    pub current_reward: Option<CurrentReward>,
    pub next_reward: Option<NextReward>,
    pub redemptions: Vec<RewardRedemption>,
}

/// Adds to or overwrites the user's balance, then checks the reward tiers.
pub async fn adjust_points(
    store: &dyn Store,
    user_id: Uuid,
    value: i64,
    mode: PointsMode,
) -> Result<PointsUpdate> {
    if store.get_user(user_id).await?.is_none() {
        return Err(Error::NotFound("user"));
    }

    let updated = match mode {
        PointsMode::Add => store.add_loyalty_points(user_id, value).await?,
        PointsMode::Set => store.set_loyalty_points(user_id, value).await?,
    }
    .ok_or_else(|| Error::Validation("loyalty points cannot be negative".into()))?;
    info!(%user_id, ?mode, value, points = updated.loyalty_points, "adjusted loyalty points");

    let redemption = evaluate_reward_tiers(store, user_id).await?;
    let user = match redemption {
        Some(_) => store
            .get_user(user_id)
            .await?
            .ok_or(Error::NotFound("user"))?,
        None => updated,
    };
    Ok(PointsUpdate { user, redemption })
}

/// Creates the redemption the current balance has earned, if any.
pub async fn evaluate_reward_tiers(
    store: &dyn Store,
    user_id: Uuid,
) -> Result<Option<RewardRedemption>> {
    let user = store
        .get_user(user_id)
        .await?
        .ok_or(Error::NotFound("user"))?;
    let points = user.loyalty_points;

    let tier = if points >= TIER2_THRESHOLD {
        RewardTier::Two
    } else if points >= TIER1_THRESHOLD {
        RewardTier::One
    } else {
        return Ok(None);
    };
    let latest_tier1 = store.latest_redemption(user_id, RewardTier::One).await?;
    let latest_tier2 = store.latest_redemption(user_id, RewardTier::Two).await?;
    if !tier.is_earned(points, latest_tier1.as_ref(), latest_tier2.as_ref()) {
        return Ok(None);
    }

    // The store checks again under its lock; a concurrent update may win.
    let reset_points = tier == RewardTier::Two;
    let Some(redemption) = store
        .create_redemption(user_id, tier, tier.threshold(), reset_points)
        .await?
    else {
        return Ok(None);
    };
    info!(
        %user_id,
        points,
        tier = ?tier,
        redemption_id = %redemption.id,
        reset_points,
        "reward unlocked"
    );
    Ok(Some(redemption))
}

/// What the user sees as their current and next reward.
pub async fn reward_status(store: &dyn Store, user_id: Uuid) -> Result<RewardStatus> {
    let user = store
        .get_user(user_id)
        .await?
        .ok_or(Error::NotFound("user"))?;
    let redemptions = store.list_redemptions(user_id).await?;
    let (current_reward, next_reward) = describe_cycle(user.loyalty_points, &redemptions);
    Ok(RewardStatus {
        points: user.loyalty_points,
        current_reward,
        next_reward,
        redemptions,
    })
}

/// `redemptions` must be oldest first.
fn describe_cycle(
    points: i64,
    redemptions: &[RewardRedemption],
) -> (Option<CurrentReward>, Option<NextReward>) {
    let cycle_start = redemptions
        .iter()
        .rev()
        .find(|r| r.reward_tier == RewardTier::Two && r.status == RedemptionStatus::Completed)
        .map(|r| r.created_at);
    let cycle: Vec<&RewardRedemption> = redemptions
        .iter()
        .filter(|r| cycle_start.is_none_or(|start| r.created_at > start))
        .collect();
    let latest = |tier: RewardTier| cycle.iter().rev().find(|r| r.reward_tier == tier).copied();
    let is_open = |r: &RewardRedemption| r.status != RedemptionStatus::Completed;

    let tier2 = latest(RewardTier::Two);
    if tier2.is_some_and(is_open) || points >= TIER2_THRESHOLD {
        return (Some(current(RewardTier::Two, tier2)), None);
    }

    let tier1 = latest(RewardTier::One);
    if points >= TIER1_THRESHOLD || tier1.is_some_and(is_open) {
        return (
            Some(current(RewardTier::One, tier1)),
            Some(next(RewardTier::Two, points)),
        );
    }

    (None, Some(next(RewardTier::One, points)))
}

fn current(tier: RewardTier, redemption: Option<&RewardRedemption>) -> CurrentReward {
    CurrentReward {
        tier,
        threshold: tier.threshold(),
        redemption_id: redemption.map(|r| r.id),
        status: redemption.map(|r| r.status),
    }
}

fn next(tier: RewardTier, points: i64) -> NextReward {
    NextReward {
        tier,
        threshold: tier.threshold(),
        points_needed: (tier.threshold() - points).max(0),
    }
}

/// Moves a redemption forward (pending, shipped, completed).
pub async fn update_redemption_status(
    store: &dyn Store,
    redemption_id: Uuid,
    status: RedemptionStatus,
) -> Result<RewardRedemption> {
    let redemption = store
        .get_redemption(redemption_id)
        .await?
        .ok_or(Error::NotFound("redemption"))?;
    if !redemption.status.can_become(status) {
        return Err(Error::InvalidState(format!(
            "redemption cannot move from {:?} to {:?}",
            redemption.status, status
        )));
    }

    let updated = store
        .set_redemption_status(redemption_id, status, Utc::now())
        .await?
        .ok_or(Error::NotFound("redemption"))?;
    info!(
        user_id = %updated.user_id,
        %redemption_id,
        tier = ?updated.reward_tier,
        ?status,
        "updated redemption"
    );
    Ok(updated)
}

/// Links `user_id` to the owner of `code`. A user can be referred once.
pub async fn apply_referral(store: &dyn Store, user_id: Uuid, code: &str) -> Result<User> {
    let code = code.trim();
    if code.is_empty() {
        return Err(Error::Validation("referral code is required".into()));
    }
    let user = store
        .get_user(user_id)
        .await?
        .ok_or(Error::NotFound("user"))?;
    let referrer = store
        .find_user_by_referral_code(code)
        .await?
        .ok_or(Error::NotFound("referral code"))?;
    if referrer.id == user.id {
        return Err(Error::Validation("cannot use your own referral code".into()));
    }
    if !store.set_referred_by(user.id, referrer.id).await? {
        return Err(Error::InvalidState("a referral code was already applied".into()));
    }

    info!(%user_id, referrer_id = %referrer.id, "applied referral code");
    store
        .get_user(user_id)
        .await?
        .ok_or(Error::NotFound("user"))
}

/// Credits the referrer the first time a referred user's order is paid.
/// Returns the points awarded.
pub async fn award_referral_bonus(store: &dyn Store, order: &Order, bonus: i64) -> Result<i64> {
    if bonus <= 0 {
        return Ok(0);
    }
    let Some(buyer) = store.get_user(order.user_id).await? else {
        return Ok(0);
    };
    let Some(referrer_id) = buyer.referred_by else {
        return Ok(0);
    };
    if store.get_user(referrer_id).await?.is_none() {
        warn!(user_id = %buyer.id, %referrer_id, "referrer no longer exists");
        return Ok(0);
    }
    if !store
        .insert_referral_reward(buyer.id, referrer_id, order.id, bonus)
        .await?
    {
        return Ok(0);
    }

    adjust_points(store, referrer_id, bonus, PointsMode::Add).await?;
    info!(%referrer_id, referee_id = %buyer.id, order_id = %order.id, bonus, "awarded referral bonus");
    Ok(bonus)
}
