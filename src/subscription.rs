//! Paid coverage windows and the checkout that creates them.

use std::collections::BTreeMap;

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::{IntentStatus, RecurringRequest};
use crate::qr::{self, VerifyOutcome};
use crate::store::Store;
use crate::types::{
    AppState, MAX_VERIFIED_PER_SUBSCRIPTION, Subscription, SubscriptionType, SubscriptionUpsert,
};

/// How the provider identifies a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentRef {
    /// A single payment intent.
    OneTime(String),
    /// A recurring subscription at the provider.
    Recurring(String),
}

impl PaymentRef {
    fn as_str(&self) -> &str {
        match self {
            PaymentRef::OneTime(id) | PaymentRef::Recurring(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub user_id: Uuid,
    pub qr_code_id: Option<Uuid>,
    pub plan: SubscriptionType,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub payment_ref: PaymentRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct Coverage {
    pub active: bool,
    pub subscription: Option<Subscription>,
    pub verified_count: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checkout {
    pub plan: SubscriptionType,
    pub amount: i64,
    pub currency: String,
    pub payment_intent_id: String,
    pub subscription_id: Option<String>,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ConfirmCheckout {
    pub user_id: Uuid,
    pub qr_code_id: Uuid,
    pub plan: SubscriptionType,
    pub payment_intent_id: String,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Confirmation {
    pub subscription: Subscription,
    /// False when an earlier confirmation already recorded this payment.
    pub created: bool,
    pub verification: VerifyOutcome,
}

/// Records a confirmed payment, updating the record for the same provider
/// reference instead of adding a second one.
pub async fn record_payment(store: &dyn Store, record: PaymentRecord) -> Result<(Subscription, bool)> {
    if record.amount < 0 {
        return Err(Error::Validation("amount must be >= 0".into()));
    }
    if record.currency.trim().is_empty() {
        return Err(Error::Validation("currency is required".into()));
    }
    if record.payment_ref.as_str().is_empty() {
        return Err(Error::Validation("payment reference is required".into()));
    }

    let now = Utc::now();
    let auto_renew =
        record.plan.is_recurring() && matches!(record.payment_ref, PaymentRef::Recurring(_));
    let (subscription, created) = store
        .upsert_subscription(SubscriptionUpsert {
            user_id: record.user_id,
            qr_code_id: record.qr_code_id,
            subscription_type: record.plan,
            start_date: now,
            end_date: record.plan.end_date(now),
            amount_paid: record.amount,
            currency: record.currency.to_lowercase(),
            auto_renew,
            external_ref: record.payment_ref.as_str().to_string(),
        })
        .await?;

    info!(
        user_id = %subscription.user_id,
        subscription_id = %subscription.id,
        plan = ?subscription.subscription_type,
        created,
        "recorded subscription payment"
    );
    Ok((subscription, created))
}

/// The user's current paid, unexpired subscription.
pub async fn active_coverage(store: &dyn Store, user_id: Uuid) -> Result<Option<Subscription>> {
    store.find_covering_by_user(user_id, Utc::now()).await
}

pub async fn coverage_summary(store: &dyn Store, user_id: Uuid) -> Result<Coverage> {
    if store.get_user(user_id).await?.is_none() {
        return Err(Error::NotFound("user"));
    }
    let subscription = active_coverage(store, user_id).await?;
    let verified_count = store.count_verified_for_user(user_id).await?;
    Ok(Coverage {
        active: subscription.is_some(),
        subscription,
        verified_count,
        max: MAX_VERIFIED_PER_SUBSCRIPTION,
    })
}

fn plan_label(plan: SubscriptionType) -> String {
    format!("{plan:?}").to_lowercase()
}

fn plan_price(state: &AppState, plan: SubscriptionType) -> i64 {
    match plan {
        SubscriptionType::Monthly => state.config.monthly_price_minor,
        SubscriptionType::Yearly => state.config.yearly_price_minor,
        SubscriptionType::Lifetime => state.config.lifetime_price_minor,
    }
}

/// Starts a payment for a user without coverage.
///
/// Lifetime plans are a single payment; monthly and yearly plans create a
/// recurring subscription at the provider.
pub async fn start_checkout(
    state: &AppState,
    user_id: Uuid,
    qr_code_id: Uuid,
    plan: SubscriptionType,
) -> Result<Checkout> {
    let store = state.store.as_ref();
    let user = store
        .get_user(user_id)
        .await?
        .ok_or(Error::NotFound("user"))?;
    let qr = store
        .get_qr(qr_code_id)
        .await?
        .ok_or(Error::NotFound("QR code"))?;
    if qr.assigned_user_id.is_some_and(|owner| owner != user_id) {
        return Err(Error::AlreadyAssigned);
    }
    if active_coverage(store, user_id).await?.is_some() {
        return Err(Error::InvalidState(
            "user already has active coverage; verify the tag instead".into(),
        ));
    }

    let amount = plan_price(state, plan);
    let currency = state.config.currency.clone();
    let metadata = BTreeMap::from([
        ("user_id".to_string(), user_id.to_string()),
        ("qr_code_id".to_string(), qr_code_id.to_string()),
        ("plan".to_string(), plan_label(plan)),
    ]);

    let checkout = if plan.is_recurring() {
        let price_id = match plan {
            SubscriptionType::Monthly => state.config.stripe_monthly_price_id.clone(),
            _ => state.config.stripe_yearly_price_id.clone(),
        }
        .ok_or_else(|| Error::Internal(anyhow!("no provider price configured for {plan:?}")))?;
        let sub = state
            .payments
            .create_recurring_subscription(RecurringRequest {
                email: user.email.clone(),
                price_id,
                metadata,
            })
            .await?;
        Checkout {
            plan,
            amount,
            currency,
            payment_intent_id: sub.payment_intent_id,
            subscription_id: Some(sub.subscription_id),
            client_secret: sub.client_secret,
        }
    } else {
        let intent = state
            .payments
            .create_payment_intent(amount, &currency, metadata)
            .await?;
        Checkout {
            plan,
            amount,
            currency,
            payment_intent_id: intent.id,
            subscription_id: None,
            client_secret: intent.client_secret,
        }
    };

    info!(%user_id, qr_code = %qr.code, ?plan, "started subscription checkout");
    Ok(checkout)
}

/// Records a successful checkout and verifies the tag under the new coverage.
///
/// Safe to call again for the same payment: the subscription is updated in
/// place and an already verified tag is left alone.
pub async fn confirm_checkout(state: &AppState, req: ConfirmCheckout) -> Result<Confirmation> {
    let store = state.store.as_ref();
    if store.get_user(req.user_id).await?.is_none() {
        return Err(Error::NotFound("user"));
    }
    let qr = store
        .get_qr(req.qr_code_id)
        .await?
        .ok_or(Error::NotFound("QR code"))?;
    if qr.assigned_user_id.is_some_and(|owner| owner != req.user_id) {
        return Err(Error::AlreadyAssigned);
    }

    let intent = state
        .payments
        .confirm_payment_intent(&req.payment_intent_id)
        .await?;
    if !intent.succeeded {
        return Err(Error::InvalidState("payment has not succeeded".into()));
    }
    let payment_ref = match_intent(&intent, &req)?;

    let (subscription, created) = record_payment(
        store,
        PaymentRecord {
            user_id: req.user_id,
            qr_code_id: Some(req.qr_code_id),
            plan: req.plan,
            amount: intent.amount,
            currency: intent.currency.clone(),
            payment_ref,
        },
    )
    .await?;

    let verification = qr::verify_or_auto_verify(state, req.user_id, req.qr_code_id, None).await?;
    Ok(Confirmation {
        subscription,
        created,
        verification,
    })
}

/// Checks the paid intent was started for this user, tag and plan, and
/// picks the reference the subscription is recorded under.
fn match_intent(intent: &IntentStatus, req: &ConfirmCheckout) -> Result<PaymentRef> {
    let expected = [
        ("user_id", req.user_id.to_string()),
        ("qr_code_id", req.qr_code_id.to_string()),
        ("plan", plan_label(req.plan)),
    ];
    for (key, want) in expected {
        if intent.metadata.get(key) != Some(&want) {
            return Err(Error::Validation(format!(
                "payment {} does not match this checkout ({key})",
                intent.id
            )));
        }
    }

    let recurring = intent.metadata.get("subscription_id");
    if req
        .subscription_id
        .as_ref()
        .is_some_and(|claimed| recurring != Some(claimed))
    {
        return Err(Error::Validation(format!(
            "payment {} does not belong to the given subscription",
            intent.id
        )));
    }

    Ok(match recurring {
        Some(id) if req.plan.is_recurring() => PaymentRef::Recurring(id.clone()),
        _ => PaymentRef::OneTime(intent.id.clone()),
    })
}
