//! Tag orders: pricing, payment confirmation and provisioning of the pet
//! and its tag once the payment succeeds.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::{Email, EmailTemplate, dispatch_email};
use crate::loyalty;
use crate::qr;
use crate::types::{
    AppState, Assignment, NewOrder, NewPet, Order, OrderType, PaymentStatus, Pet, QrCode,
};

const MAX_PET_NAME_LEN: usize = 100;

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub user_id: Uuid,
    pub order_type: OrderType,
    pub pet_name: String,
    pub is_replacement: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderCheckout {
    pub order: Order,
    pub client_secret: String,
}

/// What a paid order produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provisioning {
    Standard {
        pet: Pet,
        /// None when the pool of free tags was empty.
        qr: Option<QrCode>,
    },
    Replacement {
        pet_id: Uuid,
        revoked: Option<QrCode>,
        issued: QrCode,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderConfirmation {
    pub order: Order,
    /// None when the payment did not succeed.
    pub provisioning: Option<Provisioning>,
}

/// Prices the order and opens a payment intent for it.
pub async fn create_order(state: &AppState, req: CreateOrder) -> Result<OrderCheckout> {
    let pet_name = req.pet_name.trim();
    if pet_name.is_empty() || pet_name.chars().count() > MAX_PET_NAME_LEN {
        return Err(Error::Validation(format!(
            "pet name must be 1 to {MAX_PET_NAME_LEN} characters"
        )));
    }

    let store = state.store.as_ref();
    if store.get_user(req.user_id).await?.is_none() {
        return Err(Error::NotFound("user"));
    }
    if req.is_replacement && store.find_pet_by_name(req.user_id, pet_name).await?.is_none() {
        return Err(Error::NotFound("pet"));
    }

    let amount = if req.is_replacement {
        state.config.replacement_price_minor
    } else {
        state.config.tag_price_minor
    };
    let currency = state.config.currency.to_lowercase();

    let metadata = BTreeMap::from([
        ("user_id".to_string(), req.user_id.to_string()),
        ("pet_name".to_string(), pet_name.to_string()),
        ("is_replacement".to_string(), req.is_replacement.to_string()),
    ]);
    let intent = state
        .payments
        .create_payment_intent(amount, &currency, metadata)
        .await?;

    let order = store
        .insert_order(NewOrder {
            user_id: req.user_id,
            order_type: req.order_type,
            pet_name: pet_name.to_string(),
            is_replacement: req.is_replacement,
            amount,
            currency,
            payment_intent_id: Some(intent.id),
        })
        .await?;

    info!(
        order_id = %order.id,
        user_id = %order.user_id,
        amount = order.amount,
        is_replacement = order.is_replacement,
        "created order"
    );
    Ok(OrderCheckout {
        order,
        client_secret: intent.client_secret,
    })
}

/// Checks the order's payment with the provider and provisions it on
/// success. Confirming a paid order again only re-runs the idempotent
/// provisioning.
pub async fn confirm_order(state: &AppState, order_id: Uuid) -> Result<OrderConfirmation> {
    let store = state.store.as_ref();
    let order = store
        .get_order(order_id)
        .await?
        .ok_or(Error::NotFound("order"))?;

    if order.payment_status != PaymentStatus::Paid {
        let intent_id = order
            .payment_intent_id
            .as_deref()
            .ok_or_else(|| Error::InvalidState("order has no payment intent".into()))?;

        if !state.payments.confirm_payment_intent(intent_id).await?.succeeded {
            let order = store
                .set_payment_status(order.id, PaymentStatus::Failed)
                .await?
                .ok_or(Error::NotFound("order"))?;
            warn!(order_id = %order.id, user_id = %order.user_id, "order payment failed");
            return Ok(OrderConfirmation {
                order,
                provisioning: None,
            });
        }
    }

    let order = store
        .set_payment_status(order.id, PaymentStatus::Paid)
        .await?
        .ok_or(Error::NotFound("order"))?;
    let provisioning = on_payment_confirmed(state, &order).await?;
    Ok(OrderConfirmation {
        order,
        provisioning: Some(provisioning),
    })
}

/// Creates the pet and tag for a paid order, or swaps the tag for a
/// replacement.
pub async fn on_payment_confirmed(state: &AppState, order: &Order) -> Result<Provisioning> {
    if order.is_replacement {
        provision_replacement(state, order).await
    } else {
        provision_standard(state, order).await
    }
}

async fn provision_standard(state: &AppState, order: &Order) -> Result<Provisioning> {
    let store = state.store.as_ref();
    let user = store
        .get_user(order.user_id)
        .await?
        .ok_or(Error::NotFound("user"))?;

    let pet = match store.find_pet_by_order(order.id).await? {
        Some(pet) => pet,
        None => {
            let pet = store
                .insert_pet(NewPet {
                    user_id: order.user_id,
                    pet_name: order.pet_name.clone(),
                    breed: None,
                    order_id: Some(order.id),
                    order_type: Some(order.order_type),
                })
                .await?;
            info!(order_id = %order.id, pet_id = %pet.id, "created pet for order");
            pet
        }
    };

    let qr = match store.find_qr_for_pet(pet.id).await? {
        Some(qr) => Some(qr),
        None => {
            let assignment = Assignment {
                user_id: order.user_id,
                pet_id: Some(pet.id),
                order_id: Some(order.id),
            };
            let claimed = store.claim_unassigned(assignment, None).await?;
            match &claimed {
                Some(qr) => {
                    info!(order_id = %order.id, pet_id = %pet.id, qr_code = %qr.code, "assigned QR code to order")
                }
                None => {
                    warn!(order_id = %order.id, pet_id = %pet.id, "no unassigned QR codes, pet left without a tag")
                }
            }
            claimed
        }
    };

    match loyalty::award_referral_bonus(store, order, state.config.referral_bonus_points).await {
        Ok(0) => {}
        Ok(points) => info!(order_id = %order.id, points, "referral bonus credited"),
        Err(e) => warn!(order_id = %order.id, error = %e, "failed to award referral bonus"),
    }

    dispatch_email(
        state.mailer.clone(),
        Email {
            template: EmailTemplate::OrderConfirmation,
            to: user.email,
            variables: json!({
                "name": user.full_name,
                "order_id": order.id,
                "pet_name": pet.pet_name,
                "qr_code": qr.as_ref().map(|q| q.code.as_str()),
            }),
        },
    );

    Ok(Provisioning::Standard { pet, qr })
}

async fn provision_replacement(state: &AppState, order: &Order) -> Result<Provisioning> {
    let store = state.store.as_ref();
    let pet = store
        .find_pet_by_name(order.user_id, &order.pet_name)
        .await?
        .ok_or(Error::NotFound("pet"))?;

    if pet.user_pet_tag_order_id == Some(order.id) {
        if let Some(issued) = store.find_qr_for_pet(pet.id).await? {
            return Ok(Provisioning::Replacement {
                pet_id: pet.id,
                revoked: None,
                issued,
            });
        }
    }

    let replacement = qr::revoke_and_replace(store, pet.id, order.id).await?;

    if let Some(user) = store.get_user(order.user_id).await? {
        dispatch_email(
            state.mailer.clone(),
            Email {
                template: EmailTemplate::ReplacementIssued,
                to: user.email,
                variables: json!({
                    "name": user.full_name,
                    "pet_name": pet.pet_name,
                    "qr_code": replacement.issued.code,
                }),
            },
        );
    }

    Ok(Provisioning::Replacement {
        pet_id: pet.id,
        revoked: replacement.revoked,
        issued: replacement.issued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{IntentStatus, MockPaymentGateway, PaymentIntent};
    use crate::loyalty::apply_referral;
    use crate::test_support::{add_codes, add_pet, add_user, test_state};
    use crate::types::QrStatus;
    use std::sync::Arc;

    fn payments(succeeded: bool) -> MockPaymentGateway {
        let mut payments = MockPaymentGateway::new();
        payments.expect_create_payment_intent().returning(|amount, _, _| {
            Ok(PaymentIntent {
                id: format!("pi_{amount}"),
                client_secret: "secret".into(),
            })
        });
        payments
            .expect_confirm_payment_intent()
            .returning(move |id| {
                Ok(IntentStatus {
                    id: id.to_string(),
                    succeeded,
                    ..IntentStatus::default()
                })
            });
        payments
    }

    fn order(user_id: Uuid, pet_name: &str, is_replacement: bool) -> CreateOrder {
        CreateOrder {
            user_id,
            order_type: OrderType::UserPetTagOrder,
            pet_name: pet_name.into(),
            is_replacement,
        }
    }

    #[tokio::test]
    async fn create_order_prices_by_kind() {
        let mut state = test_state();
        state.payments = Arc::new(payments(true));
        let user = add_user(&state, 1).await;
        add_pet(&state, user.id, "Rex").await;

        let standard = create_order(&state, order(user.id, "Bella", false)).await.unwrap();
        assert_eq!(standard.order.amount, 1499);
        assert_eq!(standard.order.payment_status, PaymentStatus::Pending);
        assert_eq!(standard.order.payment_intent_id.as_deref(), Some("pi_1499"));

        let replacement = create_order(&state, order(user.id, "Rex", true)).await.unwrap();
        assert_eq!(replacement.order.amount, 499);
    }

    #[tokio::test]
    async fn create_order_rejects_blank_names_and_unknown_pets() {
        let mut state = test_state();
        state.payments = Arc::new(payments(true));
        let user = add_user(&state, 1).await;

        let err = create_order(&state, order(user.id, "  ", false)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = create_order(&state, order(user.id, "Ghost", true)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound("pet")));
    }

    #[tokio::test]
    async fn paid_order_creates_pet_and_assigns_a_code() {
        let mut state = test_state();
        state.payments = Arc::new(payments(true));
        let user = add_user(&state, 1).await;
        add_codes(&state, &["QR-0001"]).await;
        let checkout = create_order(&state, order(user.id, "Rex", false)).await.unwrap();

        let confirmed = confirm_order(&state, checkout.order.id).await.unwrap();

        assert_eq!(confirmed.order.payment_status, PaymentStatus::Paid);
        let Some(Provisioning::Standard { pet, qr: Some(qr) }) = confirmed.provisioning else {
            panic!("expected a provisioned standard order");
        };
        assert_eq!(pet.user_pet_tag_order_id, Some(checkout.order.id));
        assert_eq!(pet.order_type, Some(OrderType::UserPetTagOrder));
        assert_eq!(qr.status, QrStatus::Assigned);
        assert_eq!(qr.assigned_pet_id, Some(pet.id));
        assert_eq!(qr.assigned_order_id, Some(checkout.order.id));
    }

    #[tokio::test]
    async fn confirming_twice_does_not_duplicate() {
        let mut state = test_state();
        state.payments = Arc::new(payments(true));
        let user = add_user(&state, 1).await;
        add_codes(&state, &["QR-0001", "QR-0002"]).await;
        let checkout = create_order(&state, order(user.id, "Rex", false)).await.unwrap();

        confirm_order(&state, checkout.order.id).await.unwrap();
        confirm_order(&state, checkout.order.id).await.unwrap();

        let store = state.store.as_ref();
        assert_eq!(store.list_pets_for_user(user.id).await.unwrap().len(), 1);
        assert_eq!(store.list_qr_for_user(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_pool_leaves_pet_without_tag() {
        let mut state = test_state();
        state.payments = Arc::new(payments(true));
        let user = add_user(&state, 1).await;
        let checkout = create_order(&state, order(user.id, "Rex", false)).await.unwrap();

        let confirmed = confirm_order(&state, checkout.order.id).await.unwrap();

        assert!(matches!(
            confirmed.provisioning,
            Some(Provisioning::Standard { qr: None, .. })
        ));
        assert_eq!(confirmed.order.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn failed_payment_has_no_side_effects() {
        let mut state = test_state();
        state.payments = Arc::new(payments(false));
        let user = add_user(&state, 1).await;
        add_codes(&state, &["QR-0001"]).await;
        let checkout = create_order(&state, order(user.id, "Rex", false)).await.unwrap();

        let confirmed = confirm_order(&state, checkout.order.id).await.unwrap();

        assert_eq!(confirmed.order.payment_status, PaymentStatus::Failed);
        assert!(confirmed.provisioning.is_none());
        let store = state.store.as_ref();
        assert!(store.list_pets_for_user(user.id).await.unwrap().is_empty());
        assert!(store.list_qr_for_user(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replacement_swaps_the_tag_on_the_existing_pet() {
        let mut state = test_state();
        state.payments = Arc::new(payments(true));
        let store = state.store.clone();
        let user = add_user(&state, 1).await;
        let pet = add_pet(&state, user.id, "Rex").await;
        let codes = add_codes(&state, &["QR-0003", "QR-0099"]).await;
        store
            .assign_if_unassigned(
                codes[0].id,
                Assignment {
                    user_id: user.id,
                    pet_id: Some(pet.id),
                    order_id: None,
                },
            )
            .await
            .unwrap();
        let checkout = create_order(&state, order(user.id, "Rex", true)).await.unwrap();

        let confirmed = confirm_order(&state, checkout.order.id).await.unwrap();

        let Some(Provisioning::Replacement { pet_id, revoked, issued }) = confirmed.provisioning
        else {
            panic!("expected a replacement");
        };
        assert_eq!(pet_id, pet.id);
        assert_eq!(revoked.unwrap().status, QrStatus::Unassigned);
        assert_eq!(issued.code, "QR-0099");
        assert_eq!(issued.status, QrStatus::Assigned);
        let pet = store.get_pet(pet.id).await.unwrap().unwrap();
        assert_eq!(pet.user_pet_tag_order_id, Some(checkout.order.id));
        assert_eq!(store.list_pets_for_user(user.id).await.unwrap().len(), 1);

        let again = confirm_order(&state, checkout.order.id).await.unwrap();
        let Some(Provisioning::Replacement { issued: same, .. }) = again.provisioning else {
            panic!("expected a replacement");
        };
        assert_eq!(same.id, issued.id);
    }

    #[tokio::test]
    async fn referrer_is_credited_once() {
        let mut state = test_state();
        state.payments = Arc::new(payments(true));
        let store = state.store.clone();
        let referrer = add_user(&state, 1).await;
        let buyer = add_user(&state, 2).await;
        apply_referral(store.as_ref(), buyer.id, &referrer.referral_code)
            .await
            .unwrap();
        add_codes(&state, &["QR-0001", "QR-0002"]).await;

        for name in ["Rex", "Bella"] {
            let checkout = create_order(&state, order(buyer.id, name, false)).await.unwrap();
            confirm_order(&state, checkout.order.id).await.unwrap();
        }

        let referrer = store.get_user(referrer.id).await.unwrap().unwrap();
        assert_eq!(referrer.loyalty_points, 100);
    }
}
