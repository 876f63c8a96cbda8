use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::gateway::{DisabledMessenger, DisabledPayments, LogMailer};
use crate::store::MemoryStore;
use crate::subscription::{PaymentRef, PaymentRecord, record_payment};
use crate::types::{AppState, NewPet, NewUser, Pet, QrCode, Subscription, SubscriptionType, User};

pub(crate) fn test_state() -> AppState {
    AppState {
        store: Arc::new(MemoryStore::new()),
        payments: Arc::new(DisabledPayments),
        messenger: Arc::new(DisabledMessenger),
        mailer: Arc::new(LogMailer),
        config: Config::default(),
    }
}

pub(crate) async fn add_user(state: &AppState, n: u32) -> User {
    add_user_with_points(state, n, 0).await
}

pub(crate) async fn add_user_with_points(state: &AppState, n: u32, points: i64) -> User {
    state
        .store
        .insert_user(NewUser {
            email: format!("owner{n}@example.com"),
            full_name: format!("Owner {n}"),
            phone: Some(format!("+4477009{n:05}")),
            loyalty_points: points,
            referral_code: format!("REF{n:04}"),
        })
        .await
        .unwrap()
}

pub(crate) async fn add_pet(state: &AppState, user_id: Uuid, name: &str) -> Pet {
    state
        .store
        .insert_pet(NewPet {
            user_id,
            pet_name: name.to_string(),
            breed: None,
            order_id: None,
            order_type: None,
        })
        .await
        .unwrap()
}

pub(crate) async fn add_codes(state: &AppState, codes: &[&str]) -> Vec<QrCode> {
    let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
    state.store.insert_qr_codes(&codes).await.unwrap()
}

pub(crate) async fn subscribe(
    state: &AppState,
    user_id: Uuid,
    plan: SubscriptionType,
    payment_ref: &str,
) -> Subscription {
    let (subscription, _) = record_payment(
        state.store.as_ref(),
        PaymentRecord {
            user_id,
            qr_code_id: None,
            plan,
            amount: 275,
            currency: "gbp".into(),
            payment_ref: PaymentRef::OneTime(payment_ref.to_string()),
        },
    )
    .await
    .unwrap();
    subscription
}
