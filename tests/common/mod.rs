#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pettag_backend::{
    AppState, Assignment, NewPet, NewUser, Pet, QrCode, User,
    config::Config,
    error::{Error, Result},
    gateway::{
        DisabledMessenger, IntentStatus, LogMailer, PaymentGateway, PaymentIntent,
        RecurringRequest, RecurringSubscription,
    },
    store::MemoryStore,
};
use uuid::Uuid;

/// Payment provider double: every intent succeeds unless marked failed.
pub struct FakePayments {
    failed: Mutex<HashSet<String>>,
    created: Mutex<Vec<(i64, String)>>,
    intents: Mutex<HashMap<String, IntentStatus>>,
    /// Amount charged for each recurring price id.
    prices: HashMap<String, i64>,
}

impl FakePayments {
    pub fn new(config: &Config) -> Self {
        let prices = [
            (&config.stripe_monthly_price_id, config.monthly_price_minor),
            (&config.stripe_yearly_price_id, config.yearly_price_minor),
        ]
        .into_iter()
        .filter_map(|(id, amount)| id.clone().map(|id| (id, amount)))
        .collect();
        Self {
            failed: Mutex::default(),
            created: Mutex::default(),
            intents: Mutex::default(),
            prices,
        }
    }

    pub fn fail(&self, intent_id: &str) {
        self.failed.lock().unwrap().insert(intent_id.to_string());
    }

    /// Amount and currency of every intent created so far.
    pub fn created(&self) -> Vec<(i64, String)> {
        self.created.lock().unwrap().clone()
    }

    fn remember(&self, amount: i64, currency: &str, metadata: BTreeMap<String, String>) -> String {
        let mut created = self.created.lock().unwrap();
        created.push((amount, currency.to_string()));
        let id = format!("pi_{}", created.len());
        self.intents.lock().unwrap().insert(
            id.clone(),
            IntentStatus {
                id: id.clone(),
                succeeded: true,
                amount,
                currency: currency.to_string(),
                metadata,
            },
        );
        id
    }
}

#[async_trait]
impl PaymentGateway for FakePayments {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntent> {
        let id = self.remember(amount, currency, metadata);
        Ok(PaymentIntent {
            client_secret: format!("{id}_secret"),
            id,
        })
    }

    async fn confirm_payment_intent(&self, id: &str) -> Result<IntentStatus> {
        let mut intent = self
            .intents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Upstream(format!("no such payment intent {id}")))?;
        intent.succeeded = !self.failed.lock().unwrap().contains(id);
        Ok(intent)
    }

    async fn create_recurring_subscription(
        &self,
        request: RecurringRequest,
    ) -> Result<RecurringSubscription> {
        let amount = self.prices.get(&request.price_id).copied().unwrap_or_default();
        let n = self.created.lock().unwrap().len() + 1;
        let subscription_id = format!("sub_{n}");
        let mut metadata = request.metadata;
        metadata.insert("subscription_id".into(), subscription_id.clone());
        let id = self.remember(amount, "gbp", metadata);
        Ok(RecurringSubscription {
            subscription_id,
            client_secret: format!("{id}_secret"),
            payment_intent_id: id,
        })
    }
}

pub fn config() -> Config {
    Config {
        stripe_monthly_price_id: Some("price_monthly".into()),
        stripe_yearly_price_id: Some("price_yearly".into()),
        ..Config::default()
    }
}

pub fn state() -> (AppState, Arc<FakePayments>) {
    let config = config();
    let payments = Arc::new(FakePayments::new(&config));
    let state = AppState {
        store: Arc::new(MemoryStore::new()),
        payments: payments.clone(),
        messenger: Arc::new(DisabledMessenger),
        mailer: Arc::new(LogMailer),
        config,
    };
    (state, payments)
}

pub async fn seed_user(state: &AppState, n: u32, points: i64) -> User {
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

pub async fn seed_pet(state: &AppState, user_id: Uuid, name: &str) -> Pet {
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

pub async fn seed_codes(state: &AppState, codes: &[&str]) -> Vec<QrCode> {
    let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
    state.store.insert_qr_codes(&codes).await.unwrap()
}

pub async fn seed_assigned(state: &AppState, qr: &QrCode, user_id: Uuid, pet_id: Uuid) -> QrCode {
    state
        .store
        .assign_if_unassigned(
            qr.id,
            Assignment {
                user_id,
                pet_id: Some(pet_id),
                order_id: None,
            },
        )
        .await
        .unwrap()
        .unwrap()
}
