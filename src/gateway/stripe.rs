use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{
    IntentStatus, PaymentGateway, PaymentIntent, RecurringRequest, RecurringSubscription,
};
use crate::config::Config;
use crate::error::{Error, Result};

/// Stripe REST client.
#[derive(Clone)]
pub struct StripeGateway {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

#[derive(Deserialize)]
struct IntentBody {
    id: String,
    client_secret: Option<String>,
    status: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct CustomerBody {
    id: String,
}

#[derive(Deserialize)]
struct SubscriptionBody {
    id: String,
    latest_invoice: Option<InvoiceBody>,
}

#[derive(Deserialize)]
struct InvoiceBody {
    payment_intent: Option<IntentBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl StripeGateway {
    pub fn new(api_base: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        }
    }

    /// `None` when no secret key is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .stripe_secret_key
            .as_ref()
            .map(|key| Self::new(&config.stripe_api_base, key))
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("stripe request failed: {e}")))?;
        decode(resp).await
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("stripe request failed: {e}")))?;
        decode(resp).await
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => body.error.message,
            Err(_) => format!("status {status}"),
        };
        return Err(Error::Upstream(format!("stripe: {message}")));
    }
    resp.json::<T>()
        .await
        .map_err(|e| Error::Upstream(format!("stripe returned an unexpected body: {e}")))
}

fn with_metadata(
    mut form: Vec<(String, String)>,
    metadata: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    form.extend(
        metadata
            .iter()
            .map(|(k, v)| (format!("metadata[{k}]"), v.clone())),
    );
    form
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntent> {
        if amount <= 0 {
            return Err(Error::Validation("amount must be > 0".into()));
        }
        let form = with_metadata(
            vec![
                ("amount".into(), amount.to_string()),
                ("currency".into(), currency.to_lowercase()),
                ("automatic_payment_methods[enabled]".into(), "true".into()),
            ],
            &metadata,
        );
        let body: IntentBody = self.post("/v1/payment_intents", &form).await?;
        debug!(intent_id = %body.id, "created payment intent");

        let client_secret = body
            .client_secret
            .ok_or_else(|| Error::Upstream("stripe: payment intent without client secret".into()))?;
        Ok(PaymentIntent {
            id: body.id,
            client_secret,
        })
    }

    async fn confirm_payment_intent(&self, id: &str) -> Result<IntentStatus> {
        let body: IntentBody = self.get(&format!("/v1/payment_intents/{id}")).await?;
        Ok(IntentStatus {
            succeeded: body.status == "succeeded",
            id: body.id,
            amount: body.amount,
            currency: body.currency,
            metadata: body.metadata,
        })
    }

    async fn create_recurring_subscription(
        &self,
        request: RecurringRequest,
    ) -> Result<RecurringSubscription> {
        let customer: CustomerBody = self
            .post(
                "/v1/customers",
                &with_metadata(vec![("email".into(), request.email.clone())], &request.metadata),
            )
            .await?;

        let form = with_metadata(
            vec![
                ("customer".into(), customer.id),
                ("items[0][price]".into(), request.price_id.clone()),
                ("payment_behavior".into(), "default_incomplete".into()),
                (
                    "payment_settings[save_default_payment_method]".into(),
                    "on_subscription".into(),
                ),
                ("expand[]".into(), "latest_invoice.payment_intent".into()),
            ],
            &request.metadata,
        );
        let sub: SubscriptionBody = self.post("/v1/subscriptions", &form).await?;

        let intent = sub
            .latest_invoice
            .and_then(|invoice| invoice.payment_intent)
            .ok_or_else(|| Error::Upstream("stripe: subscription without payment intent".into()))?;
        let client_secret = intent
            .client_secret
            .ok_or_else(|| Error::Upstream("stripe: payment intent without client secret".into()))?;

        // The first invoice's intent does not inherit the subscription metadata.
        let mut metadata = request.metadata;
        metadata.insert("subscription_id".into(), sub.id.clone());
        let _: IntentBody = self
            .post(
                &format!("/v1/payment_intents/{}", intent.id),
                &with_metadata(Vec::new(), &metadata),
            )
            .await?;
        debug!(subscription_id = %sub.id, intent_id = %intent.id, "created recurring subscription");

        Ok(RecurringSubscription {
            subscription_id: sub.id,
            payment_intent_id: intent.id,
            client_secret,
        })
    }
}
