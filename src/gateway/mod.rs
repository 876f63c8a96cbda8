//! External providers: card payments, SMS and transactional email.

mod mail;
mod stripe;
mod twilio;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

pub use mail::{LogMailer, dispatch_email};
pub use stripe::StripeGateway;
pub use twilio::TwilioMessenger;

use crate::error::{Error, Result};

/// A one-time payment awaiting confirmation on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

/// A recurring subscription whose first invoice awaits payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecurringSubscription {
    pub subscription_id: String,
    /// The payment intent of the first invoice.
    pub payment_intent_id: String,
    pub client_secret: String,
}

/// An intent as the provider reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentStatus {
    pub id: String,
    pub succeeded: bool,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    /// Whatever was attached when the intent was created.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringRequest {
    pub email: String,
    pub price_id: String,
    pub metadata: BTreeMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntent>;

    async fn confirm_payment_intent(&self, id: &str) -> Result<IntentStatus>;

    async fn create_recurring_subscription(
        &self,
        request: RecurringRequest,
    ) -> Result<RecurringSubscription>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageReceipt {
    pub id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, phone_number: &str, message: &str) -> Result<MessageReceipt>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    OrderConfirmation,
    QrVerified,
    ReplacementIssued,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub template: EmailTemplate,
    pub to: String,
    pub variables: serde_json::Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: Email) -> Result<()>;
}

/// Used when no payment provider is configured.
pub struct DisabledPayments;

#[async_trait]
impl PaymentGateway for DisabledPayments {
    async fn create_payment_intent(
        &self,
        _amount: i64,
        _currency: &str,
        _metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntent> {
        Err(Error::Upstream("payments are not configured".into()))
    }

    async fn confirm_payment_intent(&self, _id: &str) -> Result<IntentStatus> {
        Err(Error::Upstream("payments are not configured".into()))
    }

    async fn create_recurring_subscription(
        &self,
        _request: RecurringRequest,
    ) -> Result<RecurringSubscription> {
        Err(Error::Upstream("payments are not configured".into()))
    }
}

/// Used when no SMS provider is configured.
pub struct DisabledMessenger;

#[async_trait]
impl Messenger for DisabledMessenger {
    async fn send(&self, _phone_number: &str, _message: &str) -> Result<MessageReceipt> {
        Err(Error::Upstream("messaging is not configured".into()))
    }
}
