use async_trait::async_trait;
use serde::Deserialize;

use super::{MessageReceipt, Messenger};
use crate::config::Config;
use crate::error::{Error, Result};

/// Twilio Programmable Messaging client.
#[derive(Clone)]
pub struct TwilioMessenger {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

#[derive(Deserialize)]
struct MessageBody {
    sid: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl TwilioMessenger {
    pub fn new(
        api_base: impl Into<String>,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
        }
    }

    /// `None` unless sid, token and sender are all configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        match (
            &config.twilio_account_sid,
            &config.twilio_auth_token,
            &config.twilio_from_number,
        ) {
            (Some(sid), Some(token), Some(from)) => {
                Some(Self::new(&config.twilio_api_base, sid, token, from))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Messenger for TwilioMessenger {
    async fn send(&self, phone_number: &str, message: &str) -> Result<MessageReceipt> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );
        let resp = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", phone_number),
                ("From", self.from_number.as_str()),
                ("Body", message),
            ])
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("twilio request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let message = match resp.json::<ErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => format!("status {status}"),
            };
            return Err(Error::Upstream(format!("twilio: {message}")));
        }

        let body: MessageBody = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("twilio returned an unexpected body: {e}")))?;
        Ok(MessageReceipt { id: body.sid })
    }
}
