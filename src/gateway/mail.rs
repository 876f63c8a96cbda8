use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Email, Mailer};
use crate::error::Result;

/// Writes outgoing mail to the log instead of delivering it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: Email) -> Result<()> {
        info!(
            template = ?email.template,
            to = %email.to,
            variables = %email.variables,
            "email queued"
        );
        Ok(())
    }
}

/// Sends `email` on a background task. Failures are only logged.
pub fn dispatch_email(mailer: Arc<dyn Mailer>, email: Email) {
    tokio::spawn(async move {
        let template = email.template;
        let to = email.to.clone();
        if let Err(e) = mailer.send(email).await {
            warn!(?template, %to, error = %e, "failed to send email");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::gateway::{EmailTemplate, MockMailer};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn dispatch_swallows_delivery_failure() {
        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let mut mailer = MockMailer::new();
        mailer.expect_send().times(1).returning(move |email| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(email.to.clone());
            }
            Err(Error::Upstream("smtp down".into()))
        });

        dispatch_email(
            Arc::new(mailer),
            Email {
                template: EmailTemplate::QrVerified,
                to: "owner@example.com".into(),
                variables: serde_json::json!({}),
            },
        );

        assert_eq!(rx.await.unwrap(), "owner@example.com");
    }
}
