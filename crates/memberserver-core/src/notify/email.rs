//! ============================================================================
//! Email Notifier - Admin Mail via Resend API
//! ============================================================================
//! Only admin notification kinds are mailed; everything else is ignored so the
//! administrator's inbox does not fill up with door events.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Notification, Notifier};

/// Resend API endpoint
const RESEND_API: &str = "https://api.resend.com/emails";

pub struct EmailNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from_email: String,
    from_name: String,
    admin_email: String,
}

impl EmailNotifier {
    pub fn new(api_key: String, from_email: String, from_name: String, admin_email: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: RESEND_API.to_string(),
            api_key,
            from_email,
            from_name,
            admin_email,
        }
    }

    /// Point at a different API endpoint (self-hosted relay, tests)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        if !notification.kind.is_admin() {
            debug!("Skipping email for {:?} notification", notification.kind);
            return Ok(());
        }

        info!("Sending email to {}: {}", self.admin_email, notification.subject);

        let request = EmailRequest {
            from: format!("{} <{}>", self.from_name, self.from_email),
            to: vec![self.admin_email.clone()],
            subject: notification.subject.clone(),
            text: notification.body.clone(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send email: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Resend API error {}: {}", status, body));
        }

        let email_response: ResendResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse Resend response: {}", e))?;

        info!("Email sent: {}", email_response.id);
        Ok(())
    }
}

// ============================================================================
// Resend API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct EmailRequest {
    from: String,
    to: Vec<String>,
    subject: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationKind;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notifier(endpoint: String) -> EmailNotifier {
        EmailNotifier::new(
            "re_test".into(),
            "noreply@example.org".into(),
            "Memberserver".into(),
            "admin@example.org".into(),
        )
        .with_endpoint(endpoint)
    }

    #[tokio::test]
    async fn test_mails_admin_kinds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer re_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "em_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let n = Notification::new(NotificationKind::IpChanged, "IP Address Changed", "5.6.7.8");
        notifier(server.uri()).notify(&n).await.unwrap();
    }

    #[tokio::test]
    async fn test_ignores_access_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "em_1"})))
            .expect(0)
            .mount(&server)
            .await;

        let n = Notification::new(NotificationKind::AccessEvent, "frontdoor", "opened");
        notifier(server.uri()).notify(&n).await.unwrap();
    }
}
