//! ============================================================================
//! PayPal Client - Billing Subscriptions API
//! ============================================================================
//! - OAuth2 client-credentials token, cached until shortly before expiry
//! - GET /v1/billing/subscriptions/{id} for status and last payment
//! ============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use super::{PaymentError, PaymentProvider, SubscriptionSnapshot, SubscriptionStatus};

/// Refresh the token this long before PayPal says it expires
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct PaypalClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl PaypalClient {
    pub fn new(base_url: impl Into<String>, client_id: String, client_secret: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            token: RwLock::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, PaymentError> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another caller may have refreshed while we waited for the lock
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        debug!("Requesting PayPal access token");
        let url = format!("{}/v1/oauth2/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Auth(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::Decode(format!("token response: {}", e)))?;

        let lifetime = token.expires_in.saturating_sub(TOKEN_REFRESH_MARGIN_SECS);
        info!("Obtained PayPal access token (valid {}s)", token.expires_in);

        let access_token = token.access_token.clone();
        *slot = Some(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(access_token)
    }

    async fn forget_token(&self) {
        *self.token.write().await = None;
    }

    /// `{base}/v1/billing/subscriptions/{id}` with the id as one escaped segment
    fn subscription_url(&self, subscription_id: &str) -> Result<Url, PaymentError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PaymentError::Transport(format!("Invalid PayPal URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| PaymentError::Transport(format!("Invalid PayPal URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(["v1", "billing", "subscriptions", subscription_id]);
        Ok(url)
    }
}

#[async_trait]
impl PaymentProvider for PaypalClient {
    async fn get_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot, PaymentError> {
        let token = self.access_token().await?;
        let url = self.subscription_url(subscription_id)?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&token)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.forget_token().await;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let details: SubscriptionDetails = response
            .json()
            .await
            .map_err(|e| PaymentError::Decode(e.to_string()))?;

        let last_payment_amount = details
            .billing_info
            .and_then(|b| b.last_payment)
            .map(|p| p.amount.value)
            .unwrap_or_default();

        Ok(SubscriptionSnapshot {
            status: SubscriptionStatus::parse(&details.status),
            last_payment_amount,
        })
    }
}

// ============================================================================
// PayPal API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDetails {
    status: String,
    #[serde(default)]
    billing_info: Option<BillingInfo>,
}

#[derive(Debug, Deserialize)]
struct BillingInfo {
    #[serde(default)]
    last_payment: Option<LastPayment>,
}

#[derive(Debug, Deserialize)]
struct LastPayment {
    amount: Money,
}

#[derive(Debug, Deserialize)]
struct Money {
    value: String,
}
