//! ============================================================================
//! Payments - Subscription Status from the Payment Provider
//! ============================================================================
//! The membership evaluator only needs "what is the status of subscription X
//! and what was the last payment". [`PaymentProvider`] is that capability;
//! [`PaypalClient`] is the production implementation.
//! ============================================================================

mod paypal;

pub use paypal::PaypalClient;

use async_trait::async_trait;
use std::fmt;

use crate::retry::{classify_error, Classify, ErrorKind};

/// Provider-side subscription state, normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Suspended,
    /// Anything else the provider reports (APPROVAL_PENDING, EXPIRED, ...)
    Other(String),
}

impl SubscriptionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "ACTIVE" => Self::Active,
            "CANCELLED" | "CANCELED" => Self::Canceled,
            "SUSPENDED" => Self::Suspended,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Canceled => write!(f, "CANCELLED"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Result of a subscription lookup
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub status: SubscriptionStatus,
    /// Decimal amount as reported, e.g. "50.00". Empty when the provider has
    /// no payment on record.
    pub last_payment_amount: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment provider request failed: {0}")]
    Transport(String),

    #[error("Payment provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Payment provider authentication failed: {0}")]
    Auth(String),

    #[error("Unusable payment provider response: {0}")]
    Decode(String),
}

impl Classify for PaymentError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            PaymentError::Transport(msg) => classify_error(msg),
            PaymentError::Status { status, .. } if *status == 429 => ErrorKind::RateLimited,
            PaymentError::Status { status, .. } if *status >= 500 => ErrorKind::Retryable,
            PaymentError::Status { .. } => ErrorKind::Permanent,
            PaymentError::Auth(_) | PaymentError::Decode(_) => ErrorKind::Permanent,
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn get_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot, PaymentError>;
}
