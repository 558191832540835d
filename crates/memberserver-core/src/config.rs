//! ============================================================================
//! Configuration - Environment Driven
//! ============================================================================
//! Everything comes from environment variables (a `.env` file is loaded by
//! the binary first). Unset optional integrations are simply disabled.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::ipcheck::DEFAULT_IP_CHECK_URL;
use crate::membership::TierThresholds;
use crate::retry::RetryConfig;

const HOUR: u64 = 60 * 60;

/// Cadence of each scheduled task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskIntervals {
    pub check_subscriptions: Duration,
    pub reconcile_acls: Duration,
    pub resource_status: Duration,
    pub update_resources: Duration,
    pub check_ip: Duration,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            check_subscriptions: Duration::from_secs(24 * HOUR),
            reconcile_acls: Duration::from_secs(25 * HOUR),
            resource_status: Duration::from_secs(HOUR),
            update_resources: Duration::from_secs(4 * HOUR),
            check_ip: Duration::from_secs(24 * HOUR),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Store path; `None` falls back to the store's default location
    pub db_path: Option<String>,
    /// WebSocket relay; `None` runs an in-process bus
    pub bus_url: Option<String>,
    pub paypal_url: Option<String>,
    pub paypal_client_id: Option<String>,
    pub paypal_client_secret: Option<String>,
    pub thresholds: TierThresholds,
    pub slack_webhook_url: Option<String>,
    pub resend_api_key: Option<String>,
    pub email_from_address: Option<String>,
    pub email_from_name: Option<String>,
    pub admin_email: Option<String>,
    pub ip_check_url: String,
    pub auto_push_on_mismatch: bool,
    pub device_timeout: Duration,
    pub retry: RetryConfig,
    pub intervals: TaskIntervals,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            bus_url: None,
            paypal_url: None,
            paypal_client_id: None,
            paypal_client_secret: None,
            thresholds: TierThresholds::default(),
            slack_webhook_url: None,
            resend_api_key: None,
            email_from_address: None,
            email_from_name: None,
            admin_email: None,
            ip_check_url: DEFAULT_IP_CHECK_URL.to_string(),
            auto_push_on_mismatch: true,
            device_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            intervals: TaskIntervals::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        fn parsed<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            match value {
                Some(v) => v
                    .parse()
                    .map_err(|e| anyhow!("Invalid value for {} ('{}'): {}", key, v, e)),
                None => Ok(default),
            }
        }

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            let n: u64 = parsed(key, get(key), default.as_secs())?;
            if n == 0 {
                return Err(anyhow!("{} must be greater than zero", key));
            }
            Ok(Duration::from_secs(n))
        };

        let defaults = Config::default();
        let intervals = TaskIntervals {
            check_subscriptions: secs(
                "CHECK_SUBSCRIPTIONS_INTERVAL_SECS",
                defaults.intervals.check_subscriptions,
            )?,
            reconcile_acls: secs("RECONCILE_ACLS_INTERVAL_SECS", defaults.intervals.reconcile_acls)?,
            resource_status: secs("RESOURCE_STATUS_INTERVAL_SECS", defaults.intervals.resource_status)?,
            update_resources: secs("UPDATE_RESOURCES_INTERVAL_SECS", defaults.intervals.update_resources)?,
            check_ip: secs("CHECK_IP_INTERVAL_SECS", defaults.intervals.check_ip)?,
        };

        let retry = RetryConfig {
            max_attempts: parsed("RETRY_MAX_ATTEMPTS", get("RETRY_MAX_ATTEMPTS"), defaults.retry.max_attempts)?,
            base_delay_ms: parsed("RETRY_BASE_DELAY_MS", get("RETRY_BASE_DELAY_MS"), defaults.retry.base_delay_ms)?,
            max_delay_ms: parsed("RETRY_MAX_DELAY_MS", get("RETRY_MAX_DELAY_MS"), defaults.retry.max_delay_ms)?,
            jitter: defaults.retry.jitter,
        };

        Ok(Self {
            db_path: get("MEMBERSERVER_DB_PATH"),
            bus_url: get("BUS_URL"),
            paypal_url: get("PAYPAL_URL"),
            paypal_client_id: get("PAYPAL_CLIENT_ID"),
            paypal_client_secret: get("PAYPAL_CLIENT_SECRET"),
            thresholds: TierThresholds {
                premium: parsed("PREMIUM_AMOUNT", get("PREMIUM_AMOUNT"), defaults.thresholds.premium)?,
                classic: parsed("CLASSIC_AMOUNT", get("CLASSIC_AMOUNT"), defaults.thresholds.classic)?,
            },
            slack_webhook_url: get("SLACK_WEBHOOK_URL"),
            resend_api_key: get("RESEND_API_KEY"),
            email_from_address: get("EMAIL_FROM_ADDRESS"),
            email_from_name: get("EMAIL_FROM_NAME"),
            admin_email: get("ADMIN_EMAIL"),
            ip_check_url: get("IP_CHECK_URL").unwrap_or(defaults.ip_check_url),
            auto_push_on_mismatch: parsed(
                "AUTO_PUSH_ON_MISMATCH",
                get("AUTO_PUSH_ON_MISMATCH"),
                defaults.auto_push_on_mismatch,
            )?,
            device_timeout: secs("DEVICE_TIMEOUT_SECS", defaults.device_timeout)?,
            retry,
            intervals,
        })
    }

    /// PayPal is enabled only with a URL and both credentials
    pub fn paypal(&self) -> Option<(&str, &str, &str)> {
        Some((
            self.paypal_url.as_deref()?,
            self.paypal_client_id.as_deref()?,
            self.paypal_client_secret.as_deref()?,
        ))
    }
}
