use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Who controls payout timing for connected accounts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutSchedule {
    Manual,
    Automatic,
}

impl PayoutSchedule {
    /// Provider payout-schedule interval value.
    pub fn interval(&self) -> &'static str {
        match self {
            PayoutSchedule::Manual => "manual",
            PayoutSchedule::Automatic => "daily",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StripeSettings {
    pub secret_key: String,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default)]
    pub stripe_version: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_webhook_tolerance_seconds")]
    pub webhook_tolerance_seconds: i64,
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default = "default_account_country")]
    pub account_country: String,
    #[serde(default = "default_payout_schedule")]
    pub payout_schedule: PayoutSchedule,
    #[serde(default = "default_state_ttl", with = "humantime_serde")]
    pub state_ttl: Duration,
}

impl Default for StripeSettings {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: String::new(),
            stripe_version: String::new(),
            timeout_ms: default_timeout_ms(),
            webhook_tolerance_seconds: default_webhook_tolerance_seconds(),
            default_currency: default_currency(),
            account_country: default_account_country(),
            payout_schedule: default_payout_schedule(),
            state_ttl: default_state_ttl(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub stripe: StripeSettings,
    pub server_port: u16,
    pub ledger_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stripe: StripeSettings::default(),
            server_port: 8080,
            ledger_path: "data/settlement-ledger.redb".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("STRIPE_SECRET_KEY is not set; refusing to start with payments disabled")]
    MissingSecretKey,
    #[error("STRIPE_WEBHOOK_SECRET is not set; webhook deliveries cannot be verified")]
    MissingWebhookSecret,
}

impl Config {
    /// Load from config.toml (if present) and environment variables.
    /// Environment variables override file values.
    /// Supported env keys: STRIPE_SECRET_KEY, STRIPE_WEBHOOK_SECRET,
    /// STRIPE_VERSION, STRIPE_TIMEOUT_MS, STRIPE_WEBHOOK_TOLERANCE_SECONDS,
    /// DEFAULT_CURRENCY, ACCOUNT_COUNTRY, PAYOUT_SCHEDULE, STATE_TTL,
    /// SERVER_PORT, LEDGER_PATH
    pub fn load() -> Self {
        // 1) Start with defaults + config.toml only if it exists
        let base: Config = Default::default();
        let mut fig = Figment::from(Serialized::defaults(base));
        if std::path::Path::new("config.toml").exists() {
            fig = fig.merge(Toml::file("config.toml"));
        }
        let mut cfg: Config = fig.extract().unwrap_or_default();

        // 2) Overlay environment variables explicitly
        if let Ok(v) = std::env::var("STRIPE_SECRET_KEY") {
            cfg.stripe.secret_key = v;
        }
        if let Ok(v) = std::env::var("STRIPE_WEBHOOK_SECRET") {
            cfg.stripe.webhook_secret = v;
        }
        if let Ok(v) = std::env::var("STRIPE_VERSION") {
            cfg.stripe.stripe_version = v;
        }
        if let Ok(v) = std::env::var("STRIPE_TIMEOUT_MS") {
            cfg.stripe.timeout_ms = v.parse().unwrap_or(cfg.stripe.timeout_ms);
        }
        if let Ok(v) = std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECONDS") {
            cfg.stripe.webhook_tolerance_seconds =
                v.parse().unwrap_or(cfg.stripe.webhook_tolerance_seconds);
        }
        if let Ok(v) = std::env::var("DEFAULT_CURRENCY") {
            cfg.stripe.default_currency = v.to_ascii_lowercase();
        }
        if let Ok(v) = std::env::var("ACCOUNT_COUNTRY") {
            cfg.stripe.account_country = v.to_ascii_uppercase();
        }
        if let Ok(v) = std::env::var("PAYOUT_SCHEDULE") {
            cfg.stripe.payout_schedule = match v.to_ascii_lowercase().as_str() {
                "automatic" => PayoutSchedule::Automatic,
                "manual" => PayoutSchedule::Manual,
                _ => cfg.stripe.payout_schedule,
            };
        }
        if let Ok(v) = std::env::var("STATE_TTL") {
            cfg.stripe.state_ttl = parse_duration_env(&v, cfg.stripe.state_ttl);
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            cfg.server_port = v.parse().unwrap_or(cfg.server_port);
        }
        if let Ok(v) = std::env::var("LEDGER_PATH") {
            cfg.ledger_path = v;
        }

        cfg
    }

    pub fn from_env() -> Self {
        Self::load()
    }

    /// Required secrets must be present before the process serves anything;
    /// absence fails fast rather than silently disabling payments.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stripe.secret_key.is_empty() {
            return Err(ConfigError::MissingSecretKey);
        }
        if self.stripe.webhook_secret.is_empty() {
            return Err(ConfigError::MissingWebhookSecret);
        }
        Ok(())
    }
}

fn parse_duration_env(value: &str, current: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(current)
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_webhook_tolerance_seconds() -> i64 {
    300 // 5 minutes
}

fn default_currency() -> String {
    "eur".to_string()
}

fn default_account_country() -> String {
    "IE".to_string()
}

fn default_payout_schedule() -> PayoutSchedule {
    PayoutSchedule::Manual
}

fn default_state_ttl() -> Duration {
    Duration::from_secs(3600)
}
