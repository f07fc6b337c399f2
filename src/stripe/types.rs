// Minimal provider DTOs and helper types
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmountPreconditionError {
    #[error("currency must be a three-letter code")]
    BadCurrency,
    #[error("amount must be non-negative minor units")]
    InvalidAmount,
}

// Helper to enforce minor-unit preconditions at the API boundary.
pub fn ensure_minor_units(amount_minor: i64, currency: &str) -> Result<(), AmountPreconditionError> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AmountPreconditionError::BadCurrency);
    }
    if amount_minor < 0 {
        return Err(AmountPreconditionError::InvalidAmount);
    }
    Ok(())
}

// Connected account, the payee-side reference. Capability flags default to
// false so a partial payload never reads as onboarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub requirements: Option<AccountRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRequirements {
    #[serde(default)]
    pub currently_due: Vec<String>,
    #[serde(default)]
    pub eventually_due: Vec<String>,
    #[serde(default)]
    pub past_due: Vec<String>,
    #[serde(default)]
    pub pending_verification: Vec<String>,
}

// Hosted-onboarding link for a connected account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLink {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

// Express-dashboard login link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginLink {
    pub url: String,
}

// Single per-account capability, delivered by capability.updated events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub account: String,
    pub status: String,
}

// Checkout session minimal shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

// PaymentIntent minimal shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

// Transfer minimal shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversed: Option<bool>,
}

// Payout minimal shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

// Webhook event envelope

/// Provider webhook/event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub livemode: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_attributes: Option<serde_json::Value>,
}

// Request shape for checkout-session creation; the REST client turns this
// into the provider's form encoding.
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub currency: String,
    pub line_items: Vec<LineItem>,
    /// Connected account that receives settled funds.
    pub destination_account: String,
    /// Platform cut withheld by the provider at settlement time.
    pub application_fee_minor: i64,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    /// Attached to both the session and its payment intent.
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LineItem {
    pub name: String,
    pub unit_amount_minor: i64,
    pub quantity: u32,
}
