// Platform fee rules and the per-payment monetary breakdown.
// All amounts are integers in minor currency units; money math never
// touches floating point.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Fixed fee charged to the payer on top of the task price.
pub const PAYER_FEE_MINOR: i64 = 200;

/// Commission withheld from the payee, in basis points of the task price.
pub const COMMISSION_BPS: i64 = 1_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeeError {
    #[error("task price must be a non-negative amount in minor units")]
    InvalidAmount,
}

/// The full monetary split for one task payment.
///
/// Invariants, maintained by [`compute_breakdown`]:
/// `total_charge_minor = task_price_minor + payer_fee_minor`,
/// `platform_fee_minor = payer_fee_minor + payee_commission_minor`,
/// `payee_receives_minor = task_price_minor - payee_commission_minor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentBreakdown {
    pub task_price_minor: i64,
    pub payer_fee_minor: i64,
    pub payee_commission_minor: i64,
    pub total_charge_minor: i64,
    pub platform_fee_minor: i64,
    pub payee_receives_minor: i64,
    pub currency: String,
}

impl PaymentBreakdown {
    /// Every amount as string key/value pairs, ready to ride in provider
    /// metadata so webhook handlers can reconstruct intent without a lookup.
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("task_price_minor".to_string(), self.task_price_minor.to_string()),
            ("payer_fee_minor".to_string(), self.payer_fee_minor.to_string()),
            (
                "payee_commission_minor".to_string(),
                self.payee_commission_minor.to_string(),
            ),
            ("total_charge_minor".to_string(), self.total_charge_minor.to_string()),
            ("platform_fee_minor".to_string(), self.platform_fee_minor.to_string()),
            (
                "payee_receives_minor".to_string(),
                self.payee_receives_minor.to_string(),
            ),
            ("currency".to_string(), self.currency.clone()),
        ])
    }
}

/// Pure and deterministic: the same price always yields the same breakdown.
/// Commission is rounded half-up to the nearest minor unit.
pub fn compute_breakdown(task_price_minor: i64, currency: &str) -> Result<PaymentBreakdown, FeeError> {
    if task_price_minor < 0 {
        return Err(FeeError::InvalidAmount);
    }

    let payee_commission_minor = task_price_minor
        .checked_mul(COMMISSION_BPS)
        .and_then(|v| v.checked_add(5_000))
        .map(|v| v / 10_000)
        .ok_or(FeeError::InvalidAmount)?;
    let total_charge_minor = task_price_minor
        .checked_add(PAYER_FEE_MINOR)
        .ok_or(FeeError::InvalidAmount)?;

    Ok(PaymentBreakdown {
        task_price_minor,
        payer_fee_minor: PAYER_FEE_MINOR,
        payee_commission_minor,
        total_charge_minor,
        platform_fee_minor: PAYER_FEE_MINOR + payee_commission_minor,
        payee_receives_minor: task_price_minor - payee_commission_minor,
        currency: currency.to_ascii_lowercase(),
    })
}
