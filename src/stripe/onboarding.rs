// Connected-account onboarding: payout-eligibility resolution and payee
// account provisioning.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::settings::PayoutSchedule;
use crate::stripe::errors::StripeApiError;
use crate::stripe::rest::ProviderApi;
use crate::stripe::types::{Account, AccountLink, AccountRequirements, LoginLink};

/// Snapshot of a payee's eligibility to receive funds. Always derived from a
/// fresh provider read; the provider is the source of truth, not this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingStatus {
    pub account_id: String,
    pub details_submitted: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub requirements: AccountRequirements,
}

/// Progression of a payee through onboarding. Derivable from any single
/// snapshot; transitions are monotonic in normal operation but nothing here
/// assumes they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardingStage {
    NotSubmitted,
    DetailsSubmitted,
    ChargesEnabled,
    FullyOnboarded,
}

impl OnboardingStatus {
    pub fn from_account(account: &Account) -> Self {
        Self {
            account_id: account.id.clone(),
            details_submitted: account.details_submitted,
            charges_enabled: account.charges_enabled,
            payouts_enabled: account.payouts_enabled,
            requirements: account.requirements.clone().unwrap_or_default(),
        }
    }

    /// Derived from the three capability flags, never provider-supplied.
    pub fn is_fully_onboarded(&self) -> bool {
        self.details_submitted && self.charges_enabled && self.payouts_enabled
    }

    pub fn stage(&self) -> OnboardingStage {
        if self.is_fully_onboarded() {
            OnboardingStage::FullyOnboarded
        } else if self.details_submitted && self.charges_enabled {
            OnboardingStage::ChargesEnabled
        } else if self.details_submitted {
            OnboardingStage::DetailsSubmitted
        } else {
            OnboardingStage::NotSubmitted
        }
    }

    /// Most urgent outstanding requirement, for user-facing messaging.
    pub fn next_requirement(&self) -> Option<&str> {
        self.requirements
            .past_due
            .first()
            .or_else(|| self.requirements.currently_due.first())
            .or_else(|| self.requirements.pending_verification.first())
            .or_else(|| self.requirements.eventually_due.first())
            .map(String::as_str)
    }
}

/// Read-through gate consulted before any checkout session is built for a
/// payee. Status can change between calls as requirements are completed, so
/// nothing is cached.
pub struct OnboardingResolver {
    api: Arc<dyn ProviderApi>,
}

impl OnboardingResolver {
    pub fn new(api: Arc<dyn ProviderApi>) -> Self {
        Self { api }
    }

    pub async fn resolve(&self, account_id: &str) -> Result<OnboardingStatus, StripeApiError> {
        let account = self.api.retrieve_account(account_id).await?;
        let status = OnboardingStatus::from_account(&account);
        debug!(
            account_id = %status.account_id,
            details_submitted = status.details_submitted,
            charges_enabled = status.charges_enabled,
            payouts_enabled = status.payouts_enabled,
            stage = ?status.stage(),
            "resolved onboarding status"
        );
        Ok(status)
    }

    /// Provision the provider-side account for a payee who first needs payout
    /// capability. Called once per payee; the account then lives for the
    /// payee's platform lifetime.
    pub async fn create_payee_account(
        &self,
        payee_id: &str,
        country: &str,
        payout_schedule: PayoutSchedule,
    ) -> Result<Account, StripeApiError> {
        let metadata = HashMap::from([("payee_id".to_string(), payee_id.to_string())]);
        let account = self
            .api
            .create_account(country, payout_schedule.interval(), &metadata)
            .await?;
        info!(
            account_id = %account.id,
            payee_id = %payee_id,
            country = %country,
            "created connected account"
        );
        Ok(account)
    }

    /// Hosted-onboarding URL the payee is redirected to for completing
    /// identity and banking requirements.
    pub async fn onboarding_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<AccountLink, StripeApiError> {
        self.api
            .create_account_link(account_id, refresh_url, return_url)
            .await
    }

    /// Dashboard login URL for an already-provisioned payee account.
    pub async fn login_link(&self, account_id: &str) -> Result<LoginLink, StripeApiError> {
        self.api.create_login_link(account_id).await
    }

    /// Re-tag an account with its owning payee id.
    pub async fn tag_account(
        &self,
        account_id: &str,
        payee_id: &str,
    ) -> Result<Account, StripeApiError> {
        let metadata = HashMap::from([("payee_id".to_string(), payee_id.to_string())]);
        self.api.update_account_metadata(account_id, &metadata).await
    }
}
