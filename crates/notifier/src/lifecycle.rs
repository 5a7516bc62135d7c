//! Token lifecycle manager - retires addresses the provider reports as dead.
//!
//! After a dispatch or a redrive, every outcome whose error code is in the
//! permanent-failure set marks its address for deactivation. Addresses are
//! deduplicated first, so an address that recurs across chunks is retired once.

use std::collections::HashSet;
use std::sync::Arc;

use pulse_common::types::DeliveryOutcome;

use crate::token_store::TokenStore;

/// Addresses to retire and to mark as recently used, both deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecyclePlan {
    pub invalid: Vec<String>,
    pub delivered: Vec<String>,
}

pub struct TokenLifecycleManager {
    store: Arc<dyn TokenStore>,
    permanent_codes: HashSet<String>,
}

impl TokenLifecycleManager {
    pub fn new<I, S>(store: Arc<dyn TokenStore>, permanent_codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            permanent_codes: permanent_codes.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `code` means the address will never accept deliveries again.
    pub fn is_permanent(&self, code: &str) -> bool {
        self.permanent_codes.contains(code)
    }

    /// Sort `(address, outcome)` pairs into retire / touch lists.
    ///
    /// First-seen order is kept; duplicates are dropped.
    pub fn plan<'a, I>(&self, outcomes: I) -> LifecyclePlan
    where
        I: IntoIterator<Item = (&'a str, &'a DeliveryOutcome)>,
    {
        let mut seen_invalid = HashSet::new();
        let mut seen_delivered = HashSet::new();
        let mut plan = LifecyclePlan::default();

        for (address, outcome) in outcomes {
            match outcome {
                DeliveryOutcome::Success { .. } => {
                    if seen_delivered.insert(address) {
                        plan.delivered.push(address.to_string());
                    }
                }
                DeliveryOutcome::Failure { error_code } => {
                    if self.is_permanent(error_code) && seen_invalid.insert(address) {
                        plan.invalid.push(address.to_string());
                    }
                }
            }
        }

        plan
    }

    /// Push the plan to the token store. Returns how many addresses were retired.
    ///
    /// Store failures are logged; the count always reflects the plan.
    pub async fn apply(&self, plan: &LifecyclePlan) -> usize {
        if !plan.invalid.is_empty() {
            match self.store.deactivate(&plan.invalid).await {
                Ok(()) => tracing::info!(count = plan.invalid.len(), "Retired invalid addresses"),
                Err(e) => tracing::warn!(
                    count = plan.invalid.len(),
                    error = %e,
                    "Failed to deactivate invalid addresses"
                ),
            }
        }

        if !plan.delivered.is_empty()
            && let Err(e) = self.store.touch_last_used(&plan.delivered).await
        {
            tracing::debug!(error = %e, "Failed to update last-used timestamps");
        }

        plan.invalid.len()
    }
}
