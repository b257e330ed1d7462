//! Payment confirmation: converting a processor-confirmed purchase into a
//! credit grant exactly once per external reference.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::LedgerError;
use crate::store::LedgerStore;

/// Authoritative view of a payment, as reported by the processor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatus {
    pub completed: bool,
    pub account_id: Option<String>,
    /// Amount charged in the smallest currency unit; informational.
    pub amount: u64,
    pub credits: u64,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid payment reference: {0}")]
    InvalidReference(String),
    #[error("payment lookup failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify_payment(&self, reference: &str) -> Result<PaymentStatus, VerifyError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub granted: bool,
    pub credits: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPlan {
    pub name: String,
    pub amount_cents: u64,
    pub credits: u64,
}

impl CreditPlan {
    pub fn new(name: impl Into<String>, amount_cents: u64, credits: u64) -> Self {
        Self {
            name: name.into(),
            amount_cents,
            credits,
        }
    }
}

pub fn default_plans() -> Vec<CreditPlan> {
    vec![
        CreditPlan::new("pro", 999, 100),
        CreditPlan::new("premiere", 2999, 310),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanCatalog {
    plans: Vec<CreditPlan>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::new(default_plans())
    }
}

impl PlanCatalog {
    pub fn new(plans: Vec<CreditPlan>) -> Self {
        Self { plans }
    }

    pub fn plans(&self) -> &[CreditPlan] {
        &self.plans
    }

    pub fn resolve(&self, name: &str) -> Result<&CreditPlan, LedgerError> {
        self.plans
            .iter()
            .find(|plan| plan.name == name)
            .ok_or_else(|| LedgerError::InvalidRequest {
                reason: format!("invalid plan: {name}"),
            })
    }
}

pub struct PaymentReconciler {
    store: Arc<dyn LedgerStore>,
    verifier: Arc<dyn PaymentVerifier>,
    lookup_timeout: Duration,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        verifier: Arc<dyn PaymentVerifier>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            store,
            verifier,
            lookup_timeout,
        }
    }

    /// Safe to call any number of times for the same reference: only the first
    /// successful call mutates the balance, every call reports the same grant.
    pub async fn reconcile(&self, reference: &str) -> Result<Reconciliation, LedgerError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(LedgerError::InvalidReference {
                reference: String::new(),
                reason: "missing reference".to_string(),
            });
        }

        let status = match tokio::time::timeout(
            self.lookup_timeout,
            self.verifier.verify_payment(reference),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(VerifyError::InvalidReference(reason))) => {
                return Err(LedgerError::InvalidReference {
                    reference: reference.to_string(),
                    reason,
                });
            }
            Ok(Err(VerifyError::Transport(message))) => {
                tracing::warn!(reference, error = %message, "payment lookup failed");
                return Err(LedgerError::PaymentNotCompleted {
                    reference: reference.to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(
                    reference,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "payment lookup timed out"
                );
                return Err(LedgerError::PaymentNotCompleted {
                    reference: reference.to_string(),
                });
            }
        };

        if !status.completed {
            tracing::debug!(reference, "payment not completed");
            return Err(LedgerError::PaymentNotCompleted {
                reference: reference.to_string(),
            });
        }

        let Some(account_id) = status.account_id.as_deref().filter(|id| !id.is_empty()) else {
            return Err(LedgerError::InvalidReference {
                reference: reference.to_string(),
                reason: "payment carries no account".to_string(),
            });
        };
        if status.credits == 0 {
            return Err(LedgerError::InvalidReference {
                reference: reference.to_string(),
                reason: "payment carries no credits".to_string(),
            });
        }

        let grant = self
            .store
            .grant_payment(reference, account_id, status.amount, status.credits)
            .await
            .map_err(LedgerError::store("grant_payment"))?;

        if grant.newly_granted {
            tracing::info!(
                reference,
                account_id = %grant.record.account_id,
                credits = grant.record.credits_granted,
                "payment granted"
            );
        } else {
            tracing::info!(reference, "payment already granted");
        }

        Ok(Reconciliation {
            granted: true,
            credits: grant.record.credits_granted,
        })
    }
}
