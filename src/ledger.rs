//! The [`Ledger`] facade wires the admission gate, the store, the coordinator
//! and the payment reconciler behind the calls collaborators make.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionGate;
use crate::audit::{Observability, ObservabilitySnapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::coordinator::{CallContext, GenerationCoordinator, GenerationOutcome};
use crate::generation::{GenerationInput, GenerationProvider};
use crate::payments::{PaymentReconciler, PaymentVerifier, PlanCatalog, Reconciliation};
use crate::store::LedgerStore;
use crate::store_types::{
    AccountRecord, ArtifactPage, ArtifactRecord, BalanceEntryKind, BalanceEntryRecord,
    GenerationAttemptRecord,
};
use crate::{LedgerError, Result};

pub const OWNER_ARTIFACT_LIMIT: usize = 20;
pub const PUBLIC_ARTIFACTS_PER_PAGE: u64 = 12;

/// Added to the upstream timeout to cover settling or refunding after the call.
pub const SWEEP_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub refunded: usize,
    pub failed: usize,
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    coordinator: GenerationCoordinator,
    reconciler: PaymentReconciler,
    plans: PlanCatalog,
    observability: Arc<Observability>,
    default_balance: u64,
    min_sweep_age: Duration,
}

impl Ledger {
    pub fn new(
        config: &LedgerConfig,
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn GenerationProvider>,
        verifier: Arc<dyn PaymentVerifier>,
    ) -> Result<Self> {
        Self::with_clock(config, store, provider, verifier, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &LedgerConfig,
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn GenerationProvider>,
        verifier: Arc<dyn PaymentVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(AdmissionGate::with_clock(
            &config.admission,
            Arc::clone(&clock),
        )?);
        let observability = Arc::new(Observability::default());
        let settings = config.coordinator_settings();
        let coordinator = GenerationCoordinator::new(
            gate,
            Arc::clone(&store),
            provider,
            Arc::clone(&observability),
            clock,
            settings,
        );
        let reconciler =
            PaymentReconciler::new(Arc::clone(&store), verifier, config.lookup_timeout());

        Ok(Self {
            store,
            coordinator,
            reconciler,
            plans: config.plan_catalog(),
            observability,
            default_balance: config.accounts.default_balance,
            min_sweep_age: settings.upstream_timeout.saturating_add(SWEEP_GRACE),
        })
    }

    pub async fn generate(
        &self,
        ctx: CallContext,
        input: &GenerationInput,
    ) -> Result<GenerationOutcome> {
        self.coordinator.generate(ctx, input).await
    }

    pub async fn reconcile_payment(&self, reference: &str) -> Result<Reconciliation> {
        self.reconciler.reconcile(reference).await
    }

    pub async fn get_balance(&self, account_id: &str) -> Result<u64> {
        self.store
            .get_balance(account_id)
            .await
            .map_err(LedgerError::store("get_balance"))
    }

    /// First-touch provisioning; repeated calls return the existing account.
    pub async fn ensure_account(&self, account_id: &str) -> Result<AccountRecord> {
        if account_id.trim().is_empty() {
            return Err(LedgerError::InvalidRequest {
                reason: "account id must not be empty".to_string(),
            });
        }
        self.store
            .ensure_account(account_id, self.default_balance)
            .await
            .map_err(LedgerError::store("ensure_account"))
    }

    /// Operator credit outside the payment flow.
    pub async fn adjust_balance(
        &self,
        account_id: &str,
        credits: u64,
        note: Option<&str>,
    ) -> Result<u64> {
        let balance = self
            .store
            .credit(account_id, credits, BalanceEntryKind::Adjustment, note)
            .await
            .map_err(LedgerError::store("adjust_balance"))?;
        tracing::info!(account_id, credits, balance, "balance adjusted");
        Ok(balance)
    }

    pub async fn balance_history(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<BalanceEntryRecord>> {
        self.store
            .list_balance_history(account_id, limit)
            .await
            .map_err(LedgerError::store("balance_history"))
    }

    pub async fn artifacts_for_owner(&self, account_id: &str) -> Result<Vec<ArtifactRecord>> {
        self.store
            .list_artifacts_for_owner(account_id, OWNER_ARTIFACT_LIMIT)
            .await
            .map_err(LedgerError::store("artifacts_for_owner"))
    }

    pub async fn public_artifacts(&self, page: u64) -> Result<ArtifactPage> {
        self.store
            .list_public_artifacts(page, PUBLIC_ARTIFACTS_PER_PAGE)
            .await
            .map_err(LedgerError::store("public_artifacts"))
    }

    pub async fn generation_attempts(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<GenerationAttemptRecord>> {
        self.store
            .list_generation_attempts(limit, since_ts_ms)
            .await
            .map_err(LedgerError::store("generation_attempts"))
    }

    /// Youngest pending debit the sweep may refund. Anything younger can still
    /// belong to a generation whose upstream call is in flight.
    pub fn min_sweep_age(&self) -> Duration {
        self.min_sweep_age
    }

    /// Refunds debits that never reached a terminal outcome within `max_age`.
    /// Meant to be run out of band, e.g. from a scheduled job. `max_age` must be
    /// at least [`Ledger::min_sweep_age`].
    pub async fn sweep_stale_debits(&self, max_age: Duration) -> Result<SweepReport> {
        if max_age < self.min_sweep_age {
            return Err(LedgerError::Config(format!(
                "sweep max age {}s is below the minimum of {}s (upstream timeout plus grace)",
                max_age.as_secs(),
                self.min_sweep_age.as_secs()
            )));
        }
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let stale = self
            .store
            .list_stale_pending_debits(max_age_ms)
            .await
            .map_err(LedgerError::store("list_stale_pending_debits"))?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };
        for pending in stale {
            match self.store.refund_debit(&pending.request_id).await {
                Ok(Some(balance)) => {
                    report.refunded += 1;
                    self.observability.record_refund();
                    tracing::info!(
                        request_id = %pending.request_id,
                        account_id = %pending.account_id,
                        balance,
                        "stale debit refunded"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    report.failed += 1;
                    self.observability.record_refund_failure();
                    tracing::error!(
                        request_id = %pending.request_id,
                        error = %err,
                        "stale debit refund failed"
                    );
                }
            }
        }
        Ok(report)
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }
}
