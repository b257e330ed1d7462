use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Instrument as _;

use crate::admission::{Admission, AdmissionGate};
use crate::audit::{AuditLog, GENERATE_ENDPOINT, Observability};
use crate::clock::Clock;
use crate::generation::{GeneratedItem, GenerationInput, GenerationProvider, GenerationRequest};
use crate::store::{LedgerStore, StoreError};
use crate::store_types::{ArtifactRecord, NewGenerationAttempt};
use crate::LedgerError;

/// Identity and transport metadata supplied by the request-handling layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    /// `None` when the caller could not be resolved to an account.
    pub account_id: Option<String>,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
}

impl CallContext {
    pub fn for_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub artifacts: Vec<ArtifactRecord>,
    /// Balance as of the transaction that committed the artifacts.
    pub balance: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub generation_cost: u64,
    pub upstream_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            generation_cost: 1,
            upstream_timeout: Duration::from_secs(60),
        }
    }
}

/// Where an attempt stopped. Every attempt that reaches `Debited` ends in
/// either `Committed` or `Refunded`; `RefundPending` means the compensating
/// credit failed and the pending debit is left for the recovery sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptStage {
    Rejected,
    Debited,
    Called,
    Committed,
    Refunded,
    RefundPending,
}

struct AttemptOutcome {
    stage: AttemptStage,
    result: Result<GenerationOutcome, LedgerError>,
}

impl AttemptOutcome {
    fn stopped(stage: AttemptStage, err: LedgerError) -> Self {
        Self {
            stage,
            result: Err(err),
        }
    }
}

#[derive(Clone)]
pub struct GenerationCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    gate: Arc<AdmissionGate>,
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn GenerationProvider>,
    audit: AuditLog,
    observability: Arc<Observability>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
}

impl GenerationCoordinator {
    pub fn new(
        gate: Arc<AdmissionGate>,
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn GenerationProvider>,
        observability: Arc<Observability>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        let audit = AuditLog::new(Arc::clone(&store), Arc::clone(&observability));
        Self {
            inner: Arc::new(CoordinatorInner {
                gate,
                store,
                provider,
                audit,
                observability,
                clock,
                settings,
            }),
        }
    }

    /// Runs one metered generation. Once the debit starts, the rest of the
    /// attempt runs on a detached task, so dropping the returned future cannot
    /// skip the compensating credit. Audit entries are written on their own
    /// detached tasks and may land shortly after the result is returned.
    pub async fn generate(
        &self,
        ctx: CallContext,
        input: &GenerationInput,
    ) -> Result<GenerationOutcome, LedgerError> {
        let span = tracing::info_span!(
            "generate",
            account_id = ctx.account_id.as_deref().unwrap_or("-"),
            request_id = tracing::field::Empty
        );
        let inner = Arc::clone(&self.inner);

        async move {
            inner.observability.record_request();

            let (account_id, request) = match inner.admit_and_validate(&ctx, input) {
                Ok(accepted) => accepted,
                Err(err) => {
                    inner.audit_outcome(&ctx, err.status_code());
                    return Err(err);
                }
            };

            let request_id = uuid::Uuid::new_v4().to_string();
            tracing::Span::current().record("request_id", request_id.as_str());

            let continuation = {
                let inner = Arc::clone(&inner);
                async move {
                    let outcome = inner.run_attempt(&account_id, &request_id, request).await;
                    let status = match &outcome.result {
                        Ok(_) => 200,
                        Err(err) => err.status_code(),
                    };
                    tracing::debug!(stage = ?outcome.stage, status, "attempt finished");
                    inner.audit_outcome(&ctx, status);
                    outcome.result
                }
                .instrument(tracing::Span::current())
            };

            match tokio::spawn(continuation).await {
                Ok(result) => result,
                Err(err) => Err(LedgerError::Store {
                    step: "generate",
                    source: StoreError::Join(err),
                }),
            }
        }
        .instrument(span)
        .await
    }
}

impl CoordinatorInner {
    fn admit_and_validate(
        &self,
        ctx: &CallContext,
        input: &GenerationInput,
    ) -> Result<(String, GenerationRequest), LedgerError> {
        if let Admission::Rejected { retry_after } = self.gate.try_admit() {
            self.observability.record_rate_limited();
            tracing::info!(retry_after_secs = retry_after.as_secs(), "rate limited");
            return Err(LedgerError::RateLimited { retry_after });
        }
        self.observability.record_admitted();

        let account_id = ctx
            .account_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(LedgerError::Unauthorized)?;

        let request = input.validate()?;
        Ok((account_id.to_string(), request))
    }

    async fn run_attempt(
        &self,
        account_id: &str,
        request_id: &str,
        request: GenerationRequest,
    ) -> AttemptOutcome {
        let balance = match self
            .store
            .debit(account_id, self.settings.generation_cost, request_id)
            .await
        {
            Ok(balance) => balance,
            Err(err) => {
                let err = LedgerError::store("debit")(err);
                match &err {
                    LedgerError::InsufficientBalance { balance, .. } => {
                        self.observability.record_insufficient_balance();
                        tracing::info!(balance, "insufficient balance");
                    }
                    LedgerError::UnknownAccount { .. } => {
                        tracing::info!("unknown account");
                    }
                    _ => tracing::error!(error = %err, "debit failed"),
                }
                return AttemptOutcome::stopped(AttemptStage::Rejected, err);
            }
        };
        tracing::debug!(balance, stage = ?AttemptStage::Debited, "debited");

        let items = match self.call_provider(&request).await {
            Ok(items) => items,
            Err(err) => {
                self.observability.record_upstream_failure();
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %err,
                    "upstream generation failed"
                );
                let stage = self.compensate(request_id).await;
                return AttemptOutcome::stopped(stage, err);
            }
        };

        let created_at_ms = self.clock.now_millis();
        let artifacts: Vec<ArtifactRecord> = items
            .into_iter()
            .map(|item| ArtifactRecord {
                id: uuid::Uuid::new_v4().to_string(),
                owner_account_id: account_id.to_string(),
                prompt: request.prompt.clone(),
                location_uri: item.uri,
                visibility: request.visibility,
                created_at_ms,
            })
            .collect();

        let balance = match self.store.settle_debit(request_id, &artifacts).await {
            Ok(balance) => balance,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    stage = ?AttemptStage::Called,
                    "artifact persistence failed"
                );
                let stage = self.compensate(request_id).await;
                return AttemptOutcome::stopped(stage, LedgerError::store("settle_debit")(err));
            }
        };

        tracing::info!(artifacts = artifacts.len(), balance, "generation committed");
        AttemptOutcome {
            stage: AttemptStage::Committed,
            result: Ok(GenerationOutcome { artifacts, balance }),
        }
    }

    async fn call_provider(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<GeneratedItem>, LedgerError> {
        let timeout = self.settings.upstream_timeout;
        match tokio::time::timeout(timeout, self.provider.generate(request)).await {
            Err(_) => Err(LedgerError::UpstreamFailure {
                status: Some(504),
                message: format!(
                    "{} did not respond within {}ms",
                    self.provider.name(),
                    timeout.as_millis()
                ),
            }),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(items)) if items.is_empty() => Err(LedgerError::UpstreamFailure {
                status: None,
                message: "no image generated".to_string(),
            }),
            Ok(Ok(items)) => Ok(items),
        }
    }

    /// Credits back a debit that did not produce artifacts.
    async fn compensate(&self, request_id: &str) -> AttemptStage {
        match self.store.refund_debit(request_id).await {
            Ok(Some(balance)) => {
                self.observability.record_refund();
                tracing::info!(balance, "debit refunded");
                AttemptStage::Refunded
            }
            Ok(None) => {
                tracing::debug!("debit already resolved");
                AttemptStage::Refunded
            }
            Err(err) => {
                self.observability.record_refund_failure();
                tracing::error!(request_id, error = %err, "compensating credit failed");
                AttemptStage::RefundPending
            }
        }
    }

    fn audit_outcome(&self, ctx: &CallContext, status: u16) {
        self.audit.spawn_record(NewGenerationAttempt {
            account_id: ctx.account_id.clone(),
            endpoint: GENERATE_ENDPOINT.to_string(),
            outcome_status: status,
            remote_address: ctx.remote_address.clone(),
            user_agent: ctx.user_agent.clone(),
        });
    }
}
