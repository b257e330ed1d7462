use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::Instrument as _;

use crate::store::LedgerStore;
use crate::store_types::NewGenerationAttempt;

pub const GENERATE_ENDPOINT: &str = "/api/generate";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub admitted: u64,
    pub rate_limited: u64,
    pub insufficient_balance: u64,
    pub upstream_failures: u64,
    pub refunds: u64,
    pub refund_failures: u64,
    pub audit_write_failures: u64,
}

/// Process-local counters; shared across concurrent requests.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    insufficient_balance: AtomicU64,
    upstream_failures: AtomicU64,
    refunds: AtomicU64,
    refund_failures: AtomicU64,
    audit_write_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_admitted(&self) {
        bump(&self.admitted);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_insufficient_balance(&self) {
        bump(&self.insufficient_balance);
    }

    pub fn record_upstream_failure(&self) {
        bump(&self.upstream_failures);
    }

    pub fn record_refund(&self) {
        bump(&self.refunds);
    }

    pub fn record_refund_failure(&self) {
        bump(&self.refund_failures);
    }

    pub fn record_audit_write_failure(&self) {
        bump(&self.audit_write_failures);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            insufficient_balance: self.insufficient_balance.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            refunds: self.refunds.load(Ordering::Relaxed),
            refund_failures: self.refund_failures.load(Ordering::Relaxed),
            audit_write_failures: self.audit_write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Writes one generation-attempt entry per request outcome. A failed write is
/// logged and counted but never changes the outcome returned to the caller.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn LedgerStore>,
    observability: Arc<Observability>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn LedgerStore>, observability: Arc<Observability>) -> Self {
        Self {
            store,
            observability,
        }
    }

    /// Writes the entry on a detached task in the current span. The caller
    /// never waits on the store, and dropping the caller does not lose the entry.
    pub fn spawn_record(&self, attempt: NewGenerationAttempt) -> tokio::task::JoinHandle<()> {
        let audit = self.clone();
        tokio::spawn(
            async move { audit.record(attempt).await }.instrument(tracing::Span::current()),
        )
    }

    pub async fn record(&self, attempt: NewGenerationAttempt) {
        if let Err(err) = self.store.append_generation_attempt(&attempt).await {
            self.observability.record_audit_write_failure();
            tracing::error!(
                error = %err,
                endpoint = %attempt.endpoint,
                status = attempt.outcome_status,
                "failed to write generation audit entry"
            );
        }
    }
}
