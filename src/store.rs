//! Transactional persistence seam for balances, payments, artifacts and the
//! call audit log.

use async_trait::async_trait;
use thiserror::Error;

use crate::store_types::{
    AccountRecord, ArtifactPage, ArtifactRecord, BalanceEntryKind, BalanceEntryRecord,
    GenerationAttemptRecord, NewGenerationAttempt, PaymentRecord, PendingDebitRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "store-postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),
    #[error("insufficient balance: balance={balance} required={required}")]
    InsufficientBalance { balance: u64, required: u64 },
    #[error("unknown account: {account_id}")]
    UnknownAccount { account_id: String },
    #[error("amount must be positive, got {amount}")]
    InvalidAmount { amount: u64 },
    #[error("debit {request_id} is no longer pending")]
    DebitNotPending { request_id: String },
}

/// Outcome of [`LedgerStore::grant_payment`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentGrant {
    pub record: PaymentRecord,
    /// `false` when the reference had already been granted; nothing was mutated.
    pub newly_granted: bool,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates the account with `default_balance` unless it already exists.
    async fn ensure_account(
        &self,
        account_id: &str,
        default_balance: u64,
    ) -> Result<AccountRecord, StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, StoreError>;

    async fn get_balance(&self, account_id: &str) -> Result<u64, StoreError>;

    /// Atomically checks `balance >= amount` and decrements, recording a
    /// pending debit under `request_id` in the same transaction.
    async fn debit(
        &self,
        account_id: &str,
        amount: u64,
        request_id: &str,
    ) -> Result<u64, StoreError>;

    /// Atomically increments, creating the account on first sight.
    async fn credit(
        &self,
        account_id: &str,
        amount: u64,
        kind: BalanceEntryKind,
        reference: Option<&str>,
    ) -> Result<u64, StoreError>;

    /// Reverses a pending debit. Returns `None` if it was already settled or
    /// refunded, which makes the call safe to repeat.
    async fn refund_debit(&self, request_id: &str) -> Result<Option<u64>, StoreError>;

    /// Resolves a pending debit as charged and stores its artifacts, atomically.
    /// Returns the account balance as of that transaction.
    async fn settle_debit(
        &self,
        request_id: &str,
        artifacts: &[ArtifactRecord],
    ) -> Result<u64, StoreError>;

    async fn list_stale_pending_debits(
        &self,
        older_than_ms: u64,
    ) -> Result<Vec<PendingDebitRecord>, StoreError>;

    /// Inserts the payment record and credits the account in one transaction,
    /// unless a record for the same reference exists, in which case that record
    /// is returned untouched.
    async fn grant_payment(
        &self,
        reference: &str,
        account_id: &str,
        amount: u64,
        credits: u64,
    ) -> Result<PaymentGrant, StoreError>;

    async fn find_payment(&self, reference: &str) -> Result<Option<PaymentRecord>, StoreError>;

    async fn append_generation_attempt(
        &self,
        attempt: &NewGenerationAttempt,
    ) -> Result<i64, StoreError>;

    async fn list_generation_attempts(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<GenerationAttemptRecord>, StoreError>;

    async fn list_balance_history(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<BalanceEntryRecord>, StoreError>;

    async fn list_artifacts_for_owner(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<ArtifactRecord>, StoreError>;

    async fn list_public_artifacts(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<ArtifactPage, StoreError>;
}
