//! Postgres-backed ledger. Balance changes lock only the affected account row
//! (`SELECT ... FOR UPDATE` or a single-row `UPDATE`), so debits for different
//! accounts run in parallel.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

use crate::clock::{Clock, SystemClock};
use crate::store::{LedgerStore, PaymentGrant, StoreError};
use crate::store_types::{
    AccountRecord, ArtifactPage, ArtifactRecord, BalanceEntryKind, BalanceEntryRecord,
    GenerationAttemptRecord, NewGenerationAttempt, PaymentRecord, PendingDebitRecord, Visibility,
};

type PgTransaction<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        u64_to_i64(self.clock.now_millis())
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn ensure_account(
        &self,
        account_id: &str,
        default_balance: u64,
    ) -> Result<AccountRecord, StoreError> {
        let ts_ms = self.now_ms();
        let balance = u64_to_i64(default_balance);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO accounts (account_id, balance, created_at_ms, updated_at_ms)
             VALUES ($1, $2, $3, $3)
             ON CONFLICT (account_id) DO NOTHING",
        )
        .bind(account_id)
        .bind(balance)
        .bind(ts_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 1 && balance > 0 {
            insert_balance_entry(
                &mut tx,
                account_id,
                BalanceEntryKind::Grant,
                balance,
                balance,
                None,
                ts_ms,
            )
            .await?;
        }

        let row = sqlx::query(
            "SELECT account_id, balance, created_at_ms, updated_at_ms
             FROM accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;
        let account = account_from_row(&row)?;
        tx.commit().await?;
        Ok(account)
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT account_id, balance, created_at_ms, updated_at_ms
             FROM accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn get_balance(&self, account_id: &str) -> Result<u64, StoreError> {
        match self.get_account(account_id).await? {
            Some(account) => Ok(account.balance),
            None => Err(StoreError::UnknownAccount {
                account_id: account_id.to_string(),
            }),
        }
    }

    async fn debit(
        &self,
        account_id: &str,
        amount: u64,
        request_id: &str,
    ) -> Result<u64, StoreError> {
        if amount == 0 {
            return Err(StoreError::InvalidAmount { amount });
        }
        let ts_ms = self.now_ms();
        let amount_i64 = u64_to_i64(amount);
        let mut tx = self.pool.begin().await?;

        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(balance) = balance else {
            return Err(StoreError::UnknownAccount {
                account_id: account_id.to_string(),
            });
        };

        let balance_u64 = i64_to_u64(balance);
        if balance_u64 < amount {
            return Err(StoreError::InsufficientBalance {
                balance: balance_u64,
                required: amount,
            });
        }
        let next = balance - amount_i64;

        sqlx::query("UPDATE accounts SET balance = $2, updated_at_ms = $3 WHERE account_id = $1")
            .bind(account_id)
            .bind(next)
            .bind(ts_ms)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO pending_debits (request_id, account_id, amount, ts_ms)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(request_id)
        .bind(account_id)
        .bind(amount_i64)
        .bind(ts_ms)
        .execute(&mut *tx)
        .await?;
        insert_balance_entry(
            &mut tx,
            account_id,
            BalanceEntryKind::Debit,
            -amount_i64,
            next,
            Some(request_id),
            ts_ms,
        )
        .await?;

        tx.commit().await?;
        Ok(i64_to_u64(next))
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: u64,
        kind: BalanceEntryKind,
        reference: Option<&str>,
    ) -> Result<u64, StoreError> {
        if amount == 0 {
            return Err(StoreError::InvalidAmount { amount });
        }
        let ts_ms = self.now_ms();
        let mut tx = self.pool.begin().await?;
        let balance = apply_credit(
            &mut tx,
            account_id,
            u64_to_i64(amount),
            kind,
            reference,
            ts_ms,
        )
        .await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn refund_debit(&self, request_id: &str) -> Result<Option<u64>, StoreError> {
        let ts_ms = self.now_ms();
        let mut tx = self.pool.begin().await?;

        // Deleting the row claims the refund; a concurrent caller finds nothing.
        let pending = sqlx::query(
            "DELETE FROM pending_debits WHERE request_id = $1 RETURNING account_id, amount",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(pending) = pending else {
            return Ok(None);
        };
        let account_id: String = pending.try_get("account_id")?;
        let amount: i64 = pending.try_get("amount")?;

        let balance = apply_credit(
            &mut tx,
            &account_id,
            amount.max(0),
            BalanceEntryKind::Refund,
            Some(request_id),
            ts_ms,
        )
        .await?;
        tx.commit().await?;
        Ok(Some(balance))
    }

    async fn settle_debit(
        &self,
        request_id: &str,
        artifacts: &[ArtifactRecord],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let account_id: Option<String> = sqlx::query_scalar(
            "DELETE FROM pending_debits WHERE request_id = $1 RETURNING account_id",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(account_id) = account_id else {
            return Err(StoreError::DebitNotPending {
                request_id: request_id.to_string(),
            });
        };

        for artifact in artifacts {
            sqlx::query(
                "INSERT INTO artifacts (
                    id, owner_account_id, prompt, location_uri, visibility,
                    request_id, created_at_ms
                 )
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(artifact.id.as_str())
            .bind(artifact.owner_account_id.as_str())
            .bind(artifact.prompt.as_str())
            .bind(artifact.location_uri.as_str())
            .bind(artifact.visibility.as_str())
            .bind(request_id)
            .bind(u64_to_i64(artifact.created_at_ms))
            .execute(&mut *tx)
            .await?;
        }

        let balance: i64 = sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = $1")
            .bind(account_id.as_str())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(i64_to_u64(balance))
    }

    async fn list_stale_pending_debits(
        &self,
        older_than_ms: u64,
    ) -> Result<Vec<PendingDebitRecord>, StoreError> {
        let cutoff = self.now_ms().saturating_sub(u64_to_i64(older_than_ms));
        let rows = sqlx::query(
            "SELECT request_id, account_id, amount, ts_ms
             FROM pending_debits
             WHERE ts_ms <= $1
             ORDER BY ts_ms, request_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PendingDebitRecord, StoreError> {
                Ok(PendingDebitRecord {
                    request_id: row.try_get("request_id")?,
                    account_id: row.try_get("account_id")?,
                    amount: i64_to_u64(row.try_get("amount")?),
                    ts_ms: i64_to_u64(row.try_get("ts_ms")?),
                })
            })
            .collect()
    }

    async fn grant_payment(
        &self,
        reference: &str,
        account_id: &str,
        amount: u64,
        credits: u64,
    ) -> Result<PaymentGrant, StoreError> {
        if credits == 0 {
            return Err(StoreError::InvalidAmount { amount: credits });
        }
        let ts_ms = self.now_ms();
        let mut tx = self.pool.begin().await?;

        // A concurrent insert of the same reference waits on the unique index
        // and then does nothing.
        let inserted = sqlx::query(
            "INSERT INTO payments
                (external_reference, account_id, amount, credits_granted, recorded_at_ms)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (external_reference) DO NOTHING",
        )
        .bind(reference)
        .bind(account_id)
        .bind(u64_to_i64(amount))
        .bind(u64_to_i64(credits))
        .bind(ts_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let row = sqlx::query(
                "SELECT external_reference, account_id, amount, credits_granted, recorded_at_ms
                 FROM payments WHERE external_reference = $1",
            )
            .bind(reference)
            .fetch_one(&mut *tx)
            .await?;
            let record = payment_from_row(&row)?;
            tx.commit().await?;
            return Ok(PaymentGrant {
                record,
                newly_granted: false,
            });
        }

        apply_credit(
            &mut tx,
            account_id,
            u64_to_i64(credits),
            BalanceEntryKind::Payment,
            Some(reference),
            ts_ms,
        )
        .await?;
        tx.commit().await?;

        Ok(PaymentGrant {
            record: PaymentRecord {
                external_reference: reference.to_string(),
                account_id: account_id.to_string(),
                amount,
                credits_granted: credits,
                recorded_at_ms: i64_to_u64(ts_ms),
            },
            newly_granted: true,
        })
    }

    async fn find_payment(&self, reference: &str) -> Result<Option<PaymentRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT external_reference, account_id, amount, credits_granted, recorded_at_ms
             FROM payments WHERE external_reference = $1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn append_generation_attempt(
        &self,
        attempt: &NewGenerationAttempt,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO generation_attempts
                (account_id, endpoint, outcome_status, remote_address, user_agent, ts_ms)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(attempt.account_id.as_deref())
        .bind(attempt.endpoint.as_str())
        .bind(i32::from(attempt.outcome_status))
        .bind(attempt.remote_address.as_deref())
        .bind(attempt.user_agent.as_deref())
        .bind(self.now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_generation_attempts(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<GenerationAttemptRecord>, StoreError> {
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, account_id, endpoint, outcome_status, remote_address, user_agent, ts_ms
             FROM generation_attempts
             WHERE $1::BIGINT IS NULL OR ts_ms >= $1
             ORDER BY id DESC
             LIMIT $2",
        )
        .bind(since_ts_ms.map(u64_to_i64))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<GenerationAttemptRecord, StoreError> {
                Ok(GenerationAttemptRecord {
                    id: row.try_get("id")?,
                    account_id: row.try_get("account_id")?,
                    endpoint: row.try_get("endpoint")?,
                    outcome_status: u16::try_from(row.try_get::<i32, _>("outcome_status")?)
                        .unwrap_or(0),
                    remote_address: row.try_get("remote_address")?,
                    user_agent: row.try_get("user_agent")?,
                    ts_ms: i64_to_u64(row.try_get("ts_ms")?),
                })
            })
            .collect()
    }

    async fn list_balance_history(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<BalanceEntryRecord>, StoreError> {
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, account_id, kind, delta, balance_after, reference, ts_ms
             FROM balance_entries
             WHERE account_id = $1
             ORDER BY id DESC
             LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<BalanceEntryRecord, StoreError> {
                let kind: String = row.try_get("kind")?;
                Ok(BalanceEntryRecord {
                    id: row.try_get("id")?,
                    account_id: row.try_get("account_id")?,
                    kind: BalanceEntryKind::parse(&kind).unwrap_or(BalanceEntryKind::Adjustment),
                    delta: row.try_get("delta")?,
                    balance_after: i64_to_u64(row.try_get("balance_after")?),
                    reference: row.try_get("reference")?,
                    ts_ms: i64_to_u64(row.try_get("ts_ms")?),
                })
            })
            .collect()
    }

    async fn list_artifacts_for_owner(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<ArtifactRecord>, StoreError> {
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, owner_account_id, prompt, location_uri, visibility, created_at_ms
             FROM artifacts
             WHERE owner_account_id = $1
             ORDER BY created_at_ms DESC, seq DESC
             LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn list_public_artifacts(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<ArtifactPage, StoreError> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let offset = u64_to_i64(page.saturating_sub(1).saturating_mul(per_page));

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE visibility = 'public'")
                .fetch_one(&self.pool)
                .await?;
        let rows = sqlx::query(
            "SELECT id, owner_account_id, prompt, location_uri, visibility, created_at_ms
             FROM artifacts
             WHERE visibility = 'public'
             ORDER BY created_at_ms DESC, seq DESC
             LIMIT $1 OFFSET $2",
        )
        .bind(u64_to_i64(per_page))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(ArtifactPage {
            artifacts: rows
                .iter()
                .map(artifact_from_row)
                .collect::<Result<Vec<_>, _>>()?,
            total_pages: i64_to_u64(total).div_ceil(per_page),
            current_page: page,
        })
    }
}

async fn apply_credit(
    tx: &mut PgTransaction<'_>,
    account_id: &str,
    amount: i64,
    kind: BalanceEntryKind,
    reference: Option<&str>,
    ts_ms: i64,
) -> Result<u64, StoreError> {
    let balance: i64 = sqlx::query_scalar(
        "INSERT INTO accounts (account_id, balance, created_at_ms, updated_at_ms)
         VALUES ($1, $2, $3, $3)
         ON CONFLICT (account_id)
         DO UPDATE SET balance = accounts.balance + EXCLUDED.balance,
                       updated_at_ms = EXCLUDED.updated_at_ms
         RETURNING balance",
    )
    .bind(account_id)
    .bind(amount)
    .bind(ts_ms)
    .fetch_one(&mut **tx)
    .await?;
    insert_balance_entry(tx, account_id, kind, amount, balance, reference, ts_ms).await?;
    Ok(i64_to_u64(balance))
}

async fn insert_balance_entry(
    tx: &mut PgTransaction<'_>,
    account_id: &str,
    kind: BalanceEntryKind,
    delta: i64,
    balance_after: i64,
    reference: Option<&str>,
    ts_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO balance_entries (account_id, kind, delta, balance_after, reference, ts_ms)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(account_id)
    .bind(kind.as_str())
    .bind(delta)
    .bind(balance_after)
    .bind(reference)
    .bind(ts_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn account_from_row(row: &PgRow) -> Result<AccountRecord, StoreError> {
    Ok(AccountRecord {
        account_id: row.try_get("account_id")?,
        balance: i64_to_u64(row.try_get("balance")?),
        created_at_ms: i64_to_u64(row.try_get("created_at_ms")?),
        updated_at_ms: i64_to_u64(row.try_get("updated_at_ms")?),
    })
}

fn payment_from_row(row: &PgRow) -> Result<PaymentRecord, StoreError> {
    Ok(PaymentRecord {
        external_reference: row.try_get("external_reference")?,
        account_id: row.try_get("account_id")?,
        amount: i64_to_u64(row.try_get("amount")?),
        credits_granted: i64_to_u64(row.try_get("credits_granted")?),
        recorded_at_ms: i64_to_u64(row.try_get("recorded_at_ms")?),
    })
}

fn artifact_from_row(row: &PgRow) -> Result<ArtifactRecord, StoreError> {
    let visibility: String = row.try_get("visibility")?;
    Ok(ArtifactRecord {
        id: row.try_get("id")?,
        owner_account_id: row.try_get("owner_account_id")?,
        prompt: row.try_get("prompt")?,
        location_uri: row.try_get("location_uri")?,
        visibility: Visibility::parse(&visibility).unwrap_or_default(),
        created_at_ms: i64_to_u64(row.try_get("created_at_ms")?),
    })
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        account_id TEXT PRIMARY KEY,
        balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
        created_at_ms BIGINT NOT NULL,
        updated_at_ms BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS balance_entries (
        id BIGSERIAL PRIMARY KEY,
        account_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        delta BIGINT NOT NULL,
        balance_after BIGINT NOT NULL,
        reference TEXT,
        ts_ms BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_balance_entries_account_id
        ON balance_entries(account_id, id)",
    "CREATE TABLE IF NOT EXISTS pending_debits (
        request_id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        amount BIGINT NOT NULL,
        ts_ms BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pending_debits_ts_ms ON pending_debits(ts_ms)",
    "CREATE TABLE IF NOT EXISTS payments (
        external_reference TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        amount BIGINT NOT NULL,
        credits_granted BIGINT NOT NULL CHECK (credits_granted > 0),
        recorded_at_ms BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_payments_account_id ON payments(account_id)",
    "CREATE TABLE IF NOT EXISTS artifacts (
        seq BIGSERIAL,
        id TEXT PRIMARY KEY,
        owner_account_id TEXT NOT NULL,
        prompt TEXT NOT NULL,
        location_uri TEXT NOT NULL,
        visibility TEXT NOT NULL,
        request_id TEXT NOT NULL,
        created_at_ms BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_artifacts_owner
        ON artifacts(owner_account_id, created_at_ms)",
    "CREATE INDEX IF NOT EXISTS idx_artifacts_visibility
        ON artifacts(visibility, created_at_ms)",
    "CREATE TABLE IF NOT EXISTS generation_attempts (
        id BIGSERIAL PRIMARY KEY,
        account_id TEXT,
        endpoint TEXT NOT NULL,
        outcome_status INTEGER NOT NULL,
        remote_address TEXT,
        user_agent TEXT,
        ts_ms BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_generation_attempts_ts_ms ON generation_attempts(ts_ms)",
    "CREATE INDEX IF NOT EXISTS idx_generation_attempts_account_id
        ON generation_attempts(account_id, ts_ms)",
];

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
