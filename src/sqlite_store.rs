use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};

use crate::clock::{Clock, SystemClock};
use crate::store::{LedgerStore, PaymentGrant, StoreError};
use crate::store_types::{
    AccountRecord, ArtifactPage, ArtifactRecord, BalanceEntryKind, BalanceEntryRecord,
    GenerationAttemptRecord, NewGenerationAttempt, PaymentRecord, PendingDebitRecord, Visibility,
};

/// SQLite-backed ledger. Every mutation runs in one `BEGIN IMMEDIATE`
/// transaction on a fresh connection inside `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(SystemClock))
    }

    pub fn with_clock(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            f(&mut conn)
        })
        .await?
    }

    fn now_ms(&self) -> i64 {
        u64_to_i64(self.clock.now_millis())
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn ensure_account(
        &self,
        account_id: &str,
        default_balance: u64,
    ) -> Result<AccountRecord, StoreError> {
        let account_id = account_id.to_string();
        let ts_ms = self.now_ms();
        let balance_i64 = u64_to_i64(default_balance);

        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO accounts (account_id, balance, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![account_id, balance_i64, ts_ms],
            )?;
            if inserted == 1 && balance_i64 > 0 {
                insert_balance_entry(
                    &tx,
                    &account_id,
                    BalanceEntryKind::Grant,
                    balance_i64,
                    balance_i64,
                    None,
                    ts_ms,
                )?;
            }
            let account = select_account(&tx, &account_id)?.ok_or_else(|| {
                StoreError::UnknownAccount {
                    account_id: account_id.clone(),
                }
            })?;
            tx.commit()?;
            Ok(account)
        })
        .await
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.with_connection(move |conn| select_account(conn, &account_id))
            .await
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
        let account_id = account_id.to_string();
        let request_id = request_id.to_string();
        let ts_ms = self.now_ms();
        let amount_i64 = u64_to_i64(amount);

        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let balance: Option<i64> = tx
                .query_row(
                    "SELECT balance FROM accounts WHERE account_id=?1",
                    rusqlite::params![account_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(balance) = balance else {
                return Err(StoreError::UnknownAccount { account_id });
            };

            let balance_u64 = i64_to_u64(balance);
            if balance_u64 < amount {
                return Err(StoreError::InsufficientBalance {
                    balance: balance_u64,
                    required: amount,
                });
            }
            let next = balance - amount_i64;

            tx.execute(
                "UPDATE accounts SET balance = ?2, updated_at_ms = ?3 WHERE account_id = ?1",
                rusqlite::params![account_id, next, ts_ms],
            )?;
            tx.execute(
                "INSERT INTO pending_debits (request_id, account_id, amount, ts_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![request_id, account_id, amount_i64, ts_ms],
            )?;
            insert_balance_entry(
                &tx,
                &account_id,
                BalanceEntryKind::Debit,
                -amount_i64,
                next,
                Some(&request_id),
                ts_ms,
            )?;

            tx.commit()?;
            Ok(i64_to_u64(next))
        })
        .await
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
        let account_id = account_id.to_string();
        let reference = reference.map(str::to_string);
        let ts_ms = self.now_ms();

        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let balance = apply_credit(
                &tx,
                &account_id,
                u64_to_i64(amount),
                kind,
                reference.as_deref(),
                ts_ms,
            )?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    async fn refund_debit(&self, request_id: &str) -> Result<Option<u64>, StoreError> {
        let request_id = request_id.to_string();
        let ts_ms = self.now_ms();

        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let pending: Option<(String, i64)> = tx
                .query_row(
                    "SELECT account_id, amount FROM pending_debits WHERE request_id=?1",
                    rusqlite::params![request_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((account_id, amount_i64)) = pending else {
                return Ok(None);
            };

            tx.execute(
                "DELETE FROM pending_debits WHERE request_id=?1",
                rusqlite::params![request_id],
            )?;
            let balance = apply_credit(
                &tx,
                &account_id,
                amount_i64.max(0),
                BalanceEntryKind::Refund,
                Some(&request_id),
                ts_ms,
            )?;

            tx.commit()?;
            Ok(Some(balance))
        })
        .await
    }

    async fn settle_debit(
        &self,
        request_id: &str,
        artifacts: &[ArtifactRecord],
    ) -> Result<u64, StoreError> {
        let request_id = request_id.to_string();
        let artifacts = artifacts.to_vec();

        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let account_id: Option<String> = tx
                .query_row(
                    "SELECT account_id FROM pending_debits WHERE request_id=?1",
                    rusqlite::params![request_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(account_id) = account_id else {
                return Err(StoreError::DebitNotPending { request_id });
            };
            tx.execute(
                "DELETE FROM pending_debits WHERE request_id=?1",
                rusqlite::params![request_id],
            )?;

            for artifact in &artifacts {
                tx.execute(
                    "INSERT INTO artifacts (
                        id, owner_account_id, prompt, location_uri, visibility,
                        request_id, created_at_ms
                     )
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        artifact.id,
                        artifact.owner_account_id,
                        artifact.prompt,
                        artifact.location_uri,
                        artifact.visibility.as_str(),
                        request_id,
                        u64_to_i64(artifact.created_at_ms),
                    ],
                )?;
            }

            let balance: i64 = tx.query_row(
                "SELECT balance FROM accounts WHERE account_id=?1",
                rusqlite::params![account_id],
                |row| row.get(0),
            )?;

            tx.commit()?;
            Ok(i64_to_u64(balance))
        })
        .await
    }

    async fn list_stale_pending_debits(
        &self,
        older_than_ms: u64,
    ) -> Result<Vec<PendingDebitRecord>, StoreError> {
        let cutoff = self.now_ms().saturating_sub(u64_to_i64(older_than_ms));

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, account_id, amount, ts_ms
                 FROM pending_debits
                 WHERE ts_ms <= ?1
                 ORDER BY ts_ms, request_id",
            )?;
            let rows = stmt.query_map(rusqlite::params![cutoff], |row| {
                Ok(PendingDebitRecord {
                    request_id: row.get(0)?,
                    account_id: row.get(1)?,
                    amount: i64_to_u64(row.get(2)?),
                    ts_ms: i64_to_u64(row.get(3)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
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
        let reference = reference.to_string();
        let account_id = account_id.to_string();
        let ts_ms = self.now_ms();

        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // The primary key on external_reference is the deduplication point.
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO payments
                    (external_reference, account_id, amount, credits_granted, recorded_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    reference,
                    account_id,
                    u64_to_i64(amount),
                    u64_to_i64(credits),
                    ts_ms
                ],
            )?;

            if inserted == 0 {
                let existing = select_payment(&tx, &reference)?.ok_or_else(|| {
                    StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows)
                })?;
                return Ok(PaymentGrant {
                    record: existing,
                    newly_granted: false,
                });
            }

            apply_credit(
                &tx,
                &account_id,
                u64_to_i64(credits),
                BalanceEntryKind::Payment,
                Some(&reference),
                ts_ms,
            )?;
            tx.commit()?;

            Ok(PaymentGrant {
                record: PaymentRecord {
                    external_reference: reference,
                    account_id,
                    amount,
                    credits_granted: credits,
                    recorded_at_ms: i64_to_u64(ts_ms),
                },
                newly_granted: true,
            })
        })
        .await
    }

    async fn find_payment(&self, reference: &str) -> Result<Option<PaymentRecord>, StoreError> {
        let reference = reference.to_string();
        self.with_connection(move |conn| select_payment(conn, &reference))
            .await
    }

    async fn append_generation_attempt(
        &self,
        attempt: &NewGenerationAttempt,
    ) -> Result<i64, StoreError> {
        let attempt = attempt.clone();
        let ts_ms = self.now_ms();

        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO generation_attempts
                    (account_id, endpoint, outcome_status, remote_address, user_agent, ts_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    attempt.account_id,
                    attempt.endpoint,
                    i64::from(attempt.outcome_status),
                    attempt.remote_address,
                    attempt.user_agent,
                    ts_ms
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list_generation_attempts(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<GenerationAttemptRecord>, StoreError> {
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let since = since_ts_ms.map(u64_to_i64);

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, endpoint, outcome_status, remote_address, user_agent, ts_ms
                 FROM generation_attempts
                 WHERE ?1 IS NULL OR ts_ms >= ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![since, limit], |row| {
                Ok(GenerationAttemptRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    endpoint: row.get(2)?,
                    outcome_status: u16::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                    remote_address: row.get(4)?,
                    user_agent: row.get(5)?,
                    ts_ms: i64_to_u64(row.get(6)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn list_balance_history(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<BalanceEntryRecord>, StoreError> {
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, kind, delta, balance_after, reference, ts_ms
                 FROM balance_entries
                 WHERE account_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit], |row| {
                let kind: String = row.get(2)?;
                Ok(BalanceEntryRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    kind: BalanceEntryKind::parse(&kind).unwrap_or(BalanceEntryKind::Adjustment),
                    delta: row.get(3)?,
                    balance_after: i64_to_u64(row.get(4)?),
                    reference: row.get(5)?,
                    ts_ms: i64_to_u64(row.get(6)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn list_artifacts_for_owner(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<ArtifactRecord>, StoreError> {
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_account_id, prompt, location_uri, visibility, created_at_ms
                 FROM artifacts
                 WHERE owner_account_id = ?1
                 ORDER BY created_at_ms DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit], artifact_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn list_public_artifacts(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<ArtifactPage, StoreError> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let offset = u64_to_i64(page.saturating_sub(1).saturating_mul(per_page));
        let limit = u64_to_i64(per_page);

        self.with_connection(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM artifacts WHERE visibility = 'public'",
                [],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT id, owner_account_id, prompt, location_uri, visibility, created_at_ms
                 FROM artifacts
                 WHERE visibility = 'public'
                 ORDER BY created_at_ms DESC, rowid DESC
                 LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![limit, offset], artifact_from_row)?;
            let artifacts = rows.collect::<Result<Vec<_>, _>>()?;

            Ok(ArtifactPage {
                artifacts,
                total_pages: i64_to_u64(total).div_ceil(per_page),
                current_page: page,
            })
        })
        .await
    }
}

fn apply_credit(
    tx: &rusqlite::Transaction<'_>,
    account_id: &str,
    amount_i64: i64,
    kind: BalanceEntryKind,
    reference: Option<&str>,
    ts_ms: i64,
) -> Result<u64, StoreError> {
    tx.execute(
        "INSERT OR IGNORE INTO accounts (account_id, balance, created_at_ms, updated_at_ms)
         VALUES (?1, 0, ?2, ?2)",
        rusqlite::params![account_id, ts_ms],
    )?;
    tx.execute(
        "UPDATE accounts SET balance = balance + ?2, updated_at_ms = ?3 WHERE account_id = ?1",
        rusqlite::params![account_id, amount_i64, ts_ms],
    )?;
    let balance: i64 = tx.query_row(
        "SELECT balance FROM accounts WHERE account_id=?1",
        rusqlite::params![account_id],
        |row| row.get(0),
    )?;
    insert_balance_entry(tx, account_id, kind, amount_i64, balance, reference, ts_ms)?;
    Ok(i64_to_u64(balance))
}

fn insert_balance_entry(
    tx: &rusqlite::Transaction<'_>,
    account_id: &str,
    kind: BalanceEntryKind,
    delta: i64,
    balance_after: i64,
    reference: Option<&str>,
    ts_ms: i64,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT INTO balance_entries (account_id, kind, delta, balance_after, reference, ts_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![account_id, kind.as_str(), delta, balance_after, reference, ts_ms],
    )?;
    Ok(())
}

fn select_account(
    conn: &rusqlite::Connection,
    account_id: &str,
) -> Result<Option<AccountRecord>, StoreError> {
    let account = conn
        .query_row(
            "SELECT account_id, balance, created_at_ms, updated_at_ms
             FROM accounts WHERE account_id=?1",
            rusqlite::params![account_id],
            |row| {
                Ok(AccountRecord {
                    account_id: row.get(0)?,
                    balance: i64_to_u64(row.get(1)?),
                    created_at_ms: i64_to_u64(row.get(2)?),
                    updated_at_ms: i64_to_u64(row.get(3)?),
                })
            },
        )
        .optional()?;
    Ok(account)
}

fn select_payment(
    conn: &rusqlite::Connection,
    reference: &str,
) -> Result<Option<PaymentRecord>, StoreError> {
    let payment = conn
        .query_row(
            "SELECT external_reference, account_id, amount, credits_granted, recorded_at_ms
             FROM payments WHERE external_reference=?1",
            rusqlite::params![reference],
            |row| {
                Ok(PaymentRecord {
                    external_reference: row.get(0)?,
                    account_id: row.get(1)?,
                    amount: i64_to_u64(row.get(2)?),
                    credits_granted: i64_to_u64(row.get(3)?),
                    recorded_at_ms: i64_to_u64(row.get(4)?),
                })
            },
        )
        .optional()?;
    Ok(payment)
}

fn artifact_from_row(row: &rusqlite::Row<'_>) -> Result<ArtifactRecord, rusqlite::Error> {
    let visibility: String = row.get(4)?;
    Ok(ArtifactRecord {
        id: row.get(0)?,
        owner_account_id: row.get(1)?,
        prompt: row.get(2)?,
        location_uri: row.get(3)?,
        visibility: Visibility::parse(&visibility).unwrap_or_default(),
        created_at_ms: i64_to_u64(row.get(5)?),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY NOT NULL,
            balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS balance_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            delta INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            reference TEXT,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_balance_entries_account_id
            ON balance_entries(account_id, id);

        CREATE TABLE IF NOT EXISTS pending_debits (
            request_id TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_debits_ts_ms
            ON pending_debits(ts_ms);

        CREATE TABLE IF NOT EXISTS payments (
            external_reference TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            credits_granted INTEGER NOT NULL CHECK (credits_granted > 0),
            recorded_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payments_account_id
            ON payments(account_id);

        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY NOT NULL,
            owner_account_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            location_uri TEXT NOT NULL,
            visibility TEXT NOT NULL,
            request_id TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_artifacts_owner
            ON artifacts(owner_account_id, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_artifacts_visibility
            ON artifacts(visibility, created_at_ms);

        CREATE TABLE IF NOT EXISTS generation_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT,
            endpoint TEXT NOT NULL,
            outcome_status INTEGER NOT NULL,
            remote_address TEXT,
            user_agent TEXT,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_generation_attempts_ts_ms
            ON generation_attempts(ts_ms);
        CREATE INDEX IF NOT EXISTS idx_generation_attempts_account_id
            ON generation_attempts(account_id, ts_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
