//! Postgres Ledger Backend
//!
//! Enable with the `postgres` feature flag.
//!
//! Atomicity comes from the storage layer: each mutation runs one SQL
//! transaction holding the wallet row lock, with the balance change expressed
//! as a conditional `UPDATE … WHERE balance_cents >= $n`. A zero affected-row
//! count means insufficient funds; the ledger insert shares the transaction
//! so balance and history commit together or not at all. The unique index on
//! `idempotency_key` turns a duplicate-delivery race into a replay of the
//! winner's row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction as PgTransaction};
use uuid::Uuid;

use crate::model::{
    Transaction, TransactionKind, TransactionSource, Wallet, WalletTier,
};
use crate::store::LedgerStore;
use crate::{LedgerError, LedgerResult};

/// Postgres-backed wallet ledger
pub struct PostgresLedger {
    pool: PgPool,
}

const PG_UNIQUE_VIOLATION: &str = "23505";

impl PostgresLedger {
    /// Connect to the database
    pub async fn new(database_url: &str) -> LedgerResult<Self> {
        let pool = PgPool::connect(database_url).await.map_err(storage)?;
        Ok(Self::with_pool(pool))
    }

    /// Reuse an existing connection pool
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the wallet and ledger tables if they do not exist
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                tenant_id TEXT PRIMARY KEY,
                balance_cents BIGINT NOT NULL DEFAULT 0 CHECK (balance_cents >= 0),
                tier TEXT NOT NULL DEFAULT 'base',
                lifetime_spent_cents BIGINT NOT NULL DEFAULT 0,
                lifetime_topped_up_cents BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS ledger_transactions (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES wallets (tenant_id),
                kind TEXT NOT NULL,
                amount_cents BIGINT NOT NULL,
                balance_after_cents BIGINT NOT NULL,
                source TEXT NOT NULL,
                source_id TEXT,
                idempotency_key TEXT NOT NULL,
                description TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_tx_key
                ON ledger_transactions (idempotency_key);
            CREATE INDEX IF NOT EXISTS idx_ledger_tx_tenant
                ON ledger_transactions (tenant_id, created_at DESC);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    /// Insert the wallet row on first touch; a no-op for known tenants.
    async fn ensure_wallet(
        txn: &mut PgTransaction<'_, Postgres>,
        tenant_id: &str,
    ) -> LedgerResult<()> {
        sqlx::query("INSERT INTO wallets (tenant_id) VALUES ($1) ON CONFLICT (tenant_id) DO NOTHING")
            .bind(tenant_id)
            .execute(&mut **txn)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn find_by_key(
        txn: &mut PgTransaction<'_, Postgres>,
        idempotency_key: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, kind, amount_cents, balance_after_cents, source, source_id,
                    idempotency_key, description, created_at
             FROM ledger_transactions WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&mut **txn)
        .await
        .map_err(storage)?;

        row.map(row_to_transaction).transpose()
    }

    /// The single mutation path shared by credit, debit and adjust.
    ///
    /// `amount_cents` is signed. The conditional update keeps the balance
    /// non-negative under concurrency: Postgres serializes on the wallet row
    /// lock and re-evaluates the predicate after acquiring it.
    async fn apply(
        &self,
        tenant_id: &str,
        kind: TransactionKind,
        amount_cents: i64,
        source: TransactionSource,
        idempotency_key: &str,
        source_id: Option<&str>,
        description: Option<&str>,
    ) -> LedgerResult<Transaction> {
        let mut txn = self.pool.begin().await.map_err(storage)?;

        if let Some(existing) = Self::find_by_key(&mut txn, idempotency_key).await? {
            tracing::debug!(
                tenant_id = %tenant_id,
                idempotency_key = %idempotency_key,
                "duplicate ledger operation absorbed"
            );
            return Ok(existing);
        }

        Self::ensure_wallet(&mut txn, tenant_id).await?;

        let (spent_delta, topped_up_delta) = match kind {
            TransactionKind::Credit => (0, amount_cents),
            TransactionKind::Debit => (-amount_cents, 0),
            TransactionKind::Adjustment => (0, 0),
        };

        let updated = sqlx::query(
            "UPDATE wallets
             SET balance_cents = balance_cents + $2,
                 lifetime_spent_cents = lifetime_spent_cents + $3,
                 lifetime_topped_up_cents = lifetime_topped_up_cents + $4,
                 updated_at = NOW()
             WHERE tenant_id = $1 AND balance_cents + $2 >= 0
             RETURNING balance_cents",
        )
        .bind(tenant_id)
        .bind(amount_cents)
        .bind(spent_delta)
        .bind(topped_up_delta)
        .fetch_optional(&mut *txn)
        .await
        .map_err(storage)?;

        let balance_after: i64 = match updated {
            Some(row) => row.try_get("balance_cents").map_err(storage)?,
            None => {
                // Zero rows affected: the predicate failed, funds are short.
                let available: i64 =
                    sqlx::query("SELECT balance_cents FROM wallets WHERE tenant_id = $1")
                        .bind(tenant_id)
                        .fetch_one(&mut *txn)
                        .await
                        .map_err(storage)?
                        .try_get("balance_cents")
                        .map_err(storage)?;
                return Err(LedgerError::InsufficientBalance {
                    tenant_id: tenant_id.to_string(),
                    requested_cents: -amount_cents,
                    available_cents: available,
                });
            }
        };

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO ledger_transactions
                 (id, tenant_id, kind, amount_cents, balance_after_cents, source, source_id,
                  idempotency_key, description)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING created_at",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(kind.as_str())
        .bind(amount_cents)
        .bind(balance_after)
        .bind(source.as_str())
        .bind(source_id)
        .bind(idempotency_key)
        .bind(description)
        .fetch_one(&mut *txn)
        .await;

        let created_at: DateTime<Utc> = match inserted {
            Ok(row) => row.try_get("created_at").map_err(storage)?,
            Err(e) if is_unique_violation(&e) => {
                // Lost the duplicate-delivery race: drop our work and return
                // the winner's transaction.
                drop(txn);
                let mut fresh = self.pool.begin().await.map_err(storage)?;
                let winner = Self::find_by_key(&mut fresh, idempotency_key).await?;
                return winner.ok_or_else(|| {
                    LedgerError::StorageUnavailable(
                        "idempotency key vanished after unique violation".to_string(),
                    )
                });
            }
            Err(e) => return Err(storage(e)),
        };

        txn.commit().await.map_err(storage)?;

        tracing::debug!(
            tenant_id = %tenant_id,
            kind = kind.as_str(),
            amount_cents,
            balance_after,
            "ledger entry committed"
        );

        Ok(Transaction {
            id,
            tenant_id: tenant_id.to_string(),
            kind,
            amount_cents,
            balance_after_cents: balance_after,
            source,
            source_id: source_id.map(str::to_string),
            idempotency_key: idempotency_key.to_string(),
            description: description.map(str::to_string),
            created_at,
        })
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn get_wallet(&self, tenant_id: &str) -> LedgerResult<Wallet> {
        let mut txn = self.pool.begin().await.map_err(storage)?;
        Self::ensure_wallet(&mut txn, tenant_id).await?;
        let row = sqlx::query(
            "SELECT tenant_id, balance_cents, tier, lifetime_spent_cents,
                    lifetime_topped_up_cents, created_at, updated_at
             FROM wallets WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&mut *txn)
        .await
        .map_err(storage)?;
        txn.commit().await.map_err(storage)?;
        row_to_wallet(row)
    }

    async fn credit(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
        source: TransactionSource,
        source_id: Option<&str>,
        description: Option<&str>,
    ) -> LedgerResult<Transaction> {
        if amount_cents <= 0 {
            return Err(LedgerError::InvalidAmount(amount_cents));
        }
        self.apply(
            tenant_id,
            TransactionKind::Credit,
            amount_cents,
            source,
            idempotency_key,
            source_id,
            description,
        )
        .await
    }

    async fn debit(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
        source_id: Option<&str>,
        description: Option<&str>,
    ) -> LedgerResult<Transaction> {
        if amount_cents <= 0 {
            return Err(LedgerError::InvalidAmount(amount_cents));
        }
        self.apply(
            tenant_id,
            TransactionKind::Debit,
            -amount_cents,
            TransactionSource::WorkflowCharge,
            idempotency_key,
            source_id,
            description,
        )
        .await
    }

    async fn adjust(
        &self,
        tenant_id: &str,
        delta_cents: i64,
        idempotency_key: &str,
        source_id: Option<&str>,
        description: Option<&str>,
    ) -> LedgerResult<Transaction> {
        if delta_cents == 0 {
            return Err(LedgerError::InvalidAmount(delta_cents));
        }
        self.apply(
            tenant_id,
            TransactionKind::Adjustment,
            delta_cents,
            TransactionSource::Admin,
            idempotency_key,
            source_id,
            description,
        )
        .await
    }

    async fn set_tier(&self, tenant_id: &str, tier: WalletTier) -> LedgerResult<Wallet> {
        let mut txn = self.pool.begin().await.map_err(storage)?;
        Self::ensure_wallet(&mut txn, tenant_id).await?;
        let row = sqlx::query(
            "UPDATE wallets SET tier = $2, updated_at = NOW()
             WHERE tenant_id = $1
             RETURNING tenant_id, balance_cents, tier, lifetime_spent_cents,
                       lifetime_topped_up_cents, created_at, updated_at",
        )
        .bind(tenant_id)
        .bind(tier.as_str())
        .fetch_one(&mut *txn)
        .await
        .map_err(storage)?;
        txn.commit().await.map_err(storage)?;
        row_to_wallet(row)
    }

    async fn list_transactions(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, kind, amount_cents, balance_after_cents, source, source_id,
                    idempotency_key, description, created_at
             FROM ledger_transactions
             WHERE tenant_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2",
        )
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(row_to_transaction).collect()
    }
}

fn storage(e: sqlx::Error) -> LedgerError {
    LedgerError::StorageUnavailable(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(PG_UNIQUE_VIOLATION),
        _ => false,
    }
}

/// Typed boundary between relational rows and the domain model. Unknown
/// enum names are storage corruption, not business errors.
fn row_to_wallet(row: PgRow) -> LedgerResult<Wallet> {
    let tier: String = row.try_get("tier").map_err(storage)?;
    Ok(Wallet {
        tenant_id: row.try_get("tenant_id").map_err(storage)?,
        balance_cents: row.try_get("balance_cents").map_err(storage)?,
        tier: WalletTier::parse(&tier)
            .ok_or_else(|| LedgerError::StorageUnavailable(format!("unknown tier: {tier}")))?,
        lifetime_spent_cents: row.try_get("lifetime_spent_cents").map_err(storage)?,
        lifetime_topped_up_cents: row.try_get("lifetime_topped_up_cents").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

fn row_to_transaction(row: PgRow) -> LedgerResult<Transaction> {
    let kind: String = row.try_get("kind").map_err(storage)?;
    let source: String = row.try_get("source").map_err(storage)?;
    Ok(Transaction {
        id: row.try_get("id").map_err(storage)?,
        tenant_id: row.try_get("tenant_id").map_err(storage)?,
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| LedgerError::StorageUnavailable(format!("unknown kind: {kind}")))?,
        amount_cents: row.try_get("amount_cents").map_err(storage)?,
        balance_after_cents: row.try_get("balance_after_cents").map_err(storage)?,
        source: TransactionSource::parse(&source)
            .ok_or_else(|| LedgerError::StorageUnavailable(format!("unknown source: {source}")))?,
        source_id: row.try_get("source_id").map_err(storage)?,
        idempotency_key: row.try_get("idempotency_key").map_err(storage)?,
        description: row.try_get("description").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}
