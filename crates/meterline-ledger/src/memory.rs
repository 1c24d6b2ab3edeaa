//! In-Memory Ledger Backend
//!
//! Backend for tests and single-process deployments. Correctness relies on a
//! per-tenant critical section: every read-compute-write runs under that
//! tenant's mutex, so concurrent debits serialize and the balance can never
//! go negative. The replay index is consulted under the same lock, which
//! makes duplicate delivery of the same idempotency key a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::model::{
    TenantId, Transaction, TransactionKind, TransactionSource, Wallet, WalletTier,
};
use crate::store::LedgerStore;
use crate::{LedgerError, LedgerResult};

/// In-memory wallet ledger
pub struct MemoryLedger {
    accounts: DashMap<TenantId, Arc<Mutex<Account>>>,
}

/// Everything owned by one tenant: wallet, append-only log, replay index.
struct Account {
    wallet: Wallet,
    log: Vec<Transaction>,
    by_key: HashMap<String, usize>,
}

impl Account {
    fn new(tenant_id: &str) -> Self {
        Self {
            wallet: Wallet::new(tenant_id),
            log: Vec::new(),
            by_key: HashMap::new(),
        }
    }
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    /// Get or lazily create the tenant's account slot.
    fn account(&self, tenant_id: &str) -> Arc<Mutex<Account>> {
        self.accounts
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(tenant_id))))
            .clone()
    }

    /// The single mutation path. Holds the tenant mutex across replay check,
    /// balance math and log append, so the three are atomic per tenant.
    fn apply(
        &self,
        tenant_id: &str,
        kind: TransactionKind,
        amount_cents: i64,
        source: TransactionSource,
        idempotency_key: &str,
        source_id: Option<&str>,
        description: Option<&str>,
    ) -> LedgerResult<Transaction> {
        let slot = self.account(tenant_id);
        let mut account = slot.lock();

        if let Some(&ix) = account.by_key.get(idempotency_key) {
            tracing::debug!(
                tenant_id = %tenant_id,
                idempotency_key = %idempotency_key,
                "duplicate ledger operation absorbed"
            );
            return Ok(account.log[ix].clone());
        }

        let balance_after = account.wallet.balance_cents + amount_cents;
        if balance_after < 0 {
            return Err(LedgerError::InsufficientBalance {
                tenant_id: tenant_id.to_string(),
                requested_cents: -amount_cents,
                available_cents: account.wallet.balance_cents,
            });
        }

        let now = Utc::now();
        account.wallet.balance_cents = balance_after;
        account.wallet.updated_at = now;
        match kind {
            TransactionKind::Credit => account.wallet.lifetime_topped_up_cents += amount_cents,
            TransactionKind::Debit => account.wallet.lifetime_spent_cents += -amount_cents,
            TransactionKind::Adjustment => {}
        }

        let tx = Transaction {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            kind,
            amount_cents,
            balance_after_cents: balance_after,
            source,
            source_id: source_id.map(str::to_string),
            idempotency_key: idempotency_key.to_string(),
            description: description.map(str::to_string),
            created_at: now,
        };
        let ix = account.log.len();
        account.log.push(tx.clone());
        account.by_key.insert(idempotency_key.to_string(), ix);

        tracing::debug!(
            tenant_id = %tenant_id,
            kind = kind.as_str(),
            amount_cents,
            balance_after,
            "ledger entry committed"
        );
        Ok(tx)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_wallet(&self, tenant_id: &str) -> LedgerResult<Wallet> {
        let slot = self.account(tenant_id);
        let account = slot.lock();
        Ok(account.wallet.clone())
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
    }

    async fn set_tier(&self, tenant_id: &str, tier: WalletTier) -> LedgerResult<Wallet> {
        let slot = self.account(tenant_id);
        let mut account = slot.lock();
        account.wallet.tier = tier;
        account.wallet.updated_at = Utc::now();
        Ok(account.wallet.clone())
    }

    async fn list_transactions(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>> {
        let slot = self.account(tenant_id);
        let account = slot.lock();
        Ok(account.log.iter().rev().take(limit).cloned().collect())
    }
}
