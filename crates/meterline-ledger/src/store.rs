//! Ledger Store Trait

use async_trait::async_trait;

use crate::model::{Transaction, TransactionSource, Wallet, WalletTier};
use crate::LedgerResult;

/// Sole owner of wallet balance mutation.
///
/// Every mutation takes an idempotency key: a call that replays a key already
/// in the transaction history returns the original [`Transaction`] unchanged
/// and leaves the wallet untouched, which is what makes retried webhook
/// deliveries and retried client calls safe. Duplicate delivery is a no-op,
/// never an error.
///
/// Concurrent mutations against the same tenant serialize inside the backend
/// (per-tenant critical section or conditional update at the storage layer),
/// so the balance can never be observed negative and `balance_after_cents`
/// snapshots are consistent with commit order.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Return the tenant's wallet, creating it on first touch.
    async fn get_wallet(&self, tenant_id: &str) -> LedgerResult<Wallet>;

    /// Add funds. `amount_cents` must be positive.
    async fn credit(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
        source: TransactionSource,
        source_id: Option<&str>,
        description: Option<&str>,
    ) -> LedgerResult<Transaction>;

    /// Remove funds for a workflow charge. `amount_cents` must be positive.
    ///
    /// Fails fast with [`LedgerError::InsufficientBalance`] when the wallet
    /// cannot cover the amount, without mutating anything.
    ///
    /// [`LedgerError::InsufficientBalance`]: crate::LedgerError::InsufficientBalance
    async fn debit(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
        source_id: Option<&str>,
        description: Option<&str>,
    ) -> LedgerResult<Transaction>;

    /// Apply a signed administrative correction. Lifetime counters are
    /// untouched; a negative delta that would drive the balance below zero is
    /// rejected.
    async fn adjust(
        &self,
        tenant_id: &str,
        delta_cents: i64,
        idempotency_key: &str,
        source_id: Option<&str>,
        description: Option<&str>,
    ) -> LedgerResult<Transaction>;

    /// Move the tenant to a new discount tier. Balance untouched.
    async fn set_tier(&self, tenant_id: &str, tier: WalletTier) -> LedgerResult<Wallet>;

    /// Transaction history in reverse commit order, newest first.
    async fn list_transactions(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> LedgerResult<Vec<Transaction>>;
}
