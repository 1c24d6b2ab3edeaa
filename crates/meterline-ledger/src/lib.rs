//! Meterline Tenant Ledger (MTL)
//!
//! Wallet and metering ledger for usage-billed tenants.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      TENANT LEDGER (MTL)                        │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                     LedgerStore trait                     │  │
//! │  │   get_wallet │ credit │ debit │ adjust │ set_tier │ list  │  │
//! │  └───────────────┬───────────────────────────┬───────────────┘  │
//! │                  │                           │                  │
//! │  ┌───────────────▼──────────┐  ┌─────────────▼───────────────┐  │
//! │  │       MemoryLedger       │  │       PostgresLedger        │  │
//! │  │  per-tenant mutex around │  │  conditional UPDATE + row   │  │
//! │  │  read-compute-write      │  │  count check, one SQL txn   │  │
//! │  └──────────────────────────┘  └─────────────────────────────┘  │
//! │                                                                 │
//! │   Idempotency: every mutation carries a unique key; replays     │
//! │   return the original transaction instead of applying twice.   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod memory;
pub mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

use thiserror::Error;

pub use memory::MemoryLedger;
pub use model::{
    TenantId, Transaction, TransactionKind, TransactionSource, Wallet, WalletTier,
};
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedger;
pub use store::LedgerStore;

/// Ledger error types
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The wallet cannot cover the requested amount. A business-rule
    /// rejection, surfaced to the end user; never retried as-is.
    #[error("insufficient balance for tenant {tenant_id}: requested {requested_cents}, available {available_cents}")]
    InsufficientBalance {
        /// Tenant whose wallet was checked
        tenant_id: TenantId,
        /// Amount the operation needed, in cents
        requested_cents: i64,
        /// Balance at the time of the check, in cents
        available_cents: i64,
    },

    /// Caller passed a zero or wrongly-signed amount
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// Backing store unreachable or failed mid-operation. Safe to retry with
    /// backoff; must never be read as insufficient balance.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
