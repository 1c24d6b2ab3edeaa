//! Meterline Revenue Core (MRC)
//!
//! Pricing, metering and charge orchestration for AI workflow runs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        REVENUE CORE (MRC)                            │
//! │                                                                      │
//! │   caller ──► MeteringOrchestrator ──► PricingCalculator ◄── Catalog  │
//! │                      │                                               │
//! │                      ├─► LedgerStore.debit   (charge before work)    │
//! │                      ├─► WorkflowExecutor    (the unreliable step)   │
//! │                      └─► LedgerStore.credit  (refund on failure)     │
//! │                                                                      │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │  Saga: PRICED ─► CHARGED ─► EXECUTING ─► SUCCEEDED             │  │
//! │  │                                      └──► REFUNDED             │  │
//! │  │                                      └──► REFUND_FAILED (loud) │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod catalog;
pub mod orchestrator;
pub mod pricing;

use std::sync::Arc;
use std::time::Duration;

use meterline_ledger::{LedgerError, LedgerStore, Transaction, TransactionSource, Wallet, WalletTier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use catalog::{BulkBracket, CatalogError, PriceCatalog, PriceableUnit, TierDiscounts};
pub use orchestrator::{
    ExecutionError, MeterRequest, MeteringOrchestrator, RunReceipt, RunState, WorkflowExecutor,
    DEFAULT_EXECUTION_TIMEOUT,
};
pub use pricing::{PricedOperation, PricingCalculator, PricingError};

/// Metering error types
#[derive(Debug, Error)]
pub enum MeterError {
    /// Caller input error: unknown unit or bad quantity. Not retried.
    #[error(transparent)]
    Pricing(#[from] PricingError),

    /// Business-rule rejection: the wallet cannot cover the quote. Reported
    /// to the end user with required vs. available amounts; the executor is
    /// never contacted.
    #[error("insufficient balance for tenant {tenant_id}: requested {requested_cents}, available {available_cents}")]
    InsufficientBalance {
        /// Tenant whose wallet was checked
        tenant_id: String,
        /// Quoted amount in cents
        requested_cents: i64,
        /// Balance at the time of the check, in cents
        available_cents: i64,
    },

    /// Infrastructure fault in the ledger. Safe to retry with backoff.
    #[error("ledger error: {0}")]
    Ledger(LedgerError),

    /// Executor failed or timed out; the charge was reversed. Carries the
    /// refund transaction as proof of compensation.
    #[error("execution failed: {error}")]
    ExecutionFailed {
        /// What the executor reported
        error: String,
        /// The compensating credit; absent only for zero-priced runs
        refund: Option<Box<Transaction>>,
    },

    /// Executor failed and the compensating credit also failed: money was
    /// charged for work that did not happen. Terminal severity — logged and
    /// alertable, needs manual reconciliation.
    #[error("refund failed: {refund_error} (after execution failure: {execution_error})")]
    RefundFailed {
        /// What the executor reported
        execution_error: String,
        /// Why the compensating credit failed
        refund_error: String,
        /// The un-reversed charge
        charge: Box<Transaction>,
    },
}

impl MeterError {
    /// Lift a ledger error, keeping insufficient-balance as its own case so
    /// callers can distinguish a rejection from an infrastructure fault.
    pub fn from_ledger(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientBalance {
                tenant_id,
                requested_cents,
                available_cents,
            } => Self::InsufficientBalance {
                tenant_id,
                requested_cents,
                available_cents,
            },
            other => Self::Ledger(other),
        }
    }

    /// Stable machine-readable discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pricing(PricingError::UnknownUnit(_)) => "unknown-unit",
            Self::Pricing(PricingError::InvalidQuantity(_)) => "invalid-quantity",
            Self::Pricing(PricingError::Overflow(_)) => "price-overflow",
            Self::InsufficientBalance { .. } => "insufficient-balance",
            Self::Ledger(LedgerError::InsufficientBalance { .. }) => "insufficient-balance",
            Self::Ledger(LedgerError::InvalidAmount(_)) => "invalid-amount",
            Self::Ledger(LedgerError::StorageUnavailable(_)) => "storage-unavailable",
            Self::ExecutionFailed { .. } => "execution-failed",
            Self::RefundFailed { .. } => "refund-failed",
        }
    }

    /// Wire representation for collaborators
    pub fn to_payload(&self) -> ErrorPayload {
        let (tenant_id, requested_cents, available_cents) = match self {
            Self::InsufficientBalance {
                tenant_id,
                requested_cents,
                available_cents,
            } => (
                Some(tenant_id.clone()),
                Some(*requested_cents),
                Some(*available_cents),
            ),
            Self::RefundFailed { charge, .. } => (Some(charge.tenant_id.clone()), None, None),
            Self::ExecutionFailed {
                refund: Some(refund),
                ..
            } => (Some(refund.tenant_id.clone()), None, None),
            _ => (None, None, None),
        };
        ErrorPayload {
            kind: self.kind().to_string(),
            tenant_id,
            requested_cents,
            available_cents,
            message: self.to_string(),
        }
    }
}

/// Error shape returned to collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable discriminator
    pub kind: String,
    /// Tenant involved, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Amount the operation needed, in cents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_cents: Option<i64>,
    /// Balance available at the time, in cents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_cents: Option<i64>,
    /// Human-readable description
    pub message: String,
}

/// Result type for metering operations
pub type MeterResult<T> = Result<T, MeterError>;

/// Revenue Core: catalog, calculator, ledger and orchestrator wired together
pub struct RevenueCore {
    catalog: Arc<PriceCatalog>,
    calculator: PricingCalculator,
    ledger: Arc<dyn LedgerStore>,
    orchestrator: MeteringOrchestrator,
}

impl RevenueCore {
    /// Assemble the core around a ledger backend and a workflow executor
    pub fn new(
        catalog: PriceCatalog,
        ledger: Arc<dyn LedgerStore>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let calculator = PricingCalculator::new(catalog.clone());
        let orchestrator =
            MeteringOrchestrator::new(calculator.clone(), ledger.clone(), executor);
        Self {
            catalog,
            calculator,
            ledger,
            orchestrator,
        }
    }

    /// Override the per-run execution timeout
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator = self.orchestrator.with_execution_timeout(timeout);
        self
    }

    /// Record a payment-processor top-up. The processor's own event id is
    /// the idempotency key, so redelivery of the same payment event never
    /// double-credits.
    pub async fn top_up(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        payment_event_id: &str,
    ) -> MeterResult<Transaction> {
        self.ledger
            .credit(
                tenant_id,
                amount_cents,
                payment_event_id,
                TransactionSource::PaymentProcessor,
                Some(payment_event_id),
                None,
            )
            .await
            .map_err(MeterError::from_ledger)
    }

    /// Grant promotional credit, at most once per code per tenant.
    pub async fn grant_promo(
        &self,
        tenant_id: &str,
        amount_cents: i64,
        promo_code: &str,
    ) -> MeterResult<Transaction> {
        let key = format!("promo:{tenant_id}:{promo_code}");
        self.ledger
            .credit(
                tenant_id,
                amount_cents,
                &key,
                TransactionSource::Promo,
                Some(promo_code),
                None,
            )
            .await
            .map_err(MeterError::from_ledger)
    }

    /// Apply an administrative balance correction.
    pub async fn adjust(
        &self,
        tenant_id: &str,
        delta_cents: i64,
        adjustment_id: &str,
        note: Option<&str>,
    ) -> MeterResult<Transaction> {
        self.ledger
            .adjust(tenant_id, delta_cents, adjustment_id, None, note)
            .await
            .map_err(MeterError::from_ledger)
    }

    /// Wallet snapshot, created on first touch
    pub async fn wallet(&self, tenant_id: &str) -> MeterResult<Wallet> {
        self.ledger
            .get_wallet(tenant_id)
            .await
            .map_err(MeterError::from_ledger)
    }

    /// Transaction history, newest first
    pub async fn history(&self, tenant_id: &str, limit: usize) -> MeterResult<Vec<Transaction>> {
        self.ledger
            .list_transactions(tenant_id, limit)
            .await
            .map_err(MeterError::from_ledger)
    }

    /// Move a tenant to a new discount tier
    pub async fn set_tier(&self, tenant_id: &str, tier: WalletTier) -> MeterResult<Wallet> {
        self.ledger
            .set_tier(tenant_id, tier)
            .await
            .map_err(MeterError::from_ledger)
    }

    /// Dry-run quote without touching the wallet
    pub fn quote(
        &self,
        unit_id: &str,
        quantity: u32,
        tier: WalletTier,
    ) -> Result<PricedOperation, PricingError> {
        self.calculator.quote(unit_id, quantity, tier)
    }

    /// Price, charge, execute, and refund on failure
    pub async fn charge_and_run(&self, request: MeterRequest) -> MeterResult<RunReceipt> {
        self.orchestrator.run(request).await
    }

    /// The catalog this core prices against
    pub fn catalog(&self) -> &PriceCatalog {
        &self.catalog
    }
}
