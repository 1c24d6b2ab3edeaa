//! Metering Orchestrator
//!
//! The charge-execute-refund saga. Each request moves through
//! `PRICED -> CHARGED -> EXECUTING` and ends in `SUCCEEDED`, `REFUNDED`, or
//! `REFUND_FAILED`. Charging before executing means a tenant can never
//! consume more work than the wallet covers; the price is a compensating
//! refund whenever the downstream executor fails or times out.
//!
//! Idempotency keys make every step retry-safe: the charge key is stable per
//! logical request (not per attempt), and the refund key is derived from the
//! charge key, so duplicate deliveries at any layer collapse in the ledger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meterline_ledger::{LedgerError, LedgerStore, Transaction, TransactionSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pricing::{PricedOperation, PricingCalculator};
use crate::MeterError;

/// Default ceiling on a single workflow execution
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Downstream workflow executor (collaborator)
///
/// The one step of the saga the orchestrator does not control: a call across
/// a trust boundary that can fail, hang, or time out. Input and output are
/// opaque JSON; the orchestrator never inspects either.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Run the workflow for `unit_id` with the validated input.
    async fn execute(&self, unit_id: &str, input: Value) -> Result<Value, ExecutionError>;
}

/// Failure reported by the workflow executor
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// A charge-and-execute request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterRequest {
    /// Tenant to bill
    pub tenant_id: String,
    /// Catalog unit to price
    pub unit_id: String,
    /// Requested quantity
    pub quantity: u32,
    /// Caller-generated id, unique per logical request and stable across
    /// retries of that request
    pub request_id: String,
    /// Opaque input forwarded to the executor
    pub execution_input: Value,
}

/// Saga states of a metered run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Quote computed
    Priced,
    /// Wallet debited
    Charged,
    /// Executor invoked
    Executing,
    /// Executor finished, charge kept
    Succeeded,
    /// Executor failed, charge reversed
    Refunded,
    /// Executor failed and the reversal also failed; needs reconciliation
    RefundFailed,
}

/// Proof of a completed run: quote, charge, and executor output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReceipt {
    /// Unique id of this attempt
    pub run_id: Uuid,
    /// Caller's logical request id
    pub request_id: String,
    /// Billed tenant
    pub tenant_id: String,
    /// Terminal state
    pub state: RunState,
    /// The quote the charge was based on
    pub quote: PricedOperation,
    /// Charge transaction; absent when the quote priced to zero
    pub charge: Option<Transaction>,
    /// Wallet balance after the charge
    pub balance_cents: i64,
    /// Executor output
    pub output: Value,
    /// Attempt start
    pub started_at: DateTime<Utc>,
    /// Attempt end
    pub completed_at: DateTime<Utc>,
}

/// Saga controller: price, charge, execute, refund on failure
pub struct MeteringOrchestrator {
    calculator: PricingCalculator,
    ledger: Arc<dyn LedgerStore>,
    executor: Arc<dyn WorkflowExecutor>,
    execution_timeout: Duration,
}

impl MeteringOrchestrator {
    /// Orchestrator with the default execution timeout
    pub fn new(
        calculator: PricingCalculator,
        ledger: Arc<dyn LedgerStore>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> Self {
        Self {
            calculator,
            ledger,
            executor,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    /// Override the ceiling on a single execution. A run that exceeds it is
    /// treated exactly like an executor failure and refunded: an unknown
    /// outcome never silently keeps the charge.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Debit idempotency key for a request. Stable per logical request so
    /// client retries collapse into one charge, and collision-free across
    /// distinct requests.
    pub fn charge_key(request: &MeterRequest) -> String {
        format!(
            "{}:{}:{}",
            request.tenant_id, request.unit_id, request.request_id
        )
    }

    /// Refund idempotency key derived from a charge key. The single place
    /// this derivation exists; every retried refund re-derives the same key.
    pub fn refund_key(charge_key: &str) -> String {
        format!("{charge_key}_refund")
    }

    /// Run the full saga for one request.
    pub async fn run(&self, request: MeterRequest) -> Result<RunReceipt, MeterError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        tracing::info!(
            run_id = %run_id,
            tenant_id = %request.tenant_id,
            unit_id = %request.unit_id,
            quantity = request.quantity,
            request_id = %request.request_id,
            "metered run started"
        );

        // PRICED
        let wallet = self
            .ledger
            .get_wallet(&request.tenant_id)
            .await
            .map_err(MeterError::from_ledger)?;
        let quote = self
            .calculator
            .quote(&request.unit_id, request.quantity, wallet.tier)?;
        tracing::debug!(
            run_id = %run_id,
            state = ?RunState::Priced,
            final_price_cents = quote.final_price_cents,
            tier = ?wallet.tier,
            "request priced"
        );

        // CHARGED
        let charge_key = Self::charge_key(&request);
        let charge = if quote.final_price_cents > 0 {
            let tx = self
                .ledger
                .debit(
                    &request.tenant_id,
                    quote.final_price_cents,
                    &charge_key,
                    Some(&run_id.to_string()),
                    Some(&format!("{} x{}", request.unit_id, request.quantity)),
                )
                .await
                .map_err(|e| {
                    if let LedgerError::InsufficientBalance { .. } = &e {
                        tracing::info!(
                            run_id = %run_id,
                            tenant_id = %request.tenant_id,
                            requested_cents = quote.final_price_cents,
                            "charge rejected, balance insufficient"
                        );
                    }
                    MeterError::from_ledger(e)
                })?;
            tracing::info!(
                run_id = %run_id,
                state = ?RunState::Charged,
                tenant_id = %request.tenant_id,
                amount_cents = quote.final_price_cents,
                balance_after = tx.balance_after_cents,
                "wallet charged"
            );
            Some(tx)
        } else {
            None
        };

        // EXECUTING
        tracing::debug!(
            run_id = %run_id,
            state = ?RunState::Executing,
            unit_id = %request.unit_id,
            "invoking workflow executor"
        );
        let execution = tokio::time::timeout(
            self.execution_timeout,
            self.executor
                .execute(&request.unit_id, request.execution_input.clone()),
        )
        .await;

        let failure = match execution {
            Ok(Ok(output)) => {
                let balance_cents = match &charge {
                    Some(tx) => tx.balance_after_cents,
                    None => wallet.balance_cents,
                };
                let completed_at = Utc::now();
                tracing::info!(run_id = %run_id, state = ?RunState::Succeeded, "metered run succeeded");
                return Ok(RunReceipt {
                    run_id,
                    request_id: request.request_id,
                    tenant_id: request.tenant_id,
                    state: RunState::Succeeded,
                    quote,
                    charge,
                    balance_cents,
                    output,
                    started_at,
                    completed_at,
                });
            }
            Ok(Err(e)) => e.0,
            Err(_) => format!(
                "execution timed out after {}ms",
                self.execution_timeout.as_millis()
            ),
        };

        // Compensate. The charge key is stable, so the derived refund key is
        // too: a retried refund replays instead of double-crediting.
        let Some(charge) = charge else {
            // Nothing was charged, nothing to reverse.
            return Err(MeterError::ExecutionFailed {
                error: failure,
                refund: None,
            });
        };

        let refund_key = Self::refund_key(&charge_key);
        let refunded = self
            .ledger
            .credit(
                &request.tenant_id,
                quote.final_price_cents,
                &refund_key,
                TransactionSource::Refund,
                Some(&charge.id.to_string()),
                Some(&format!("refund: {failure}")),
            )
            .await;

        match refunded {
            Ok(refund) => {
                tracing::info!(
                    run_id = %run_id,
                    state = ?RunState::Refunded,
                    tenant_id = %request.tenant_id,
                    amount_cents = quote.final_price_cents,
                    balance_after = refund.balance_after_cents,
                    "charge refunded after execution failure"
                );
                Err(MeterError::ExecutionFailed {
                    error: failure,
                    refund: Some(Box::new(refund)),
                })
            }
            Err(refund_error) => {
                tracing::error!(
                    run_id = %run_id,
                    state = ?RunState::RefundFailed,
                    tenant_id = %request.tenant_id,
                    charge_id = %charge.id,
                    amount_cents = quote.final_price_cents,
                    execution_error = %failure,
                    refund_error = %refund_error,
                    "REFUND FAILED: charge kept for work that did not happen, reconcile manually"
                );
                Err(MeterError::RefundFailed {
                    execution_error: failure,
                    refund_error: refund_error.to_string(),
                    charge: Box::new(charge),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PriceCatalog;
    use meterline_ledger::{MemoryLedger, TransactionKind, WalletTier};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor that succeeds and counts invocations.
    struct OkExecutor {
        calls: AtomicUsize,
    }

    impl OkExecutor {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkflowExecutor for OkExecutor {
        async fn execute(&self, unit_id: &str, input: Value) -> Result<Value, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "unit": unit_id, "echo": input }))
        }
    }

    /// Executor that always fails.
    struct FailingExecutor;

    #[async_trait]
    impl WorkflowExecutor for FailingExecutor {
        async fn execute(&self, _unit_id: &str, _input: Value) -> Result<Value, ExecutionError> {
            Err(ExecutionError("downstream exploded".into()))
        }
    }

    /// Executor that never returns in time.
    struct SlowExecutor;

    #[async_trait]
    impl WorkflowExecutor for SlowExecutor {
        async fn execute(&self, _unit_id: &str, _input: Value) -> Result<Value, ExecutionError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(json!({}))
        }
    }

    /// Ledger wrapper whose refund credits fail with a storage fault.
    struct RefundsUnavailable {
        inner: MemoryLedger,
    }

    #[async_trait]
    impl LedgerStore for RefundsUnavailable {
        async fn get_wallet(&self, tenant_id: &str) -> meterline_ledger::LedgerResult<meterline_ledger::Wallet> {
            self.inner.get_wallet(tenant_id).await
        }

        async fn credit(
            &self,
            tenant_id: &str,
            amount_cents: i64,
            idempotency_key: &str,
            source: TransactionSource,
            source_id: Option<&str>,
            description: Option<&str>,
        ) -> meterline_ledger::LedgerResult<Transaction> {
            if source == TransactionSource::Refund {
                return Err(LedgerError::StorageUnavailable("connection reset".into()));
            }
            self.inner
                .credit(tenant_id, amount_cents, idempotency_key, source, source_id, description)
                .await
        }

        async fn debit(
            &self,
            tenant_id: &str,
            amount_cents: i64,
            idempotency_key: &str,
            source_id: Option<&str>,
            description: Option<&str>,
        ) -> meterline_ledger::LedgerResult<Transaction> {
            self.inner
                .debit(tenant_id, amount_cents, idempotency_key, source_id, description)
                .await
        }

        async fn adjust(
            &self,
            tenant_id: &str,
            delta_cents: i64,
            idempotency_key: &str,
            source_id: Option<&str>,
            description: Option<&str>,
        ) -> meterline_ledger::LedgerResult<Transaction> {
            self.inner
                .adjust(tenant_id, delta_cents, idempotency_key, source_id, description)
                .await
        }

        async fn set_tier(
            &self,
            tenant_id: &str,
            tier: WalletTier,
        ) -> meterline_ledger::LedgerResult<meterline_ledger::Wallet> {
            self.inner.set_tier(tenant_id, tier).await
        }

        async fn list_transactions(
            &self,
            tenant_id: &str,
            limit: usize,
        ) -> meterline_ledger::LedgerResult<Vec<Transaction>> {
            self.inner.list_transactions(tenant_id, limit).await
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn request(request_id: &str) -> MeterRequest {
        MeterRequest {
            tenant_id: "t1".into(),
            unit_id: "website-audit".into(),
            quantity: 1,
            request_id: request_id.into(),
            execution_input: json!({ "url": "https://example.com" }),
        }
    }

    fn orchestrator(
        ledger: Arc<dyn LedgerStore>,
        executor: Arc<dyn WorkflowExecutor>,
    ) -> MeteringOrchestrator {
        let calculator = PricingCalculator::new(Arc::new(PriceCatalog::with_defaults()));
        MeteringOrchestrator::new(calculator, ledger, executor)
    }

    async fn funded_ledger(cents: i64) -> Arc<MemoryLedger> {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .credit("t1", cents, "pay_seed", TransactionSource::PaymentProcessor, None, None)
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_success_keeps_charge() {
        let ledger = funded_ledger(5000).await;
        let orch = orchestrator(ledger.clone(), Arc::new(OkExecutor::new()));

        let receipt = orch.run(request("req_1")).await.unwrap();

        assert_eq!(receipt.state, RunState::Succeeded);
        assert_eq!(receipt.balance_cents, 3000);
        assert_eq!(receipt.output["unit"], "website-audit");
        let charge = receipt.charge.unwrap();
        assert_eq!(charge.kind, TransactionKind::Debit);
        assert_eq!(charge.amount_cents, -2000);
        assert_eq!(ledger.get_wallet("t1").await.unwrap().balance_cents, 3000);
    }

    #[tokio::test]
    async fn test_insufficient_balance_skips_executor() {
        let ledger = funded_ledger(1000).await;
        let executor = Arc::new(OkExecutor::new());
        let orch = orchestrator(ledger.clone(), executor.clone());

        let err = orch.run(request("req_1")).await.unwrap_err();

        match err {
            MeterError::InsufficientBalance {
                requested_cents,
                available_cents,
                ..
            } => {
                assert_eq!(requested_cents, 2000);
                assert_eq!(available_cents, 1000);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The executor was never contacted.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.get_wallet("t1").await.unwrap().balance_cents, 1000);
    }

    #[tokio::test]
    async fn test_failure_triggers_refund() {
        let ledger = funded_ledger(5000).await;
        let orch = orchestrator(ledger.clone(), Arc::new(FailingExecutor));

        let err = orch.run(request("req_1")).await.unwrap_err();

        let refund = match err {
            MeterError::ExecutionFailed { error, refund } => {
                assert!(error.contains("downstream exploded"));
                *refund.expect("refund present")
            }
            other => panic!("unexpected error: {other}"),
        };

        assert_eq!(refund.source, TransactionSource::Refund);
        assert_eq!(refund.amount_cents, 2000);
        assert_eq!(refund.idempotency_key, "t1:website-audit:req_1_refund");
        assert_eq!(ledger.get_wallet("t1").await.unwrap().balance_cents, 5000);

        // Exactly one charge and one refund, linked by the charge id.
        let log = ledger.list_transactions("t1", 10).await.unwrap();
        let charge = log
            .iter()
            .find(|t| t.kind == TransactionKind::Debit)
            .unwrap();
        assert_eq!(refund.source_id.as_deref(), Some(charge.id.to_string().as_str()));
        assert_eq!(
            log.iter().filter(|t| t.source == TransactionSource::Refund).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_timeout_treated_as_failure() {
        let ledger = funded_ledger(5000).await;
        let calculator = PricingCalculator::new(Arc::new(PriceCatalog::with_defaults()));
        let orch = MeteringOrchestrator::new(calculator, ledger.clone(), Arc::new(SlowExecutor))
            .with_execution_timeout(Duration::from_millis(20));

        let err = orch.run(request("req_1")).await.unwrap_err();

        match err {
            MeterError::ExecutionFailed { error, refund } => {
                assert!(error.contains("timed out"));
                assert!(refund.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.get_wallet("t1").await.unwrap().balance_cents, 5000);
    }

    #[tokio::test]
    async fn test_refund_failure_is_loud() {
        init_tracing();
        let inner = MemoryLedger::new();
        inner
            .credit("t1", 5000, "pay_seed", TransactionSource::PaymentProcessor, None, None)
            .await
            .unwrap();
        let ledger = Arc::new(RefundsUnavailable { inner });
        let orch = orchestrator(ledger.clone(), Arc::new(FailingExecutor));

        let err = orch.run(request("req_1")).await.unwrap_err();

        match err {
            MeterError::RefundFailed {
                execution_error,
                refund_error,
                charge,
            } => {
                assert!(execution_error.contains("downstream exploded"));
                assert!(refund_error.contains("storage unavailable"));
                assert_eq!(charge.amount_cents, -2000);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The charge stands until reconciliation.
        assert_eq!(ledger.get_wallet("t1").await.unwrap().balance_cents, 3000);
    }

    #[tokio::test]
    async fn test_retried_request_charges_once() {
        let ledger = funded_ledger(5000).await;
        let orch = orchestrator(ledger.clone(), Arc::new(OkExecutor::new()));

        let first = orch.run(request("req_1")).await.unwrap();
        let second = orch.run(request("req_1")).await.unwrap();

        // Same logical request: the debit replays instead of applying twice.
        assert_eq!(
            first.charge.as_ref().unwrap().id,
            second.charge.as_ref().unwrap().id
        );
        assert_eq!(ledger.get_wallet("t1").await.unwrap().balance_cents, 3000);

        // A distinct request charges again.
        orch.run(request("req_2")).await.unwrap();
        assert_eq!(ledger.get_wallet("t1").await.unwrap().balance_cents, 1000);
    }

    #[tokio::test]
    async fn test_zero_priced_run_skips_ledger() {
        use crate::catalog::{PriceableUnit, TierDiscounts};

        let catalog = PriceCatalog::build(
            vec![PriceableUnit {
                id: "freebie".into(),
                name: "Freebie".into(),
                base_price_cents: 100,
                bulk_brackets: vec![],
            }],
            TierDiscounts {
                base: 0,
                mid: 0,
                top: 100,
            },
        )
        .unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_tier("t1", WalletTier::Top).await.unwrap();
        let orch = MeteringOrchestrator::new(
            PricingCalculator::new(Arc::new(catalog)),
            ledger.clone(),
            Arc::new(OkExecutor::new()),
        );

        let receipt = orch
            .run(MeterRequest {
                tenant_id: "t1".into(),
                unit_id: "freebie".into(),
                quantity: 1,
                request_id: "req_free".into(),
                execution_input: json!({}),
            })
            .await
            .unwrap();

        assert!(receipt.charge.is_none());
        assert_eq!(receipt.state, RunState::Succeeded);
        assert!(ledger.list_transactions("t1", 10).await.unwrap().is_empty());
    }
}
