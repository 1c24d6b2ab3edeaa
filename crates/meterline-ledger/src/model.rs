//! Wallet and Transaction Data Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant ID (opaque, chat-platform-derived)
pub type TenantId = String;

/// Wallet discount tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletTier {
    /// Entry tier, no discount
    Base,
    /// Mid tier
    Mid,
    /// Top tier
    Top,
}

impl Default for WalletTier {
    fn default() -> Self {
        Self::Base
    }
}

impl WalletTier {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Mid => "mid",
            Self::Top => "top",
        }
    }

    /// Parse a stable storage name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "base" => Some(Self::Base),
            "mid" => Some(Self::Mid),
            "top" => Some(Self::Top),
            _ => None,
        }
    }
}

/// Per-tenant wallet
///
/// `balance_cents` is never negative at a committed state, and always equals
/// `lifetime_topped_up_cents - lifetime_spent_cents` plus the sum of
/// adjustment amounts. Both lifetime counters only grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Current balance in minor currency units
    pub balance_cents: i64,
    /// Discount tier
    pub tier: WalletTier,
    /// Gross debits over the wallet's lifetime
    pub lifetime_spent_cents: i64,
    /// Gross credits over the wallet's lifetime
    pub lifetime_topped_up_cents: i64,
    /// First-touch creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Fresh zero-balance wallet at the base tier
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: tenant_id.into(),
            balance_cents: 0,
            tier: WalletTier::Base,
            lifetime_spent_cents: 0,
            lifetime_topped_up_cents: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ledger mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Balance increase
    Credit,
    /// Balance decrease
    Debit,
    /// Signed administrative correction
    Adjustment,
}

impl TransactionKind {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::Adjustment => "adjustment",
        }
    }

    /// Parse a stable storage name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(Self::Credit),
            "debit" => Some(Self::Debit),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

/// Origin of a ledger mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionSource {
    /// External top-up event
    PaymentProcessor,
    /// Charge for a metered workflow run
    WorkflowCharge,
    /// Compensating credit for a failed run
    Refund,
    /// Administrative action
    Admin,
    /// Promotional grant
    Promo,
}

impl TransactionSource {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentProcessor => "payment-processor",
            Self::WorkflowCharge => "workflow-charge",
            Self::Refund => "refund",
            Self::Admin => "admin",
            Self::Promo => "promo",
        }
    }

    /// Parse a stable storage name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment-processor" => Some(Self::PaymentProcessor),
            "workflow-charge" => Some(Self::WorkflowCharge),
            "refund" => Some(Self::Refund),
            "admin" => Some(Self::Admin),
            "promo" => Some(Self::Promo),
            _ => None,
        }
    }
}

/// Committed ledger entry, append-only
///
/// `amount_cents` is signed: credits positive, debits negative, adjustments
/// either. `balance_after_cents` snapshots the wallet balance immediately
/// after this entry committed, so history can be read without replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique id
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Mutation kind
    pub kind: TransactionKind,
    /// Signed amount in minor currency units
    pub amount_cents: i64,
    /// Wallet balance right after this entry committed
    pub balance_after_cents: i64,
    /// Mutation origin
    pub source: TransactionSource,
    /// External reference (payment id, workflow run id)
    pub source_id: Option<String>,
    /// At-most-once application token, unique across the ledger
    pub idempotency_key: String,
    /// Free-form note
    pub description: Option<String>,
    /// Commit time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_wallet() {
        let wallet = Wallet::new("tenant_001");

        assert_eq!(wallet.balance_cents, 0);
        assert_eq!(wallet.tier, WalletTier::Base);
        assert_eq!(wallet.lifetime_spent_cents, 0);
        assert_eq!(wallet.lifetime_topped_up_cents, 0);
    }

    #[test]
    fn test_storage_name_round_trip() {
        for tier in [WalletTier::Base, WalletTier::Mid, WalletTier::Top] {
            assert_eq!(WalletTier::parse(tier.as_str()), Some(tier));
        }
        for kind in [
            TransactionKind::Credit,
            TransactionKind::Debit,
            TransactionKind::Adjustment,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        for source in [
            TransactionSource::PaymentProcessor,
            TransactionSource::WorkflowCharge,
            TransactionSource::Refund,
            TransactionSource::Admin,
            TransactionSource::Promo,
        ] {
            assert_eq!(TransactionSource::parse(source.as_str()), Some(source));
        }
        assert_eq!(WalletTier::parse("platinum"), None);
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&TransactionSource::PaymentProcessor).unwrap();
        assert_eq!(json, "\"payment-processor\"");

        let json = serde_json::to_string(&WalletTier::Mid).unwrap();
        assert_eq!(json, "\"mid\"");
    }
}
