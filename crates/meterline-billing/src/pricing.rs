//! Pricing Calculator
//!
//! Pure quoting: catalog + tier + quantity in, deterministic price out. No
//! clock, no randomness, no side effects, so identical inputs always produce
//! identical quotes.

use std::sync::Arc;

use meterline_ledger::WalletTier;
use serde::{Deserialize, Serialize};

use crate::catalog::{PriceCatalog, PriceableUnit};

/// Deterministic quote for one metered operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedOperation {
    /// Catalog unit
    pub unit_id: String,
    /// Requested quantity
    pub quantity: u32,
    /// Catalog base price per unit
    pub base_price_cents: i64,
    /// Per-unit price after bracket selection
    pub unit_price_cents: i64,
    /// Tier percentage applied
    pub tier_discount_pct: u32,
    /// Saving versus the base price from the selected bracket, in percent
    pub bulk_discount_pct: u32,
    /// Amount the wallet will be debited
    pub final_price_cents: i64,
}

/// Pricing error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum PricingError {
    /// Unit id not present in the catalog
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
    /// Quantity below one
    #[error("invalid quantity: {0}")]
    InvalidQuantity(u32),
    /// Quantity times price exceeds the representable range
    #[error("price overflow for unit {0}")]
    Overflow(String),
}

/// Pure price calculator over a shared catalog
#[derive(Clone)]
pub struct PricingCalculator {
    catalog: Arc<PriceCatalog>,
}

impl PricingCalculator {
    /// Calculator over the given catalog
    pub fn new(catalog: Arc<PriceCatalog>) -> Self {
        Self { catalog }
    }

    /// Price `quantity` units of `unit_id` for a tenant at `tier`.
    ///
    /// Bracket selection picks the largest bracket whose lower bound is at
    /// or below the quantity; with no matching bracket the base price
    /// applies. The tier discount is a percentage reduction on the subtotal,
    /// floored to whole cents so rounding never favors the tenant beyond
    /// the computed discount.
    pub fn quote(
        &self,
        unit_id: &str,
        quantity: u32,
        tier: WalletTier,
    ) -> Result<PricedOperation, PricingError> {
        if quantity < 1 {
            return Err(PricingError::InvalidQuantity(quantity));
        }
        let unit = self
            .catalog
            .get(unit_id)
            .ok_or_else(|| PricingError::UnknownUnit(unit_id.to_string()))?;

        let unit_price_cents = select_unit_price(unit, quantity);
        let subtotal = unit_price_cents
            .checked_mul(i64::from(quantity))
            .ok_or_else(|| PricingError::Overflow(unit_id.to_string()))?;

        let tier_discount_pct = self.catalog.tier_discounts().for_tier(tier);
        let final_price_cents = subtotal
            .checked_mul(i64::from(100 - tier_discount_pct))
            .ok_or_else(|| PricingError::Overflow(unit_id.to_string()))?
            / 100;

        let bulk_discount_pct = if unit.base_price_cents > 0 && unit_price_cents < unit.base_price_cents
        {
            ((unit.base_price_cents - unit_price_cents) * 100 / unit.base_price_cents) as u32
        } else {
            0
        };

        Ok(PricedOperation {
            unit_id: unit_id.to_string(),
            quantity,
            base_price_cents: unit.base_price_cents,
            unit_price_cents,
            tier_discount_pct,
            bulk_discount_pct,
            final_price_cents,
        })
    }
}

/// Largest bracket whose lower bound is <= quantity, else the base price.
fn select_unit_price(unit: &PriceableUnit, quantity: u32) -> i64 {
    unit.bulk_brackets
        .iter()
        .rev()
        .find(|b| b.min_quantity <= quantity)
        .map(|b| b.unit_price_cents)
        .unwrap_or(unit.base_price_cents)
}
