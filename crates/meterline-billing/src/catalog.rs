//! Pricing Catalog
//!
//! Static table of priceable work units: base price per unit, optional
//! bulk-quantity brackets, and the discount percentage of each wallet tier.
//! Built-in defaults cover the stock workflows; deployments override them
//! with a JSON catalog file.

use std::collections::HashMap;
use std::path::Path;

use meterline_ledger::WalletTier;
use serde::{Deserialize, Serialize};

/// Quantity range with its own per-unit price
///
/// Ranges are closed on both ends; `max_quantity = None` leaves the top
/// bracket open-ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkBracket {
    /// Lowest quantity this bracket covers (inclusive)
    pub min_quantity: u32,
    /// Highest quantity this bracket covers (inclusive)
    pub max_quantity: Option<u32>,
    /// Per-unit price inside this bracket
    pub unit_price_cents: i64,
}

/// A priceable unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceableUnit {
    /// Catalog key
    pub id: String,
    /// Display name
    pub name: String,
    /// Per-unit price when no bracket applies
    pub base_price_cents: i64,
    /// Volume pricing, sorted ascending by lower bound
    #[serde(default)]
    pub bulk_brackets: Vec<BulkBracket>,
}

/// Percentage reduction per wallet tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierDiscounts {
    /// Base tier discount (usually zero)
    pub base: u32,
    /// Mid tier discount
    pub mid: u32,
    /// Top tier discount
    pub top: u32,
}

impl TierDiscounts {
    /// Discount percentage for a tier
    pub fn for_tier(&self, tier: WalletTier) -> u32 {
        match tier {
            WalletTier::Base => self.base,
            WalletTier::Mid => self.mid,
            WalletTier::Top => self.top,
        }
    }
}

impl Default for TierDiscounts {
    fn default() -> Self {
        Self {
            base: 0,
            mid: 10,
            top: 25,
        }
    }
}

/// On-disk catalog document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    units: Vec<PriceableUnit>,
    #[serde(default)]
    tier_discounts: TierDiscounts,
}

/// Catalog loading/validation error
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Catalog file unreadable
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),
    /// Catalog document malformed
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// Catalog contents violate an invariant
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// Price catalog
#[derive(Debug)]
pub struct PriceCatalog {
    units: HashMap<String, PriceableUnit>,
    tier_discounts: TierDiscounts,
}

impl PriceCatalog {
    /// Catalog with the stock workflow units
    pub fn with_defaults() -> Self {
        let units = vec![
            PriceableUnit {
                id: "website-audit".into(),
                name: "Website Audit".into(),
                base_price_cents: 2000,
                bulk_brackets: vec![],
            },
            PriceableUnit {
                id: "lead-discovery".into(),
                name: "Lead Discovery".into(),
                base_price_cents: 150,
                bulk_brackets: vec![
                    BulkBracket {
                        min_quantity: 25,
                        max_quantity: Some(99),
                        unit_price_cents: 120,
                    },
                    BulkBracket {
                        min_quantity: 100,
                        max_quantity: None,
                        unit_price_cents: 90,
                    },
                ],
            },
            PriceableUnit {
                id: "competitor-scan".into(),
                name: "Competitor Scan".into(),
                base_price_cents: 800,
                bulk_brackets: vec![BulkBracket {
                    min_quantity: 5,
                    max_quantity: None,
                    unit_price_cents: 600,
                }],
            },
            PriceableUnit {
                id: "content-brief".into(),
                name: "Content Brief".into(),
                base_price_cents: 400,
                bulk_brackets: vec![],
            },
        ];
        Self {
            units: units.into_iter().map(|u| (u.id.clone(), u)).collect(),
            tier_discounts: TierDiscounts::default(),
        }
    }

    /// Assemble and validate a catalog
    pub fn build(
        units: Vec<PriceableUnit>,
        tier_discounts: TierDiscounts,
    ) -> Result<Self, CatalogError> {
        for unit in &units {
            validate_unit(unit)?;
        }
        for (tier, pct) in [
            ("base", tier_discounts.base),
            ("mid", tier_discounts.mid),
            ("top", tier_discounts.top),
        ] {
            if pct > 100 {
                return Err(CatalogError::Invalid(format!(
                    "tier {tier} discount {pct}% exceeds 100%"
                )));
            }
        }
        Ok(Self {
            units: units.into_iter().map(|u| (u.id.clone(), u)).collect(),
            tier_discounts,
        })
    }

    /// Parse a JSON catalog document
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::build(file.units, file.tier_discounts)
    }

    /// Load a JSON catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Look up a unit
    pub fn get(&self, unit_id: &str) -> Option<&PriceableUnit> {
        self.units.get(unit_id)
    }

    /// All units, unordered
    pub fn units(&self) -> impl Iterator<Item = &PriceableUnit> {
        self.units.values()
    }

    /// Tier discount table
    pub fn tier_discounts(&self) -> TierDiscounts {
        self.tier_discounts
    }
}

fn validate_unit(unit: &PriceableUnit) -> Result<(), CatalogError> {
    if unit.base_price_cents < 0 {
        return Err(CatalogError::Invalid(format!(
            "unit {} has negative base price",
            unit.id
        )));
    }

    let mut previous: Option<&BulkBracket> = None;
    for bracket in &unit.bulk_brackets {
        if bracket.min_quantity < 1 {
            return Err(CatalogError::Invalid(format!(
                "unit {} bracket lower bound must be >= 1",
                unit.id
            )));
        }
        if bracket.unit_price_cents < 0 {
            return Err(CatalogError::Invalid(format!(
                "unit {} bracket has negative price",
                unit.id
            )));
        }
        if let Some(max) = bracket.max_quantity {
            if max < bracket.min_quantity {
                return Err(CatalogError::Invalid(format!(
                    "unit {} bracket range [{}, {max}] is empty",
                    unit.id, bracket.min_quantity
                )));
            }
        }
        if let Some(prev) = previous {
            // Sorted ascending, non-overlapping, and nothing after an
            // open-ended bracket.
            let prev_max = match prev.max_quantity {
                Some(max) => max,
                None => {
                    return Err(CatalogError::Invalid(format!(
                        "unit {} has brackets after an open-ended bracket",
                        unit.id
                    )))
                }
            };
            if bracket.min_quantity <= prev_max {
                return Err(CatalogError::Invalid(format!(
                    "unit {} brackets overlap or are unsorted at quantity {}",
                    unit.id, bracket.min_quantity
                )));
            }
        }
        previous = Some(bracket);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let catalog = PriceCatalog::with_defaults();

        assert!(catalog.get("website-audit").is_some());
        assert!(catalog.get("lead-discovery").is_some());
        assert!(catalog.get("no-such-unit").is_none());
        assert_eq!(catalog.tier_discounts().for_tier(WalletTier::Base), 0);
    }

    #[test]
    fn test_default_catalog_passes_validation() {
        let catalog = PriceCatalog::with_defaults();
        let units: Vec<_> = catalog.units().cloned().collect();

        assert!(PriceCatalog::build(units, catalog.tier_discounts()).is_ok());
    }

    #[test]
    fn test_from_json() {
        let catalog = PriceCatalog::from_json(
            r#"{
                "units": [
                    {"id": "audit", "name": "Audit", "base_price_cents": 2000},
                    {"id": "leads", "name": "Leads", "base_price_cents": 150,
                     "bulk_brackets": [
                        {"min_quantity": 10, "max_quantity": 49, "unit_price_cents": 100},
                        {"min_quantity": 50, "max_quantity": null, "unit_price_cents": 80}
                     ]}
                ],
                "tier_discounts": {"base": 0, "mid": 5, "top": 20}
            }"#,
        )
        .unwrap();

        assert_eq!(catalog.get("audit").unwrap().base_price_cents, 2000);
        assert_eq!(catalog.get("leads").unwrap().bulk_brackets.len(), 2);
        assert_eq!(catalog.tier_discounts().for_tier(WalletTier::Top), 20);
    }

    #[test]
    fn test_rejects_overlapping_brackets() {
        let err = PriceCatalog::build(
            vec![PriceableUnit {
                id: "u".into(),
                name: "U".into(),
                base_price_cents: 100,
                bulk_brackets: vec![
                    BulkBracket {
                        min_quantity: 10,
                        max_quantity: Some(50),
                        unit_price_cents: 90,
                    },
                    BulkBracket {
                        min_quantity: 40,
                        max_quantity: None,
                        unit_price_cents: 80,
                    },
                ],
            }],
            TierDiscounts::default(),
        )
        .unwrap_err();

        assert!(matches!(err, CatalogError::Invalid(_)));
    }

    #[test]
    fn test_rejects_discount_over_100() {
        let err = PriceCatalog::build(
            vec![],
            TierDiscounts {
                base: 0,
                mid: 10,
                top: 120,
            },
        )
        .unwrap_err();

        assert!(matches!(err, CatalogError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bracket_after_open_ended() {
        let err = PriceCatalog::build(
            vec![PriceableUnit {
                id: "u".into(),
                name: "U".into(),
                base_price_cents: 100,
                bulk_brackets: vec![
                    BulkBracket {
                        min_quantity: 10,
                        max_quantity: None,
                        unit_price_cents: 90,
                    },
                    BulkBracket {
                        min_quantity: 100,
                        max_quantity: None,
                        unit_price_cents: 80,
                    },
                ],
            }],
            TierDiscounts::default(),
        )
        .unwrap_err();

        assert!(matches!(err, CatalogError::Invalid(_)));
    }
}
