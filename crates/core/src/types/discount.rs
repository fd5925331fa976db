//! Coupon discount values using decimal arithmetic.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A monetary amount with currency information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Price {
    /// Amount in the currency's standard unit (e.g., rand, not cents).
    pub amount: Decimal,
    /// ISO 4217 currency code.
    pub currency_code: CurrencyCode,
}

impl Price {
    /// Create a new price.
    #[must_use]
    pub const fn new(amount: Decimal, currency_code: CurrencyCode) -> Self {
        Self {
            amount,
            currency_code,
        }
    }
}

/// ISO 4217 currency codes accepted for fixed-amount coupons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    #[default]
    ZAR,
    USD,
    EUR,
    GBP,
}

impl CurrencyCode {
    /// Display symbol for the currency.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::ZAR => "R",
            Self::USD => "$",
            Self::EUR => "€",
            Self::GBP => "£",
        }
    }
}

/// The value a coupon takes off an order.
///
/// Stored on the coupon document as `{"type": "percentage", "value": "10"}` or
/// `{"type": "fixedAmount", "value": {"amount": "50", "currencyCode": "ZAR"}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Discount {
    /// Percentage off the order total (0-100).
    Percentage(Decimal),
    /// Fixed amount off the order total.
    FixedAmount(Price),
}

impl Discount {
    /// Apply the discount to an order total.
    ///
    /// The result never goes below zero; percentages above 100 are capped.
    #[must_use]
    pub fn apply(&self, total: Decimal) -> Decimal {
        let reduced = match self {
            Self::Percentage(pct) => {
                let pct = (*pct).clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
                total - total * pct / Decimal::ONE_HUNDRED
            }
            Self::FixedAmount(price) => total - price.amount,
        };
        reduced.max(Decimal::ZERO)
    }

    /// Human-readable label (e.g., "10% off", "R50 off").
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Percentage(pct) => format!("{}% off", pct.normalize()),
            Self::FixedAmount(price) => {
                format!("{}{} off", price.currency_code.symbol(), price.amount.normalize())
            }
        }
    }
}
