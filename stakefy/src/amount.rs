//! Currency amounts and facilitator fees.
//!
//! Amounts are [`Decimal`] values in whole token units (e.g. `1.25` USDC). They are
//! serialized as strings so no precision is lost on the wire.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Maximum number of fractional digits accepted in a caller-supplied amount.
pub const MAX_SCALE: u32 = 9;

/// Largest caller-supplied amount: one trillion whole units. Sums of a few such
/// amounts stay far below [`Decimal::MAX`].
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0xD4A5_1000, 0xE8, 0, false, 0);

/// Reasons an amount or fee rate is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// Zero or negative amount.
    #[error("amount must be greater than zero, got {0}")]
    NotPositive(Decimal),
    /// Above [`MAX_AMOUNT`].
    #[error("amount {0} exceeds the maximum of {MAX_AMOUNT}")]
    TooLarge(Decimal),
    /// More fractional digits than the ledger can represent.
    #[error("amount {0} has more than {MAX_SCALE} decimal places")]
    TooPrecise(Decimal),
    /// Fee percentage outside `0..=100`.
    #[error("fee percentage must be between 0 and 100, got {0}")]
    FeeOutOfRange(Decimal),
    /// Arithmetic overflow while deriving a total.
    #[error("amount arithmetic overflowed")]
    Overflow,
}

/// Validates a caller-supplied amount.
///
/// # Errors
///
/// Returns [`AmountError`] if the amount is not strictly positive, exceeds
/// [`MAX_AMOUNT`] or carries more than [`MAX_SCALE`] decimal places.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, AmountError> {
    if amount <= Decimal::ZERO {
        return Err(AmountError::NotPositive(amount));
    }
    if amount > MAX_AMOUNT {
        return Err(AmountError::TooLarge(amount));
    }
    let normalized = amount.normalize();
    if normalized.scale() > MAX_SCALE {
        return Err(AmountError::TooPrecise(amount));
    }
    Ok(normalized)
}

/// Adds two amounts, failing instead of panicking on overflow.
///
/// # Errors
///
/// Returns [`AmountError::Overflow`] if the sum is not representable.
pub fn checked_total(a: Decimal, b: Decimal) -> Result<Decimal, AmountError> {
    a.checked_add(b).ok_or(AmountError::Overflow)
}

/// Facilitator fee, expressed as a percentage of the principal.
///
/// `FeeRate` of `0.5` charges half a percent: a `10` payment carries a `0.05` fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeeRate(Decimal);

impl Default for FeeRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FeeRate {
    /// Half a percent.
    pub const DEFAULT: Self = Self(Decimal::from_parts(5, 0, 0, false, 1));

    /// Creates a fee rate from a percentage in `0..=100`.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::FeeOutOfRange`] for negative or > 100 percentages.
    pub fn from_percentage(percentage: Decimal) -> Result<Self, AmountError> {
        if percentage < Decimal::ZERO || percentage > Decimal::ONE_HUNDRED {
            return Err(AmountError::FeeOutOfRange(percentage));
        }
        Ok(Self(percentage))
    }

    /// Returns the configured percentage.
    #[must_use]
    pub const fn percentage(&self) -> Decimal {
        self.0
    }

    /// Computes the fee owed on `amount`.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Overflow`] if the product is not representable.
    pub fn fee_for(&self, amount: Decimal) -> Result<Decimal, AmountError> {
        amount
            .checked_mul(self.0)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .map(|v| v.normalize())
            .ok_or(AmountError::Overflow)
    }
}
