//! Money amounts as stored in `NUMERIC(18, 2)` columns.

use bigdecimal::BigDecimal;
use num_traits::Zero;
use thiserror::Error;

/// Decimal places a stored amount keeps.
pub const MONEY_SCALE: i64 = 2;
/// Digits left of the decimal point a stored amount can have.
pub const MONEY_INTEGER_DIGITS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("Amount must be positive")]
    NotPositive,

    #[error("Amount must have at most {MONEY_SCALE} decimal places")]
    TooPrecise,

    #[error("Amount must be less than 10^{MONEY_INTEGER_DIGITS}")]
    TooLarge,
}

/// Checks that `amount` is positive and is stored without rounding or overflow.
pub fn check_amount(amount: &BigDecimal) -> Result<(), AmountError> {
    if *amount <= BigDecimal::zero() {
        return Err(AmountError::NotPositive);
    }
    let (_, scale) = amount.normalized().as_bigint_and_exponent();
    if scale > MONEY_SCALE {
        return Err(AmountError::TooPrecise);
    }
    if *amount >= BigDecimal::from(10u64.pow(MONEY_INTEGER_DIGITS)) {
        return Err(AmountError::TooLarge);
    }
    Ok(())
}
