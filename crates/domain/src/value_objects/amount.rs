use crate::error::{DomainError, DomainResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

fn pow10(decimals: u8) -> DomainResult<Decimal> {
    let mut multiplier = Decimal::ONE;
    for _ in 0..decimals {
        multiplier = multiplier
            .checked_mul(Decimal::TEN)
            .ok_or_else(|| DomainError::AmountOverflow(format!("10^{decimals}")))?;
    }
    Ok(multiplier)
}

/// Converts a human-readable token amount into integer atomic units
/// (`amount * 10^decimals`, rounded half away from zero).
pub fn to_atomic(amount: Decimal, decimals: u8) -> DomainResult<u64> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(DomainError::NegativeAmount(amount.to_string()));
    }
    let scaled = amount
        .checked_mul(pow10(decimals)?)
        .ok_or_else(|| DomainError::AmountOverflow(amount.to_string()))?;
    scaled
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .ok_or_else(|| DomainError::AmountOverflow(amount.to_string()))
}

/// Converts atomic units back into a human-readable amount.
pub fn from_atomic(raw: u64, decimals: u8) -> DomainResult<Decimal> {
    Decimal::try_from_i128_with_scale(i128::from(raw), u32::from(decimals))
        .map_err(|_| DomainError::AmountOverflow(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_to_atomic_rounds() {
        assert_eq!(to_atomic(dec!(12.5), 6).unwrap(), 12_500_000);
        assert_eq!(to_atomic(dec!(0.0000015), 6).unwrap(), 2);
        assert_eq!(to_atomic(dec!(1), 9).unwrap(), 1_000_000_000);
    }

    #[test]
    fn test_to_atomic_rejects_negative() {
        assert!(matches!(
            to_atomic(dec!(-1), 6),
            Err(DomainError::NegativeAmount(_))
        ));
    }

    #[test]
    fn test_from_atomic() {
        assert_eq!(from_atomic(12_500_000, 6).unwrap(), dec!(12.5));
    }
}
