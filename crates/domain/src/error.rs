use rust_decimal::Decimal;
use thiserror::Error;

/// Validation failures when building domain values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("symbol must not be empty")]
    EmptySymbol,
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),
    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),
    #[error("percentage must be within (0, 1), got {0}")]
    PercentageOutOfRange(Decimal),
}
