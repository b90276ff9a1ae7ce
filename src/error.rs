//! Error taxonomy shared by the ledger services.

use thiserror::Error;

use crate::amount::AmountParseError;
use crate::identifier::IdentifierError;
use crate::insights::InsightsError;
use crate::referral::AttributionError;
use crate::store::StoreError;
use crate::wallet::IntegrityError;
use crate::withdrawal::{TransitionError, WithdrawalError};
use crate::{Amount, UserId};

/// Malformed or out-of-range caller input. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Amount),

    #[error("invalid amount: {0}")]
    Amount(#[from] AmountParseError),

    #[error("'{base}' leaves no usable characters")]
    EmptyIdentifier { base: String },

    #[error("'{candidate}' is shorter than {min} characters")]
    IdentifierTooShort { candidate: String, min: usize },

    #[error("user {0} cannot refer themselves")]
    SelfReferral(UserId),
}

/// Top-level error for callers that drive several services.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("withdrawal failed: {0}")]
    Withdrawal(#[from] WithdrawalError),

    #[error("transition failed: {0}")]
    Transition(#[from] TransitionError),

    #[error("identifier allocation failed: {0}")]
    Identifier(#[from] IdentifierError),

    #[error("attribution failed: {0}")]
    Attribution(#[from] AttributionError),

    #[error("insights failed: {0}")]
    Insights(#[from] InsightsError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Transient infrastructure failures; the whole operation may be retried.
    pub fn is_retryable(&self) -> bool {
        let store = match self {
            LedgerError::Store(e) => Some(e),
            LedgerError::Withdrawal(WithdrawalError::Store(e))
            | LedgerError::Transition(TransitionError::Store(e))
            | LedgerError::Identifier(IdentifierError::Store(e))
            | LedgerError::Attribution(AttributionError::Store(e))
            | LedgerError::Insights(InsightsError::Store(e)) => Some(e),
            _ => None,
        };
        matches!(
            store,
            Some(StoreError::Unavailable(_) | StoreError::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_store_failures_are_retryable() {
        let timeout = LedgerError::from(WithdrawalError::Store(StoreError::Timeout));
        assert!(timeout.is_retryable());

        let offline = LedgerError::from(StoreError::Unavailable("down".into()));
        assert!(offline.is_retryable());

        let below = LedgerError::from(WithdrawalError::BelowMinimum {
            minimum: Amount::from_units(100),
            requested: Amount::from_units(10),
        });
        assert!(!below.is_retryable());

        let conflict = LedgerError::from(StoreError::UniqueViolation {
            column: "slug",
            value: "x".into(),
        });
        assert!(!conflict.is_retryable());
    }
}
