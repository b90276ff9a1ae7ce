//! Error types for the withdrawal workflow.

use thiserror::Error;

use crate::Amount;
use crate::error::ValidationError;
use crate::model::{Actor, UserId, WithdrawalId, WithdrawalStatus};
use crate::store::StoreError;
use crate::wallet::IntegrityError;

/// Error returned by [`WithdrawalWorkflow::create_request`](super::WithdrawalWorkflow::create_request).
#[derive(Debug, Error)]
pub enum WithdrawalError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("requested {requested} is below the minimum withdrawal of {minimum}")]
    BelowMinimum { minimum: Amount, requested: Amount },

    #[error("insufficient balance for referrer {referrer}: available {available}, requested {requested}")]
    InsufficientBalance {
        referrer: UserId,
        available: Amount,
        requested: Amount,
    },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by admin operations on an existing request.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("withdrawal {0} not found")]
    NotFound(WithdrawalId),

    #[error("withdrawal {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: WithdrawalId,
        from: WithdrawalStatus,
        to: WithdrawalStatus,
    },

    #[error("{0:?} may not change withdrawal requests")]
    Forbidden(Actor),

    #[error(transparent)]
    Store(#[from] StoreError),
}
