//! Spendable balance derived from credited commission and withdrawal history.
//!
//! `available = credited - paid out - locked`, where paid out sums `paid`
//! withdrawals and locked sums `requested` and `processing` ones. A negative
//! result is never clamped here: it means a withdrawal was double-locked or
//! exceeded its eligible balance, and [`WalletBalance::checked`] reports it.

use thiserror::Error;
use tracing::error;

use crate::Amount;
use crate::model::{UserId, WithdrawalRequest, WithdrawalStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error(
        "referrer {referrer} has a negative balance {available} \
         (credited {credited}, paid out {withdrawn}, locked {locked})"
    )]
    NegativeBalance {
        referrer: UserId,
        available: Amount,
        credited: Amount,
        withdrawn: Amount,
        locked: Amount,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalletBalance {
    pub total_credited: Amount,
    pub total_withdrawn: Amount,
    pub locked_amount: Amount,
    pub available_balance: Amount,
}

impl WalletBalance {
    pub fn is_consistent(&self) -> bool {
        !self.available_balance.is_negative()
    }

    /// Fails if the balance went negative, logging the inconsistency.
    pub fn checked(self, referrer: UserId) -> Result<Self, IntegrityError> {
        if self.is_consistent() {
            return Ok(self);
        }
        error!(
            referrer = %referrer,
            available = %self.available_balance,
            credited = %self.total_credited,
            withdrawn = %self.total_withdrawn,
            locked = %self.locked_amount,
            "negative wallet balance"
        );
        Err(IntegrityError::NegativeBalance {
            referrer,
            available: self.available_balance,
            credited: self.total_credited,
            withdrawn: self.total_withdrawn,
            locked: self.locked_amount,
        })
    }

    /// Available balance floored at zero, for presentation only.
    pub fn display_available(&self) -> Amount {
        self.available_balance.clamp_zero()
    }
}

/// Net `total_credited` against a referrer's withdrawals.
pub fn compute_balance<'a>(
    total_credited: Amount,
    withdrawals: impl IntoIterator<Item = &'a WithdrawalRequest>,
) -> WalletBalance {
    let mut total_withdrawn = Amount::ZERO;
    let mut locked_amount = Amount::ZERO;

    for withdrawal in withdrawals {
        match withdrawal.status {
            WithdrawalStatus::Paid => total_withdrawn += withdrawal.amount,
            status if status.is_locking() => locked_amount += withdrawal.amount,
            _ => {}
        }
    }

    WalletBalance {
        total_credited,
        total_withdrawn,
        locked_amount,
        available_balance: total_credited - total_withdrawn - locked_amount,
    }
}
