//! Row store interface.
//!
//! The ledger never keeps state of its own: every operation reads and writes
//! through a [`Store`]. Uniqueness of identifiers, attribution and order
//! references is enforced by the store's writes, not by the callers' lookups.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Amount;
use crate::model::{
    CommissionEarning, EarningId, EarningStatus, Listing, ListingId, ListingPaymentState,
    PayoutDetails, ReferralSignup, ReferrerAccount, UserId, WithdrawalId, WithdrawalRequest,
    WithdrawalStatus,
};

mod memory;
pub use memory::MemoryStore;

/// Infrastructure failures. A failed call has written nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out")]
    Timeout,

    #[error("unique constraint on {column} violated by '{value}'")]
    UniqueViolation { column: &'static str, value: String },

    #[error("{entity} {id} changed concurrently")]
    StaleWrite { entity: &'static str, id: u64 },

    #[error("{entity} {id} not found")]
    MissingRow { entity: &'static str, id: u64 },
}

/// Commission row to insert; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEarning {
    pub referrer: UserId,
    pub referred: UserId,
    pub order_ref: String,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

/// Withdrawal row to insert in `requested` state; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWithdrawal {
    pub request_number: String,
    pub referrer: UserId,
    pub amount: Amount,
    pub payout: PayoutDetails,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Held while a referrer's balance is checked and a withdrawal inserted.
    type ReferrerLock: Send;

    // identities

    /// Batch identity lookup. Unknown ids are simply absent from the map.
    async fn accounts_by_ids(
        &self,
        ids: &[UserId],
    ) -> Result<HashMap<UserId, ReferrerAccount>, StoreError>;

    /// Case-insensitive referral code lookup.
    async fn account_by_referral_code(
        &self,
        code: &str,
    ) -> Result<Option<ReferrerAccount>, StoreError>;

    // listings

    /// Live payment state per listing owner. A user with any paid listing is `Paid`.
    async fn payment_states(
        &self,
        users: &[UserId],
    ) -> Result<HashMap<UserId, ListingPaymentState>, StoreError>;

    async fn listing_by_slug(&self, slug: &str) -> Result<Option<Listing>, StoreError>;

    /// Case-insensitive.
    async fn listing_by_username(&self, username: &str) -> Result<Option<Listing>, StoreError>;

    /// Fails with `UniqueViolation` if another listing holds `slug`.
    async fn set_listing_slug(&self, listing: ListingId, slug: &str) -> Result<(), StoreError>;

    /// Fails with `UniqueViolation` if another listing holds `username`, ignoring case.
    async fn set_listing_username(
        &self,
        listing: ListingId,
        username: &str,
    ) -> Result<(), StoreError>;

    // signups

    async fn signups(&self, referrer: Option<UserId>) -> Result<Vec<ReferralSignup>, StoreError>;

    async fn signup_for(&self, referred: UserId) -> Result<Option<ReferralSignup>, StoreError>;

    /// Fails with `UniqueViolation` if `referred` is already attributed.
    async fn insert_signup(&self, signup: ReferralSignup) -> Result<(), StoreError>;

    // earnings

    async fn earnings(&self, referrer: Option<UserId>)
    -> Result<Vec<CommissionEarning>, StoreError>;

    async fn earning(&self, id: EarningId) -> Result<Option<CommissionEarning>, StoreError>;

    /// Fails with `UniqueViolation` if `order_ref` was already credited.
    async fn insert_earning(&self, earning: NewEarning) -> Result<CommissionEarning, StoreError>;

    /// Conditional status update: fails with `StaleWrite` unless the row is still `expected`.
    async fn update_earning_status(
        &self,
        id: EarningId,
        expected: EarningStatus,
        status: EarningStatus,
    ) -> Result<CommissionEarning, StoreError>;

    // withdrawals

    async fn withdrawals(
        &self,
        referrer: Option<UserId>,
        status: Option<WithdrawalStatus>,
    ) -> Result<Vec<WithdrawalRequest>, StoreError>;

    async fn withdrawal(&self, id: WithdrawalId) -> Result<Option<WithdrawalRequest>, StoreError>;

    /// Fails with `UniqueViolation` on a duplicate request number.
    async fn insert_withdrawal(
        &self,
        withdrawal: NewWithdrawal,
    ) -> Result<WithdrawalRequest, StoreError>;

    /// Replaces the row, but only if its status is still `expected`.
    async fn update_withdrawal(
        &self,
        expected: WithdrawalStatus,
        updated: &WithdrawalRequest,
    ) -> Result<(), StoreError>;

    /// Unconditionally overwrites the admin note.
    async fn set_withdrawal_note(
        &self,
        id: WithdrawalId,
        note: Option<String>,
    ) -> Result<WithdrawalRequest, StoreError>;

    /// Per-referrer advisory lock, released on drop.
    async fn lock_referrer(&self, referrer: UserId) -> Result<Self::ReferrerLock, StoreError>;
}
