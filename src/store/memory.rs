use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{NewEarning, NewWithdrawal, Store, StoreError};
use crate::model::{
    CommissionEarning, EarningId, EarningStatus, Listing, ListingId, ListingPaymentState,
    ReferralSignup, ReferrerAccount, UserId, WithdrawalId, WithdrawalRequest, WithdrawalStatus,
};

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<UserId, ReferrerAccount>,
    listings: BTreeMap<ListingId, Listing>,
    /// Keyed by referred user: one referrer per referred user.
    signups: BTreeMap<UserId, ReferralSignup>,
    earnings: BTreeMap<EarningId, CommissionEarning>,
    withdrawals: BTreeMap<WithdrawalId, WithdrawalRequest>,
}

impl Tables {
    fn next_earning_id(&self) -> EarningId {
        self.earnings.keys().next_back().map_or(1, |id| id + 1)
    }

    fn next_withdrawal_id(&self) -> WithdrawalId {
        self.withdrawals.keys().next_back().map_or(1, |id| id + 1)
    }
}

/// In-process [`Store`] backed by ordered maps.
///
/// Enforces the same constraints a relational backend would: unique slugs,
/// case-insensitive unique usernames, unique referred users, unique order
/// references and unique request numbers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    referrer_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
    offline: AtomicBool,
    withdrawals_unavailable: AtomicBool,
}

/// Seeding and fault injection
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every store call fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// While set, only the withdrawal reads fail with `StoreError::Unavailable`.
    pub fn set_withdrawals_unavailable(&self, unavailable: bool) {
        self.withdrawals_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    pub async fn put_account(&self, account: ReferrerAccount) {
        self.tables
            .write()
            .await
            .accounts
            .insert(account.id, account);
    }

    pub async fn put_listing(&self, listing: Listing) {
        self.tables
            .write()
            .await
            .listings
            .insert(listing.id, listing);
    }

    /// Returns `false` if the listing does not exist.
    pub async fn set_payment_state(&self, listing: ListingId, state: ListingPaymentState) -> bool {
        match self.tables.write().await.listings.get_mut(&listing) {
            Some(row) => {
                row.payment_state = state;
                true
            }
            None => false,
        }
    }

    pub async fn put_earning(&self, earning: CommissionEarning) {
        self.tables
            .write()
            .await
            .earnings
            .insert(earning.id, earning);
    }

    pub async fn put_withdrawal(&self, withdrawal: WithdrawalRequest) {
        self.tables
            .write()
            .await
            .withdrawals
            .insert(withdrawal.id, withdrawal);
    }

    pub async fn listing(&self, id: ListingId) -> Option<Listing> {
        self.tables.read().await.listings.get(&id).cloned()
    }

    pub async fn withdrawal_count(&self) -> usize {
        self.tables.read().await.withdrawals.len()
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn ensure_withdrawals_readable(&self) -> Result<(), StoreError> {
        self.ensure_online()?;
        if self.withdrawals_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("withdrawals table is unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    type ReferrerLock = OwnedMutexGuard<()>;

    async fn accounts_by_ids(
        &self,
        ids: &[UserId],
    ) -> Result<HashMap<UserId, ReferrerAccount>, StoreError> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.accounts.get(id))
            .map(|account| (account.id, account.clone()))
            .collect())
    }

    async fn account_by_referral_code(
        &self,
        code: &str,
    ) -> Result<Option<ReferrerAccount>, StoreError> {
        self.ensure_online()?;
        let code = code.trim();
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .values()
            .find(|account| {
                account
                    .referral_code
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(code))
            })
            .cloned())
    }

    async fn payment_states(
        &self,
        users: &[UserId],
    ) -> Result<HashMap<UserId, ListingPaymentState>, StoreError> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        let mut states = HashMap::with_capacity(users.len());
        for user in users {
            let paid = tables
                .listings
                .values()
                .any(|l| l.owner == *user && l.payment_state == ListingPaymentState::Paid);
            let state = if paid {
                ListingPaymentState::Paid
            } else {
                ListingPaymentState::Unpaid
            };
            states.insert(*user, state);
        }
        Ok(states)
    }

    async fn listing_by_slug(&self, slug: &str) -> Result<Option<Listing>, StoreError> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables
            .listings
            .values()
            .find(|l| l.slug.as_deref() == Some(slug))
            .cloned())
    }

    async fn listing_by_username(&self, username: &str) -> Result<Option<Listing>, StoreError> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables
            .listings
            .values()
            .find(|l| {
                l.username
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case(username))
            })
            .cloned())
    }

    async fn set_listing_slug(&self, listing: ListingId, slug: &str) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let taken = tables
            .listings
            .values()
            .any(|l| l.id != listing && l.slug.as_deref() == Some(slug));
        if taken {
            return Err(StoreError::UniqueViolation {
                column: "slug",
                value: slug.to_string(),
            });
        }
        let row = tables
            .listings
            .get_mut(&listing)
            .ok_or(StoreError::MissingRow {
                entity: "listing",
                id: listing,
            })?;
        row.slug = Some(slug.to_string());
        Ok(())
    }

    async fn set_listing_username(
        &self,
        listing: ListingId,
        username: &str,
    ) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let taken = tables.listings.values().any(|l| {
            l.id != listing
                && l.username
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case(username))
        });
        if taken {
            return Err(StoreError::UniqueViolation {
                column: "username",
                value: username.to_string(),
            });
        }
        let row = tables
            .listings
            .get_mut(&listing)
            .ok_or(StoreError::MissingRow {
                entity: "listing",
                id: listing,
            })?;
        row.username = Some(username.to_string());
        Ok(())
    }

    async fn signups(&self, referrer: Option<UserId>) -> Result<Vec<ReferralSignup>, StoreError> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables
            .signups
            .values()
            .filter(|s| referrer.is_none_or(|r| s.referrer == r))
            .cloned()
            .collect())
    }

    async fn signup_for(&self, referred: UserId) -> Result<Option<ReferralSignup>, StoreError> {
        self.ensure_online()?;
        Ok(self.tables.read().await.signups.get(&referred).cloned())
    }

    async fn insert_signup(&self, signup: ReferralSignup) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        if tables.signups.contains_key(&signup.referred) {
            return Err(StoreError::UniqueViolation {
                column: "referred_user",
                value: signup.referred.to_string(),
            });
        }
        tables.signups.insert(signup.referred, signup);
        Ok(())
    }

    async fn earnings(
        &self,
        referrer: Option<UserId>,
    ) -> Result<Vec<CommissionEarning>, StoreError> {
        self.ensure_online()?;
        let tables = self.tables.read().await;
        Ok(tables
            .earnings
            .values()
            .filter(|e| referrer.is_none_or(|r| e.referrer == r))
            .cloned()
            .collect())
    }

    async fn earning(&self, id: EarningId) -> Result<Option<CommissionEarning>, StoreError> {
        self.ensure_online()?;
        Ok(self.tables.read().await.earnings.get(&id).cloned())
    }

    async fn insert_earning(&self, earning: NewEarning) -> Result<CommissionEarning, StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        if tables
            .earnings
            .values()
            .any(|e| e.order_ref == earning.order_ref)
        {
            return Err(StoreError::UniqueViolation {
                column: "order_ref",
                value: earning.order_ref,
            });
        }
        let row = CommissionEarning {
            id: tables.next_earning_id(),
            referrer: earning.referrer,
            referred: earning.referred,
            order_ref: earning.order_ref,
            amount: earning.amount,
            status: EarningStatus::Credited,
            created_at: earning.created_at,
        };
        tables.earnings.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_earning_status(
        &self,
        id: EarningId,
        expected: EarningStatus,
        status: EarningStatus,
    ) -> Result<CommissionEarning, StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let row = tables
            .earnings
            .get_mut(&id)
            .ok_or(StoreError::MissingRow {
                entity: "earning",
                id,
            })?;
        if row.status != expected {
            return Err(StoreError::StaleWrite {
                entity: "earning",
                id,
            });
        }
        row.status = status;
        Ok(row.clone())
    }

    async fn withdrawals(
        &self,
        referrer: Option<UserId>,
        status: Option<WithdrawalStatus>,
    ) -> Result<Vec<WithdrawalRequest>, StoreError> {
        self.ensure_withdrawals_readable()?;
        let tables = self.tables.read().await;
        Ok(tables
            .withdrawals
            .values()
            .filter(|w| referrer.is_none_or(|r| w.referrer == r))
            .filter(|w| status.is_none_or(|s| w.status == s))
            .cloned()
            .collect())
    }

    async fn withdrawal(&self, id: WithdrawalId) -> Result<Option<WithdrawalRequest>, StoreError> {
        self.ensure_withdrawals_readable()?;
        Ok(self.tables.read().await.withdrawals.get(&id).cloned())
    }

    async fn insert_withdrawal(
        &self,
        withdrawal: NewWithdrawal,
    ) -> Result<WithdrawalRequest, StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        if tables
            .withdrawals
            .values()
            .any(|w| w.request_number == withdrawal.request_number)
        {
            return Err(StoreError::UniqueViolation {
                column: "request_number",
                value: withdrawal.request_number,
            });
        }
        let row = WithdrawalRequest {
            id: tables.next_withdrawal_id(),
            request_number: withdrawal.request_number,
            referrer: withdrawal.referrer,
            amount: withdrawal.amount,
            payout: withdrawal.payout,
            notes: withdrawal.notes,
            status: WithdrawalStatus::Requested,
            admin_note: None,
            created_at: withdrawal.created_at,
            processed_at: None,
        };
        tables.withdrawals.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_withdrawal(
        &self,
        expected: WithdrawalStatus,
        updated: &WithdrawalRequest,
    ) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let row = tables
            .withdrawals
            .get_mut(&updated.id)
            .ok_or(StoreError::MissingRow {
                entity: "withdrawal",
                id: updated.id,
            })?;
        if row.status != expected {
            return Err(StoreError::StaleWrite {
                entity: "withdrawal",
                id: updated.id,
            });
        }
        *row = updated.clone();
        Ok(())
    }

    async fn set_withdrawal_note(
        &self,
        id: WithdrawalId,
        note: Option<String>,
    ) -> Result<WithdrawalRequest, StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.write().await;
        let row = tables
            .withdrawals
            .get_mut(&id)
            .ok_or(StoreError::MissingRow {
                entity: "withdrawal",
                id,
            })?;
        row.admin_note = note;
        Ok(row.clone())
    }

    async fn lock_referrer(&self, referrer: UserId) -> Result<Self::ReferrerLock, StoreError> {
        self.ensure_online()?;
        let lock = {
            let mut locks = self.referrer_locks.lock().await;
            // only the map holds an idle lock; drop those
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(referrer).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }
}
