//! Read-only aggregation over signup and commission rows.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::Amount;
use crate::model::{
    CommissionEarning, ListingPaymentState, ReferralSignup, ReferrerAccount, UserId,
};
use crate::store::{Store, StoreError};
use crate::wallet::{WalletBalance, compute_balance};

/// Per-referrer counts and credited total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReferralSummary {
    pub total_signups: usize,
    pub paid_signups: usize,
    pub unpaid_signups: usize,
    /// Sum of `credited` earnings only.
    pub total_earned: Amount,
}

/// One row of the referrer leaderboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrerStanding {
    pub referrer: UserId,
    pub name: String,
    pub referral_code: Option<String>,
    pub summary: ReferralSummary,
}

/// Summarize one referrer's rows.
///
/// A signup counts as paid when the referred user's live payment state is
/// `Paid`; users missing from `payment_states` count as unpaid.
pub fn summarize_rows<'a>(
    referrer: UserId,
    signups: impl IntoIterator<Item = &'a ReferralSignup>,
    earnings: impl IntoIterator<Item = &'a CommissionEarning>,
    payment_states: &HashMap<UserId, ListingPaymentState>,
) -> ReferralSummary {
    let mut summary = ReferralSummary::default();

    for signup in signups.into_iter().filter(|s| s.referrer == referrer) {
        summary.total_signups += 1;
        match payment_states.get(&signup.referred) {
            Some(ListingPaymentState::Paid) => summary.paid_signups += 1,
            _ => summary.unpaid_signups += 1,
        }
    }

    summary.total_earned = earnings
        .into_iter()
        .filter(|e| e.referrer == referrer && e.is_credited())
        .map(|e| e.amount)
        .sum();

    summary
}

/// Rank every referrer appearing in `signups` or `earnings`.
///
/// Ordered by earned desc, signups desc, name asc, then id, so identical
/// input always yields the identical order.
pub fn rank_referrers(
    signups: &[ReferralSignup],
    earnings: &[CommissionEarning],
    accounts: &HashMap<UserId, ReferrerAccount>,
    payment_states: &HashMap<UserId, ListingPaymentState>,
) -> Vec<ReferrerStanding> {
    let mut summaries: HashMap<UserId, ReferralSummary> = HashMap::new();

    for signup in signups {
        let summary = summaries.entry(signup.referrer).or_default();
        summary.total_signups += 1;
        match payment_states.get(&signup.referred) {
            Some(ListingPaymentState::Paid) => summary.paid_signups += 1,
            _ => summary.unpaid_signups += 1,
        }
    }
    for earning in earnings {
        let summary = summaries.entry(earning.referrer).or_default();
        if earning.is_credited() {
            summary.total_earned += earning.amount;
        }
    }

    let mut standings: Vec<ReferrerStanding> = summaries
        .into_iter()
        .map(|(referrer, summary)| {
            let account = accounts.get(&referrer);
            ReferrerStanding {
                referrer,
                name: account.map(|a| a.name.clone()).unwrap_or_default(),
                referral_code: account.and_then(|a| a.referral_code.clone()),
                summary,
            }
        })
        .collect();

    standings.sort_by(compare_standings);
    standings
}

fn compare_standings(a: &ReferrerStanding, b: &ReferrerStanding) -> Ordering {
    b.summary
        .total_earned
        .cmp(&a.summary.total_earned)
        .then_with(|| b.summary.total_signups.cmp(&a.summary.total_signups))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.referrer.cmp(&b.referrer))
}

/// Store-backed view over [`summarize_rows`] and the wallet balance.
pub struct CommissionLedger<S> {
    store: Arc<S>,
}

impl<S: Store> CommissionLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn summarize(&self, referrer: UserId) -> Result<ReferralSummary, StoreError> {
        let signups = self.store.signups(Some(referrer)).await?;
        let earnings = self.store.earnings(Some(referrer)).await?;

        let referred: Vec<UserId> = signups.iter().map(|s| s.referred).collect();
        let payment_states = self.store.payment_states(&referred).await?;

        Ok(summarize_rows(
            referrer,
            &signups,
            &earnings,
            &payment_states,
        ))
    }

    /// Unchecked balance; callers gating money movement must call
    /// [`WalletBalance::checked`].
    pub async fn wallet(&self, referrer: UserId) -> Result<WalletBalance, StoreError> {
        let credited: Amount = self
            .store
            .earnings(Some(referrer))
            .await?
            .iter()
            .filter(|e| e.is_credited())
            .map(|e| e.amount)
            .sum();
        let withdrawals = self.store.withdrawals(Some(referrer), None).await?;

        Ok(compute_balance(credited, &withdrawals))
    }
}
