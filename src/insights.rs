//! Admin-facing referral dashboard.
//!
//! Joins signups, earnings and withdrawals with the referenced identities.
//! Identities and payment states are each resolved with one batched store
//! call. Nothing here writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::Amount;
use crate::config::LedgerConfig;
use crate::ledger::{ReferrerStanding, rank_referrers};
use crate::model::{
    CommissionEarning, ListingPaymentState, ReferralSignup, ReferrerAccount, UserId,
    WithdrawalRequest, WithdrawalStatus,
};
use crate::store::{Store, StoreError};
use crate::wallet::compute_balance;

#[derive(Debug, Error)]
pub enum InsightsError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsightsFilter {
    /// Case-insensitive substring over request number, referrer identity and status.
    pub search: Option<String>,
    pub withdrawal_status: Option<WithdrawalStatus>,
}

/// Totals across every referrer, unaffected by the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsightsSummary {
    pub total_referrers: usize,
    pub total_signups: usize,
    pub paid_signups: usize,
    pub unpaid_signups: usize,
    pub total_earned: Amount,
    pub total_reversed: Amount,
    pub total_withdrawn: Amount,
    pub total_locked: Amount,
    pub available_balance: Amount,
    pub open_requests: usize,
    pub withdrawal_counts: HashMap<WithdrawalStatus, usize>,
    /// Referrers whose own balance went negative.
    pub inconsistent_wallets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalRow {
    pub request: WithdrawalRequest,
    pub referrer: Option<ReferrerAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignupFeedEntry {
    pub signup: ReferralSignup,
    pub referrer_name: Option<String>,
    pub referred_name: Option<String>,
    pub payment_state: ListingPaymentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarningFeedEntry {
    pub earning: CommissionEarning,
    pub referrer_name: Option<String>,
    pub referred_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralInsights {
    pub summary: InsightsSummary,
    /// Most recent first.
    pub withdrawals: Vec<WithdrawalRow>,
    pub top_referrers: Vec<ReferrerStanding>,
    pub recent_signups: Vec<SignupFeedEntry>,
    pub recent_earnings: Vec<EarningFeedEntry>,
}

pub struct AdminReferralInsights<S> {
    store: Arc<S>,
    config: LedgerConfig,
}

impl<S: Store> AdminReferralInsights<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub async fn build_insights(
        &self,
        filter: &InsightsFilter,
    ) -> Result<ReferralInsights, InsightsError> {
        let withdrawals = self.store.withdrawals(None, None).await?;
        let earnings = self.store.earnings(None).await?;
        let signups = self.store.signups(None).await?;

        let user_ids: Vec<UserId> = withdrawals
            .iter()
            .map(|w| w.referrer)
            .chain(signups.iter().flat_map(|s| [s.referrer, s.referred]))
            .chain(earnings.iter().flat_map(|e| [e.referrer, e.referred]))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let accounts = self.store.accounts_by_ids(&user_ids).await?;

        let referred: Vec<UserId> = signups.iter().map(|s| s.referred).collect();
        let payment_states = self.store.payment_states(&referred).await?;

        let summary = summarize(&signups, &earnings, &withdrawals, &payment_states);
        if summary.inconsistent_wallets > 0 {
            warn!(
                count = summary.inconsistent_wallets,
                "referrers with a negative wallet balance"
            );
        }

        let mut top_referrers = rank_referrers(&signups, &earnings, &accounts, &payment_states);
        top_referrers.truncate(self.config.feed_page_size);

        let search = filter
            .search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let mut rows: Vec<WithdrawalRow> = withdrawals
            .into_iter()
            .filter(|w| filter.withdrawal_status.is_none_or(|s| w.status == s))
            .map(|request| WithdrawalRow {
                referrer: accounts.get(&request.referrer).cloned(),
                request,
            })
            .filter(|row| search.as_deref().is_none_or(|needle| row_matches(row, needle)))
            .collect();
        rows.sort_by(|a, b| {
            b.request
                .created_at
                .cmp(&a.request.created_at)
                .then_with(|| b.request.id.cmp(&a.request.id))
        });

        let name_of = |id: UserId| accounts.get(&id).map(|a| a.name.clone());

        let mut recent_signups: Vec<&ReferralSignup> = signups.iter().collect();
        recent_signups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.referred.cmp(&a.referred))
        });
        let recent_signups = recent_signups
            .into_iter()
            .take(self.config.feed_page_size)
            .map(|signup| SignupFeedEntry {
                referrer_name: name_of(signup.referrer),
                referred_name: name_of(signup.referred),
                payment_state: payment_states
                    .get(&signup.referred)
                    .copied()
                    .unwrap_or_default(),
                signup: signup.clone(),
            })
            .collect();

        let mut recent_earnings: Vec<&CommissionEarning> = earnings.iter().collect();
        recent_earnings.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        let recent_earnings = recent_earnings
            .into_iter()
            .take(self.config.feed_page_size)
            .map(|earning| EarningFeedEntry {
                referrer_name: name_of(earning.referrer),
                referred_name: name_of(earning.referred),
                earning: earning.clone(),
            })
            .collect();

        debug!(
            withdrawals = rows.len(),
            search = search.as_deref().unwrap_or(""),
            "insights built"
        );

        Ok(ReferralInsights {
            summary,
            withdrawals: rows,
            top_referrers,
            recent_signups,
            recent_earnings,
        })
    }
}

fn summarize(
    signups: &[ReferralSignup],
    earnings: &[CommissionEarning],
    withdrawals: &[WithdrawalRequest],
    payment_states: &HashMap<UserId, ListingPaymentState>,
) -> InsightsSummary {
    let mut summary = InsightsSummary {
        withdrawal_counts: WithdrawalStatus::ALL.into_iter().map(|s| (s, 0)).collect(),
        ..InsightsSummary::default()
    };

    let mut referrers = BTreeSet::new();
    let mut credited: HashMap<UserId, Amount> = HashMap::new();
    let mut history: HashMap<UserId, Vec<&WithdrawalRequest>> = HashMap::new();

    for signup in signups {
        referrers.insert(signup.referrer);
        summary.total_signups += 1;
        match payment_states.get(&signup.referred) {
            Some(ListingPaymentState::Paid) => summary.paid_signups += 1,
            _ => summary.unpaid_signups += 1,
        }
    }

    for earning in earnings {
        referrers.insert(earning.referrer);
        let total = credited.entry(earning.referrer).or_default();
        if earning.is_credited() {
            summary.total_earned += earning.amount;
            *total += earning.amount;
        } else {
            summary.total_reversed += earning.amount;
        }
    }

    for withdrawal in withdrawals {
        *summary.withdrawal_counts.entry(withdrawal.status).or_default() += 1;
        history.entry(withdrawal.referrer).or_default().push(withdrawal);
    }

    let overall = compute_balance(summary.total_earned, withdrawals);
    summary.total_withdrawn = overall.total_withdrawn;
    summary.total_locked = overall.locked_amount;
    summary.available_balance = overall.available_balance;
    summary.open_requests = withdrawals.iter().filter(|w| w.status.is_locking()).count();

    let wallet_owners: BTreeSet<UserId> = credited.keys().chain(history.keys()).copied().collect();
    summary.inconsistent_wallets = wallet_owners
        .into_iter()
        .filter(|referrer| {
            let total = credited.get(referrer).copied().unwrap_or_default();
            let requests = history.get(referrer).map(Vec::as_slice).unwrap_or_default();
            !compute_balance(total, requests.iter().copied()).is_consistent()
        })
        .count();

    summary.total_referrers = referrers.len();
    summary
}

fn row_matches(row: &WithdrawalRow, needle: &str) -> bool {
    let contains = |field: &str| field.to_lowercase().contains(needle);

    if contains(&row.request.request_number) || contains(row.request.status.as_str()) {
        return true;
    }
    row.referrer.as_ref().is_some_and(|account| {
        contains(&account.name)
            || [&account.email, &account.phone, &account.referral_code]
                .into_iter()
                .flatten()
                .any(|field| contains(field))
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::model::{EarningStatus, Listing, PayoutDetails};
    use crate::store::MemoryStore;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).unwrap()
    }

    fn account(id: UserId, name: &str, code: &str, email: &str) -> ReferrerAccount {
        ReferrerAccount {
            id,
            referral_code: Some(code.into()),
            name: name.into(),
            email: Some(email.into()),
            phone: Some(format!("98765{id:05}")),
        }
    }

    fn withdrawal(
        id: u64,
        referrer: UserId,
        units: i64,
        status: WithdrawalStatus,
        day: u32,
    ) -> WithdrawalRequest {
        WithdrawalRequest {
            id,
            request_number: format!("WD-202405{day:02}-{id:08X}"),
            referrer,
            amount: Amount::from_units(units),
            payout: PayoutDetails::Manual { instructions: None },
            notes: None,
            status,
            admin_note: None,
            created_at: at(day),
            processed_at: None,
        }
    }

    fn earning(id: u64, referrer: UserId, referred: UserId, units: i64, day: u32) -> CommissionEarning {
        CommissionEarning {
            id,
            referrer,
            referred,
            order_ref: format!("order_{id}"),
            amount: Amount::from_units(units),
            status: EarningStatus::Credited,
            created_at: at(day),
        }
    }

    async fn fixture() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put_account(account(1, "Asha Rao", "ASHA10", "asha@example.com")).await;
        store.put_account(account(2, "Bala Iyer", "BALA20", "bala@example.com")).await;
        store.put_account(account(10, "Ravi", "RAVI", "ravi@example.com")).await;

        for (referred, referrer, day) in [(10, 1, 1), (11, 1, 2), (12, 2, 3)] {
            store
                .insert_signup(ReferralSignup {
                    referred,
                    referrer,
                    created_at: at(day),
                })
                .await
                .unwrap();
        }
        store
            .put_listing(Listing {
                id: 100,
                owner: 10,
                slug: Some("ravi-prints".into()),
                username: None,
                payment_state: ListingPaymentState::Paid,
            })
            .await;

        store.put_earning(earning(1, 1, 10, 1000, 4)).await;
        store.put_earning(earning(2, 2, 12, 300, 5)).await;

        store.put_withdrawal(withdrawal(1, 1, 200, WithdrawalStatus::Paid, 6)).await;
        store.put_withdrawal(withdrawal(2, 1, 100, WithdrawalStatus::Requested, 7)).await;
        store.put_withdrawal(withdrawal(3, 1, 50, WithdrawalStatus::Processing, 8)).await;
        store.put_withdrawal(withdrawal(4, 2, 150, WithdrawalStatus::Rejected, 9)).await;
        store
    }

    fn insights(store: &Arc<MemoryStore>) -> AdminReferralInsights<MemoryStore> {
        AdminReferralInsights::new(store.clone(), LedgerConfig::default())
    }

    #[tokio::test]
    async fn summary_totals() {
        let store = fixture().await;
        let result = insights(&store)
            .build_insights(&InsightsFilter::default())
            .await
            .unwrap();
        let summary = result.summary;

        assert_eq!(summary.total_referrers, 2);
        assert_eq!(summary.total_signups, 3);
        assert_eq!(summary.paid_signups, 1);
        assert_eq!(summary.unpaid_signups, 2);
        assert_eq!(summary.total_earned, Amount::from_units(1300));
        assert_eq!(summary.total_withdrawn, Amount::from_units(200));
        assert_eq!(summary.total_locked, Amount::from_units(150));
        assert_eq!(summary.available_balance, Amount::from_units(950));
        assert_eq!(summary.open_requests, 2);
        assert_eq!(summary.withdrawal_counts[&WithdrawalStatus::Rejected], 1);
        assert_eq!(summary.withdrawal_counts[&WithdrawalStatus::Cancelled], 0);
        assert_eq!(summary.inconsistent_wallets, 0);
    }

    #[tokio::test]
    async fn withdrawals_are_joined_and_most_recent_first() {
        let store = fixture().await;
        let result = insights(&store)
            .build_insights(&InsightsFilter::default())
            .await
            .unwrap();

        let ids: Vec<u64> = result.withdrawals.iter().map(|r| r.request.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
        assert_eq!(
            result.withdrawals[0].referrer.as_ref().map(|a| a.name.as_str()),
            Some("Bala Iyer")
        );
    }

    #[tokio::test]
    async fn status_filter_narrows_the_list_but_not_the_summary() {
        let store = fixture().await;
        let filter = InsightsFilter {
            withdrawal_status: Some(WithdrawalStatus::Requested),
            ..InsightsFilter::default()
        };
        let result = insights(&store).build_insights(&filter).await.unwrap();

        assert_eq!(result.withdrawals.len(), 1);
        assert_eq!(result.withdrawals[0].request.id, 2);
        assert_eq!(result.summary.total_withdrawn, Amount::from_units(200));
    }

    #[tokio::test]
    async fn search_matches_identity_fields_case_insensitively() {
        let store = fixture().await;
        let insights = insights(&store);
        let search = |term: &str| InsightsFilter {
            search: Some(term.into()),
            withdrawal_status: None,
        };

        let by_name = insights.build_insights(&search("asha rao")).await.unwrap();
        assert_eq!(by_name.withdrawals.len(), 3);

        let by_code = insights.build_insights(&search("bala20")).await.unwrap();
        assert_eq!(by_code.withdrawals.len(), 1);

        let by_email = insights.build_insights(&search("@EXAMPLE.com")).await.unwrap();
        assert_eq!(by_email.withdrawals.len(), 4);

        let by_status = insights.build_insights(&search("PROCESSING")).await.unwrap();
        assert_eq!(by_status.withdrawals.len(), 1);

        let by_number = insights.build_insights(&search("wd-20240509")).await.unwrap();
        assert_eq!(by_number.withdrawals.len(), 1);

        let nothing = insights.build_insights(&search("zzz")).await.unwrap();
        assert!(nothing.withdrawals.is_empty());

        let blank = insights.build_insights(&search("   ")).await.unwrap();
        assert_eq!(blank.withdrawals.len(), 4);
    }

    #[tokio::test]
    async fn feeds_are_recent_first_and_capped() {
        let store = fixture().await;
        let config = LedgerConfig {
            feed_page_size: 2,
            ..LedgerConfig::default()
        };
        let result = AdminReferralInsights::new(store.clone(), config)
            .build_insights(&InsightsFilter::default())
            .await
            .unwrap();

        let referred: Vec<UserId> = result
            .recent_signups
            .iter()
            .map(|e| e.signup.referred)
            .collect();
        assert_eq!(referred, vec![12, 11]);
        assert_eq!(result.recent_signups[0].referrer_name.as_deref(), Some("Bala Iyer"));

        let earning_ids: Vec<u64> = result.recent_earnings.iter().map(|e| e.earning.id).collect();
        assert_eq!(earning_ids, vec![2, 1]);
        assert_eq!(result.recent_earnings[1].referred_name.as_deref(), Some("Ravi"));

        assert_eq!(result.top_referrers.len(), 2);
        assert_eq!(result.top_referrers[0].referrer, 1);
    }

    #[tokio::test]
    async fn negative_wallets_are_counted() {
        let store = fixture().await;
        store.put_withdrawal(withdrawal(5, 2, 500, WithdrawalStatus::Paid, 10)).await;

        let result = insights(&store)
            .build_insights(&InsightsFilter::default())
            .await
            .unwrap();
        assert_eq!(result.summary.inconsistent_wallets, 1);
    }
}
