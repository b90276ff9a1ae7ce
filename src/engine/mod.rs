//! Referral ledger engine.
//!
//! Wires the services over one shared store and replays [`Command`]s,
//! one at a time, from an async stream. A failed command is logged and
//! skipped; it never stops the stream.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::Amount;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::identifier::IdentifierAllocator;
use crate::insights::AdminReferralInsights;
use crate::ledger::{CommissionLedger, ReferrerStanding, rank_referrers};
use crate::model::{Actor, Command, UserId};
use crate::referral::ReferralAttribution;
use crate::store::Store;
use crate::wallet::{WalletBalance, compute_balance};
use crate::withdrawal::{WithdrawalInput, WithdrawalWorkflow};

/// One line of the referrer report: ranking plus wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrerReport {
    pub standing: ReferrerStanding,
    pub wallet: WalletBalance,
}

/// Counters returned by [`Engine::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub applied: usize,
    pub skipped: usize,
}

pub struct Engine<S> {
    store: Arc<S>,
    ledger: CommissionLedger<S>,
    attribution: ReferralAttribution<S>,
    withdrawals: WithdrawalWorkflow<S>,
    identifiers: IdentifierAllocator<S>,
    insights: AdminReferralInsights<S>,
}

/// Public API
impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self {
            ledger: CommissionLedger::new(store.clone()),
            attribution: ReferralAttribution::new(store.clone(), config.clone()),
            withdrawals: WithdrawalWorkflow::new(store.clone(), config.clone()),
            identifiers: IdentifierAllocator::new(store.clone(), config.clone()),
            insights: AdminReferralInsights::new(store.clone(), config),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn ledger(&self) -> &CommissionLedger<S> {
        &self.ledger
    }

    pub fn attribution(&self) -> &ReferralAttribution<S> {
        &self.attribution
    }

    pub fn withdrawals(&self) -> &WithdrawalWorkflow<S> {
        &self.withdrawals
    }

    pub fn identifiers(&self) -> &IdentifierAllocator<S> {
        &self.identifiers
    }

    pub fn insights(&self) -> &AdminReferralInsights<S> {
        &self.insights
    }

    /// Run the engine over the given command stream
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) -> RunStats {
        let mut stats = RunStats::default();
        while let Some(command) = stream.next().await {
            match self.apply(command).await {
                Ok(()) => stats.applied += 1,
                Err(_) => stats.skipped += 1,
            }
        }
        stats
    }

    /// Apply a single command
    pub async fn apply(&self, command: Command) -> Result<(), LedgerError> {
        let kind = command.kind();
        let result = self.dispatch(command).await;
        Self::log_result(kind, &result);
        result
    }

    /// Every referrer with a signup or earning, in ranking order, with their wallet.
    pub async fn report(&self) -> Result<Vec<ReferrerReport>, LedgerError> {
        let signups = self.store.signups(None).await?;
        let earnings = self.store.earnings(None).await?;
        let withdrawals = self.store.withdrawals(None, None).await?;

        let referrers: Vec<UserId> = signups
            .iter()
            .map(|s| s.referrer)
            .chain(earnings.iter().map(|e| e.referrer))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let accounts = self.store.accounts_by_ids(&referrers).await?;
        let referred: Vec<UserId> = signups.iter().map(|s| s.referred).collect();
        let payment_states = self.store.payment_states(&referred).await?;

        let mut credited: HashMap<UserId, Amount> = HashMap::new();
        for earning in earnings.iter().filter(|e| e.is_credited()) {
            *credited.entry(earning.referrer).or_default() += earning.amount;
        }

        Ok(rank_referrers(&signups, &earnings, &accounts, &payment_states)
            .into_iter()
            .map(|standing| {
                let history = withdrawals
                    .iter()
                    .filter(|w| w.referrer == standing.referrer);
                let total = credited.get(&standing.referrer).copied().unwrap_or_default();
                ReferrerReport {
                    wallet: compute_balance(total, history),
                    standing,
                }
            })
            .collect())
    }
}

/// Private API
impl<S: Store> Engine<S> {
    async fn dispatch(&self, command: Command) -> Result<(), LedgerError> {
        match command {
            Command::Signup { user, code } => {
                self.attribution.record_signup(user, &code).await?;
            }
            Command::Credit { user, order_ref } => {
                self.attribution.credit_conversion(user, &order_ref).await?;
            }
            Command::Withdraw {
                referrer,
                amount,
                payout,
                notes,
            } => {
                let input = WithdrawalInput {
                    amount,
                    payout,
                    notes,
                };
                self.withdrawals.create_request(referrer, input).await?;
            }
            Command::Transition {
                admin,
                request,
                status,
                note,
            } => {
                self.withdrawals
                    .transition(Actor::Admin(admin), request, status, note)
                    .await?;
            }
            Command::Annotate {
                admin,
                request,
                note,
            } => {
                self.withdrawals
                    .annotate(Actor::Admin(admin), request, note)
                    .await?;
            }
            Command::Reverse { admin, earning } => {
                self.attribution
                    .reverse_earning(Actor::Admin(admin), earning)
                    .await?;
            }
            Command::AssignSlug { listing, name } => {
                self.identifiers.assign_slug(listing, &name).await?;
            }
            Command::AssignUsername { listing, handle } => {
                self.identifiers.assign_username(listing, &handle).await?;
            }
        }
        Ok(())
    }

    /// Small helper to log `apply` results
    fn log_result(kind: &str, result: &Result<(), LedgerError>) {
        match result {
            Ok(()) => info!(command = kind, "{kind} applied"),
            Err(e) => warn!(command = kind, reason = %e, "{kind} skipped"),
        }
    }
}
