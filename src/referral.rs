//! Referral attribution and commission crediting.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::LedgerConfig;
use crate::error::ValidationError;
use crate::ledger::CommissionLedger;
use crate::model::{
    Actor, CommissionEarning, EarningId, EarningStatus, ListingPaymentState, ReferralSignup,
    UserId,
};
use crate::store::{NewEarning, Store, StoreError};

#[derive(Debug, Error)]
pub enum AttributionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown referral code '{0}'")]
    UnknownReferralCode(String),

    #[error("user {0} is already attributed to a referrer")]
    AlreadyAttributed(UserId),

    #[error("user {0} was not referred")]
    NotAttributed(UserId),

    #[error("user {0} has no paid listing")]
    NotConverted(UserId),

    #[error("order '{0}' was already credited")]
    DuplicateOrder(String),

    #[error("earning {0} not found")]
    NotFound(EarningId),

    #[error("earning {0} is already reversed")]
    AlreadyReversed(EarningId),

    #[error("{0:?} may not reverse earnings")]
    Forbidden(Actor),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ReferralAttribution<S> {
    store: Arc<S>,
    ledger: CommissionLedger<S>,
    config: LedgerConfig,
}

impl<S: Store> ReferralAttribution<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self {
            ledger: CommissionLedger::new(store.clone()),
            store,
            config,
        }
    }

    /// Attribute `referred` to the owner of `referral_code`. Attribution is permanent.
    pub async fn record_signup(
        &self,
        referred: UserId,
        referral_code: &str,
    ) -> Result<ReferralSignup, AttributionError> {
        let code = referral_code.trim();
        if code.is_empty() {
            return Err(ValidationError::MissingField("referral_code").into());
        }

        let referrer = self
            .store
            .account_by_referral_code(code)
            .await?
            .ok_or_else(|| AttributionError::UnknownReferralCode(code.to_string()))?;
        if referrer.id == referred {
            return Err(ValidationError::SelfReferral(referred).into());
        }

        let signup = ReferralSignup {
            referred,
            referrer: referrer.id,
            created_at: Utc::now(),
        };
        match self.store.insert_signup(signup.clone()).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation { .. }) => {
                return Err(AttributionError::AlreadyAttributed(referred));
            }
            Err(e) => return Err(e.into()),
        }

        info!(referred = %referred, referrer = %referrer.id, code, "signup attributed");
        Ok(signup)
    }

    /// Credit the configured commission to `referred`'s referrer for a paid order.
    ///
    /// At most one earning exists per `order_ref`.
    pub async fn credit_conversion(
        &self,
        referred: UserId,
        order_ref: &str,
    ) -> Result<CommissionEarning, AttributionError> {
        let order_ref = order_ref.trim();
        if order_ref.is_empty() {
            return Err(ValidationError::MissingField("order_ref").into());
        }

        let signup = self
            .store
            .signup_for(referred)
            .await?
            .ok_or(AttributionError::NotAttributed(referred))?;

        let states = self.store.payment_states(&[referred]).await?;
        if states.get(&referred) != Some(&ListingPaymentState::Paid) {
            return Err(AttributionError::NotConverted(referred));
        }

        let new = NewEarning {
            referrer: signup.referrer,
            referred,
            order_ref: order_ref.to_string(),
            amount: self.config.commission_amount,
            created_at: Utc::now(),
        };
        let earning = match self.store.insert_earning(new).await {
            Ok(earning) => earning,
            Err(StoreError::UniqueViolation { .. }) => {
                return Err(AttributionError::DuplicateOrder(order_ref.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            referrer = %earning.referrer,
            referred = %referred,
            order = %earning.order_ref,
            amount = %earning.amount,
            "commission credited"
        );
        Ok(earning)
    }

    /// Reverse a credited earning. Admin only.
    ///
    /// The reversal is applied even if the referrer already withdrew the
    /// amount; the resulting negative balance is logged and then blocks new
    /// withdrawals until reconciled.
    pub async fn reverse_earning(
        &self,
        actor: Actor,
        id: EarningId,
    ) -> Result<CommissionEarning, AttributionError> {
        if !actor.is_admin() {
            return Err(AttributionError::Forbidden(actor));
        }

        let earning = self
            .store
            .earning(id)
            .await?
            .ok_or(AttributionError::NotFound(id))?;
        if earning.status == EarningStatus::Reversed {
            return Err(AttributionError::AlreadyReversed(id));
        }

        let reversed = match self
            .store
            .update_earning_status(id, EarningStatus::Credited, EarningStatus::Reversed)
            .await
        {
            Ok(earning) => earning,
            Err(StoreError::StaleWrite { .. }) => return Err(AttributionError::AlreadyReversed(id)),
            Err(StoreError::MissingRow { .. }) => return Err(AttributionError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        warn!(
            referrer = %reversed.referrer,
            order = %reversed.order_ref,
            amount = %reversed.amount,
            "commission reversed"
        );

        // the reversal is committed; the wallet check only logs
        match self.ledger.wallet(reversed.referrer).await {
            Ok(wallet) => {
                let _ = wallet.checked(reversed.referrer);
            }
            Err(e) => warn!(
                referrer = %reversed.referrer,
                reason = %e,
                "wallet check after reversal skipped"
            ),
        }

        Ok(reversed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::model::{Listing, ReferrerAccount};
    use crate::store::MemoryStore;

    const ADMIN: Actor = Actor::Admin(99);

    async fn fixture() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .put_account(ReferrerAccount {
                id: 1,
                referral_code: Some("ABC123".into()),
                name: "Asha".into(),
                email: Some("asha@example.com".into()),
                phone: None,
            })
            .await;
        store
            .put_listing(Listing {
                id: 7,
                owner: 2,
                slug: None,
                username: None,
                payment_state: ListingPaymentState::Unpaid,
            })
            .await;
        store
    }

    fn attribution(store: &Arc<MemoryStore>) -> ReferralAttribution<MemoryStore> {
        ReferralAttribution::new(store.clone(), LedgerConfig::default())
    }

    #[tokio::test]
    async fn signup_is_attributed_case_insensitively() {
        let store = fixture().await;
        let signup = attribution(&store).record_signup(2, " abc123 ").await.unwrap();
        assert_eq!(signup.referrer, 1);
        assert_eq!(store.signup_for(2).await.unwrap(), Some(signup));
    }

    #[tokio::test]
    async fn signup_cannot_be_reattributed() {
        let store = fixture().await;
        let attribution = attribution(&store);
        attribution.record_signup(2, "ABC123").await.unwrap();

        let err = attribution.record_signup(2, "ABC123").await.unwrap_err();
        assert!(matches!(err, AttributionError::AlreadyAttributed(2)));
    }

    #[tokio::test]
    async fn signup_rejects_unknown_and_self_referral() {
        let store = fixture().await;
        let attribution = attribution(&store);

        assert!(matches!(
            attribution.record_signup(2, "NOPE").await,
            Err(AttributionError::UnknownReferralCode(_))
        ));
        assert!(matches!(
            attribution.record_signup(1, "ABC123").await,
            Err(AttributionError::Validation(ValidationError::SelfReferral(1)))
        ));
    }

    #[tokio::test]
    async fn credit_requires_a_paid_listing() {
        let store = fixture().await;
        let attribution = attribution(&store);
        attribution.record_signup(2, "ABC123").await.unwrap();

        assert!(matches!(
            attribution.credit_conversion(2, "order_1").await,
            Err(AttributionError::NotConverted(2))
        ));

        store.set_payment_state(7, ListingPaymentState::Paid).await;
        let earning = attribution.credit_conversion(2, "order_1").await.unwrap();
        assert_eq!(earning.referrer, 1);
        assert_eq!(earning.amount, Amount::from_units(500));
        assert_eq!(earning.status, EarningStatus::Credited);
    }

    #[tokio::test]
    async fn credit_is_idempotent_per_order() {
        let store = fixture().await;
        let attribution = attribution(&store);
        attribution.record_signup(2, "ABC123").await.unwrap();
        store.set_payment_state(7, ListingPaymentState::Paid).await;

        attribution.credit_conversion(2, "order_1").await.unwrap();
        assert!(matches!(
            attribution.credit_conversion(2, "order_1").await,
            Err(AttributionError::DuplicateOrder(_))
        ));
        assert_eq!(store.earnings(Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn credit_requires_attribution() {
        let store = fixture().await;
        assert!(matches!(
            attribution(&store).credit_conversion(3, "order_9").await,
            Err(AttributionError::NotAttributed(3))
        ));
    }

    #[tokio::test]
    async fn reversal_is_admin_only_and_happens_once() {
        let store = fixture().await;
        let attribution = attribution(&store);
        attribution.record_signup(2, "ABC123").await.unwrap();
        store.set_payment_state(7, ListingPaymentState::Paid).await;
        let earning = attribution.credit_conversion(2, "order_1").await.unwrap();

        assert!(matches!(
            attribution
                .reverse_earning(Actor::Referrer(1), earning.id)
                .await,
            Err(AttributionError::Forbidden(_))
        ));

        let reversed = attribution.reverse_earning(ADMIN, earning.id).await.unwrap();
        assert_eq!(reversed.status, EarningStatus::Reversed);

        assert!(matches!(
            attribution.reverse_earning(ADMIN, earning.id).await,
            Err(AttributionError::AlreadyReversed(_))
        ));
        assert!(matches!(
            attribution.reverse_earning(ADMIN, 404).await,
            Err(AttributionError::NotFound(404))
        ));

        let wallet = attribution.ledger.wallet(1).await.unwrap();
        assert_eq!(wallet.total_credited, Amount::ZERO);
    }

    #[tokio::test]
    async fn reversal_stands_when_the_wallet_check_cannot_read() {
        let store = fixture().await;
        let attribution = attribution(&store);
        attribution.record_signup(2, "ABC123").await.unwrap();
        store.set_payment_state(7, ListingPaymentState::Paid).await;
        let earning = attribution.credit_conversion(2, "order_1").await.unwrap();

        store.set_withdrawals_unavailable(true);
        let reversed = attribution.reverse_earning(ADMIN, earning.id).await.unwrap();
        assert_eq!(reversed.status, EarningStatus::Reversed);

        store.set_withdrawals_unavailable(false);
        let stored = store.earning(earning.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EarningStatus::Reversed);
    }
}
