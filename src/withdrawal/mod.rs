//! Withdrawal request workflow.
//!
//! A request is created in `requested` with its amount locked out of the
//! referrer's spendable balance. Admins move it through `processing` to one
//! of the terminal states; after that only the advisory note may change.
//!
//! Creation holds the store's per-referrer lock across the balance check and
//! the insert, so concurrent requests from one referrer cannot overdraw the
//! wallet. Transitions are compare-and-set on the current status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid7::uuid7;

use crate::Amount;
use crate::config::LedgerConfig;
use crate::error::ValidationError;
use crate::ledger::CommissionLedger;
use crate::model::{Actor, PayoutDetails, UserId, WithdrawalId, WithdrawalRequest, WithdrawalStatus};
use crate::store::{NewWithdrawal, Store, StoreError};

mod error;
pub use error::{TransitionError, WithdrawalError};

/// Fresh request numbers tried before a collision is reported.
const REQUEST_NUMBER_ATTEMPTS: usize = 3;

const MAX_NOTE_LEN: usize = 500;

/// Referrer-supplied withdrawal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalInput {
    pub amount: Amount,
    pub payout: PayoutDetails,
    pub notes: Option<String>,
}

pub struct WithdrawalWorkflow<S> {
    store: Arc<S>,
    ledger: CommissionLedger<S>,
    config: LedgerConfig,
}

/// Public API
impl<S: Store> WithdrawalWorkflow<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self {
            ledger: CommissionLedger::new(store.clone()),
            store,
            config,
        }
    }

    /// Create a request for `referrer`:
    /// - Validate amount, payout details and notes
    /// - Ensure the amount reaches the minimum withdrawal
    /// - Under the referrer lock, ensure the amount fits the available balance
    /// - Insert the request in `requested` state
    pub async fn create_request(
        &self,
        referrer: UserId,
        input: WithdrawalInput,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        let WithdrawalInput {
            amount,
            payout,
            notes,
        } = input;

        if !amount.is_positive() {
            return Err(ValidationError::NonPositiveAmount(amount).into());
        }
        let payout = validate_payout(payout)?;
        let notes = clean_note("notes", notes)?;

        if amount < self.config.min_withdrawal {
            return Err(WithdrawalError::BelowMinimum {
                minimum: self.config.min_withdrawal,
                requested: amount,
            });
        }

        let _lock = self.store.lock_referrer(referrer).await?;

        let balance = self.ledger.wallet(referrer).await?.checked(referrer)?;
        if amount > balance.available_balance {
            return Err(WithdrawalError::InsufficientBalance {
                referrer,
                available: balance.available_balance,
                requested: amount,
            });
        }

        let now = Utc::now();
        let mut attempt = 0;
        let request = loop {
            attempt += 1;
            let new = NewWithdrawal {
                request_number: request_number(now),
                referrer,
                amount,
                payout: payout.clone(),
                notes: notes.clone(),
                created_at: now,
            };
            match self.store.insert_withdrawal(new).await {
                Ok(request) => break request,
                Err(StoreError::UniqueViolation { value, .. })
                    if attempt < REQUEST_NUMBER_ATTEMPTS =>
                {
                    warn!(request_number = %value, "request number collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(
            referrer = %referrer,
            request = %request.request_number,
            amount = %amount,
            method = request.payout.method(),
            "withdrawal requested"
        );

        Ok(request)
    }

    /// Move a request to `target`. Admin only.
    ///
    /// `admin_note`, when given, replaces the current note. Entering `paid`
    /// stamps `processed_at`.
    pub async fn transition(
        &self,
        actor: Actor,
        id: WithdrawalId,
        target: WithdrawalStatus,
        admin_note: Option<String>,
    ) -> Result<WithdrawalRequest, TransitionError> {
        if !actor.is_admin() {
            return Err(TransitionError::Forbidden(actor));
        }

        let current = self
            .store
            .withdrawal(id)
            .await?
            .ok_or(TransitionError::NotFound(id))?;

        if !current.status.can_transition_to(target) {
            return Err(TransitionError::IllegalTransition {
                id,
                from: current.status,
                to: target,
            });
        }

        let mut updated = current.clone();
        updated.status = target;
        if target == WithdrawalStatus::Paid {
            updated.processed_at = Some(Utc::now());
        }
        if let Some(note) = admin_note {
            updated.admin_note = normalize_note(note);
        }

        match self.store.update_withdrawal(current.status, &updated).await {
            Ok(()) => {}
            Err(StoreError::StaleWrite { .. }) => {
                // another admin moved it first; report against what is stored now
                let latest = self
                    .store
                    .withdrawal(id)
                    .await?
                    .ok_or(TransitionError::NotFound(id))?;
                return Err(TransitionError::IllegalTransition {
                    id,
                    from: latest.status,
                    to: target,
                });
            }
            Err(StoreError::MissingRow { .. }) => return Err(TransitionError::NotFound(id)),
            Err(e) => return Err(e.into()),
        }

        info!(
            request = %updated.request_number,
            from = %current.status,
            to = %target,
            amount = %updated.amount,
            "withdrawal transitioned"
        );

        Ok(updated)
    }

    /// Overwrite the advisory note in any status. Admin only.
    pub async fn annotate(
        &self,
        actor: Actor,
        id: WithdrawalId,
        note: Option<String>,
    ) -> Result<WithdrawalRequest, TransitionError> {
        if !actor.is_admin() {
            return Err(TransitionError::Forbidden(actor));
        }

        match self
            .store
            .set_withdrawal_note(id, note.and_then(normalize_note))
            .await
        {
            Ok(request) => Ok(request),
            Err(StoreError::MissingRow { .. }) => Err(TransitionError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}

/// `WD-<date>-<8 hex digits>`, the tail taken from a fresh UUIDv7.
fn request_number(now: DateTime<Utc>) -> String {
    let id = uuid7();
    let tail: String = id.as_bytes()[12..]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();
    format!("WD-{}-{tail}", now.format("%Y%m%d"))
}

fn normalize_note(note: String) -> Option<String> {
    let note = note.trim();
    (!note.is_empty()).then(|| note.to_string())
}

fn clean_note(field: &'static str, note: Option<String>) -> Result<Option<String>, ValidationError> {
    let note = note.and_then(normalize_note);
    if note.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTE_LEN) {
        return Err(ValidationError::InvalidField {
            field,
            reason: format!("longer than {MAX_NOTE_LEN} characters"),
        });
    }
    Ok(note)
}

fn required(field: &'static str, value: String) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(value.to_string())
}

fn validate_payout(payout: PayoutDetails) -> Result<PayoutDetails, ValidationError> {
    match payout {
        PayoutDetails::Upi { upi_id } => {
            let upi_id = required("upi_id", upi_id)?;
            let well_formed = upi_id
                .split_once('@')
                .is_some_and(|(handle, provider)| {
                    !handle.is_empty() && !provider.is_empty() && !provider.contains('@')
                });
            if !well_formed || upi_id.contains(char::is_whitespace) {
                return Err(ValidationError::InvalidField {
                    field: "upi_id",
                    reason: format!("'{upi_id}' is not of the form handle@provider"),
                });
            }
            Ok(PayoutDetails::Upi { upi_id })
        }
        PayoutDetails::Bank {
            account_name,
            account_number,
            ifsc,
        } => {
            let account_name = required("account_name", account_name)?;
            let account_number = required("account_number", account_number)?;
            if !(6..=18).contains(&account_number.len())
                || !account_number.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(ValidationError::InvalidField {
                    field: "account_number",
                    reason: "expected 6 to 18 digits".to_string(),
                });
            }
            let ifsc = required("ifsc", ifsc)?.to_ascii_uppercase();
            if !is_ifsc(&ifsc) {
                return Err(ValidationError::InvalidField {
                    field: "ifsc",
                    reason: format!("'{ifsc}' is not a valid IFSC code"),
                });
            }
            Ok(PayoutDetails::Bank {
                account_name,
                account_number,
                ifsc,
            })
        }
        PayoutDetails::Manual { instructions } => Ok(PayoutDetails::Manual {
            instructions: clean_note("instructions", instructions)?,
        }),
    }
}

/// Four bank letters, a literal `0`, six alphanumeric branch characters.
fn is_ifsc(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 11
        && bytes[..4].iter().all(u8::is_ascii_uppercase)
        && bytes[4] == b'0'
        && bytes[5..].iter().all(u8::is_ascii_alphanumeric)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::{CommissionEarning, EarningStatus};
    use crate::store::MemoryStore;

    const ADMIN: Actor = Actor::Admin(99);

    async fn store_with_credit(referrer: UserId, units: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .put_earning(CommissionEarning {
                id: 1,
                referrer,
                referred: 50,
                order_ref: "order_1".to_string(),
                amount: Amount::from_units(units),
                status: EarningStatus::Credited,
                created_at: Utc::now(),
            })
            .await;
        store
    }

    fn upi(units: i64) -> WithdrawalInput {
        WithdrawalInput {
            amount: Amount::from_units(units),
            payout: PayoutDetails::Upi {
                upi_id: "asha@okbank".to_string(),
            },
            notes: None,
        }
    }

    fn workflow(store: &Arc<MemoryStore>) -> WithdrawalWorkflow<MemoryStore> {
        WithdrawalWorkflow::new(store.clone(), LedgerConfig::default())
    }

    #[test]
    fn request_number_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let number = request_number(now);
        assert!(number.starts_with("WD-20240309-"), "{number}");
        assert_eq!(number.len(), "WD-20240309-".len() + 8);
        assert_ne!(number, request_number(now));
    }

    #[test]
    fn ifsc_shape() {
        assert!(is_ifsc("HDFC0001234"));
        assert!(!is_ifsc("HDFC1001234"));
        assert!(!is_ifsc("HDF00001234"));
        assert!(!is_ifsc("HDFC000123"));
    }

    #[test]
    fn payout_validation() {
        assert!(validate_payout(PayoutDetails::Upi {
            upi_id: "bad".into()
        })
        .is_err());
        assert!(validate_payout(PayoutDetails::Upi {
            upi_id: "a@b@c".into()
        })
        .is_err());
        assert_eq!(
            validate_payout(PayoutDetails::Bank {
                account_name: " Asha ".into(),
                account_number: "00123456".into(),
                ifsc: "hdfc0001234".into(),
            }),
            Ok(PayoutDetails::Bank {
                account_name: "Asha".into(),
                account_number: "00123456".into(),
                ifsc: "HDFC0001234".into(),
            })
        );
        assert_eq!(
            validate_payout(PayoutDetails::Bank {
                account_name: "".into(),
                account_number: "00123456".into(),
                ifsc: "HDFC0001234".into(),
            }),
            Err(ValidationError::MissingField("account_name"))
        );
        assert_eq!(
            validate_payout(PayoutDetails::Manual {
                instructions: Some("  ".into())
            }),
            Ok(PayoutDetails::Manual { instructions: None })
        );
    }

    #[tokio::test]
    async fn create_locks_the_amount() {
        let store = store_with_credit(1, 500).await;
        let workflow = workflow(&store);

        let request = workflow.create_request(1, upi(300)).await.unwrap();
        assert_eq!(request.status, WithdrawalStatus::Requested);
        assert_eq!(request.amount, Amount::from_units(300));
        assert!(request.processed_at.is_none());

        let balance = workflow.ledger.wallet(1).await.unwrap();
        assert_eq!(balance.locked_amount, Amount::from_units(300));
        assert_eq!(balance.available_balance, Amount::from_units(200));
    }

    #[tokio::test]
    async fn create_exact_balance_succeeds() {
        let store = store_with_credit(1, 500).await;
        workflow(&store).create_request(1, upi(500)).await.unwrap();
    }

    #[tokio::test]
    async fn create_over_balance_fails_without_a_row() {
        let store = store_with_credit(1, 500).await;
        let before = store.withdrawal_count().await;

        let err = workflow(&store).create_request(1, upi(501)).await.unwrap_err();
        assert!(matches!(
            err,
            WithdrawalError::InsufficientBalance { referrer: 1, .. }
        ));
        assert_eq!(store.withdrawal_count().await, before);
    }

    #[tokio::test]
    async fn create_below_minimum_fails_regardless_of_balance() {
        let store = store_with_credit(1, 100_000).await;
        let err = workflow(&store).create_request(1, upi(99)).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::BelowMinimum { .. }));
        assert_eq!(store.withdrawal_count().await, 0);
    }

    #[tokio::test]
    async fn create_rejects_non_positive_amount() {
        let store = store_with_credit(1, 500).await;
        let err = workflow(&store).create_request(1, upi(0)).await.unwrap_err();
        assert!(matches!(
            err,
            WithdrawalError::Validation(ValidationError::NonPositiveAmount(_))
        ));
    }

    #[tokio::test]
    async fn create_surfaces_negative_balance() {
        let store = store_with_credit(1, 500).await;
        store
            .put_withdrawal(WithdrawalRequest {
                id: 1,
                request_number: "WD-LEGACY".into(),
                referrer: 1,
                amount: Amount::from_units(800),
                payout: PayoutDetails::Manual { instructions: None },
                notes: None,
                status: WithdrawalStatus::Paid,
                admin_note: None,
                created_at: Utc::now(),
                processed_at: Some(Utc::now()),
            })
            .await;

        let err = workflow(&store).create_request(1, upi(100)).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::Integrity(_)));
    }

    #[tokio::test]
    async fn paid_is_reached_through_processing() {
        let store = store_with_credit(1, 500).await;
        let workflow = workflow(&store);
        let request = workflow.create_request(1, upi(300)).await.unwrap();

        let processing = workflow
            .transition(ADMIN, request.id, WithdrawalStatus::Processing, None)
            .await
            .unwrap();
        assert!(processing.processed_at.is_none());

        let paid = workflow
            .transition(
                ADMIN,
                request.id,
                WithdrawalStatus::Paid,
                Some("UTR 12345".into()),
            )
            .await
            .unwrap();
        assert!(paid.processed_at.is_some());
        assert_eq!(paid.admin_note.as_deref(), Some("UTR 12345"));

        let balance = workflow.ledger.wallet(1).await.unwrap();
        assert_eq!(balance.total_withdrawn, Amount::from_units(300));
        assert_eq!(balance.locked_amount, Amount::ZERO);
        assert_eq!(balance.available_balance, Amount::from_units(200));
    }

    #[tokio::test]
    async fn terminal_requests_never_move() {
        let store = store_with_credit(1, 500).await;
        let workflow = workflow(&store);
        let request = workflow.create_request(1, upi(300)).await.unwrap();
        workflow
            .transition(ADMIN, request.id, WithdrawalStatus::Processing, None)
            .await
            .unwrap();
        let paid = workflow
            .transition(ADMIN, request.id, WithdrawalStatus::Paid, None)
            .await
            .unwrap();

        for target in WithdrawalStatus::ALL {
            let err = workflow
                .transition(ADMIN, request.id, target, Some("again".into()))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                TransitionError::IllegalTransition {
                    from: WithdrawalStatus::Paid,
                    ..
                }
            ));
        }
        assert_eq!(store.withdrawal(request.id).await.unwrap(), Some(paid));
    }

    #[tokio::test]
    async fn requested_can_be_rejected_directly() {
        let store = store_with_credit(1, 500).await;
        let workflow = workflow(&store);
        let request = workflow.create_request(1, upi(300)).await.unwrap();

        let rejected = workflow
            .transition(ADMIN, request.id, WithdrawalStatus::Rejected, None)
            .await
            .unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);

        let balance = workflow.ledger.wallet(1).await.unwrap();
        assert_eq!(balance.available_balance, Amount::from_units(500));
    }

    #[tokio::test]
    async fn referrers_cannot_transition() {
        let store = store_with_credit(1, 500).await;
        let workflow = workflow(&store);
        let request = workflow.create_request(1, upi(300)).await.unwrap();

        let err = workflow
            .transition(
                Actor::Referrer(1),
                request.id,
                WithdrawalStatus::Cancelled,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::Forbidden(Actor::Referrer(1))));
    }

    #[tokio::test]
    async fn transition_unknown_request() {
        let store = store_with_credit(1, 500).await;
        let err = workflow(&store)
            .transition(ADMIN, 42, WithdrawalStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotFound(42)));
    }

    #[tokio::test]
    async fn notes_can_be_overwritten_after_settlement() {
        let store = store_with_credit(1, 500).await;
        let workflow = workflow(&store);
        let request = workflow.create_request(1, upi(300)).await.unwrap();
        workflow
            .transition(ADMIN, request.id, WithdrawalStatus::Cancelled, None)
            .await
            .unwrap();

        let noted = workflow
            .annotate(ADMIN, request.id, Some("referrer asked to cancel".into()))
            .await
            .unwrap();
        assert_eq!(noted.status, WithdrawalStatus::Cancelled);
        assert_eq!(noted.admin_note.as_deref(), Some("referrer asked to cancel"));

        let cleared = workflow.annotate(ADMIN, request.id, None).await.unwrap();
        assert_eq!(cleared.admin_note, None);

        assert!(matches!(
            workflow.annotate(ADMIN, 77, None).await,
            Err(TransitionError::NotFound(77))
        ));
    }
}
