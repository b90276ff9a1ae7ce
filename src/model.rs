//! Core domain types for the referral ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::Amount;

/// User identifier, owned by the account subsystem.
pub type UserId = u64;

/// Business listing identifier.
pub type ListingId = u64;

/// Commission earning row identifier.
pub type EarningId = u64;

/// Withdrawal request row identifier.
pub type WithdrawalId = u64;

/// A user able to refer others. Read-only from the ledger's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrerAccount {
    pub id: UserId,
    pub referral_code: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Records that `referred` signed up with `referrer`'s code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralSignup {
    pub referred: UserId,
    pub referrer: UserId,
    pub created_at: DateTime<Utc>,
}

/// Payment state of a business listing, as reported by the listing subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ListingPaymentState {
    #[default]
    Unpaid,
    Paid,
}

/// A business listing row with its public identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub id: ListingId,
    pub owner: UserId,
    pub slug: Option<String>,
    pub username: Option<String>,
    pub payment_state: ListingPaymentState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EarningStatus {
    Credited,
    Reversed,
}

/// One credited commission for one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionEarning {
    pub id: EarningId,
    pub referrer: UserId,
    pub referred: UserId,
    pub order_ref: String,
    pub amount: Amount,
    pub status: EarningStatus,
    pub created_at: DateTime<Utc>,
}

impl CommissionEarning {
    pub fn is_credited(&self) -> bool {
        self.status == EarningStatus::Credited
    }
}

/// Lifecycle of a withdrawal request.
///
/// `Requested` is initial; `Paid`, `Rejected` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WithdrawalStatus {
    Requested,
    Processing,
    Paid,
    Rejected,
    Cancelled,
}

impl WithdrawalStatus {
    pub const ALL: [WithdrawalStatus; 5] = [
        WithdrawalStatus::Requested,
        WithdrawalStatus::Processing,
        WithdrawalStatus::Paid,
        WithdrawalStatus::Rejected,
        WithdrawalStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WithdrawalStatus::Requested => "requested",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Paid => "paid",
            WithdrawalStatus::Rejected => "rejected",
            WithdrawalStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Paid | WithdrawalStatus::Rejected | WithdrawalStatus::Cancelled
        )
    }

    /// Open requests keep their amount locked out of the spendable balance.
    pub fn is_locking(self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Requested | WithdrawalStatus::Processing
        )
    }

    /// The transition table. Anything not listed here is illegal,
    /// including a transition to the current status.
    pub fn can_transition_to(self, target: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, target),
            (Requested, Processing)
                | (Requested, Rejected)
                | (Requested, Cancelled)
                | (Processing, Paid)
                | (Processing, Rejected)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        WithdrawalStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown withdrawal status '{s}'"))
    }
}

/// Where a withdrawal is paid out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutDetails {
    Upi {
        upi_id: String,
    },
    Bank {
        account_name: String,
        account_number: String,
        ifsc: String,
    },
    Manual {
        instructions: Option<String>,
    },
}

impl PayoutDetails {
    pub fn method(&self) -> &'static str {
        match self {
            PayoutDetails::Upi { .. } => "upi",
            PayoutDetails::Bank { .. } => "bank",
            PayoutDetails::Manual { .. } => "manual",
        }
    }
}

/// A referrer's request to cash out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub id: WithdrawalId,
    pub request_number: String,
    pub referrer: UserId,
    pub amount: Amount,
    pub payout: PayoutDetails,
    pub notes: Option<String>,
    pub status: WithdrawalStatus,
    pub admin_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Who is performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Admin(UserId),
    Referrer(UserId),
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }
}

/// An operation replayed through the [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `user` signs up citing a referral code.
    Signup { user: UserId, code: String },
    /// `user`'s paid order earns their referrer a commission.
    Credit { user: UserId, order_ref: String },
    /// A referrer asks to cash out.
    Withdraw {
        referrer: UserId,
        amount: Amount,
        payout: PayoutDetails,
        notes: Option<String>,
    },
    /// An admin moves a withdrawal request.
    Transition {
        admin: UserId,
        request: WithdrawalId,
        status: WithdrawalStatus,
        note: Option<String>,
    },
    /// An admin rewrites the advisory note of a request.
    Annotate {
        admin: UserId,
        request: WithdrawalId,
        note: Option<String>,
    },
    /// An admin reverses a credited commission.
    Reverse { admin: UserId, earning: EarningId },
    /// Give a listing a slug derived from `name`.
    AssignSlug { listing: ListingId, name: String },
    /// Give a listing a public username derived from `handle`.
    AssignUsername { listing: ListingId, handle: String },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Signup { .. } => "signup",
            Command::Credit { .. } => "credit",
            Command::Withdraw { .. } => "withdraw",
            Command::Transition { .. } => "transition",
            Command::Annotate { .. } => "annotate",
            Command::Reverse { .. } => "reverse",
            Command::AssignSlug { .. } => "slug",
            Command::AssignUsername { .. } => "username",
        }
    }
}
