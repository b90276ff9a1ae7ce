pub mod amount;
pub mod config;
pub mod csv;
pub mod engine;
pub mod error;
pub mod identifier;
pub mod insights;
pub mod ledger;
pub mod model;
pub mod referral;
pub mod store;
pub mod wallet;
pub mod withdrawal;

pub use amount::Amount;
pub use config::LedgerConfig;
pub use engine::Engine;
pub use error::LedgerError;
pub use model::{
    Actor, Command, EarningId, ListingId, PayoutDetails, UserId, WithdrawalId, WithdrawalStatus,
};
