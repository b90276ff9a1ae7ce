//! Ledger tunables.

use crate::Amount;

/// Handles that are never handed out as public usernames: system routes and staff handles.
pub const RESERVED_USERNAMES: &[&str] = &[
    "about", "account", "admin", "administrator", "api", "app", "assets", "auth", "billing",
    "blog", "business", "careers", "checkout", "contact", "courses", "dashboard", "help",
    "internships", "legal", "login", "logout", "me", "moderator", "null", "owner", "payment",
    "payments", "privacy", "referral", "referrals", "register", "root", "settings", "signin",
    "signup", "staff", "static", "support", "system", "team", "terms", "undefined", "wallet",
    "webhook", "www",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Smallest amount a referrer may withdraw.
    pub min_withdrawal: Amount,
    /// Credited per converted referral.
    pub commission_amount: Amount,
    pub username_min_len: usize,
    pub username_max_len: usize,
    /// Candidates tried before giving up on a username or a slug write.
    pub identifier_attempts: u32,
    /// Cap on the recent-signup and recent-earning feeds.
    pub feed_page_size: usize,
    pub reserved_usernames: Vec<String>,
}

impl LedgerConfig {
    pub fn is_reserved(&self, username: &str) -> bool {
        self.reserved_usernames
            .iter()
            .any(|r| r.eq_ignore_ascii_case(username))
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_withdrawal: Amount::from_units(100),
            commission_amount: Amount::from_units(500),
            username_min_len: 3,
            username_max_len: 30,
            identifier_attempts: 200,
            feed_page_size: 20,
            reserved_usernames: RESERVED_USERNAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}
