//! CSV snapshots, command files and the referrer report.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::ReferrerReport;
use crate::model::{
    CommissionEarning, EarningStatus, Listing, ListingPaymentState, PayoutDetails, ReferralSignup,
    ReferrerAccount, UserId, WithdrawalRequest, WithdrawalStatus,
};
use crate::store::{MemoryStore, Store};
use crate::{Amount, Command};

/// Errors that can occur when reading csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("{}: failed to open: {source}", path.display())]
    Open { path: PathBuf, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{kind}'")]
    UnrecognizedType { line: usize, kind: String },

    #[error("line {line}: {kind} missing {field}")]
    MissingField {
        line: usize,
        kind: String,
        field: &'static str,
    },

    #[error("line {line}: {reason}")]
    Invalid { line: usize, reason: String },

    #[error("{file}: {reason}")]
    Snapshot { file: &'static str, reason: String },

    #[error("{}: not a directory", .0.display())]
    NotADirectory(PathBuf),
}

#[derive(Debug, Deserialize)]
struct AccountRow {
    id: UserId,
    name: String,
    referral_code: Option<String>,
    email: Option<String>,
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingRow {
    id: u64,
    owner: UserId,
    slug: Option<String>,
    username: Option<String>,
    payment_state: String,
}

#[derive(Debug, Deserialize)]
struct SignupRow {
    referred: UserId,
    referrer: UserId,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct EarningRow {
    id: u64,
    referrer: UserId,
    referred: UserId,
    order_ref: String,
    amount: String,
    status: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WithdrawalRow {
    id: u64,
    request_number: String,
    referrer: UserId,
    amount: String,
    method: String,
    details: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    admin_note: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandRow {
    r#type: String,
    actor: Option<u64>,
    target: Option<u64>,
    amount: Option<String>,
    status: Option<String>,
    method: Option<String>,
    details: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReportRow {
    referrer: UserId,
    name: String,
    signups: usize,
    paid_signups: usize,
    earned: String,
    withdrawn: String,
    locked: String,
    available: String,
}

/// Build payout details from a method name and its `details` column.
///
/// `upi` takes the UPI id, `bank` takes `name|account number|ifsc`,
/// `manual` takes optional free-form instructions.
pub fn parse_payout(method: &str, details: Option<&str>) -> Result<PayoutDetails, String> {
    let details = details.map(str::trim).filter(|d| !d.is_empty());
    match method.trim().to_ascii_lowercase().as_str() {
        "upi" => Ok(PayoutDetails::Upi {
            upi_id: details.ok_or("upi payout needs a upi id")?.to_string(),
        }),
        "bank" => {
            let details = details.ok_or("bank payout needs name|account|ifsc")?;
            let mut parts = details.split('|').map(str::trim);
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(number), Some(ifsc), None) => Ok(PayoutDetails::Bank {
                    account_name: name.to_string(),
                    account_number: number.to_string(),
                    ifsc: ifsc.to_string(),
                }),
                _ => Err(format!("bank details '{details}' are not name|account|ifsc")),
            }
        }
        "manual" => Ok(PayoutDetails::Manual {
            instructions: details.map(str::to_string),
        }),
        other => Err(format!("unknown payout method '{other}'")),
    }
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Read every row of an optional snapshot file; a missing file is empty.
fn read_rows<T: serde::de::DeserializeOwned>(
    dir: &Path,
    file: &'static str,
) -> Result<Vec<T>, CsvError> {
    let path = dir.join(file);
    if !path.exists() {
        return Ok(Vec::new());
    }
    open(&path)?
        .into_deserialize::<T>()
        .enumerate()
        .map(|(idx, row)| {
            row.map_err(|source| CsvError::Parse {
                line: idx + 2,
                source,
            })
        })
        .collect()
}

fn snapshot_error(file: &'static str) -> impl Fn(String) -> CsvError {
    move |reason| CsvError::Snapshot { file, reason }
}

/// Values of one unique snapshot column.
struct UniqueColumn {
    file: &'static str,
    column: &'static str,
    seen: HashSet<String>,
}

impl UniqueColumn {
    fn new(file: &'static str, column: &'static str) -> Self {
        Self {
            file,
            column,
            seen: HashSet::new(),
        }
    }

    fn claim(&mut self, value: impl ToString) -> Result<(), CsvError> {
        let value = value.to_string();
        if self.seen.contains(&value) {
            return Err(CsvError::Snapshot {
                file: self.file,
                reason: format!("duplicate {} '{value}'", self.column),
            });
        }
        self.seen.insert(value);
        Ok(())
    }
}

/// Load `accounts.csv`, `listings.csv`, `signups.csv`, `earnings.csv` and
/// `withdrawals.csv` from `dir` into a fresh store. Missing files are skipped.
pub async fn load_store(dir: impl AsRef<Path>) -> Result<MemoryStore, CsvError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(CsvError::NotADirectory(dir.to_path_buf()));
    }
    let store = MemoryStore::new();

    let mut account_ids = UniqueColumn::new("accounts.csv", "id");
    let mut referral_codes = UniqueColumn::new("accounts.csv", "referral_code");
    for row in read_rows::<AccountRow>(dir, "accounts.csv")? {
        account_ids.claim(row.id)?;
        if let Some(code) = &row.referral_code {
            referral_codes.claim(code.to_ascii_uppercase())?;
        }
        store
            .put_account(ReferrerAccount {
                id: row.id,
                referral_code: row.referral_code,
                name: row.name,
                email: row.email,
                phone: row.phone,
            })
            .await;
    }

    let mut listing_ids = UniqueColumn::new("listings.csv", "id");
    let mut slugs = UniqueColumn::new("listings.csv", "slug");
    let mut usernames = UniqueColumn::new("listings.csv", "username");
    for row in read_rows::<ListingRow>(dir, "listings.csv")? {
        listing_ids.claim(row.id)?;
        if let Some(slug) = &row.slug {
            slugs.claim(slug)?;
        }
        if let Some(username) = &row.username {
            usernames.claim(username.to_ascii_lowercase())?;
        }
        let payment_state = match row.payment_state.to_ascii_lowercase().as_str() {
            "paid" => ListingPaymentState::Paid,
            "unpaid" => ListingPaymentState::Unpaid,
            other => {
                return Err(CsvError::Snapshot {
                    file: "listings.csv",
                    reason: format!("listing {}: unknown payment state '{other}'", row.id),
                });
            }
        };
        store
            .put_listing(Listing {
                id: row.id,
                owner: row.owner,
                slug: row.slug,
                username: row.username,
                payment_state,
            })
            .await;
    }

    for row in read_rows::<SignupRow>(dir, "signups.csv")? {
        store
            .insert_signup(ReferralSignup {
                referred: row.referred,
                referrer: row.referrer,
                created_at: row.created_at,
            })
            .await
            .map_err(|e| snapshot_error("signups.csv")(e.to_string()))?;
    }

    let mut earning_ids = UniqueColumn::new("earnings.csv", "id");
    let mut order_refs = UniqueColumn::new("earnings.csv", "order_ref");
    for row in read_rows::<EarningRow>(dir, "earnings.csv")? {
        earning_ids.claim(row.id)?;
        order_refs.claim(&row.order_ref)?;
        let invalid = snapshot_error("earnings.csv");
        let status = match row.status.to_ascii_lowercase().as_str() {
            "credited" => EarningStatus::Credited,
            "reversed" => EarningStatus::Reversed,
            other => return Err(invalid(format!("earning {}: unknown status '{other}'", row.id))),
        };
        let amount: Amount = row
            .amount
            .parse()
            .map_err(|e| invalid(format!("earning {}: {e}", row.id)))?;
        store
            .put_earning(CommissionEarning {
                id: row.id,
                referrer: row.referrer,
                referred: row.referred,
                order_ref: row.order_ref,
                amount,
                status,
                created_at: row.created_at,
            })
            .await;
    }

    let mut withdrawal_ids = UniqueColumn::new("withdrawals.csv", "id");
    let mut request_numbers = UniqueColumn::new("withdrawals.csv", "request_number");
    for row in read_rows::<WithdrawalRow>(dir, "withdrawals.csv")? {
        withdrawal_ids.claim(row.id)?;
        request_numbers.claim(&row.request_number)?;
        let invalid = snapshot_error("withdrawals.csv");
        let amount: Amount = row
            .amount
            .parse()
            .map_err(|e| invalid(format!("withdrawal {}: {e}", row.id)))?;
        let status: WithdrawalStatus = row
            .status
            .parse()
            .map_err(|e| invalid(format!("withdrawal {}: {e}", row.id)))?;
        let payout = parse_payout(&row.method, row.details.as_deref())
            .map_err(|e| invalid(format!("withdrawal {}: {e}", row.id)))?;
        store
            .put_withdrawal(WithdrawalRequest {
                id: row.id,
                request_number: row.request_number,
                referrer: row.referrer,
                amount,
                payout,
                notes: row.notes,
                status,
                admin_note: row.admin_note,
                created_at: row.created_at,
                processed_at: row.processed_at,
            })
            .await;
    }

    Ok(store)
}

/// Read commands from a csv file
///
/// The iterator owns its reader, so it can outlive `path`.
pub fn read_commands(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Command, CsvError>> + use<>, CsvError> {
    let reader = open(path)?;

    Ok(reader
        .into_deserialize::<CommandRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_command(line, row)
        }))
}

fn parse_command(line: usize, row: CommandRow) -> Result<Command, CsvError> {
    let kind = row.r#type.to_ascii_lowercase();
    let missing = |field: &'static str| CsvError::MissingField {
        line,
        kind: kind.clone(),
        field,
    };
    let invalid = |reason: String| CsvError::Invalid { line, reason };
    let text = row.text.filter(|t| !t.is_empty());

    let command = match kind.as_str() {
        "signup" => Command::Signup {
            user: row.actor.ok_or_else(|| missing("actor"))?,
            code: text.ok_or_else(|| missing("text"))?,
        },
        "credit" => Command::Credit {
            user: row.actor.ok_or_else(|| missing("actor"))?,
            order_ref: text.ok_or_else(|| missing("text"))?,
        },
        "withdraw" => {
            let amount = row.amount.ok_or_else(|| missing("amount"))?;
            let method = row.method.ok_or_else(|| missing("method"))?;
            Command::Withdraw {
                referrer: row.actor.ok_or_else(|| missing("actor"))?,
                amount: amount.parse().map_err(|e| invalid(format!("{e}")))?,
                payout: parse_payout(&method, row.details.as_deref()).map_err(invalid)?,
                notes: text,
            }
        }
        "transition" => {
            let status = row.status.ok_or_else(|| missing("status"))?;
            Command::Transition {
                admin: row.actor.ok_or_else(|| missing("actor"))?,
                request: row.target.ok_or_else(|| missing("target"))?,
                status: status.parse().map_err(invalid)?,
                note: text,
            }
        }
        "annotate" => Command::Annotate {
            admin: row.actor.ok_or_else(|| missing("actor"))?,
            request: row.target.ok_or_else(|| missing("target"))?,
            note: text,
        },
        "reverse" => Command::Reverse {
            admin: row.actor.ok_or_else(|| missing("actor"))?,
            earning: row.target.ok_or_else(|| missing("target"))?,
        },
        "slug" => Command::AssignSlug {
            listing: row.target.ok_or_else(|| missing("target"))?,
            name: text.ok_or_else(|| missing("text"))?,
        },
        "username" => Command::AssignUsername {
            listing: row.target.ok_or_else(|| missing("target"))?,
            handle: text.ok_or_else(|| missing("text"))?,
        },
        _ => {
            return Err(CsvError::UnrecognizedType {
                line,
                kind: row.r#type,
            });
        }
    };
    Ok(command)
}

/// Write the referrer report in csv format
pub fn write_report<W: io::Write>(
    writer: W,
    reports: impl IntoIterator<Item = ReferrerReport>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for report in reports {
        let ReferrerReport { standing, wallet } = report;
        writer.serialize(ReportRow {
            referrer: standing.referrer,
            name: standing.name,
            signups: standing.summary.total_signups,
            paid_signups: standing.summary.paid_signups,
            earned: wallet.total_credited.to_string(),
            withdrawn: wallet.total_withdrawn.to_string(),
            locked: wallet.locked_amount.to_string(),
            available: wallet.available_balance.to_string(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
