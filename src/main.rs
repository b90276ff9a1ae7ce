use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use referral_ledger::csv::{load_store, read_commands, write_report};
use referral_ledger::{Amount, Engine, LedgerConfig};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Replay referral commands over a ledger snapshot and print every referrer's wallet.
#[derive(Debug, Parser)]
#[command(name = "referral-ledger", version)]
struct Args {
    /// Directory holding accounts.csv, listings.csv, signups.csv, earnings.csv and withdrawals.csv
    data_dir: PathBuf,

    /// Commands to replay, in order
    commands: Option<PathBuf>,

    #[arg(long, env = "LEDGER_MIN_WITHDRAWAL", default_value = "100.00")]
    min_withdrawal: Amount,

    #[arg(long, env = "LEDGER_COMMISSION_AMOUNT", default_value = "500.00")]
    commission_amount: Amount,

    #[arg(long, env = "LEDGER_USERNAME_MIN_LEN", default_value_t = 3)]
    username_min_len: usize,

    #[arg(long, env = "LEDGER_USERNAME_MAX_LEN", default_value_t = 30)]
    username_max_len: usize,

    #[arg(long, env = "LEDGER_IDENTIFIER_ATTEMPTS", default_value_t = 200)]
    identifier_attempts: u32,

    #[arg(long, env = "LEDGER_FEED_PAGE_SIZE", default_value_t = 20)]
    feed_page_size: usize,
}

impl Args {
    fn config(&self) -> LedgerConfig {
        LedgerConfig {
            min_withdrawal: self.min_withdrawal,
            commission_amount: self.commission_amount,
            username_min_len: self.username_min_len,
            username_max_len: self.username_max_len,
            identifier_attempts: self.identifier_attempts,
            feed_page_size: self.feed_page_size,
            ..LedgerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let store = match load_store(&args.data_dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(dir = %args.data_dir.display(), "failed to load snapshot: {e}");
            return ExitCode::FAILURE;
        }
    };
    let engine = Engine::new(store, args.config());

    if let Some(path) = args.commands {
        if path.extension().is_none_or(|ext| ext != "csv") {
            warn!(path = %path.display(), "command file seems to not be a csv file");
        }

        let commands = match read_commands(&path) {
            Ok(commands) => commands,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        };

        let (command_sender, command_receiver) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            for result in commands {
                match result {
                    Ok(command) => {
                        if command_sender.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("{e}");
                    }
                }
            }
        });

        let stats = engine.run(ReceiverStream::new(command_receiver)).await;
        info!(applied = stats.applied, skipped = stats.skipped, "replay finished");
    }

    let report = match engine.report().await {
        Ok(report) => report,
        Err(e) => {
            error!("failed to build report: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = write_report(std::io::stdout().lock(), report) {
        error!("failed to write report: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
