use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use ledger_cli::{
    logging::{self, LogFormat},
    Amount, LedgerError, LedgerEvent, SnapshotStore, StoreError, TransferRequest,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Parser, Debug)]
#[command(name = "ledger", version, about = "Account ledger with atomic transfers")]
struct Cli {
    /// Ledger state file
    #[arg(long, env = "LEDGER_STATE", default_value = "ledger.json", global = true)]
    state: PathBuf,

    #[arg(
        long,
        env = "LEDGER_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty ledger
    Init {
        /// Overwrite existing state
        #[arg(long)]
        force: bool,
    },
    /// Provision an account with an opening balance
    Open { account: String, balance: Amount },
    /// Move funds between two accounts
    Transfer {
        from: String,
        to: String,
        #[arg(allow_negative_numbers = true)]
        amount: Amount,
        #[arg(long)]
        memo: Option<String>,
    },
    /// Print one account's balance
    Balance { account: String },
    /// Print every account and the ledger total
    List,
    /// Print the journal, oldest first
    History {
        /// Only the last N entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check the merkle root over balances and journal, then replay the
    /// journal against the balances
    Verify,
}

/// Bad command line.
const EXIT_USAGE: i32 = 1;
/// Rejected operation or unreadable state.
const EXIT_FAILURE: i32 = 2;

/// Exit status for a parse error; help and version output are not errors.
fn usage_status(err: &clap::Error) -> i32 {
    if err.use_stderr() {
        EXIT_USAGE
    } else {
        0
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match usage_status(&err) {
            0 => err.exit(),
            status => {
                let _ = err.print();
                std::process::exit(status);
            }
        },
    };
    logging::init(cli.log_format, "warn");
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(EXIT_FAILURE);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let store = SnapshotStore::new(&cli.state);
    debug!(state = %store.path().display(), command = ?cli.command, "running");
    match cli.command {
        Command::Init { force } => {
            store.init(force)?;
            println!("Initialized empty ledger → {}", store.path().display());
        }
        Command::Open { account, balance } => {
            let ledger = store.load()?;
            ledger.open_account(account.clone(), balance)?;
            store.save(&ledger)?;
            println!("Opened {account} with balance {balance}");
        }
        Command::Transfer {
            from,
            to,
            amount,
            memo,
        } => {
            let ledger = store.load()?;
            let request = TransferRequest {
                from,
                to,
                amount,
                memo,
            };
            let receipt = ledger.transfer(&request)?;
            store.save(&ledger)?;
            println!(
                "Transferred {} {} → {} ({}={}, {}={}, seq {})",
                receipt.amount,
                receipt.from,
                receipt.to,
                receipt.from,
                receipt.from_balance,
                receipt.to,
                receipt.to_balance,
                receipt.seq
            );
        }
        Command::Balance { account } => {
            let ledger = store.load()?;
            println!("{}", ledger.balance(&account)?);
        }
        Command::List => {
            let ledger = store.load()?;
            let accounts = ledger.accounts();
            for (account, balance) in &accounts {
                println!("{account}\t{balance}");
            }
            let total: i128 = accounts.iter().map(|(_, b)| i128::from(*b)).sum();
            println!("total\t{total}");
        }
        Command::History { limit } => {
            let history = store.load()?.history();
            let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
            for event in history.iter().skip(skip) {
                println!("{}", describe(event));
            }
        }
        Command::Verify => {
            let snapshot = store.load_snapshot()?;
            println!(
                "OK height={} accounts={} root={}",
                snapshot.meta.height,
                snapshot.accounts.len(),
                hex::encode(snapshot.merkle_root)
            );
        }
    }
    Ok(())
}

fn describe(event: &LedgerEvent) -> String {
    match event {
        LedgerEvent::AccountOpened {
            seq,
            account,
            opening_balance,
        } => format!("#{seq} open {account} {opening_balance}"),
        LedgerEvent::Transfer {
            seq,
            from,
            to,
            amount,
            memo,
        } => match memo {
            Some(memo) => format!("#{seq} transfer {from} → {to} {amount} ({memo})"),
            None => format!("#{seq} transfer {from} → {to} {amount}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn transfer_accepts_negative_amount_so_the_ledger_can_reject_it() {
        let cli = Cli::try_parse_from(["ledger", "transfer", "A", "B", "-5"]).unwrap();
        match cli.command {
            Command::Transfer { amount, .. } => assert_eq!(amount, -5),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn usage_errors_exit_with_one_and_help_with_zero() {
        let bogus = Cli::try_parse_from(["ledger", "bogus"]).unwrap_err();
        assert_eq!(usage_status(&bogus), EXIT_USAGE);

        let missing = Cli::try_parse_from(["ledger", "transfer", "A"]).unwrap_err();
        assert_eq!(usage_status(&missing), EXIT_USAGE);

        let help = Cli::try_parse_from(["ledger", "--help"]).unwrap_err();
        assert_eq!(usage_status(&help), 0);
        let version = Cli::try_parse_from(["ledger", "--version"]).unwrap_err();
        assert_eq!(usage_status(&version), 0);

        assert_ne!(EXIT_USAGE, EXIT_FAILURE);
    }

    #[test]
    fn verify_rejects_state_that_other_commands_reject() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = dir.path().join("ledger.json");
        let mut accounts = std::collections::BTreeMap::new();
        accounts.insert("A".to_string(), -5);
        let snapshot = ledger_cli::LedgerSnapshot::new(Default::default(), accounts, vec![]);
        std::fs::write(&state, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let invoke = |command: &str| {
            let argv = ["ledger", "--state", state.to_str().unwrap(), command];
            run(Cli::try_parse_from(argv).unwrap())
        };
        assert!(matches!(
            invoke("verify"),
            Err(CliError::Store(StoreError::Ledger(
                LedgerError::NegativeBalance { .. }
            )))
        ));
        assert!(invoke("list").is_err());
    }

    #[test]
    fn describe_includes_memo_when_present() {
        let event = LedgerEvent::Transfer {
            seq: 7,
            from: "A".into(),
            to: "B".into(),
            amount: 30,
            memo: Some("rent".into()),
        };
        assert_eq!(describe(&event), "#7 transfer A → B 30 (rent)");
    }

    #[test]
    fn commands_round_trip_through_state_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = dir.path().join("ledger.json");
        let invoke = |args: &[&str]| {
            let mut argv = vec!["ledger", "--state", state.to_str().unwrap()];
            argv.extend_from_slice(args);
            run(Cli::try_parse_from(argv).unwrap())
        };

        invoke(&["init"]).unwrap();
        invoke(&["open", "A", "100"]).unwrap();
        invoke(&["open", "B", "50"]).unwrap();
        invoke(&["transfer", "A", "B", "30", "--memo", "rent"]).unwrap();
        assert!(matches!(
            invoke(&["transfer", "A", "B", "500"]),
            Err(CliError::Ledger(LedgerError::InsufficientFunds { .. }))
        ));
        invoke(&["verify"]).unwrap();

        let ledger = SnapshotStore::new(&state).load().unwrap();
        assert_eq!(ledger.balance("A").unwrap(), 70);
        assert_eq!(ledger.balance("B").unwrap(), 80);
        assert_eq!(ledger.history().len(), 3);
    }
}
