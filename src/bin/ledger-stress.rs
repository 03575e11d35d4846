use std::{collections::BTreeMap, sync::Arc, thread, time::Instant};

use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use ledger_cli::{
    logging::{self, LogFormat},
    Amount, Ledger, TransferRequest,
};

/// Hammers an in-memory ledger with random concurrent transfers and checks
/// that no money was created or destroyed.
#[derive(Parser, Debug)]
#[command(name = "ledger-stress", version)]
struct Args {
    #[arg(long, default_value_t = 16)]
    accounts: usize,
    /// Opening balance of every account
    #[arg(long, default_value_t = 1_000)]
    balance: Amount,
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// Transfers issued per thread
    #[arg(long, default_value_t = 10_000)]
    transfers: usize,
    #[arg(long, default_value_t = 0x1ED6_E500)]
    seed: u64,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    applied: u64,
    rejected: BTreeMap<&'static str, u64>,
    expected_total: i128,
    actual_total: i128,
    negative_accounts: usize,
    elapsed_ms: u128,
}

impl Report {
    fn merge(&mut self, other: Report) {
        self.applied += other.applied;
        for (kind, n) in other.rejected {
            *self.rejected.entry(kind).or_default() += n;
        }
    }

    fn conserved(&self) -> bool {
        self.expected_total == self.actual_total && self.negative_accounts == 0
    }
}

fn worker(
    ledger: &Ledger,
    ids: &[String],
    transfers: usize,
    balance: Amount,
    seed: u64,
) -> Report {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = Report::default();
    // amounts may exceed balances and ids may collide, so every
    // rejection path gets exercised
    let max_amount = balance.max(1).saturating_mul(2);
    for _ in 0..transfers {
        let from = &ids[rng.gen_range(0..ids.len())];
        let to = &ids[rng.gen_range(0..ids.len())];
        let amount = rng.gen_range(-1..=max_amount);
        match ledger.transfer(&TransferRequest::new(from.as_str(), to.as_str(), amount)) {
            Ok(_) => report.applied += 1,
            Err(err) => *report.rejected.entry(err.kind()).or_default() += 1,
        }
    }
    report
}

fn run(args: &Args) -> Result<Report, Box<dyn std::error::Error>> {
    if args.accounts < 2 {
        return Err("--accounts must be at least 2".into());
    }
    let ledger = Arc::new(Ledger::new());
    let ids: Arc<Vec<String>> =
        Arc::new((0..args.accounts).map(|i| format!("acct-{i:04}")).collect());
    for id in ids.iter() {
        ledger.open_account(id.clone(), args.balance)?;
    }
    let expected_total = ledger.total();
    info!(
        accounts = args.accounts,
        threads = args.threads,
        transfers = args.transfers,
        seed = args.seed,
        "stress run starting"
    );

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.threads);
    for t in 0..args.threads {
        let ledger = Arc::clone(&ledger);
        let ids = Arc::clone(&ids);
        let (transfers, balance) = (args.transfers, args.balance);
        let seed = args.seed.wrapping_add(t as u64);
        let handle = thread::Builder::new()
            .name(format!("stress-{t}"))
            .spawn(move || worker(&ledger, &ids, transfers, balance, seed))?;
        handles.push(handle);
    }

    let mut report = Report::default();
    for handle in handles {
        match handle.join() {
            Ok(partial) => report.merge(partial),
            Err(_) => return Err("stress worker panicked".into()),
        }
    }
    report.elapsed_ms = started.elapsed().as_millis();
    report.expected_total = expected_total;
    report.actual_total = ledger.total();
    report.negative_accounts = ledger
        .accounts()
        .iter()
        .filter(|(_, balance)| *balance < 0)
        .count();
    Ok(report)
}

fn main() {
    let args = Args::parse();
    logging::init(args.log_format, "info");
    let report = match run(&args) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("error: cannot encode report: {err}"),
    }
    if !report.conserved() {
        warn!(
            expected = %report.expected_total,
            actual = %report.actual_total,
            negative = report.negative_accounts,
            "conservation violated"
        );
        std::process::exit(3);
    }
}
