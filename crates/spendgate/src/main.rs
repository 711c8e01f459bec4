//! Inspect and exercise a spendgate budget from the command line.
//!
//! Reads configuration from `spendgate.json` in the working directory unless
//! `--config` points elsewhere. Logs go to stderr at `info`; `--verbose`
//! raises that to `debug` and `RUST_LOG` overrides both.
//!
//! # Examples
//!
//! ```sh
//! # Current spend and remaining budget
//! spendgate status
//!
//! # Charge 1000 tokens of gpt-4o-mini
//! spendgate record --tokens 1000 --model gpt-4o-mini
//!
//! # Which model would a prompt get?
//! spendgate select --text "Summarize this document..."
//!
//! # Start a new budget period
//! spendgate reset
//!
//! # Load test: 200 calls, 16 in flight, first 2 attempts of each rate limited
//! spendgate simulate --calls 200 --concurrency 16 --rate-limited 2 --tokens 500
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use spendgate::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Rate-limited, budget-aware call dispatcher.
#[derive(Parser)]
#[command(name = "spendgate")]
struct Cli {
    /// Path to a JSON config file (missing file = defaults)
    #[arg(long, default_value = "spendgate.json")]
    config: PathBuf,

    /// Override the budget record location
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Override the budget ceiling in USD
    #[arg(long)]
    budget: Option<f64>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print spend, call count and remaining budget
    Status,

    /// Charge token usage for a model
    Record {
        /// Tokens consumed
        #[arg(long)]
        tokens: u64,

        /// Model the tokens were consumed on
        #[arg(long)]
        model: String,
    },

    /// Show which model a call would be routed to
    Select {
        /// Prompt text to estimate tokens from
        #[arg(long, conflicts_with = "tokens", required_unless_present = "tokens")]
        text: Option<String>,

        /// Explicit token estimate
        #[arg(long)]
        tokens: Option<u64>,
    },

    /// Start a new budget period (zero the ledger)
    Reset,

    /// Run concurrent dispatches against a simulated rate-limited backend
    Simulate {
        /// Number of dispatches
        #[arg(long, default_value_t = 50)]
        calls: u32,

        /// Dispatches in flight at once
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Attempts of each call that are rate limited before it succeeds
        #[arg(long, default_value_t = 1)]
        rate_limited: u32,

        /// Tokens each successful call reports
        #[arg(long, default_value_t = 500)]
        tokens: u64,

        /// Sleep for the configured backoff instead of retrying immediately
        #[arg(long)]
        real_delays: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<DispatcherConfig> {
    let mut config = DispatcherConfig::load(&cli.config)?;
    if let Some(ledger) = &cli.ledger {
        config.ledger_path = ledger.clone();
    }
    if let Some(budget) = cli.budget {
        config.default_budget = budget;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: &Cli) -> Result<String> {
    let config = load_config(cli)?;
    let budget = config.default_budget;

    match &cli.command {
        Command::Status => {
            let ledger = config.build_ledger()?;
            let record = ledger.load();
            Ok(format!(
                "ledger: {}\n{}\n",
                ledger.path().display(),
                record.summary(budget)
            ))
        }

        Command::Record { tokens, model } => {
            let ledger = config.build_ledger()?;
            let (record, cost) = ledger.record_usage(*tokens, model)?;
            Ok(format!(
                "charged ${cost:.4} for {tokens} tokens on {model}\n{}\n",
                record.summary(budget)
            ))
        }

        Command::Select { text, tokens } => {
            let estimated = match (tokens, text) {
                (Some(tokens), _) => *tokens,
                (None, Some(text)) => estimate_tokens(text),
                (None, None) => 0,
            };
            let ledger = config.build_ledger()?;
            let selector = config.build_selector()?;
            let remaining = ledger.remaining(budget);
            let selection = selector.select(estimated, remaining);
            Ok(format!(
                "model: {}\nrule: {}\nestimated tokens: {estimated}\nestimated cost: ${:.4}\nremaining: ${remaining:.4}\n",
                selection.model, selection.rule, selection.estimated_cost,
            ))
        }

        Command::Reset => {
            let ledger = config.build_ledger()?;
            let record = ledger.reset()?;
            Ok(format!(
                "reset {}\n{}\n",
                ledger.path().display(),
                record.summary(budget)
            ))
        }

        Command::Simulate {
            calls,
            concurrency,
            rate_limited,
            tokens,
            real_delays,
        } => {
            let mut config = config;
            if !real_delays {
                config.retry = RetryConfig::no_delay(config.retry.max_retries);
            }
            simulate(&config, *calls, *concurrency, *rate_limited, *tokens).await
        }
    }
}

async fn simulate(
    config: &DispatcherConfig,
    calls: u32,
    concurrency: usize,
    rate_limited: u32,
    tokens: u64,
) -> Result<String> {
    let dispatcher = Arc::new(config.build_dispatcher()?);
    let before = dispatcher.ledger().load();
    let start = Instant::now();

    let reports: Vec<Result<DispatchReport<u32>>> = futures::stream::iter(0..calls)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher
                    .dispatch_with(tokens, None, move |attempt| async move {
                        if attempt.attempt < rate_limited {
                            Err(CallError::RateLimited(format!(
                                "simulated HTTP 429 for call {i}"
                            )))
                        } else {
                            Ok(CallResponse::new(i, tokens))
                        }
                    })
                    .await
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut succeeded = 0;
    let mut degraded = 0;
    for report in reports {
        if report?.is_degraded() {
            degraded += 1;
        } else {
            succeeded += 1;
        }
    }

    let after = dispatcher.ledger().load();
    Ok(format!(
        "dispatched {calls} call(s) in {:.2}s: {succeeded} succeeded, {degraded} degraded\ncharged ${:.4} over {} call(s)\n{}\n",
        start.elapsed().as_secs_f64(),
        after.spent - before.spent,
        after.calls - before.calls,
        after.summary(config.default_budget),
    ))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
