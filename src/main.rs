mod config;
mod console;
mod models;
mod queue;
mod session;
mod store;
mod tally;
mod tasks;
mod view;

#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use console::{ConsoleCommand, HELP, parse_line};
use log::{error, info};
use models::BallotType;
use session::ObserverSession;
use std::sync::Arc;
use store::CounterStore;
use tally::render_summary;
use tokio::io::{AsyncBufReadExt, BufReader};
use view::{ResultsView, ViewPhase};

type AppResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "election-tally", about = "Live vote tallies for the village and mayor races")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enter vote counts from a polling station
    Observe {
        #[arg(long, short)]
        village: i32,
        #[arg(long, short, value_enum, default_value_t = BallotArg::Mayor)]
        ballot: BallotArg,
    },
    /// Show live results, reprinting on every change
    Dashboard {
        #[arg(long)]
        json: bool,
    },
    /// Zero every counter
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BallotArg {
    Mayor,
    Member,
}

impl From<BallotArg> for BallotType {
    fn from(arg: BallotArg) -> Self {
        match arg {
            BallotArg::Mayor => BallotType::Mayor,
            BallotArg::Member => BallotType::Member,
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let store = store::connect(&config).await;

    let outcome = match cli.command {
        Command::Observe { village, ballot } => run_observer(store, &config, village, ballot.into()).await,
        Command::Dashboard { json } => run_dashboard(store, json).await,
        Command::Reset { yes } => run_reset(store, yes).await,
    };

    if let Err(why) = outcome {
        error!("{}", why);
        std::process::exit(1);
    }
}

async fn run_observer(store: Arc<dyn CounterStore>, config: &Config, village: i32, ballot: BallotType) -> AppResult<()> {
    let mut session = ObserverSession::start(store, village, ballot, config.flush_interval).await?;
    println!("Observing village {} ({} ballot). Type `help` for commands.", village, ballot);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(ConsoleCommand::Tap { candidate_number, delta }) => match session.tap(candidate_number, delta) {
                Ok(key) => println!(
                    "{:+} -> {} ({:+} pending, {} stored)",
                    delta,
                    key,
                    session.pending_for(candidate_number),
                    session.current_votes(candidate_number)
                ),
                Err(e) => println!("{}", e),
            },
            Ok(ConsoleCommand::SelectVillage(village)) => match session.select_village(village) {
                Ok(()) => println!("Now observing village {}", village),
                Err(e) => println!("{}", e),
            },
            Ok(ConsoleCommand::SelectBallot(ballot)) => match session.select_ballot(ballot) {
                Ok(()) => println!("Now entering the {} ballot", ballot),
                Err(e) => println!("{}", e),
            },
            Ok(ConsoleCommand::Status) => print_status(&session),
            Ok(ConsoleCommand::Help) => println!("{}", HELP),
            Ok(ConsoleCommand::Quit) => break,
            Err(message) => println!("{}", message),
        }
    }

    session.shutdown().await;
    Ok(())
}

fn print_status(session: &ObserverSession) {
    let snapshot = session.snapshot();
    println!(
        "Village {} / {} ballot, last updated {}",
        session.village_number(),
        session.ballot_type(),
        snapshot
            .last_updated
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );

    let pending = session.pending();
    if pending.is_empty() {
        println!("Nothing waiting to be sent.");
    } else {
        println!("Sending... ({} entries)", pending.len());
        for (key, delta) in pending {
            println!("  {}: {:+}", key, delta);
        }
    }

    for (key, votes) in snapshot.tallies.iter() {
        if key.village_number == session.village_number() && key.ballot_type == session.ballot_type() {
            println!("  #{}: {} votes", key.candidate_number, (*votes).max(0));
        }
    }
}

async fn run_dashboard(store: Arc<dyn CounterStore>, json: bool) -> AppResult<()> {
    let view = ResultsView::activate(store).await;
    let mut updates = view.watch();
    info!("Dashboard running; press Ctrl-C to stop");

    loop {
        {
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.phase == ViewPhase::Inactive {
                break;
            }
            if json {
                println!("{}", serde_json::to_string(&*snapshot.results)?);
            } else {
                let updated = snapshot
                    .last_updated
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "=== Results #{} (last updated {}) ===\n{}",
                    snapshot.refreshes,
                    updated,
                    render_summary(&snapshot.results)
                );
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    view.deactivate().await;
    Ok(())
}

async fn run_reset(store: Arc<dyn CounterStore>, yes: bool) -> AppResult<()> {
    if !yes {
        return Err("Refusing to reset all vote counts without --yes".into());
    }
    store.reset_all().await?;
    info!("All vote counts reset to zero");
    Ok(())
}
