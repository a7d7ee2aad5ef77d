use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use steward::audit::AuditLog;
use steward::config::Settings;
use steward::health::HealthVerifier;
use steward::orchestrator::Orchestrator;
use steward::policy::Mode;
use steward::state::StateStore;

#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(about = "Single-node self-upgrade orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate runtime configuration.
    Doctor,
    /// Run one upgrade cycle (invoked by the external scheduler).
    Run {
        /// One-shot channel override; never persisted.
        #[arg(long, value_parser = parse_mode)]
        mode: Option<Mode>,
    },
    /// Run the deferred post-upgrade health check.
    Verify {
        /// Seconds to wait before probing.
        #[arg(long, default_value_t = 0)]
        delay: u64,
        #[arg(long, default_value_t = 1)]
        attempt: u32,
    },
    /// Show persisted orchestrator state as JSON.
    Status,
    /// Inspect or set the persisted update channel.
    Mode {
        #[command(subcommand)]
        command: ModeCommands,
    },
    /// Inspect or clear the quarantined-revision list.
    Skiplist {
        #[command(subcommand)]
        command: SkiplistCommands,
    },
    /// Audit log operations.
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ModeCommands {
    /// Print the persisted channel.
    Show,
    /// Persist a channel for future cycles.
    Set {
        #[arg(value_parser = parse_mode)]
        mode: Mode,
    },
}

#[derive(Subcommand, Debug)]
enum SkiplistCommands {
    /// Print quarantined revisions, one per line.
    Show,
    /// Operator action: drop every quarantined revision.
    Clear,
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    /// Check the audit log hash chain.
    Verify,
}

#[derive(Debug, serde::Serialize)]
struct StatusReport {
    mode: Mode,
    skip_list: Vec<String>,
    net_failure_count: u64,
    failover: Option<steward::state::FailoverRecord>,
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command.unwrap_or(Commands::Doctor) {
        Commands::Doctor => {
            let report = settings.doctor_report();
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed encoding doctor report")?
            );
        }
        Commands::Run { mode } => {
            let result = Orchestrator::new(settings).run_cycle(mode)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("failed encoding cycle result")?
            );
        }
        Commands::Verify { delay, attempt } => {
            let store = StateStore::new(&settings.state_dir)?;
            let verifier = HealthVerifier::new(&store, &settings);
            let outcome = verifier.run_scheduled(delay, attempt)?;
            println!(
                "{}",
                serde_json::to_string(&outcome).context("failed encoding check outcome")?
            );
        }
        Commands::Status => {
            let store = StateStore::new(&settings.state_dir)?;
            let report = StatusReport {
                mode: store.mode(),
                skip_list: store.skip_list(),
                net_failure_count: store.net_failure_count(),
                failover: store.failover(),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed encoding status report")?
            );
        }
        Commands::Mode { command } => {
            let store = StateStore::new(&settings.state_dir)?;
            match command {
                ModeCommands::Show => println!("{}", store.mode().as_str()),
                ModeCommands::Set { mode } => {
                    store.set_mode(mode)?;
                    println!("{}", mode.as_str());
                }
            }
        }
        Commands::Skiplist { command } => {
            let store = StateStore::new(&settings.state_dir)?;
            match command {
                SkiplistCommands::Show => {
                    for revision in store.skip_list() {
                        println!("{}", revision);
                    }
                }
                SkiplistCommands::Clear => {
                    let removed = store.clear_skip_list()?;
                    println!("cleared {} quarantined revision(s)", removed);
                }
            }
        }
        Commands::Audit { command } => match command {
            AuditCommands::Verify => {
                let log = AuditLog::new(&settings.state_dir);
                let report = log.verify()?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report)
                        .context("failed encoding audit report")?
                );
            }
        },
    }

    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

fn parse_mode(value: &str) -> std::result::Result<Mode, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "latest" => Ok(Mode::Latest),
        "stable" => Ok(Mode::Stable),
        other => Err(format!("invalid mode '{other}', expected latest|stable")),
    }
}
