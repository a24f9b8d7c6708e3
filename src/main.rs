//! maat CLI: self-correcting temporal fact graph.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use maat::config::MaatConfig;
use maat::engine::{CancelToken, HealingEngine};
use maat::ingest::FactInput;
use maat::observe;
use maat::store::mem::MemStore;
use maat::store::metrics_log::MetricsLog;

#[derive(Parser)]
#[command(name = "maat", version, about = "Self-correcting temporal fact graph")]
struct Cli {
    /// Path to a maat.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the durable metrics history.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest facts and report detected conflicts without healing.
    Check {
        /// Path to a JSON array of facts.
        #[arg(long)]
        facts: PathBuf,
    },

    /// Ingest facts and run one full detect-heal-observe cycle.
    Heal {
        /// Path to a JSON array of facts.
        #[arg(long)]
        facts: PathBuf,

        /// Override the oracle URL and enable the oracle.
        #[arg(long)]
        oracle_url: Option<String>,
    },

    /// Ingest facts, then run healing cycles on an interval until Ctrl-C.
    Run {
        /// Path to a JSON array of facts.
        #[arg(long)]
        facts: PathBuf,

        /// Seconds between cycles.
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show the recorded metrics history.
    Metrics {
        /// Only show snapshots taken at or after this epoch timestamp.
        #[arg(long, default_value = "0")]
        since: u64,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MaatConfig::load(path)?,
        None => MaatConfig::default(),
    };

    let metrics = match &cli.data_dir {
        Some(dir) => MetricsLog::open(dir)?,
        None => MetricsLog::in_memory(),
    };

    match cli.command {
        Commands::Check { facts } => {
            let engine = HealingEngine::new(Arc::new(MemStore::new()), config, metrics);
            ingest_file(&engine, &facts)?;
            let conflicts = engine.run_detection_cycle()?;
            if conflicts.is_empty() {
                println!("No conflicts detected.");
            } else {
                println!("Conflicts ({}):", conflicts.len());
                for c in &conflicts {
                    println!(
                        "  {} [{}] {} facts, severity {}",
                        c.id,
                        c.strategy,
                        c.facts.len(),
                        c.severity
                    );
                }
            }
        }

        Commands::Heal { facts, oracle_url } => {
            let mut config = config;
            if let Some(url) = oracle_url {
                config.oracle.base_url = url;
                config.oracle.enabled = true;
            }
            let engine = HealingEngine::new(Arc::new(MemStore::new()), config, metrics);
            ingest_file(&engine, &facts)?;
            let report = engine.run_full_cycle()?;
            println!(
                "Detected {} conflicts: {} healed, {} skipped, {} failed",
                report.conflicts_detected,
                report.healing.healed,
                report.healing.skipped,
                report.healing.failed
            );
            println!(
                "Tokens used: {} (${:.4})",
                report.healing.tokens_used, report.healing.cost_usd
            );
            print_snapshot(&report.metrics);

            let risks = observe::high_risk_nodes(engine.store().as_ref())?;
            if !risks.is_empty() {
                println!("High-risk entities:");
                for row in &risks {
                    println!(
                        "  \"{}\" / {} changes={} avg_confidence={:.2}",
                        row.name, row.entity, row.change_count, row.average_confidence
                    );
                }
            }
        }

        Commands::Run { facts, interval } => {
            let mut config = config;
            if let Some(secs) = interval {
                config.cycle.interval_secs = secs;
            }
            config.validate()?;
            let engine = HealingEngine::new(Arc::new(MemStore::new()), config, metrics);
            ingest_file(&engine, &facts)?;

            let token = CancelToken::new();
            for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                signal_hook::flag::register(sig, token.flag()).into_diagnostic()?;
            }

            println!(
                "Running healing cycles every {}s (Ctrl-C to stop)...",
                engine.config().cycle.interval_secs
            );
            let cycles = engine.run_loop(&token)?;
            println!("Stopped after {cycles} cycles.");
        }

        Commands::Metrics { since } => {
            let history = metrics.range(since, u64::MAX)?;
            if history.is_empty() {
                println!("No metrics recorded.");
            } else {
                for snapshot in &history {
                    print_snapshot(snapshot);
                }
            }
        }
    }

    Ok(())
}

fn ingest_file(engine: &HealingEngine, path: &PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(path).into_diagnostic()?;
    let inputs: Vec<FactInput> = serde_json::from_str(&content).into_diagnostic()?;
    let results = engine.ingest(&inputs);
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results.len() - ok;
    if rejected > 0 {
        println!(
            "Ingested {ok} facts from {} ({rejected} rejected)",
            path.display()
        );
    } else {
        println!("Ingested {ok} facts from {}", path.display());
    }
    Ok(())
}

fn print_snapshot(snapshot: &maat::fact::MetricsSnapshot) {
    println!(
        "[{}] entities={} facts={} conflicted={} resolved={} open={} unstable={} accuracy={:.3} avg_confidence={:.2} tokens={} cost=${:.4}",
        snapshot.timestamp,
        snapshot.total_entities,
        snapshot.total_facts,
        snapshot.conflicted_entities,
        snapshot.resolved_conflicts,
        snapshot.unresolved_conflicts,
        snapshot.unstable_entities,
        snapshot.data_accuracy_score,
        snapshot.average_confidence,
        snapshot.total_tokens_used,
        snapshot.total_healing_cost
    );
}
