use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use uuid::Uuid;

use anomalywatch::config::{Config, LogFormat};
use anomalywatch::detect::Engine;
use anomalywatch::entity::Priority;
use anomalywatch::scheduler::Tier;

#[derive(Parser)]
#[command(
    name = "anomalywatch",
    about = "Statistical anomaly detection for home-automation entities",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $ANOMALYWATCH_CONFIG, then /etc/anomalywatch/anomalywatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + tier scheduler)
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one tier immediately and print its report
    Check {
        /// priority, standard, baseline_refresh or report
        #[arg(long, default_value = "priority")]
        tier: Tier,
    },

    /// Rebuild every enabled baseline now
    Rebuild,

    /// List recent findings
    Findings {
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Only findings for this entity
        #[arg(long)]
        entity: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Report a finding as a false alarm
    FalseAlarm {
        id: Uuid,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Turn evaluation of one entity on or off
    Monitor { entity: String, state: Toggle },

    /// Turn all evaluation on or off
    Monitoring { state: Toggle },

    /// Show or change learning mode
    Learning {
        state: Option<Toggle>,

        /// Apply to one entity instead of globally
        #[arg(long)]
        entity: Option<String>,
    },

    /// Classify an entity from its current value without registering it
    Classify { entity: String },

    /// Manage monitored entities
    Entities {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Show tier schedule status
    Schedule,

    /// Run the engine over a recorded history file
    Replay {
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Log-summary reports
    Reports {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[derive(Subcommand)]
enum EntityAction {
    /// List registered entities
    List,

    /// Start monitoring an entity
    Add {
        entity: String,

        /// standard or priority
        #[arg(long, default_value = "standard")]
        priority: Priority,
    },

    /// Stop monitoring an entity
    Remove { entity: String },

    /// Remove an entity and keep configuration from re-adding it
    Ignore { entity: String },

    /// Classify an entity again and rebuild its baseline
    Reclassify { entity: String },
}

#[derive(Subcommand)]
enum ReportAction {
    /// List stored reports, newest first
    List {
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Summarize the host log now
    Generate,
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn engine(config: &Config) -> Result<Engine> {
    let engine = anomalywatch::open_engine(config).await?;
    engine.sync_configured().await?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config);
    config.validate()?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "starting anomalywatch daemon");
            anomalywatch::serve(config).await?;
        }
        Commands::Check { tier } => {
            let engine = engine(&config).await?;
            let report = engine.run_tier(tier).await?;
            print_json(&report)?;
        }
        Commands::Rebuild => {
            let engine = engine(&config).await?;
            let report = engine.run_tier(Tier::BaselineRefresh).await?;
            println!(
                "Rebuilt {} baselines ({} degraded, {} skipped, {} pruned).",
                report.rebuilt, report.degraded, report.skipped, report.pruned
            );
        }
        Commands::Findings { limit, entity, json } => {
            let engine = anomalywatch::open_engine(&config).await?;
            let findings = engine.findings().list_recent(limit, entity.as_deref()).await?;
            if json {
                print_json(&findings)?;
            } else if findings.is_empty() {
                println!("No findings.");
            } else {
                println!(
                    "{:<36} | {:<20} | {:<30} | {:<8} | {:>8} | Flags",
                    "ID", "Observed", "Entity", "Severity", "Score"
                );
                println!("{:-<36}-|-{:-<20}-|-{:-<30}-|-{:-<8}-|-{:->8}-|-{:-<10}", "", "", "", "", "", "");
                for f in findings {
                    let mut flags = Vec::new();
                    if f.suppressed {
                        flags.push("learning");
                    }
                    if f.false_positive {
                        flags.push("false-alarm");
                    }
                    println!(
                        "{:<36} | {:<20} | {:<30} | {:<8} | {:>8.2} | {}",
                        f.id.to_string(),
                        f.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                        f.entity_id,
                        f.severity.to_string(),
                        f.score,
                        flags.join(",")
                    );
                }
            }
        }
        Commands::FalseAlarm { id, reason } => {
            let engine = anomalywatch::open_engine(&config).await?;
            let outcome = engine.feedback().report_false_alarm(id, reason).await?;
            if outcome.adjusted {
                println!(
                    "Finding {} marked as a false alarm; {} sensitivity is now {:.2}.",
                    id, outcome.finding.entity_id, outcome.sensitivity
                );
            } else {
                println!("Finding {} was already marked as a false alarm.", id);
            }
        }
        Commands::Monitor { entity, state } => {
            let engine = anomalywatch::open_engine(&config).await?;
            let updated = engine
                .feedback()
                .report_monitoring_toggle(&entity, state.enabled())
                .await?;
            println!("{} monitoring {}.", updated.id, if updated.enabled { "enabled" } else { "disabled" });
        }
        Commands::Monitoring { state } => {
            let engine = anomalywatch::open_engine(&config).await?;
            engine.set_global_monitoring(state.enabled()).await?;
            println!("Global monitoring {}.", if state.enabled() { "enabled" } else { "disabled" });
        }
        Commands::Learning { state, entity } => {
            let engine = anomalywatch::open_engine(&config).await?;
            let status = match (state, entity) {
                (None, _) => engine.learning().status(),
                (Some(state), Some(entity)) => engine.set_entity_learning(&entity, state.enabled()).await?,
                (Some(state), None) => engine.set_learning(state.enabled()).await?,
            };
            print_json(&status)?;
        }
        Commands::Classify { entity } => {
            let engine = anomalywatch::open_engine(&config).await?;
            let kind = engine.classify(&entity).await?;
            println!("{entity}: {kind}");
        }
        Commands::Entities { action } => {
            let engine = anomalywatch::open_engine(&config).await?;
            match action {
                EntityAction::List => {
                    let entities = engine.registry().all();
                    if entities.is_empty() {
                        println!("No entities registered.");
                    } else {
                        println!(
                            "{:<40} | {:<11} | {:<8} | {:<10} | {:<7} | Baseline",
                            "Entity", "Kind", "Priority", "Origin", "Enabled"
                        );
                        println!("{:-<40}-|-{:-<11}-|-{:-<8}-|-{:-<10}-|-{:-<7}-|-{:-<30}", "", "", "", "", "", "");
                        for e in entities {
                            let baseline = match (&e.unsuitable, engine.store().get(&e.id)) {
                                (Some(reason), _) => format!("unsuitable: {reason}"),
                                (None, Some(b)) => b.summary(),
                                (None, None) => "cold".to_string(),
                            };
                            println!(
                                "{:<40} | {:<11} | {:<8} | {:<10} | {:<7} | {}",
                                e.id,
                                e.kind.to_string(),
                                e.priority.to_string(),
                                e.origin.to_string(),
                                e.enabled,
                                baseline
                            );
                        }
                    }
                }
                EntityAction::Add { entity, priority } => {
                    let added = engine.add_entity(&entity, priority).await?;
                    println!("Entity '{}' added as {} ({}).", added.id, added.kind, added.priority);
                }
                EntityAction::Remove { entity } => {
                    engine.remove_entity(&entity).await?;
                    println!("Entity '{entity}' removed.");
                }
                EntityAction::Ignore { entity } => {
                    engine.ignore_entity(&entity).await?;
                    println!("Entity '{entity}' ignored.");
                }
                EntityAction::Reclassify { entity } => {
                    let updated = engine.reclassify(&entity).await?;
                    println!("Entity '{}' is now {}.", updated.id, updated.kind);
                }
            }
        }
        Commands::Schedule => {
            let engine = anomalywatch::open_engine(&config).await?;
            let now = chrono::Utc::now();
            println!("{:<17} | {:<22} | {:<20} | Last outcome", "Tier", "Cadence", "Next due");
            println!("{:-<17}-|-{:-<22}-|-{:-<20}-|-{:-<30}", "", "", "", "");
            for s in engine.schedule().snapshot(now) {
                println!(
                    "{:<17} | {:<22} | {:<20} | {}",
                    s.tier.to_string(),
                    s.cadence,
                    s.next_due.format("%Y-%m-%d %H:%M:%S").to_string(),
                    s.last_outcome.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Replay { file, json } => {
            let outcome = anomalywatch::replay::replay(&config, &file).await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Replayed {} entities ({} baselines built).",
                    outcome.entities.len(),
                    outcome.baselines
                );
                for f in &outcome.findings {
                    println!(
                        " - {} {} score={:.2} ({})",
                        f.entity_id, f.severity, f.score, f.baseline_summary
                    );
                }
                if outcome.findings.is_empty() {
                    println!("No anomalies found.");
                }
            }
        }
        Commands::Reports { action } => {
            let engine = anomalywatch::open_engine(&config).await?;
            match action {
                ReportAction::List { limit } => {
                    let reports = engine.reports().list(limit).await?;
                    if reports.is_empty() {
                        println!("No reports yet.");
                    }
                    for r in reports {
                        println!("=== Report {} ({}) ===", r.id, r.created_at.format("%Y-%m-%d %H:%M:%S"));
                        println!("{}\n", r.report);
                    }
                }
                ReportAction::Generate => {
                    let report = engine.run_tier(Tier::Report).await?;
                    print_json(&report)?;
                }
            }
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
