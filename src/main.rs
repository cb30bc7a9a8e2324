use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cadence_core::config::AppConfig;
use cadence_core::event::EventBus;
use cadence_core::traits::MessageSender;
use cadence_core::types::{EnrollmentId, Scenario, ScenarioId, SubjectId};
use cadence_engine::{ActionDispatcher, Engine, EventLog, LogSender, TickLoop, WebhookSender};
use cadence_graph::NodeGraph;
use cadence_store::SqliteStore;

#[derive(Parser)]
#[command(name = "cadence", version, about = "Timed journey scenarios for subjects")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Serve,
    /// Advance every due enrollment once and exit
    Tick,
    /// Show current configuration
    Config,
    /// Manage scenarios
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },
    /// Enroll a subject into a scenario
    Enroll { scenario: String, subject: String },
    /// Feed a triggering event
    Event {
        #[command(subcommand)]
        event: EventAction,
    },
    /// Exit a subject from every active scenario
    ExitAll {
        subject: String,
        #[arg(long, default_value = "manual exit")]
        reason: String,
    },
    /// Move an active enrollment to another step
    Jump { enrollment: i64, step: usize },
    /// Show a subject's enrollments
    Status { subject: String },
    /// Record a visit used by behavioral rules
    Visit {
        subject: String,
        /// Purchase amount of the visit
        #[arg(long, default_value = "0")]
        amount: f64,
        /// Count the visit as a reorder
        #[arg(long)]
        reorder: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// Import (insert or replace) a scenario from a JSON file
    Import { file: PathBuf },
    /// List stored scenarios
    List,
    /// Print a scenario's steps as a node graph
    ExportGraph {
        id: String,
        /// Previous graph whose node positions are kept
        #[arg(long)]
        layout: Option<PathBuf>,
    },
    /// Replace a scenario's steps with an edited node graph
    ImportGraph { id: String, file: PathBuf },
}

#[derive(Subcommand)]
enum EventAction {
    /// The subject became eligible
    Eligible { subject: String },
    /// The subject sent a message
    Keyword { subject: String, text: String },
    /// A tag was assigned to the subject
    Tag { subject: String, tag: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cadence=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cadence", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.store_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Arc::new(SqliteStore::open(&db_path)?);

    let sender: Arc<dyn MessageSender> = match WebhookSender::from_config(&config.delivery)? {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(LogSender),
    };
    let events = Arc::new(EventBus::default());
    let engine = Arc::new(Engine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        ActionDispatcher::new(sender, store.clone()),
        &config.scheduler,
        events.clone(),
    )?);

    match cli.command {
        Commands::Serve => {
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down scheduler...");
                cancel_clone.cancel();
            });

            let event_log = tokio::spawn(EventLog::new(events.subscribe(), cancel.clone()).run());

            let interval = Duration::from_secs(config.scheduler.tick_interval_secs);
            TickLoop::new(engine, interval, cancel).run().await;
            let logged = event_log.await.unwrap_or_default();
            info!(events = logged, "Scheduler stopped");
        }
        Commands::Tick => {
            let report = engine.tick().await?;
            println!(
                "due: {}, advanced: {}, conflicts: {}, action failures: {}, errors: {}",
                report.due, report.advanced, report.conflicts, report.action_failures, report.errors
            );
        }
        Commands::Scenario { action } => handle_scenario(&engine, action).await?,
        Commands::Enroll { scenario, subject } => {
            let outcome = engine
                .enroll(&ScenarioId(scenario), &SubjectId(subject))
                .await?;
            println!("{:?}", outcome);
        }
        Commands::Event { event } => match event {
            EventAction::Eligible { subject } => {
                let outcomes = engine.on_eligible(&SubjectId(subject)).await?;
                print_outcomes(&outcomes);
            }
            EventAction::Keyword { subject, text } => {
                let outcomes = engine.on_keyword(&SubjectId(subject), &text).await?;
                print_outcomes(&outcomes);
            }
            EventAction::Tag { subject, tag } => {
                let outcome = engine.on_tag_assigned(&SubjectId(subject), &tag).await?;
                print_outcomes(&outcome.enrolled);
                for id in outcome.jumped {
                    println!("jumped enrollment {}", id);
                }
            }
        },
        Commands::ExitAll { subject, reason } => {
            let changed = engine.exit_all(&SubjectId(subject), &reason).await?;
            println!("exited {} enrollment(s)", changed);
        }
        Commands::Jump { enrollment, step } => {
            if engine.jump_to(EnrollmentId(enrollment), step).await? {
                println!("enrollment {} moved to step {}", enrollment, step);
            } else {
                println!("enrollment {} is not active", enrollment);
            }
        }
        Commands::Status { subject } => {
            let enrollments = engine.subject_enrollments(&SubjectId(subject)).await?;
            if enrollments.is_empty() {
                println!("No enrollments.");
            }
            for e in enrollments {
                let due = e
                    .next_fire_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>6}  {:<24} step {:<3} {:<10} due {}{}",
                    e.id.0,
                    e.scenario_id.as_str(),
                    e.current_step,
                    e.status.as_str(),
                    due,
                    e.exit_reason
                        .map(|r| format!("  ({})", r))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Visit {
            subject,
            amount,
            reorder,
        } => {
            store.record_visit(&SubjectId(subject), chrono::Utc::now(), amount, reorder)?;
        }
        Commands::Completions { .. } | Commands::Config => {}
    }

    Ok(())
}

/// Load the config file, or fall back to defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    let config = AppConfig::default();
    config.validate()?;
    Ok(config)
}

async fn handle_scenario(engine: &Engine, action: ScenarioAction) -> anyhow::Result<()> {
    match action {
        ScenarioAction::Import { file } => {
            let scenario: Scenario = serde_json::from_str(&read(&file)?)
                .with_context(|| format!("parsing scenario {}", file.display()))?;
            engine.save_scenario(&scenario).await?;
            println!("imported scenario {} ({} steps)", scenario.id, scenario.steps.len());
        }
        ScenarioAction::List => {
            let scenarios = engine.list_scenarios().await?;
            if scenarios.is_empty() {
                println!("No scenarios.");
            }
            for s in scenarios {
                println!(
                    "{:<24} {:<8} {:>3} steps  {}",
                    s.id.as_str(),
                    if s.enabled { "enabled" } else { "disabled" },
                    s.steps.len(),
                    s.name
                );
            }
        }
        ScenarioAction::ExportGraph { id, layout } => {
            let scenario = engine.load_scenario(&ScenarioId(id)).await?;
            let graph = match layout {
                Some(path) => {
                    let previous: NodeGraph = serde_json::from_str(&read(&path)?)
                        .with_context(|| format!("parsing graph {}", path.display()))?;
                    cadence_graph::encode_preserving(&scenario.steps, &previous)
                }
                None => cadence_graph::encode(&scenario.steps),
            };
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        ScenarioAction::ImportGraph { id, file } => {
            let graph: NodeGraph = serde_json::from_str(&read(&file)?)
                .with_context(|| format!("parsing graph {}", file.display()))?;
            let mut scenario = engine.load_scenario(&ScenarioId(id)).await?;
            scenario.steps = cadence_graph::decode(&graph)?;
            engine.save_scenario(&scenario).await?;
            println!("updated scenario {} ({} steps)", scenario.id, scenario.steps.len());
        }
    }
    Ok(())
}

fn print_outcomes(outcomes: &cadence_engine::TriggerOutcomes) {
    if outcomes.is_empty() {
        println!("No scenario matched.");
    }
    for (scenario, outcome) in outcomes {
        println!("{}: {:?}", scenario, outcome);
    }
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}
