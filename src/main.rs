use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_core::catalog::CatalogFile;
use fleet_core::config::AppConfig;
use fleet_core::run::{RunStatus, SequenceRun};
use fleet_core::types::{Context, Event, OrgId, RunId, UserId};

use fleet_engine::{
    CompletionBroker, Dispatcher, DispatchingExecutor, EventOutcome, Fleet, HttpTransport,
    SkillRegistry, WebhookNotifier,
};
use fleet_store::SqliteStore;

#[derive(Parser)]
#[command(name = "fleet", version, about = "Event-driven sequence orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway and the handoff worker
    Serve,
    /// Load routes, sequences, handoffs and preferences into the database
    Import {
        /// Catalog file (TOML)
        catalog: PathBuf,
    },
    /// Check a catalog file without writing anything
    Validate {
        /// Catalog file (TOML)
        catalog: PathBuf,
    },
    /// Handle one event and print the runs it started
    Submit {
        /// Event type, e.g. meeting.ended
        event_type: String,
        /// Org the event belongs to
        #[arg(long)]
        org: OrgId,
        /// JSON object payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        user: Option<UserId>,
        /// Idempotency key; defaults to a hash of the payload
        #[arg(long)]
        dedup_key: Option<String>,
        /// Run a specific sequence version
        #[arg(long)]
        version: Option<u32>,
    },
    /// Show a run
    Run {
        run_id: String,
        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent runs
    Runs {
        /// Filter by status (running, awaiting_approval, failed, ...)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Approve a step parked on a human decision
    Approve { run_id: String, step: String },
    /// Reject a step parked on a human decision
    Reject { run_id: String, step: String },
    /// Cancel a run
    Cancel { run_id: String },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions and validation before config loading
    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "fleet", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { catalog } => return validate_catalog(catalog),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Import { catalog } => {
            let file = CatalogFile::load(&catalog)?;
            for warning in file.validate()? {
                warn!("{}", warning);
            }
            let store = SqliteStore::open(&config.database_path())?;
            let summary = file.apply(&store)?;
            for (key, scope, version) in &summary.sequences {
                println!("sequence  {:<32} {:<44} v{}", key, scope, version);
            }
            println!(
                "Imported {} sequences, {} routes, {} handoffs, {} preferences, {} org settings",
                summary.sequences.len(),
                summary.routes,
                summary.handoffs,
                summary.preferences,
                summary.org_settings
            );
        }
        Commands::Submit {
            event_type,
            org,
            payload,
            user,
            dedup_key,
            version,
        } => {
            let value: serde_json::Value = serde_json::from_str(&payload)?;
            if !value.is_object() {
                anyhow::bail!("--payload must be a JSON object");
            }
            let mut event = Event::new(event_type, org, Context::from_value(value));
            if let Some(user) = user {
                event = event.with_user(user);
            }
            if let Some(key) = dedup_key {
                event = event.with_dedup_key(key);
            }
            if let Some(version) = version {
                event = event.pin_version(version);
            }

            let fleet = build_fleet(&config)?;
            let shutdown = CancellationToken::new();
            let worker = fleet.spawn_handoff_worker(shutdown.clone());
            let outcome = fleet.handle_event(event).await?;
            print_outcome(&outcome);
            shutdown.cancel();
            worker.await.ok();
        }
        Commands::Run { run_id, json } => {
            let fleet = build_fleet(&config)?;
            let run = fleet.run(&RunId::from_string(&run_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&run);
            }
        }
        Commands::Runs { status, limit } => {
            let status = status.map(|s| parse_status(&s)).transpose()?;
            let fleet = build_fleet(&config)?;
            let runs = fleet.list_runs(status, limit)?;
            if runs.is_empty() {
                println!("No runs.");
            }
            for run in runs {
                println!(
                    "{:<38} {:<24} v{:<3} {:<18} {}",
                    run.run_id.to_string(),
                    run.sequence_key,
                    run.version,
                    run.status.to_string(),
                    run.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Approve { run_id, step } => {
            let fleet = build_fleet(&config)?;
            let run = fleet.approve(&RunId::from_string(&run_id), &step).await?;
            print_run(&run);
        }
        Commands::Reject { run_id, step } => {
            let fleet = build_fleet(&config)?;
            let run = fleet.reject(&RunId::from_string(&run_id), &step).await?;
            print_run(&run);
        }
        Commands::Cancel { run_id } => {
            let fleet = build_fleet(&config)?;
            let run = fleet.cancel(&RunId::from_string(&run_id)).await?;
            print_run(&run);
        }
        Commands::Completions { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".fleet").join("config.toml"));
    match home_config {
        Some(ref home) if home.exists() => {
            info!(path = %home.display(), "Loading config from home directory");
            Ok(AppConfig::load(home)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn validate_catalog(path: &Path) -> anyhow::Result<()> {
    let file = CatalogFile::load(path)?;
    let warnings = file.validate()?;
    for warning in &warnings {
        println!("warning: {}", warning);
    }
    println!(
        "{}: {} sequences, {} routes, {} handoffs OK",
        path.display(),
        file.sequences.len(),
        file.routes.len(),
        file.handoffs.len()
    );
    Ok(())
}

/// Wire the store, remote skill dispatch and notifications into a `Fleet`.
fn build_fleet(config: &AppConfig) -> anyhow::Result<Arc<Fleet>> {
    let store = Arc::new(SqliteStore::open(&config.database_path())?);
    let completions = Arc::new(CompletionBroker::new());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(HttpTransport::new()),
        config.dispatch.retry.clone(),
    ));
    let remote = DispatchingExecutor::new(dispatcher, completions.clone(), config.dispatch.clone());
    let skills = SkillRegistry::new().with_fallback(Arc::new(remote));

    let mut builder = Fleet::builder(
        config.engine.clone(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(skills),
    )
    .completions(completions);

    let webhooks = WebhookNotifier::new(&config.notifications);
    if !webhooks.is_empty() {
        builder = builder.notifier(Arc::new(webhooks));
    }

    Ok(Arc::new(builder.build()))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let fleet = build_fleet(&config)?;
    let resumed = fleet.recover().await?;
    info!(resumed, "Recovery complete");

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    let worker = fleet.spawn_handoff_worker(cancel.clone());

    // Debounce records older than the longest window can never suppress again
    let retention = config
        .engine
        .debounce_window()
        .max(config.engine.handoff_cooldown())
        .max(Duration::from_secs(60));
    let purge_fleet = fleet.clone();
    let purge_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(retention);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = purge_fleet.purge_debounce(retention) {
                        error!(error = %e, "Debounce purge failed");
                    }
                }
                _ = purge_cancel.cancelled() => break,
            }
        }
    });

    let gateway_config = config.gateway.clone().unwrap_or_default();
    info!(bind = %gateway_config.bind, "Starting gateway");
    let server = fleet_gateway::GatewayServer::new(gateway_config, fleet);
    let result = server.run(cancel.clone()).await;

    cancel.cancel();
    worker.await.ok();
    result
}

fn parse_status(s: &str) -> anyhow::Result<RunStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| anyhow::anyhow!("unknown run status: {}", s))
}

fn print_outcome(outcome: &EventOutcome) {
    let disposition = serde_json::to_value(outcome.disposition)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();
    println!("Event {}: {}", outcome.event_id, disposition);
    for run in &outcome.runs {
        println!();
        print_run(run);
    }
}

fn print_run(run: &SequenceRun) {
    println!(
        "Run {} ({} v{}) status={} channel={}",
        run.run_id, run.sequence_key, run.version, run.status, run.channel
    );
    if let Some(failure) = &run.failure {
        println!("  failure: {}", failure);
    }
    for step in &run.steps {
        let detail = match (&step.skip_reason, &step.error) {
            (_, Some(err)) => format!(" error={}", truncate(err, 80)),
            (Some(reason), None) => format!(" reason={:?}", reason),
            (None, None) => String::new(),
        };
        println!(
            "  [{}] {:<28} {:<18}{}",
            step.wave,
            step.name,
            step.status.to_string(),
            detail
        );
    }
    for handoff in &run.handoffs {
        println!(
            "  handoff {} -> {} at {}",
            handoff.source_step,
            handoff.event.event_type,
            handoff.fire_at.format("%H:%M:%S")
        );
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
