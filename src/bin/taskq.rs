//! taskq CLI: operator interface to the task distribution engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use taskq::config::Config;
use taskq::config::secrets::redacted_url;
use taskq::handler::HandlerRegistry;
use taskq::model::{NewWorkItem, Payload, Priority, State, WorkId};
use taskq::storage::SqliteStore;
use taskq::telemetry::{TelemetryConfig, init_telemetry};
use taskq::Engine;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "taskq", about = "Durable background task distribution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher, worker pool and scheduler
    Serve {
        /// Directory containing handler TOML configs
        #[arg(long, default_value = "handlers")]
        handlers: PathBuf,
        /// Worker pool slots (overrides the engine config)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Submit a new work item
    Submit {
        /// Handler that processes the item
        handler: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Priority: lowest, low, medium, high, highest (or 1-5)
        #[arg(long, default_value = "medium")]
        priority: Priority,
        /// Attempt ceiling (engine default when omitted)
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Show a work item
    Status {
        /// Work item ID
        id: WorkId,
    },
    /// Resubmit a failed or expired work item
    Resubmit {
        /// Work item ID
        id: WorkId,
    },
    /// Queue depth by state
    Stats,
    /// Schedule operations
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List registered schedules
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { handlers, workers } => cmd_serve(config, handlers, workers).await,
        Command::Submit {
            handler,
            payload,
            priority,
            max_attempts,
        } => {
            let engine = open_engine(&config).await?;
            cmd_submit(&engine, handler, payload, priority, max_attempts).await
        }
        Command::Status { id } => cmd_status(&open_engine(&config).await?, id).await,
        Command::Resubmit { id } => {
            let new_id = open_engine(&config).await?.resubmit(id).await?;
            println!("Resubmitted {id} as {new_id}");
            Ok(())
        }
        Command::Stats => cmd_stats(&open_engine(&config).await?).await,
        Command::Schedule {
            action: ScheduleAction::List,
        } => cmd_schedule_list(&open_engine(&config).await?).await,
    }
}

/// An engine for one-shot commands; it is never started.
async fn open_engine(config: &Config) -> anyhow::Result<Engine> {
    let engine_config = config.load_engine_config()?;
    let store = SqliteStore::connect(config.database_url.expose_secret()).await?;
    store.health_check().await?;
    Ok(Engine::new(
        Arc::new(store),
        HandlerRegistry::new(),
        engine_config,
    ))
}

async fn cmd_serve(
    config: Config,
    handlers: PathBuf,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "taskq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let registry = if handlers.is_dir() {
        HandlerRegistry::load_from_dir(&handlers)?
    } else {
        warn!(dir = %handlers.display(), "handler directory not found, starting with no handlers");
        HandlerRegistry::new()
    };
    info!(handlers = ?registry.names(), "handlers loaded");

    let mut engine_config = config.load_engine_config()?;
    if let Some(n) = workers {
        engine_config.workers = n.max(1);
    }

    info!(database = %redacted_url(&config.database_url), "connecting");
    let store = Arc::new(SqliteStore::connect(config.database_url.expose_secret()).await?);
    store.health_check().await?;
    let now = chrono::Utc::now();
    let entries = engine_config.schedule_entries(now)?;
    let engine = Engine::new(store, registry, engine_config);
    for entry in entries {
        engine.register_schedule(entry).await?;
    }

    let handle = engine.start();
    let shutdown = handle.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, shutting down");
        shutdown.cancel();
    });

    handle.join().await;
    Ok(())
}

async fn cmd_submit(
    engine: &Engine,
    handler: String,
    payload: Option<String>,
    priority: Priority,
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let data: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewWorkItem::new(&handler, Payload::new(data)).priority(priority);
    if let Some(n) = max_attempts {
        new = new.max_attempts(n);
    }

    let id = engine.submit(new).await?;
    println!("Submitted: {id}");
    Ok(())
}

async fn cmd_status(engine: &Engine, id: WorkId) -> anyhow::Result<()> {
    let item = engine.get(id).await?;

    println!("ID:         {}", item.id);
    println!("Handler:    {}", item.handler_name);
    println!("State:      {}", item.state);
    println!("Priority:   {}", item.priority);
    println!("Source:     {}", item.provenance.source);
    println!(
        "Trigger:    {}",
        item.provenance.trigger.as_deref().unwrap_or("-")
    );
    println!(
        "Payload:    v{} {}",
        item.payload.version,
        serde_json::to_string_pretty(&item.payload.data)?
    );
    println!("Attempts:   {}/{}", item.attempt_count, item.max_attempts);
    println!("Not Before: {}", item.not_before);
    if let Some(expiry) = item.lease_expiry {
        println!("Lease Till: {expiry}");
    }
    if let Some(expires) = item.expires_at {
        println!("Expires:    {expires}");
    }
    println!("Created:    {}", item.created_at);
    println!("Updated:    {}", item.updated_at);
    if let Some(done) = item.completed_at {
        println!("Completed:  {done}");
    }
    if let Some(ref err) = item.last_error {
        println!("Last Error: {err}");
    }
    Ok(())
}

async fn cmd_stats(engine: &Engine) -> anyhow::Result<()> {
    let stats = engine.stats().await?;
    println!("{:<10}  {:>8}", "STATE", "COUNT");
    println!("{}", "-".repeat(20));
    for state in State::ALL {
        println!("{:<10}  {:>8}", state.as_str(), stats.count(state));
    }
    println!("{}", "-".repeat(20));
    println!("{:<10}  {:>8}", "total", stats.total);
    Ok(())
}

async fn cmd_schedule_list(engine: &Engine) -> anyhow::Result<()> {
    let schedules = engine.list_schedules().await?;
    if schedules.is_empty() {
        println!("No schedules registered.");
        return Ok(());
    }

    println!(
        "{:<20}  {:<16}  {:<24}  {:<20}  LAST FIRED",
        "ID", "HANDLER", "SPEC", "NEXT FIRE"
    );
    println!("{}", "-".repeat(110));
    for entry in &schedules {
        println!(
            "{:<20}  {:<16}  {:<24}  {:<20}  {}",
            entry.id,
            entry.handler_name,
            entry.spec.to_string(),
            entry.next_fire_at.format("%Y-%m-%d %H:%M:%S"),
            entry
                .last_fired_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("\n{} schedule(s)", schedules.len());
    Ok(())
}
