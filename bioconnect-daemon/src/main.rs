//! BioConnect daemon and command line.
//!
//! `bioconnect run` keeps the sync engine alive, replicating queued
//! enrollments whenever the remote directory is reachable. The other
//! subcommands operate on the local store directly and queue their
//! mutations; the running daemon picks them up on its next queue poll.

mod descriptor;

use anyhow::{anyhow, Context, Result};
use bioconnect_core::database::shared;
use bioconnect_core::{
    ensure_data_dir, get_default_config_path, AppConfig, BiometricPipeline, Database,
    HttpDirectory, Identity, LocalStore, MatchOutcome, NetworkMonitor, Role, SharedDatabase,
    SyncEngine, SyncQueue,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use descriptor::{DescriptorExtractor, DescriptorFile};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Offline-first worker enrollment and identification
#[derive(Parser)]
#[command(name = "bioconnect", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Remote directory URL override
    #[arg(long)]
    remote_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine until interrupted
    Run,

    /// Enroll a new person from a descriptor file
    Enroll {
        #[arg(long)]
        name: String,

        /// worker or supervisor
        #[arg(long, default_value = "worker", value_parser = parse_role)]
        role: Role,

        /// Face descriptor (JSON array of floats)
        #[arg(long)]
        template: PathBuf,
    },

    /// Identify a descriptor against everyone enrolled
    Identify {
        #[arg(long)]
        template: PathBuf,
    },

    /// Change an identity's name and role
    Update {
        local_id: String,

        #[arg(long)]
        name: String,

        #[arg(long, value_parser = parse_role)]
        role: Role,
    },

    /// Replace an identity's face template
    Reenroll {
        local_id: String,

        #[arg(long)]
        template: PathBuf,
    },

    /// List enrolled identities
    List,

    /// Show the replication queue and its error log
    Queue,

    /// Show pending replication and the current session
    Status,

    /// Start a session for whoever matches the descriptor
    Login {
        #[arg(long)]
        template: PathBuf,
    },

    /// End the current session
    Logout,
}

fn parse_role(s: &str) -> std::result::Result<Role, String> {
    Role::parse(s).ok_or_else(|| format!("unknown role '{}' (expected worker or supervisor)", s))
}

/// Identity without its template, for display.
#[derive(Serialize)]
struct IdentitySummary {
    local_id: String,
    remote_id: Option<String>,
    display_name: String,
    role: Role,
    enrolled_at: DateTime<Utc>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl From<&Identity> for IdentitySummary {
    fn from(identity: &Identity) -> Self {
        Self {
            local_id: identity.local_id.clone(),
            remote_id: identity.remote_id.clone(),
            display_name: identity.display_name.clone(),
            role: identity.role,
            enrolled_at: identity.enrolled_at,
            last_synced_at: identity.last_synced_at,
        }
    }
}

#[derive(Serialize)]
struct QueueEntry {
    sequence: u64,
    action: &'static str,
    local_id: String,
    enqueued_at: DateTime<Utc>,
    synced: bool,
    synced_at: Option<DateTime<Utc>>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let path = cli.config.clone().unwrap_or_else(get_default_config_path);
    let mut config = AppConfig::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    if let Some(url) = &cli.remote_url {
        config.remote_url = Some(url.clone());
    }
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<SharedDatabase> {
    if config.database_path == bioconnect_core::get_default_database_path() {
        ensure_data_dir()?;
    }
    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(shared(db))
}

fn pipeline(
    store: LocalStore,
    template: PathBuf,
) -> BiometricPipeline<DescriptorFile, DescriptorExtractor> {
    BiometricPipeline::new(DescriptorFile::new(template), DescriptorExtractor, store)
}

async fn run_daemon(config: &AppConfig, db: SharedDatabase) -> Result<()> {
    let url = config
        .remote_url
        .as_deref()
        .ok_or_else(|| anyhow!("No remote_url configured; nothing to sync with"))?;
    let directory = HttpDirectory::new(url, config.sync.replicate_timeout())?;
    let probe_addr = directory.probe_addr()?;

    let monitor = NetworkMonitor::new(false);
    let probe = monitor.spawn_probe(probe_addr.clone(), config.sync.probe_interval());
    let handle = SyncEngine::new(db.clone(), Arc::new(directory), config.sync.clone())
        .spawn(monitor.subscribe());

    info!("Syncing with {} (probing {})", url, probe_addr);
    info!("Daemon ready. Press Ctrl+C to exit.");

    signal::ctrl_c().await?;
    info!("Received shutdown signal");

    probe.abort();
    handle.shutdown().await;

    let pending = SyncQueue::new(db).pending_count()?;
    if pending > 0 {
        warn!("{} mutation(s) still pending; they will sync on next start", pending);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let db = open_database(&config)?;
    let store = LocalStore::new(db.clone(), config.matcher()?);

    match cli.command {
        Commands::Run => {
            info!("Starting BioConnect daemon v{}", VERSION);
            run_daemon(&config, db).await?;
        }
        Commands::Enroll {
            name,
            role,
            template,
        } => {
            let (identity, item) = pipeline(store, template).register(&name, role)?;
            info!("Queued registration #{}", item.sequence);
            print_json(&IdentitySummary::from(&identity))?;
        }
        Commands::Identify { template } => match pipeline(store, template).identify()? {
            MatchOutcome::Match { local_id, distance } => {
                print_json(&serde_json::json!({ "local_id": local_id, "distance": distance }))?
            }
            MatchOutcome::NoMatch => print_json(&serde_json::json!({ "local_id": null }))?,
        },
        Commands::Update {
            local_id,
            name,
            role,
        } => {
            let (identity, item) = store.update_profile(&local_id, &name, role)?;
            info!("Queued update #{}", item.sequence);
            print_json(&IdentitySummary::from(&identity))?;
        }
        Commands::Reenroll { local_id, template } => {
            let identity = pipeline(store, template).reenroll(&local_id)?;
            print_json(&IdentitySummary::from(&identity))?;
        }
        Commands::List => {
            let identities: Vec<IdentitySummary> =
                store.list_all()?.iter().map(IdentitySummary::from).collect();
            print_json(&identities)?;
        }
        Commands::Queue => {
            let queue = SyncQueue::new(db);
            let entries: Vec<QueueEntry> = queue
                .all()?
                .into_iter()
                .map(|item| QueueEntry {
                    sequence: item.sequence,
                    action: item.action.as_str(),
                    local_id: item.payload.local_id,
                    enqueued_at: item.enqueued_at,
                    synced: item.synced,
                    synced_at: item.synced_at,
                })
                .collect();
            print_json(&serde_json::json!({ "items": entries, "errors": queue.errors()? }))?;
        }
        Commands::Status => {
            let queue = SyncQueue::new(db);
            let current = store.current()?;
            print_json(&serde_json::json!({
                "pending_count": queue.pending_count()?,
                "failed_count": queue.errors()?.len(),
                "remote_url": config.remote_url,
                "current_user": current.as_ref().map(IdentitySummary::from),
                "is_supervisor": current.map(|i| i.is_supervisor()).unwrap_or(false),
            }))?;
        }
        Commands::Login { template } => match pipeline(store, template).login()? {
            Some(identity) => print_json(&IdentitySummary::from(&identity))?,
            None => return Err(anyhow!("Face not recognized")),
        },
        Commands::Logout => {
            store.clear_current()?;
            info!("Session cleared");
        }
    }

    Ok(())
}
