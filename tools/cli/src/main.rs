//! Cadence CLI - Command line interface for habit tracking with sync.
//!
//! Entities live in a SQLite database in the data directory. Syncing goes
//! through a shared directory that plays the role of the remote store, so
//! several data directories can converge on the same records.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cadence_common::{EntityId, RecordType, ZoneId};
use cadence_storage::{
    Activity, ActivityKind, DirRemoteStore, LocalEntity, LocalStore, Session, SqliteLocalStore,
    WriteOrigin,
};
use cadence_sync::{
    AttemptOutcome, ChangeTracker, EntityLocks, FileTokenStore, SyncConfig, SyncEngine,
    SyncStatus, ZoneFetch,
};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence - Local-first habit tracking")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the local database and change tokens.
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage activities.
    Activity {
        #[command(subcommand)]
        command: ActivityCommands,
    },

    /// Log a session for an activity.
    Log {
        /// Activity id.
        #[arg(short, long)]
        activity: String,

        /// Count or seconds, depending on the activity kind.
        #[arg(long, default_value_t = 1.0)]
        value: f64,

        /// Day of the session (YYYY-MM-DD or RFC 3339). Defaults to now.
        #[arg(long)]
        date: Option<String>,

        /// Record the session as not completed.
        #[arg(long)]
        incomplete: bool,
    },

    /// List activities and their sessions.
    List {
        /// Include archived activities.
        #[arg(short, long)]
        all: bool,
    },

    /// Run one sync attempt against a shared directory.
    Sync {
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Sync periodically and after local changes until interrupted.
    Watch {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Seconds between automatic syncs.
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum ActivityCommands {
    /// Create an activity.
    Add {
        #[arg(short, long)]
        name: String,

        /// "count", "duration" or "check".
        #[arg(short, long, default_value = "check")]
        kind: String,

        #[arg(short, long, default_value = "#4a90d9")]
        color: String,
    },

    /// Archive an activity. It stays synced as inactive.
    Archive {
        /// Activity id.
        id: String,
    },
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Shared directory acting as the remote store.
    #[arg(short, long)]
    remote: PathBuf,

    /// Create the remote directory if it does not exist.
    #[arg(long)]
    init: bool,

    /// Additional zones to fetch.
    #[arg(short, long)]
    zone: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder().with_target(false).compact();
    match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?,
        Err(_) => tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?,
    }

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No data directory on this platform; pass --data-dir")?
            .join("cadence"),
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    match cli.command {
        Commands::Activity { command } => match command {
            ActivityCommands::Add { name, kind, color } => {
                cmd_activity_add(&data_dir, &name, &kind, &color)
            }
            ActivityCommands::Archive { id } => cmd_activity_archive(&data_dir, &id),
        },

        Commands::Log {
            activity,
            value,
            date,
            incomplete,
        } => cmd_log(&data_dir, &activity, value, date.as_deref(), !incomplete),

        Commands::List { all } => cmd_list(&data_dir, all),

        Commands::Sync { remote } => cmd_sync(&data_dir, &remote).await,

        Commands::Watch { remote, interval } => cmd_watch(&data_dir, &remote, interval).await,
    }
}

fn open_local(data_dir: &Path) -> Result<Arc<SqliteLocalStore>> {
    let path = data_dir.join("cadence.db");
    let store = SqliteLocalStore::open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Arc::new(store))
}

fn parse_id(id: &str) -> Result<EntityId> {
    id.parse().with_context(|| format!("Invalid id: {}", id))
}

fn parse_date(date: &str) -> Result<DateTime<Utc>> {
    if let Ok(day) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        let noon = day.and_hms_opt(12, 0, 0).context("Invalid time of day")?;
        return Ok(noon.and_utc());
    }
    Ok(DateTime::parse_from_rfc3339(date)
        .with_context(|| format!("Invalid date: {}", date))?
        .with_timezone(&Utc))
}

/// Create an activity.
fn cmd_activity_add(data_dir: &Path, name: &str, kind: &str, color: &str) -> Result<()> {
    let kind: ActivityKind = kind.parse().context("Invalid activity kind")?;
    let local = open_local(data_dir)?;

    let activity = Activity::new(name, kind, color);
    local.upsert(&activity.clone().into(), WriteOrigin::Local)?;

    println!("Activity created: {}", activity.id);
    Ok(())
}

/// Archive an activity.
fn cmd_activity_archive(data_dir: &Path, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let local = open_local(data_dir)?;

    if !matches!(local.get(&id)?, Some(LocalEntity::Activity(_))) {
        anyhow::bail!("No activity with id {}", id);
    }

    let tracker = Arc::new(ChangeTracker::new(local, Arc::new(EntityLocks::new())));
    tracker.attach();
    tracker.edit(id, |entity| {
        if let LocalEntity::Activity(activity) = entity {
            activity.is_active = false;
        }
    })?;

    println!("Activity archived: {}", id);
    Ok(())
}

/// Log a session.
fn cmd_log(
    data_dir: &Path,
    activity: &str,
    value: f64,
    date: Option<&str>,
    completed: bool,
) -> Result<()> {
    let activity_id = parse_id(activity)?;
    let date = match date {
        Some(date) => parse_date(date)?,
        None => Utc::now(),
    };
    let local = open_local(data_dir)?;

    if !matches!(local.get(&activity_id)?, Some(LocalEntity::Activity(_))) {
        anyhow::bail!("No activity with id {}", activity_id);
    }

    let session = Session::new(activity_id, date, value, completed);
    local.upsert(&session.clone().into(), WriteOrigin::Local)?;

    println!("Session logged: {}", session.id);
    Ok(())
}

fn sync_marker(entity: &LocalEntity) -> &'static str {
    match (entity.is_dirty(), entity.remote_ref().is_some()) {
        (true, false) => "new",
        (true, true) => "modified",
        (false, _) => "synced",
    }
}

/// List activities and sessions.
fn cmd_list(data_dir: &Path, all: bool) -> Result<()> {
    let local = open_local(data_dir)?;
    let sessions = local.all(RecordType::Session)?;
    let activities = local.all(RecordType::Activity)?;

    if activities.is_empty() {
        println!("(no activities)");
        return Ok(());
    }

    for entity in &activities {
        let LocalEntity::Activity(activity) = entity else {
            continue;
        };
        if !all && !activity.is_active {
            continue;
        }
        let archived = if activity.is_active { "" } else { " [archived]" };
        println!(
            "{}  {} ({}){}  [{}]",
            activity.id,
            activity.name,
            activity.kind,
            archived,
            sync_marker(entity)
        );

        for entity in &sessions {
            let LocalEntity::Session(session) = entity else {
                continue;
            };
            if session.activity_id != activity.id {
                continue;
            }
            let done = if session.completed { "done" } else { "open" };
            println!(
                "    {}  {}  {}  {}  [{}]",
                session.id,
                session.date.format("%Y-%m-%d"),
                session.value,
                done,
                sync_marker(entity)
            );
        }
    }

    Ok(())
}

async fn build_engine(data_dir: &Path, remote: &RemoteArgs) -> Result<Arc<SyncEngine>> {
    if remote.init {
        tokio::fs::create_dir_all(&remote.remote)
            .await
            .with_context(|| format!("Failed to create {}", remote.remote.display()))?;
    }

    let mut config = SyncConfig::default();
    for zone in &remote.zone {
        config = config.with_zone(ZoneId::new(zone.as_str()).context("Invalid zone name")?);
    }

    let local = open_local(data_dir)?;
    let tokens = FileTokenStore::open(data_dir.join("tokens.json"))
        .await
        .context("Failed to open token store")?;
    let store = DirRemoteStore::new(&remote.remote);

    info!("Syncing {} with {}", data_dir.display(), remote.remote.display());
    Ok(SyncEngine::new(local, Arc::new(store), Arc::new(tokens), config))
}

fn print_outcome(outcome: &AttemptOutcome) {
    match outcome {
        AttemptOutcome::AlreadyRunning => println!("A sync is already running."),
        AttemptOutcome::Failed(err) => println!("Sync failed: {}", err),
        AttemptOutcome::Completed(report) => {
            let upload = &report.upload;
            println!(
                "Uploaded {}, conflicts {}, skipped {}, failed {}",
                upload.uploaded, upload.conflicts_resolved, upload.skipped, upload.failed
            );
            for (zone, fetch) in &report.zones {
                match fetch {
                    ZoneFetch::Delta(outcome) => println!("  {}: {:?}", zone, outcome),
                    ZoneFetch::Full { report, baseline } => println!(
                        "  {}: full fetch, {} applied, {} skipped{}",
                        zone,
                        report.applied,
                        report.skipped,
                        if *baseline { ", token stored" } else { "" }
                    ),
                }
            }
        }
    }
}

/// Run one sync attempt.
async fn cmd_sync(data_dir: &Path, remote: &RemoteArgs) -> Result<()> {
    let engine = build_engine(data_dir, remote).await?;
    let outcome = engine.start().await;
    print_outcome(&outcome);

    if let AttemptOutcome::Failed(err) = outcome {
        anyhow::bail!(err);
    }
    Ok(())
}

/// Sync until Ctrl-C.
async fn cmd_watch(data_dir: &Path, remote: &RemoteArgs, interval: u64) -> Result<()> {
    let engine = build_engine(data_dir, remote).await?;
    let _tracker = engine.change_tracker();
    let mut status = engine.subscribe();

    engine.spawn_scheduler();
    engine.enable_automatic(Duration::from_secs(interval.max(1)));
    print_outcome(&engine.start().await);

    println!("Watching for changes every {}s. Press Ctrl-C to stop.", interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                match snapshot.status {
                    SyncStatus::Completed => {
                        if let Some(at) = snapshot.last_synced_at {
                            println!("Synced at {}", at.format("%H:%M:%S"));
                        }
                    }
                    SyncStatus::Failed => {
                        if let Some(err) = snapshot.last_error {
                            println!("Sync failed: {}", err);
                        }
                    }
                    SyncStatus::Idle | SyncStatus::Syncing => {}
                }
            }
        }
    }

    engine.disable();
    engine.shutdown().await;
    Ok(())
}
