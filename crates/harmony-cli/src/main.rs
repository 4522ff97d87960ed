//! Harmony CLI - Command-line interface for HarmonyCare dispatch
//!
//! Raise, accept, and resolve emergencies from the terminal, drain the
//! offline queue, and listen for peer broadcasts on the local segment.

use std::env;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::Generator;
use clap_complete::{generate, shells};
use harmony_core::db::{
    ContactRepository, Database, EmergencyRepository, LibSqlContactRepository,
    LibSqlEmergencyRepository, LibSqlPendingOperationRepository, PendingOperationRepository,
};
use harmony_core::models::{EmergencyContact, NotificationMethod};
use harmony_core::sync::{
    BroadcastListener, Broadcaster, ConnectivityOracle, HttpDispatchClient, LogAlertSink,
    Reachability, RemoteDispatch, RouteConnectivity, SharedConnectivity, SubmitOutcome,
    SyncCoordinator, UdpBroadcaster, BROADCAST_PORT,
};
use harmony_core::{Emergency, EmergencyId, EmergencyStatus};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "harmony")]
#[command(about = "Offline-first emergency dispatch for peer-assisted elder care")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Base URL of the dispatch server
    #[arg(long, global = true, value_name = "URL")]
    server_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Raise a new emergency for an elderly user
    Submit {
        /// Elderly user id
        elderly_id: i64,
        /// Latitude of the device
        latitude: f64,
        /// Longitude of the device
        longitude: f64,
    },
    /// List active emergencies
    List {
        /// Only emergencies accepted by this volunteer
        #[arg(long)]
        volunteer_id: Option<i64>,
        /// Skip the server and list the local store only
        #[arg(long)]
        local: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Accept an emergency as a volunteer
    Accept {
        /// Emergency ID or unique ID prefix
        id: String,
        /// Volunteer user id
        volunteer_id: i64,
    },
    /// Complete or cancel an emergency
    Resolve {
        /// Emergency ID or unique ID prefix
        id: String,
        /// Terminal status to apply
        #[arg(value_enum)]
        status: ResolveStatus,
    },
    /// Show queued operations awaiting sync
    Pending,
    /// Drain the pending queue against the server
    Sync,
    /// Listen for peer emergency broadcasts until interrupted
    Listen {
        /// UDP port to listen on
        #[arg(long, default_value_t = BROADCAST_PORT)]
        port: u16,
        /// Seconds between automatic queue drains
        #[arg(long, default_value = "60")]
        drain_interval: u64,
    },
    /// Manage emergency contacts
    Contacts {
        #[command(subcommand)]
        command: ContactCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ContactCommands {
    /// Register a contact for an elderly user
    Add {
        /// Elderly user id
        elderly_id: i64,
        /// Contact name
        name: String,
        /// Contact phone number
        phone: String,
        /// Relationship to the elderly user
        #[arg(long)]
        relationship: Option<String>,
        /// Mark as the primary contact
        #[arg(long)]
        primary: bool,
        /// How to notify this contact
        #[arg(long, value_enum, default_value_t = ContactMethod::Sms)]
        method: ContactMethod,
    },
    /// List enabled contacts for an elderly user
    List {
        /// Elderly user id
        elderly_id: i64,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] harmony_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Emergency ID cannot be empty")]
    EmptyEmergencyId,
    #[error("Emergency not found for id/prefix: {0}")]
    EmergencyNotFound(String),
    #[error("{0}")]
    AmbiguousEmergencyId(String),
    #[error("Server URL could not be resolved: {0}")]
    ServerUnresolvable(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ResolveStatus {
    Completed,
    Cancelled,
}

impl From<ResolveStatus> for EmergencyStatus {
    fn from(status: ResolveStatus) -> Self {
        match status {
            ResolveStatus::Completed => Self::Completed,
            ResolveStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ContactMethod {
    Sms,
    Call,
    Push,
}

impl From<ContactMethod> for NotificationMethod {
    fn from(method: ContactMethod) -> Self {
        match method {
            ContactMethod::Sms => Self::Sms,
            ContactMethod::Call => Self::Call,
            ContactMethod::Push => Self::Push,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("harmony=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let server_url = resolve_server_url(cli.server_url);

    match cli.command {
        Commands::Submit {
            elderly_id,
            latitude,
            longitude,
        } => run_submit(elderly_id, latitude, longitude, &db_path, &server_url).await?,
        Commands::List {
            volunteer_id,
            local,
            json,
        } => run_list(volunteer_id, local, json, &db_path, &server_url).await?,
        Commands::Accept { id, volunteer_id } => {
            run_accept(&id, volunteer_id, &db_path, &server_url).await?;
        }
        Commands::Resolve { id, status } => {
            run_resolve(&id, status.into(), &db_path, &server_url).await?;
        }
        Commands::Pending => run_pending(&db_path).await?,
        Commands::Sync => run_sync(&db_path, &server_url).await?,
        Commands::Listen {
            port,
            drain_interval,
        } => run_listen(port, drain_interval, &db_path, &server_url).await?,
        Commands::Contacts { command } => run_contacts(command, &db_path).await?,
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}

async fn run_submit(
    elderly_id: i64,
    latitude: f64,
    longitude: f64,
    db_path: &Path,
    server_url: &str,
) -> Result<(), CliError> {
    let (coordinator, _db) = build_coordinator(db_path, server_url).await?;
    let submission = coordinator.submit(elderly_id, latitude, longitude).await?;

    match submission.outcome {
        SubmitOutcome::Delivered { server_id } => {
            println!("{} delivered (server #{server_id})", submission.emergency.id);
        }
        SubmitOutcome::Queued { broadcast: true } => {
            println!("{} queued, announced to local peers", submission.emergency.id);
        }
        SubmitOutcome::Queued { broadcast: false } => {
            println!("{} queued for sync", submission.emergency.id);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct EmergencyListItem {
    id: String,
    server_id: Option<i64>,
    elderly_id: i64,
    volunteer_id: Option<i64>,
    latitude: f64,
    longitude: f64,
    status: String,
    created_at: i64,
    relative_time: String,
}

async fn run_list(
    volunteer_id: Option<i64>,
    local: bool,
    as_json: bool,
    db_path: &Path,
    server_url: &str,
) -> Result<(), CliError> {
    let (coordinator, db) = build_coordinator(db_path, server_url).await?;

    if !local {
        // Best effort: an unreachable server still leaves the local view
        if let Err(error) = coordinator.refresh_active(volunteer_id).await {
            if error.is_transient() {
                tracing::warn!(%error, "could not refresh from server, showing local records");
            } else {
                return Err(error.into());
            }
        }
    }

    let repo = LibSqlEmergencyRepository::new(db.connection());
    let mut emergencies = repo.list_active().await?;
    if let Some(volunteer) = volunteer_id {
        emergencies.retain(|emergency| emergency.volunteer_id == Some(volunteer));
    }

    if as_json {
        let items = emergencies
            .iter()
            .map(emergency_to_list_item)
            .collect::<Vec<EmergencyListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for line in format_emergency_lines(&emergencies) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_accept(
    id: &str,
    volunteer_id: i64,
    db_path: &Path,
    server_url: &str,
) -> Result<(), CliError> {
    let (coordinator, db) = build_coordinator(db_path, server_url).await?;
    let emergency_id = resolve_emergency_id(id, &db).await?;

    let accepted = coordinator.accept(&emergency_id, volunteer_id).await?;
    println!("{} accepted by volunteer {volunteer_id}", accepted.id);
    Ok(())
}

async fn run_resolve(
    id: &str,
    status: EmergencyStatus,
    db_path: &Path,
    server_url: &str,
) -> Result<(), CliError> {
    let (coordinator, db) = build_coordinator(db_path, server_url).await?;
    let emergency_id = resolve_emergency_id(id, &db).await?;

    let (updated, outcome) = coordinator.resolve(&emergency_id, status).await?;
    println!("{} {} ({outcome:?})", updated.id, updated.status);
    Ok(())
}

async fn run_pending(db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let queue = LibSqlPendingOperationRepository::new(db.connection());

    let pending = queue.list_fifo().await?;
    if pending.is_empty() {
        println!("No pending operations");
        return Ok(());
    }

    let now_ms = Utc::now().timestamp_millis();
    for operation in pending {
        println!(
            "#{:<6} {:<18} {}",
            operation.id,
            operation.kind.as_str(),
            format_relative_time(operation.created_at, now_ms)
        );
    }
    Ok(())
}

async fn run_sync(db_path: &Path, server_url: &str) -> Result<(), CliError> {
    let (coordinator, _db) = build_coordinator(db_path, server_url).await?;
    let report = coordinator.sync_all().await?;

    println!(
        "Synced {} operation(s), {} failed, {} skipped{}",
        report.succeeded,
        report.failed,
        report.skipped,
        if report.stopped.is_some() {
            " (halted: server not reachable)"
        } else {
            ""
        }
    );
    Ok(())
}

async fn run_listen(
    port: u16,
    drain_interval_secs: u64,
    db_path: &Path,
    server_url: &str,
) -> Result<(), CliError> {
    let (coordinator, _db) = build_coordinator(db_path, server_url).await?;

    let (frames_tx, frames_rx) = mpsc::channel(64);
    let listener = BroadcastListener::bind(port, frames_tx).await?;
    let consumer = coordinator.attach_listener(frames_rx);
    let drainer = coordinator.spawn_drain_interval(Duration::from_secs(drain_interval_secs));

    println!("Listening on {} (Ctrl-C to stop)", listener.local_addr());
    tokio::signal::ctrl_c().await?;

    drainer.abort();
    listener.stop().await;
    consumer.await.ok();
    println!("Stopped");
    Ok(())
}

async fn run_contacts(command: ContactCommands, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let repo = LibSqlContactRepository::new(db.connection());

    match command {
        ContactCommands::Add {
            elderly_id,
            name,
            phone,
            relationship,
            primary,
            method,
        } => {
            let mut contact = EmergencyContact::new(elderly_id, &name, &phone);
            contact.relationship = relationship;
            contact.is_primary = primary;
            contact.notification_method = method.into();

            repo.insert(&contact).await?;
            println!("{}", contact.id);
        }
        ContactCommands::List { elderly_id } => {
            for contact in repo.list_for_elderly(elderly_id).await? {
                let marker = if contact.is_primary { "*" } else { " " };
                println!(
                    "{marker} {:<20} {:<16} {}",
                    contact.name,
                    contact.phone,
                    contact.notification_method.as_str()
                );
            }
        }
    }
    Ok(())
}

fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();

    match shell {
        CompletionShell::Bash => generate_for_shell(shells::Bash, &mut command, &mut buffer),
        CompletionShell::Zsh => generate_for_shell(shells::Zsh, &mut command, &mut buffer),
        CompletionShell::Fish => generate_for_shell(shells::Fish, &mut command, &mut buffer),
    }

    if let Some(path) = output_path {
        std::fs::write(path, &buffer)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&buffer)?;
    }

    Ok(())
}

fn generate_for_shell<G: Generator>(
    generator: G,
    command: &mut clap::Command,
    buffer: &mut Vec<u8>,
) {
    generate(generator, command, "harmony", buffer);
}

async fn resolve_emergency_id(query: &str, db: &Database) -> Result<EmergencyId, CliError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyEmergencyId);
    }

    if let Ok(id) = trimmed.parse::<EmergencyId>() {
        return Ok(id);
    }

    let mut rows = db
        .connection()
        .query(
            "SELECT id
             FROM emergencies
             WHERE id LIKE ?
             ORDER BY created_at DESC
             LIMIT ?",
            libsql::params![format!("{trimmed}%"), 3i64],
        )
        .await
        .map_err(harmony_core::Error::from)?;

    let mut matching_ids = Vec::new();
    while let Some(row) = rows.next().await.map_err(harmony_core::Error::from)? {
        let id: String = row.get(0).map_err(harmony_core::Error::from)?;
        matching_ids.push(id);
    }

    match matching_ids.len() {
        0 => Err(CliError::EmergencyNotFound(trimmed.to_string())),
        1 => matching_ids[0]
            .parse::<EmergencyId>()
            .map_err(|_| CliError::EmergencyNotFound(trimmed.to_string())),
        _ => {
            let options = matching_ids
                .iter()
                .map(|id| id.chars().take(13).collect::<String>())
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousEmergencyId(format!(
                "ID prefix '{trimmed}' is ambiguous; matches: {options}"
            )))
        }
    }
}

fn format_emergency_lines(emergencies: &[Emergency]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    emergencies
        .iter()
        .map(|emergency| {
            let id = emergency.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let relative_time = format_relative_time(emergency.created_at, now_ms);
            let volunteer = emergency
                .volunteer_id
                .map_or_else(String::new, |volunteer| format!("  vol {volunteer}"));

            format!(
                "{short_id:<13}  elder {:<6}  {:<9}  ({:.4}, {:.4})  {relative_time}{volunteer}",
                emergency.elderly_id, emergency.status, emergency.latitude, emergency.longitude
            )
        })
        .collect()
}

fn emergency_to_list_item(emergency: &Emergency) -> EmergencyListItem {
    let now_ms = Utc::now().timestamp_millis();
    EmergencyListItem {
        id: emergency.id.to_string(),
        server_id: emergency.server_id,
        elderly_id: emergency.elderly_id,
        volunteer_id: emergency.volunteer_id,
        latitude: emergency.latitude,
        longitude: emergency.longitude,
        status: emergency.status.to_string(),
        created_at: emergency.created_at,
        relative_time: format_relative_time(emergency.created_at, now_ms),
    }
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("HARMONY_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("harmony")
        .join("harmony.db")
}

fn resolve_server_url(cli_server_url: Option<String>) -> String {
    cli_server_url
        .or_else(|| env::var("HARMONY_SERVER_URL").ok())
        .unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
}

/// Resolve the server host to a socket address for route probing
fn resolve_server_addr(server_url: &str) -> Result<SocketAddr, CliError> {
    let url = reqwest::Url::parse(server_url)
        .map_err(|error| CliError::ServerUnresolvable(error.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| CliError::ServerUnresolvable("missing host".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| CliError::ServerUnresolvable("missing port".to_string()))?;

    (host, port)
        .to_socket_addrs()
        .map_err(|error| CliError::ServerUnresolvable(error.to_string()))?
        .next()
        .ok_or_else(|| CliError::ServerUnresolvable(format!("{host}:{port}")))
}

async fn build_coordinator(
    db_path: &Path,
    server_url: &str,
) -> Result<(Arc<SyncCoordinator>, Arc<Database>), CliError> {
    let db = Arc::new(open_database(db_path).await?);

    // A DNS failure means the server is not reachable right now, not a
    // fatal misconfiguration: fall back to an offline oracle so offline
    // commands still work.
    let oracle: Arc<dyn ConnectivityOracle> = match resolve_server_addr(server_url) {
        Ok(addr) => Arc::new(RouteConnectivity::new(addr)),
        Err(error) => {
            tracing::warn!(%error, "server address unresolvable, assuming offline");
            Arc::new(SharedConnectivity::new(Reachability::Offline))
        }
    };

    let remote: Arc<dyn RemoteDispatch> =
        Arc::new(HttpDispatchClient::new(server_url, Arc::clone(&oracle))?);
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(UdpBroadcaster::new());

    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::clone(&db),
        remote,
        oracle,
        broadcaster,
        Arc::new(LogAlertSink),
    ));
    Ok((coordinator, db))
}

async fn open_database(path: &Path) -> Result<Database, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(path).await?)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use harmony_core::db::{Database, EmergencyRepository, LibSqlEmergencyRepository};
    use harmony_core::Emergency;

    use super::{
        format_emergency_lines, format_relative_time, resolve_db_path, resolve_emergency_id,
        resolve_server_addr, resolve_server_url, run_completions, CliError, CompletionShell,
    };

    #[test]
    fn format_relative_time_units() {
        let now = 10_000_000;
        assert_eq!(format_relative_time(now - 30_000, now), "just now");
        assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
        assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    }

    #[test]
    fn resolve_db_path_prefers_cli_flag() {
        let explicit = resolve_db_path(Some(PathBuf::from("/tmp/custom.db")));
        assert_eq!(explicit, PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn resolve_server_url_prefers_cli_flag() {
        assert_eq!(
            resolve_server_url(Some("https://dispatch.example.com".to_string())),
            "https://dispatch.example.com"
        );
    }

    #[test]
    fn resolve_server_addr_handles_explicit_and_default_ports() {
        assert_eq!(
            resolve_server_addr("http://127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert_eq!(
            resolve_server_addr("http://127.0.0.1").unwrap(),
            "127.0.0.1:80".parse().unwrap()
        );
        assert!(resolve_server_addr("not a url").is_err());
    }

    #[test]
    fn format_emergency_lines_includes_volunteer_when_present() {
        let mut emergency = Emergency::new(5, 23.8103, 90.4125);
        emergency.volunteer_id = Some(9);
        let lines = format_emergency_lines(&[emergency]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("elder 5"));
        assert!(lines[0].contains("vol 9"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_emergency_id_supports_exact_and_prefix() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEmergencyRepository::new(db.connection());

        let mut first = Emergency::new(5, 23.8, 90.4);
        first.id = "11111111-1111-7111-8111-111111111111".parse().unwrap();
        let mut second = Emergency::new(6, 23.9, 90.5);
        second.id = "11111111-1111-7111-8111-222222222222".parse().unwrap();
        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();

        let by_exact = resolve_emergency_id("11111111-1111-7111-8111-111111111111", &db)
            .await
            .unwrap();
        assert_eq!(by_exact, first.id);

        let by_prefix = resolve_emergency_id("11111111-1111-7111-8111-2", &db)
            .await
            .unwrap();
        assert_eq!(by_prefix, second.id);

        let ambiguous = resolve_emergency_id("11111111-1111-7111-8111", &db)
            .await
            .unwrap_err();
        assert!(matches!(ambiguous, CliError::AmbiguousEmergencyId(_)));

        let missing = resolve_emergency_id("ffffffff", &db).await.unwrap_err();
        assert!(matches!(missing, CliError::EmergencyNotFound(_)));
    }

    #[test]
    fn run_completions_writes_bash_script_file() {
        let output_path = std::env::temp_dir().join(format!(
            "harmony-completions-test-{}-{}.bash",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |duration| duration.as_nanos()),
            next_test_sequence()
        ));

        run_completions(CompletionShell::Bash, Some(&output_path)).unwrap();

        let script = std::fs::read_to_string(&output_path).unwrap();
        assert!(script.contains("_harmony()"));
        assert!(script.contains("complete -F _harmony"));

        let _ = std::fs::remove_file(output_path);
    }

    fn next_test_sequence() -> u64 {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }
}
