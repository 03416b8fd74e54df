//! Matchsync CLI
//!
//! Runs the canonical sync scenarios against the in-memory backend and
//! inspects the durable offline queue.
//!
//! ## Usage
//!
//! ```bash
//! # Two users match each other at the same moment
//! matchsync scenario duplicate-match
//!
//! # Send five messages offline, reconnect, check they land in order
//! matchsync scenario offline-send --count 5
//!
//! # Leave them queued instead, then look at the queue
//! matchsync scenario offline-send --count 3 --stay-offline
//! matchsync queue list
//!
//! # Every scenario, with per-device JSONL logs
//! matchsync -v --log-dir ./logs scenario all
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use matchsync_core::engine::QUEUE_DB_FILE;
use matchsync_core::{
    logging, schema, ManualReachability, MatchId, MemoryBackend, MemoryConnection, Reachability,
    Storage, SyncClient, SyncConfig, UserId,
};

/// Matchsync - real-time match and message sync
#[derive(Parser)]
#[command(name = "matchsync")]
#[command(version)]
#[command(about = "Matchsync - real-time match and message sync")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.matchsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file; missing keys use defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write one JSONL log per device into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync scenario against the in-memory backend
    Scenario {
        #[command(subcommand)]
        which: Scenario,
    },

    /// Inspect a device's durable offline queue
    Queue {
        /// Device owner
        #[arg(short, long, default_value = "alice")]
        user: String,

        #[command(subcommand)]
        action: QueueAction,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand, Clone, Copy)]
enum Scenario {
    /// Both users create the match concurrently; exactly one is active
    DuplicateMatch,
    /// Messages sent offline are applied once each, in order, on reconnect
    OfflineSend {
        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,
        /// Stop before reconnecting, leaving the operations queued on disk
        #[arg(long)]
        stay_offline: bool,
    },
    /// Unread counters rise with sends and return to zero on read
    UnreadRoundtrip,
    /// Every scenario in turn
    All,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending operations in replay order
    List,
    /// Drop every pending operation
    Clear,
}

/// Get the default data directory (~/.matchsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".matchsync")
        .join("data")
}

fn queue_path(data_dir: &Path, user: &str) -> PathBuf {
    data_dir.join(user).join(QUEUE_DB_FILE)
}

/// One simulated device: its own backend connection, reachability and client.
struct Device {
    conn: MemoryConnection,
    reachability: Arc<ManualReachability>,
    client: SyncClient,
}

impl Device {
    fn new(
        backend: &MemoryBackend,
        user: &str,
        config: &SyncConfig,
        data_dir: Option<&Path>,
    ) -> Result<Self> {
        let conn = backend.connect();
        let reachability = Arc::new(ManualReachability::new(Reachability::wifi()));
        let mut builder =
            SyncClient::builder(UserId::from(user), Arc::new(conn.clone()), reachability.clone())
                .config(config.clone());
        if let Some(dir) = data_dir {
            builder = builder.data_dir(dir.join(user));
        }
        let client = builder.build().with_context(|| format!("starting {}", user))?;
        Ok(Self {
            conn,
            reachability,
            client,
        })
    }

    async fn go_offline(&self) -> Result<()> {
        self.conn.set_online(false);
        self.reachability.set(Reachability::offline());
        let connectivity = self.client.connectivity();
        eventually("device offline", || async move { !connectivity.is_connected() }).await
    }

    fn go_online(&self) {
        self.conn.set_online(true);
        self.reachability.set(Reachability::wifi());
    }
}

/// Poll `check` until it holds, for up to five seconds.
async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {}", what)
}

fn active_matches(backend: &MemoryBackend) -> usize {
    backend
        .documents(schema::MATCHES)
        .iter()
        .filter(|doc| doc.data[schema::match_fields::IS_ACTIVE] == serde_json::Value::Bool(true))
        .count()
}

async fn duplicate_match(config: &SyncConfig) -> Result<()> {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice", config, None)?;
    let bob = Device::new(&backend, "bob", config, None)?;

    let (from_alice, from_bob) = tokio::join!(
        alice.client.create_match(bob.client.user()),
        bob.client.create_match(alice.client.user()),
    );
    let (from_alice, from_bob) = (from_alice?, from_bob?);

    ensure!(
        from_alice.record.id == from_bob.record.id,
        "users ended up in different matches: {} vs {}",
        from_alice.record.id,
        from_bob.record.id
    );
    ensure!(
        from_alice.created != from_bob.created,
        "expected exactly one side to create the match"
    );
    let active = active_matches(&backend);
    ensure!(active == 1, "expected 1 active match, found {}", active);

    println!("✓ duplicate-match");
    println!("  Match: {}", from_alice.record.id);
    println!(
        "  Created by: {}",
        if from_alice.created { "alice" } else { "bob" }
    );
    println!("  Active matches: {}", active);
    Ok(())
}

async fn offline_send(
    config: &SyncConfig,
    data_dir: &Path,
    count: usize,
    stay_offline: bool,
) -> Result<()> {
    ensure!(count > 0, "--count must be at least 1");
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice", config, Some(data_dir))?;
    let bob = Device::new(&backend, "bob", config, None)?;

    // Leftovers from an earlier --stay-offline run target a backend that no
    // longer exists and are discarded by the startup flush
    let queue = alice.client.queue();
    eventually("earlier queue to drain", || async move {
        queue.is_empty().unwrap_or(false)
    })
    .await?;

    let created = alice.client.create_match(bob.client.user()).await?;
    let match_id = created.record.id.clone();
    alice.client.start().await?;
    alice.client.open(&match_id).await?;

    alice.go_offline().await?;
    let texts: Vec<String> = (1..=count).map(|i| format!("offline message {}", i)).collect();
    for text in &texts {
        alice.client.send(&match_id, text.as_str()).await?;
    }
    let queued = alice.client.queue().len()?;
    ensure!(queued == count, "expected {} queued operations, found {}", count, queued);

    if stay_offline {
        println!("✓ offline-send (stayed offline)");
        println!("  Queued operations: {}", queued);
        println!("  Queue: {}", queue_path(data_dir, "alice").display());
        return Ok(());
    }

    alice.go_online();
    eventually("queue to drain", || async move { queue.is_empty().unwrap_or(false) }).await?;

    let stream = bob.client.open(&match_id).await?;
    let delivered: Vec<&str> = stream.initial.iter().map(|e| e.message.text.as_str()).collect();
    ensure!(
        delivered == texts.iter().map(String::as_str).collect::<Vec<_>>(),
        "messages arrived out of order or incomplete: {:?}",
        delivered
    );
    let stored = backend.documents(schema::MESSAGES).len();
    ensure!(stored == count, "expected {} stored messages, found {}", count, stored);
    let unread = bob.client.total_unread().await?;
    ensure!(unread == count as u64, "expected {} unread for bob, found {}", count, unread);

    println!("✓ offline-send");
    println!("  Replayed: {}", count);
    println!("  Stored messages: {}", stored);
    println!("  Bob unread: {}", unread);
    Ok(())
}

async fn unread_roundtrip(config: &SyncConfig) -> Result<()> {
    let backend = MemoryBackend::new();
    let alice = Device::new(&backend, "alice", config, None)?;
    let bob = Device::new(&backend, "bob", config, None)?;

    let created = alice.client.create_match(bob.client.user()).await?;
    let match_id: MatchId = created.record.id;
    for i in 1..=3 {
        alice.client.send(&match_id, format!("ping {}", i)).await?;
    }

    let before = bob.client.total_unread().await?;
    ensure!(before == 3, "expected 3 unread before reading, found {}", before);

    bob.client.mark_read(&match_id).await?;
    let after = bob.client.total_unread().await?;
    ensure!(after == 0, "expected 0 unread after reading, found {}", after);
    let still_unread = backend
        .documents(schema::MESSAGES)
        .iter()
        .filter(|doc| doc.data[schema::message_fields::IS_READ] != serde_json::Value::Bool(true))
        .count();
    ensure!(still_unread == 0, "{} messages still unread", still_unread);

    println!("✓ unread-roundtrip");
    println!("  Unread before read: {}", before);
    println!("  Unread after read: {}", after);
    Ok(())
}

async fn run_scenario(which: Scenario, config: &SyncConfig, data_dir: &Path) -> Result<()> {
    match which {
        Scenario::DuplicateMatch => duplicate_match(config).await,
        Scenario::OfflineSend {
            count,
            stay_offline,
        } => offline_send(config, data_dir, count, stay_offline).await,
        Scenario::UnreadRoundtrip => unread_roundtrip(config).await,
        Scenario::All => {
            duplicate_match(config).await?;
            offline_send(config, data_dir, 3, false).await?;
            unread_roundtrip(config).await?;
            println!();
            println!("All scenarios passed");
            Ok(())
        }
    }
}

fn run_queue(action: QueueAction, data_dir: &Path, user: &str) -> Result<()> {
    let path = queue_path(data_dir, user);
    if !path.exists() {
        println!("No queue for {} at {}", user, path.display());
        return Ok(());
    }
    let storage = Storage::new(&path).with_context(|| format!("opening {}", path.display()))?;

    match action {
        QueueAction::List => {
            let pending = storage.list_pending()?;
            if pending.is_empty() {
                println!("Queue is empty");
                return Ok(());
            }
            println!("Pending operations ({}):", pending.len());
            for op in pending {
                let enqueued = chrono::DateTime::from_timestamp_millis(op.enqueued_at)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| op.enqueued_at.to_string());
                println!(
                    "  #{} {} match={} token={} at {}",
                    op.order,
                    op.kind.label(),
                    op.kind.match_id(),
                    op.token,
                    enqueued
                );
            }
        }
        QueueAction::Clear => {
            let cleared = storage.clear_pending()?;
            println!("Cleared {} pending operations", cleared);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.log_dir {
        Some(dir) => {
            logging::init_with_jsonl(dir, "matchsync-cli", cli.verbose)
                .with_context(|| format!("opening log directory {}", dir.display()))?;
        }
        None => {
            logging::init_console(cli.verbose);
        }
    }

    let config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Scenario { which } => run_scenario(which, &config, &data_dir).await?,
        Commands::Queue { user, action } => run_queue(action, &data_dir, &user)?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
