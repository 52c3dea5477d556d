//! CAIRN CLI
//!
//! Runs a management node against a shared store and offers offline tools
//! for reading and compacting that store.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod node;

use cairn_core::{Clock, NodeId, SystemClock};
use cairn_ha::{HaMode, SyncRecordPersister, live_master};
use cairn_memento::MementoKind;
use cairn_persist::{EpochGuard, MementoPersister, PersisterConfig};
use cairn_storage::{CompactReason, Compactor, FsObjectStore, ObjectStore};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use config::NodeConfig;
use node::Node;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "CAIRN - persisted management plane with HA failover", long_about = None)]
struct Cli {
    /// Log filter, overriding RUST_LOG
    #[arg(long, global = true)]
    log: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a management node until interrupted
    Node {
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Store directory
        #[arg(short, long)]
        store: Option<PathBuf>,
        /// Node id
        #[arg(long)]
        node_id: Option<String>,
        /// Address other nodes can reach this one at
        #[arg(long)]
        uri: Option<String>,
        /// Election priority
        #[arg(long)]
        priority: Option<i32>,
        /// HA mode: auto, master, standby or disabled
        #[arg(long, value_parser = parse_mode)]
        mode: Option<HaMode>,
    },
    /// List the mementos in a store
    Inspect {
        /// Store directory
        store: PathBuf,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the management plane as recorded in a store
    Status {
        /// Store directory
        store: PathBuf,
        /// Heartbeat age after which a node counts as dead
        #[arg(long, default_value_t = 30_000)]
        threshold_ms: u64,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete corrupt, unreachable and stale records
    Compact {
        /// Store directory
        store: PathBuf,
        /// Only print the plan
        #[arg(long)]
        dry_run: bool,
        /// How long terminated or failed node records are kept
        #[arg(long, default_value_t = 24)]
        retention_hours: u64,
    },
}

fn parse_mode(s: &str) -> std::result::Result<HaMode, String> {
    match s.to_ascii_lowercase().as_str() {
        "auto" => Ok(HaMode::Auto),
        "master" => Ok(HaMode::Master),
        "standby" => Ok(HaMode::Standby),
        "disabled" => Ok(HaMode::Disabled),
        other => Err(format!("unknown HA mode '{other}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter = match cli.log.as_deref() {
        Some(directives) => EnvFilter::try_new(directives).wrap_err("invalid --log filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cairn=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Node {
            config,
            store,
            node_id,
            uri,
            priority,
            mode,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::load(&path).map_err(|e| eyre!("{e:#}"))?,
                None => NodeConfig::default(),
            };
            if let Some(store) = store {
                node_config.store_dir = store;
            }
            if let Some(id) = node_id {
                node_config.ha.node_id = NodeId::parse(id).wrap_err("invalid --node-id")?;
            }
            if let Some(uri) = uri {
                node_config.ha.uri = uri;
            }
            if let Some(priority) = priority {
                node_config.ha.priority = priority;
            }
            if let Some(mode) = mode {
                node_config.ha.mode = mode;
            }
            node_config.validate().map_err(|e| eyre!("{e:#}"))?;

            let node = Node::open(&node_config).await?;
            node.run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "cannot listen for ctrl-c; stopping");
                }
            })
            .await
        }
        Commands::Inspect { store, json } => inspect(&store, json).await,
        Commands::Status {
            store,
            threshold_ms,
            json,
        } => status(&store, Duration::from_millis(threshold_ms), json).await,
        Commands::Compact {
            store,
            dry_run,
            retention_hours,
        } => compact(&store, dry_run, Duration::from_secs(retention_hours * 3600)).await,
    }
}

async fn open_store(path: &Path) -> Result<Arc<dyn ObjectStore>> {
    if !path.is_dir() {
        bail!("store directory {} does not exist", path.display());
    }
    let store = FsObjectStore::open(path)
        .await
        .wrap_err_with(|| format!("opening store {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn inspect(path: &Path, json: bool) -> Result<()> {
    let store = open_store(path).await?;
    // An ungranted guard: this persister only reads.
    let persister = MementoPersister::new(
        store,
        PersisterConfig::new(),
        Arc::new(EpochGuard::new()),
        Arc::new(SystemClock),
    )?;
    let outcome = persister.list_all().await?;

    if json {
        let errors: Vec<_> = outcome
            .errors
            .iter()
            .map(|e| serde_json::json!({ "path": e.path, "reason": e.reason }))
            .collect();
        let doc = serde_json::json!({ "mementos": outcome.mementos, "errors": errors });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    for kind in MementoKind::ALL {
        let of_kind: Vec<_> = outcome.mementos.iter().filter(|m| m.kind == kind).collect();
        println!("{kind}: {}", of_kind.len());
        for memento in of_kind {
            println!("  {} ({})", memento.id, memento.type_tag);
        }
    }
    if !outcome.errors.is_empty() {
        println!("unreadable: {}", outcome.errors.len());
        for error in &outcome.errors {
            println!("  {}: {}", error.path, error.reason);
        }
    }
    Ok(())
}

async fn status(path: &Path, threshold: Duration, json: bool) -> Result<()> {
    let store = open_store(path).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();
    let plane = SyncRecordPersister::new(store, clock, threshold, Duration::from_secs(5));
    let view = plane.load().await?;
    let live = live_master(&view, now, threshold).map(|m| m.node_id.clone());

    if json {
        let nodes: Vec<_> = view
            .nodes
            .values()
            .map(|n| {
                serde_json::json!({
                    "nodeId": n.node_id,
                    "uri": n.uri,
                    "status": n.status,
                    "priority": n.priority,
                    "heartbeat": n.timestamp_utc.to_rfc3339(),
                    "persistenceDegraded": n.persistence_degraded,
                    "alive": !n.timestamp_utc.is_expired(now, threshold),
                })
            })
            .collect();
        let doc = serde_json::json!({
            "masterId": view.master_id,
            "masterEpoch": view.master_epoch,
            "masterLive": live.is_some(),
            "nodes": nodes,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    match (&view.master_id, &live) {
        (Some(id), Some(_)) => println!("master: {id} (epoch {})", view.master_epoch),
        (Some(id), None) => println!("master: {id} (epoch {}, not live)", view.master_epoch),
        (None, _) => println!("master: none"),
    }
    for node in view.nodes.values() {
        let alive = if node.timestamp_utc.is_expired(now, threshold) {
            "dead"
        } else {
            "alive"
        };
        let degraded = if node.persistence_degraded {
            " persistence-degraded"
        } else {
            ""
        };
        println!(
            "  {} {} priority={} uri={} heartbeat={} {alive}{degraded}",
            node.node_id,
            node.status,
            node.priority,
            node.uri,
            node.timestamp_utc.to_rfc3339(),
        );
    }
    Ok(())
}

async fn compact(path: &Path, dry_run: bool, retention: Duration) -> Result<()> {
    let store = open_store(path).await?;
    let compactor = Compactor::new(store).with_node_retention(retention);
    let plan = compactor.analyze(SystemClock.now()).await?;

    println!(
        "keep {}, delete {} (corrupt {}, unreachable {}, stale node {})",
        plan.keep_count(),
        plan.delete_count(),
        plan.count(CompactReason::Corrupt),
        plan.count(CompactReason::Unreachable),
        plan.count(CompactReason::StaleNode),
    );
    if dry_run {
        for (record, reason) in &plan.delete {
            println!("  {record}: {reason}");
        }
        return Ok(());
    }

    let result = compactor.compact(&plan).await;
    println!(
        "deleted {}, kept {}, errors {}",
        result.deleted_count, result.kept_count, result.error_count
    );
    if !result.is_success() {
        bail!("{} records could not be deleted", result.error_count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("Standby").unwrap(), HaMode::Standby);
        assert_eq!(parse_mode("disabled").unwrap(), HaMode::Disabled);
        assert!(parse_mode("leader").is_err());
    }

    #[test]
    fn test_cli_parses_node_flags() {
        let cli = Cli::try_parse_from([
            "cairn", "--log", "cairn=debug", "node", "--store", "/tmp/s", "--node-id", "n1",
            "--mode", "master", "--priority", "3",
        ])
        .unwrap();
        assert_eq!(cli.log.as_deref(), Some("cairn=debug"));
        match cli.command {
            Commands::Node {
                store,
                node_id,
                mode,
                priority,
                ..
            } => {
                assert_eq!(store, Some(PathBuf::from("/tmp/s")));
                assert_eq!(node_id.as_deref(), Some("n1"));
                assert_eq!(mode, Some(HaMode::Master));
                assert_eq!(priority, Some(3));
            }
            _ => panic!("expected node command"),
        }
    }

    #[tokio::test]
    async fn test_missing_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(open_store(&missing).await.is_err());
    }
}
