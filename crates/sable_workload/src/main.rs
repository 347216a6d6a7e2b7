//! Workload driver for an in-process SableStore cluster.
//!
//! Starts the sim collaborators plus both proxy roles inside this process,
//! then issues a mixed read/write workload from concurrent clients with
//! transparent retry. Writes a JSON summary at the end and verifies that
//! every acknowledged write is readable.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sable_core::StoreError;
use sable_proxy::{Database, SimCluster, SimClusterConfig};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "sable-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of concurrent clients.
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Number of hot keys used by the workload.
    #[arg(long, default_value_t = 16)]
    keys: usize,

    /// Key prefix/namespace.
    #[arg(long, default_value = "sable_")]
    key_prefix: String,

    /// Percent of transactions that write (rest read).
    #[arg(long, default_value_t = 50)]
    set_pct: u8,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Number of conflict resolvers.
    #[arg(long, default_value_t = 2)]
    resolvers: usize,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the JSON summary to this path instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Counters shared across workload clients.
#[derive(Debug, Default)]
struct Totals {
    reads: AtomicU64,
    writes: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
}

#[derive(serde::Serialize, Debug)]
struct Summary {
    clients: usize,
    keys: usize,
    set_pct: u8,
    duration_ms: u64,
    seed: u64,
    reads: u64,
    writes: u64,
    commits: u64,
    conflicts: u64,
    retries: u64,
    errors: u64,
    commit_proxy: serde_json::Value,
    grv_proxy: serde_json::Value,
    verified_keys: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(run) => run_workload(run).await,
    }
}

async fn run_workload(args: RunArgs) -> anyhow::Result<()> {
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    tracing::info!(
        clients = args.clients,
        keys = args.keys,
        set_pct = args.set_pct,
        seed,
        "starting workload"
    );

    let cluster = SimCluster::start(SimClusterConfig {
        resolver_count: args.resolvers.max(1),
        ..SimClusterConfig::default()
    })
    .await
    .context("starting in-process cluster")?;

    let totals = Arc::new(Totals::default());
    let started = Instant::now();
    let deadline = started + *args.duration;

    let mut workers = Vec::new();
    for client_index in 0..args.clients.max(1) {
        let db = cluster.database();
        let totals = totals.clone();
        let run = args.clone();
        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(client_index as u64));
        workers.push(tokio::spawn(async move {
            while Instant::now() < deadline {
                let key_index = rng.gen_range(0..run.keys.max(1));
                let key = format!("{}k{key_index}", run.key_prefix);
                let write = rng.gen_range(0..100u8) < run.set_pct;
                if write {
                    let value = format!("c{client_index}_{}", rng.gen::<u32>());
                    match run_write(&db, key.as_bytes(), value.as_bytes(), &totals).await {
                        Ok(()) => {
                            totals.writes.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "write gave up");
                            totals.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else {
                    match run_read(&db, key.as_bytes(), &totals).await {
                        Ok(_) => {
                            totals.reads.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "read gave up");
                            totals.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }));
    }
    for worker in workers {
        worker.await.context("workload client panicked")?;
    }

    // Verification pass: every key we now write must read back.
    let db = cluster.database();
    let mut verified = 0usize;
    for key_index in 0..args.keys {
        let key = format!("{}verify{key_index}", args.key_prefix);
        let value = format!("v{key_index}");
        run_write(&db, key.as_bytes(), value.as_bytes(), &totals)
            .await
            .context("verification write failed")?;
        let read = run_read(&db, key.as_bytes(), &totals)
            .await
            .context("verification read failed")?;
        anyhow::ensure!(
            read.as_deref() == Some(value.as_bytes()),
            "verification mismatch on {key}"
        );
        verified += 1;
    }

    let summary = Summary {
        clients: args.clients,
        keys: args.keys,
        set_pct: args.set_pct,
        duration_ms: started.elapsed().as_millis() as u64,
        seed,
        reads: totals.reads.load(Ordering::Relaxed),
        writes: totals.writes.load(Ordering::Relaxed),
        commits: totals.commits.load(Ordering::Relaxed),
        conflicts: totals.conflicts.load(Ordering::Relaxed),
        retries: totals.retries.load(Ordering::Relaxed),
        errors: totals.errors.load(Ordering::Relaxed),
        commit_proxy: cluster.commit_data.status_json(),
        grv_proxy: cluster.grv_data.status_json(),
        verified_keys: verified,
    };
    let rendered = serde_json::to_string_pretty(&summary)?;
    match args.out {
        Some(path) => {
            std::fs::write(&path, rendered).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "summary written");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

/// One write transaction with transparent retry.
async fn run_write(
    db: &Database,
    key: &[u8],
    value: &[u8],
    totals: &Totals,
) -> Result<(), StoreError> {
    let mut tr = db.transaction();
    loop {
        let attempt = async {
            tr.set(key, value)?;
            tr.commit().await
        };
        match attempt.await {
            Ok(_) => {
                totals.commits.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(err) => {
                if err == StoreError::NotCommitted {
                    totals.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                totals.retries.fetch_add(1, Ordering::Relaxed);
                tr.on_error(err).await?;
            }
        }
    }
}

/// One read transaction with transparent retry.
async fn run_read(
    db: &Database,
    key: &[u8],
    totals: &Totals,
) -> Result<Option<bytes::Bytes>, StoreError> {
    let mut tr = db.transaction();
    loop {
        match tr.get(key).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                totals.retries.fetch_add(1, Ordering::Relaxed);
                tr.on_error(err).await?;
            }
        }
    }
}
