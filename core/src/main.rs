//! cowtree - storage core exerciser
//!
//! Drives randomized workloads and snapshot scenarios against an in-memory
//! block store and prints the resulting tree and store statistics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL};
use cowtree_core::{
    BlockStore, CopyOnWriteDiscipline, Discipline, EngineConfig, InPlaceDiscipline,
    MemoryBlockStore, TreeEngine, store::StoreStats, tree::TreeSummary,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing_subscriber::{filter::EnvFilter, fmt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "cowtree", version, about = "Copy-on-write B+tree storage core")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true, default_value = "cowtree.json")]
    config: PathBuf,

    /// Print statistics as JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a randomized insert/remove workload, checking the tree after every step
    Stress {
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Use the copy-on-write discipline, forking a snapshot every 1000 operations
        #[arg(long)]
        cow: bool,
    },
    /// Fork a tree, mutate the fork, drop the original and report reference counts
    Snapshot {
        #[arg(long, default_value_t = 500)]
        entries: u64,
    },
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::load_from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Command::Stress { ops, seed, cow } => {
            let store = Arc::new(MemoryBlockStore::from_config(&config));
            let summary = if cow {
                stress(Arc::clone(&store), CopyOnWriteDiscipline, &config, ops, seed)?
            } else {
                stress(Arc::clone(&store), InPlaceDiscipline, &config, ops, seed)?
            };
            report(&summary, &store.stats(), args.json)?;
        }
        Command::Snapshot { entries } => snapshot(&config, entries, args.json)?,
    }
    Ok(())
}

fn stress<D: Discipline>(
    store: Arc<MemoryBlockStore>,
    discipline: D,
    config: &EngineConfig,
    ops: usize,
    seed: u64,
) -> Result<TreeSummary> {
    let mut rng = StdRng::seed_from_u64(seed);
    let cow = discipline.is_copy_on_write();
    let mut engine = TreeEngine::create(
        Arc::clone(&store),
        discipline,
        config.tree.clone(),
        Uuid::new_v4(),
    )?;
    let mut model: Vec<u64> = Vec::new();
    let mut snapshots = Vec::new();

    println!(
        "{} {} operations, seed {}, {}",
        "Running".bright_green(),
        ops,
        seed,
        if cow { "copy-on-write" } else { "in-place" }
    );

    for step in 0..ops {
        if model.is_empty() || rng.gen_bool(0.6) {
            let at = rng.gen_range(0..=model.len());
            let value = rng.gen_range(0..1_000_000u64);
            engine.insert(at as u64, value)?;
            model.insert(at, value);
        } else {
            let at = rng.gen_range(0..model.len());
            let removed = engine.remove(at as u64)?;
            let expected = model.remove(at);
            if removed != expected {
                bail!("step {step}: removed {removed} at {at}, expected {expected}");
            }
        }

        let summary = engine
            .check()
            .with_context(|| format!("tree check failed after step {step}"))?;
        if summary.entries != model.len() as u64 {
            bail!(
                "step {step}: tree holds {} entries, model holds {}",
                summary.entries,
                model.len()
            );
        }

        if cow && step % 1000 == 999 {
            let snapshot = engine.fork(Uuid::new_v4())?;
            snapshots.push((snapshot, model.clone()));
        }
    }

    if engine.entries()? != model {
        bail!("final entry sequence differs from the model");
    }
    for (snapshot, expected) in &snapshots {
        if snapshot.entries()? != *expected {
            bail!("snapshot {} no longer matches its contents", snapshot.owner());
        }
    }
    println!("{} all checks passed", "✓".bright_green().bold());
    Ok(engine.check()?)
}

fn snapshot(config: &EngineConfig, entries: u64, json: bool) -> Result<()> {
    let store = Arc::new(MemoryBlockStore::from_config(config));
    let mut original = TreeEngine::create(
        Arc::clone(&store),
        CopyOnWriteDiscipline,
        config.tree.clone(),
        Uuid::new_v4(),
    )?;
    for v in 0..entries {
        original.push(v)?;
    }
    let before = store.block_count();

    let mut fork = original.fork(Uuid::new_v4())?;
    fork.insert(0, u64::MAX)?;
    let shared = store.block_count();
    println!(
        "{} {} blocks before fork, {} after one write to the fork",
        "Snapshot:".bright_cyan(),
        before,
        shared
    );

    original.drop_container()?;
    let summary = fork.check()?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Block", "Refs"]);
    for id in store.block_ids().into_iter().take(16) {
        table.add_row(vec![id.to_string(), store.ref_count(id)?.to_string()]);
    }
    println!("{table}");

    if summary.blocks != store.block_count() {
        bail!(
            "{} blocks reachable from the fork but {} live in the store",
            summary.blocks,
            store.block_count()
        );
    }
    report(&summary, &store.stats(), json)
}

fn report(summary: &TreeSummary, stats: &StoreStats, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "tree": {
                "height": summary.height,
                "blocks": summary.blocks,
                "entries": summary.entries,
                "sum": summary.sum,
            },
            "store": stats,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["height".to_string(), summary.height.to_string()]);
    table.add_row(vec!["entries".to_string(), summary.entries.to_string()]);
    table.add_row(vec!["reachable blocks".to_string(), summary.blocks.to_string()]);
    table.add_row(vec!["live blocks".to_string(), stats.blocks.to_string()]);
    table.add_row(vec!["free pool units".to_string(), stats.free_units.to_string()]);
    table.add_row(vec!["reserved units".to_string(), stats.reserved_units.to_string()]);
    table.add_row(vec!["physical reads".to_string(), stats.physical_reads.to_string()]);
    table.add_row(vec![
        "cache hit ratio".to_string(),
        format!("{:.3}", stats.cache.hit_ratio()),
    ]);
    table.add_row(vec!["ghost hits".to_string(), stats.cache.ghost_hits.to_string()]);
    table.add_row(vec!["evictions".to_string(), stats.cache.evictions.to_string()]);
    println!("{table}");
    Ok(())
}
