//! Thin CLI wrapper that runs exactly one shard to completion
//! (SPEC_FULL.md §1.4, REDESIGN FLAG #3 cluster variant): this is the
//! binary `ClusterWorkerPool` invokes over `ssh` on each cluster host.
//! Prints the shard's final record count as the last line of stdout, the
//! only thing `RemoteShardUnit` reads back from the remote invocation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gqfi::campaign::factory::{ConfiguredStrategyFactory, QemuDriverFactory};
use gqfi::campaign::orchestrate::{ensure_analysis, shard_disk_path};
use gqfi::campaign::pool::ShardUnit;
use gqfi::campaign::shard::ShardRunner;
use gqfi::campaign::{plan_shards, ShardPlan};
use gqfi::config::GqfiConfig;
use gqfi::driver::SymbolTable;
use gqfi::inject::SampleSpace;
use gqfi::symbols::ElfSymbolTable;
use gqfi::target;

/// Run one shard of a campaign for one target.
#[derive(Parser, Debug)]
#[command(name = "gqfi-shard")]
struct Args {
    /// Path to the campaign configuration document (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Folder to discover `(elf64, elf32)` target pairs in.
    #[arg(long)]
    targets_folder: PathBuf,

    /// Target name, as reported by `gqfi::target::discover`.
    #[arg(long)]
    target: String,

    /// Shard index within `config.chunk_factor`.
    #[arg(long)]
    shard_id: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = GqfiConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {:?}", args.config))?;

    let target = target::discover(&args.targets_folder)
        .with_context(|| format!("discovering targets in {:?}", args.targets_folder))?
        .into_iter()
        .find(|t| t.name == args.target)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "target {:?} not found in {:?}",
                args.target,
                args.targets_folder
            )
        })?;

    let plan: ShardPlan = plan_shards(&config)
        .into_iter()
        .find(|p| p.shard_id == args.shard_id)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "shard {} is out of range for chunk_factor {}",
                args.shard_id,
                config.chunk_factor
            )
        })?;

    let symbols: Arc<dyn SymbolTable> = Arc::new(ElfSymbolTable::load(&target.elf64_path)?);
    let (golden, paths) = ensure_analysis(&target, &config, symbols.clone()).await?;
    let sample_space = SampleSpace::new(&golden.effective_regions)?;

    let shard_disk = shard_disk_path(&paths.disk_image, plan.shard_id);
    if !shard_disk.exists() {
        std::fs::copy(&paths.disk_image, &shard_disk)
            .with_context(|| format!("copying {:?} to {:?}", paths.disk_image, shard_disk))?;
    }

    std::fs::create_dir_all(&config.output_folder_fi_results)?;
    let result_path = config
        .output_folder_fi_results
        .join(format!("{}_shard{}.txt", target.name, plan.shard_id));

    let strategy_factory = Arc::new(ConfiguredStrategyFactory::new(&config));
    let runner = ShardRunner {
        plan,
        config: Arc::new(config),
        symbols: symbols.clone(),
        sample_space: Arc::new(sample_space),
        golden: Arc::new(golden),
        driver_factory: Arc::new(QemuDriverFactory::new(symbols)),
        strategy_factory,
        disk: shard_disk,
        image32: target.elf32_path.clone(),
        result_path,
    };

    let outcome = Box::new(runner).run().await?;
    println!("{}", outcome.records_written);
    Ok(())
}
