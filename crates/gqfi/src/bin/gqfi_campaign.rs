//! Thin CLI wrapper around the Campaign Scheduler (SPEC_FULL.md §1.4):
//! discovers targets, analyzes each, fans its experiments out over the
//! configured worker pool, and merges the per-shard result files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gqfi::campaign::orchestrate::run_campaign_for_target;
use gqfi::config::GqfiConfig;
use gqfi::target;

/// Run a full fault-injection campaign over every discovered target.
#[derive(Parser, Debug)]
#[command(name = "gqfi-campaign")]
struct Args {
    /// Path to the campaign configuration document (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Folder to discover `(elf64, elf32)` target pairs in.
    #[arg(long)]
    targets_folder: PathBuf,

    /// Restrict the campaign to a single target by name.
    #[arg(long)]
    target: Option<String>,
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

    let targets = target::discover(&args.targets_folder)
        .with_context(|| format!("discovering targets in {:?}", args.targets_folder))?;
    let targets: Vec<_> = targets
        .into_iter()
        .filter(|t| args.target.as_deref().map_or(true, |name| name == t.name))
        .collect();
    if targets.is_empty() {
        anyhow::bail!("no targets found in {:?}", args.targets_folder);
    }

    for target in &targets {
        tracing::info!(target = target.name.as_str(), "starting campaign");
        let result =
            run_campaign_for_target(target, &config, &args.config, &args.targets_folder).await?;

        let failed = result
            .shard_outcomes
            .iter()
            .filter(|o| o.is_err())
            .count();
        let records_written: u64 = result
            .shard_outcomes
            .iter()
            .filter_map(|o| o.as_ref().ok())
            .map(|o| o.records_written)
            .sum();

        tracing::info!(
            target = target.name.as_str(),
            records_written,
            failed_shards = failed,
            merged = ?result.merged_result_path,
            "campaign finished"
        );
        if failed > 0 {
            for outcome in &result.shard_outcomes {
                if let Err(e) = outcome {
                    tracing::error!(target = target.name.as_str(), "shard failed: {e}");
                }
            }
        }
    }

    Ok(())
}
