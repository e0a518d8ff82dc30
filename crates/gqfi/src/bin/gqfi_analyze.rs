//! Thin CLI wrapper around the Analyzer (SPEC_FULL.md §1.4): discovers
//! every target in a folder and ensures each has fresh analysis artifacts
//! on disk, without running any fault-injection experiments.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gqfi::campaign::orchestrate::ensure_analysis;
use gqfi::config::GqfiConfig;
use gqfi::symbols::ElfSymbolTable;
use gqfi::target;

/// Run the Analyzer over every target discovered in a folder.
#[derive(Parser, Debug)]
#[command(name = "gqfi-analyze")]
struct Args {
    /// Path to the campaign configuration document (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Folder to discover `(elf64, elf32)` target pairs in.
    #[arg(long)]
    targets_folder: PathBuf,

    /// Restrict analysis to a single target by name.
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
        tracing::info!(target = target.name.as_str(), "analyzing target");
        let symbols: Arc<dyn gqfi::driver::SymbolTable> =
            Arc::new(ElfSymbolTable::load(&target.elf64_path)?);
        let (artifacts, paths) = ensure_analysis(target, &config, symbols).await?;
        tracing::info!(
            target = target.name.as_str(),
            runtime_samples = artifacts.runtime_samples.len(),
            effective_regions = artifacts.effective_regions.len(),
            disk_image = ?paths.disk_image,
            "analysis complete"
        );
    }

    Ok(())
}
