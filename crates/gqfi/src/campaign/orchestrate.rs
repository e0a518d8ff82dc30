//! Target-level orchestration: the glue a real `gqfi-campaign` invocation
//! needs between the library's building blocks (Analyzer, sample space,
//! shard plan, worker pool) — thin enough to keep the CLI binaries
//! genuinely thin (SPEC_FULL.md §1.4) without leaving the wiring
//! unwritten.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::analyze::{self, Analyzer};
use crate::bootstrap;
use crate::campaign::cluster::{ClusterWorkerPool, RemoteShardUnit};
use crate::campaign::factory::{ConfiguredStrategyFactory, QemuDriverFactory};
use crate::campaign::plan_shards;
use crate::campaign::pool::{LocalWorkerPool, ShardOutcome, ShardUnit, WorkerPool};
use crate::campaign::shard::ShardRunner;
use crate::config::GqfiConfig;
use crate::driver::{QemuRspDriver, SymbolTable};
use crate::error::Result;
use crate::inject::SampleSpace;
use crate::result;
use crate::target::Target;

/// Per-shard disk image path: the baseline snapshot disk suffixed by
/// shard id, so concurrent shards never share a qcow2 file (spec.md §5:
/// "two concurrent shards for the same target use disjoint copies of the
/// target disk image").
pub fn shard_disk_path(base_disk: &Path, shard_id: u32) -> PathBuf {
    let stem = base_disk
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = base_disk
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("img");
    base_disk.with_file_name(format!("{stem}_shard{shard_id}.{ext}"))
}

/// Physically copy the analyzed baseline disk (already carrying the
/// `sys_start_state` snapshot) into a shard's private copy, unless that
/// copy already exists from a prior run (spec.md §4.4 resumption).
fn ensure_shard_disk_copy(base_disk: &Path, shard_disk: &Path) -> Result<()> {
    if !shard_disk.exists() {
        std::fs::copy(base_disk, shard_disk)?;
    }
    Ok(())
}

/// Run the Analyzer if this target has no cached artifacts yet, otherwise
/// reload them from disk (spec.md §4.4: artifacts are "read-only and may
/// be shared" across shards). Exposed directly for `gqfi-analyze`, which
/// only ever needs this one step.
pub async fn ensure_analysis(
    target: &Target,
    config: &GqfiConfig,
    symbols: Arc<dyn SymbolTable>,
) -> Result<(analyze::AnalysisArtifacts, analyze::ArtifactPaths)> {
    let paths = analyze::artifact_paths(
        &config.output_folder_analyze,
        &config.output_folder_qemu_snapshot,
        &target.name,
    );
    std::fs::create_dir_all(&config.output_folder_analyze)?;
    std::fs::create_dir_all(&config.output_folder_qemu_snapshot)?;
    bootstrap::ensure_disk_image(&paths.disk_image, config.qemu_image_size_in_mb)?;

    if paths.runtime.exists() {
        let artifacts = analyze::read_artifacts(&paths)?;
        return Ok((artifacts, paths));
    }

    let driver = QemuRspDriver::new(symbols.clone());
    let mut analyzer = Analyzer::new(driver, config, symbols.as_ref());
    let artifacts = analyzer.analyze(target, &paths.disk_image).await?;
    analyze::write_artifacts(&paths, &artifacts)?;
    Ok((artifacts, paths))
}

/// Outcome of running every shard of one target's campaign.
pub struct TargetCampaignResult {
    pub merged_result_path: PathBuf,
    pub shard_outcomes: Vec<Result<ShardOutcome>>,
}

/// Run a complete target campaign: analyze (or reload cached artifacts),
/// plan shards, fan them out over the configured backend, and merge the
/// per-shard result files (spec.md §4.4, §8).
///
/// `config_path` and `targets_folder` are the paths the calling binary was
/// actually invoked with; cluster mode re-passes them verbatim to each
/// remote `gqfi-shard` invocation (spec.md §6), since neither is otherwise
/// recoverable from `GqfiConfig` or `Target` alone.
pub async fn run_campaign_for_target(
    target: &Target,
    config: &GqfiConfig,
    config_path: &Path,
    targets_folder: &Path,
) -> Result<TargetCampaignResult> {
    let symbols: Arc<dyn SymbolTable> =
        Arc::new(crate::symbols::ElfSymbolTable::load(&target.elf64_path)?);

    let (golden, paths) = ensure_analysis(target, config, symbols.clone()).await?;
    let sample_space = Arc::new(SampleSpace::new(&golden.effective_regions)?);
    let golden = Arc::new(golden);

    std::fs::create_dir_all(&config.output_folder_fi_results)?;
    let plans = plan_shards(config);

    let units: Vec<Box<dyn ShardUnit>>;
    let pool: Box<dyn WorkerPool>;
    if config.run_parallel_in_cluster {
        let hosts = crate::campaign::cluster::read_host_list(
            config
                .cluster_list_file
                .as_deref()
                .expect("validated at config load: cluster mode requires cluster_list_file"),
        )?;
        let cluster = ClusterWorkerPool::new(hosts)?;
        units = build_cluster_units(target, &cluster, &plans, config_path, targets_folder);
        pool = Box::new(cluster);
    } else {
        units = build_local_units(
            target,
            config,
            &paths.disk_image,
            &symbols,
            &sample_space,
            &golden,
            &plans,
        )?;
        pool = Box::new(LocalWorkerPool::new());
    }

    let shard_outcomes = pool.run_all(units).await;

    let shard_paths: Vec<PathBuf> = plans
        .iter()
        .map(|p| result_path(config, &target.name, p.shard_id))
        .collect();
    let merged_result_path = config
        .output_folder_fi_results
        .join(format!("{}_merged.txt", target.name));
    result::merge_shards(&shard_paths, &merged_result_path)?;

    Ok(TargetCampaignResult {
        merged_result_path,
        shard_outcomes,
    })
}

fn result_path(config: &GqfiConfig, target_name: &str, shard_id: u32) -> PathBuf {
    config
        .output_folder_fi_results
        .join(format!("{target_name}_shard{shard_id}.txt"))
}

fn build_local_units(
    target: &Target,
    config: &GqfiConfig,
    base_disk: &Path,
    symbols: &Arc<dyn SymbolTable>,
    sample_space: &Arc<SampleSpace>,
    golden: &Arc<analyze::AnalysisArtifacts>,
    plans: &[crate::campaign::ShardPlan],
) -> Result<Vec<Box<dyn ShardUnit>>> {
    let driver_factory = Arc::new(QemuDriverFactory::new(symbols.clone()));
    let strategy_factory = Arc::new(ConfiguredStrategyFactory::new(config));
    let config = Arc::new(config.clone());

    let mut units: Vec<Box<dyn ShardUnit>> = Vec::with_capacity(plans.len());
    for plan in plans {
        let shard_disk = shard_disk_path(base_disk, plan.shard_id);
        ensure_shard_disk_copy(base_disk, &shard_disk)?;
        units.push(Box::new(ShardRunner {
            plan: *plan,
            config: config.clone(),
            symbols: symbols.clone(),
            sample_space: sample_space.clone(),
            golden: golden.clone(),
            driver_factory: driver_factory.clone(),
            strategy_factory: strategy_factory.clone(),
            disk: shard_disk,
            image32: target.elf32_path.clone(),
            result_path: result_path(&config, &target.name, plan.shard_id),
        }));
    }
    Ok(units)
}

fn build_cluster_units(
    target: &Target,
    cluster: &ClusterWorkerPool,
    plans: &[crate::campaign::ShardPlan],
    config_path: &Path,
    targets_folder: &Path,
) -> Vec<Box<dyn ShardUnit>> {
    plans
        .iter()
        .map(|plan| {
            let unit: Box<dyn ShardUnit> = Box::new(RemoteShardUnit {
                shard_id: plan.shard_id,
                host: cluster.host_for_shard(plan.shard_id).to_string(),
                config_path: config_path.to_path_buf(),
                targets_folder: targets_folder.to_path_buf(),
                target_name: target.name.clone(),
            });
            unit
        })
        .collect()
}
