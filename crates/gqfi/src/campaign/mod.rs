//! Campaign Scheduler (spec.md §4.4).

pub mod cluster;
pub mod factory;
pub mod orchestrate;
pub mod pool;
pub mod shard;

use crate::config::GqfiConfig;

/// One shard's share of a target's sample budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    pub shard_id: u32,
    pub experiment_count: u64,
}

/// `experiments_per_shard = samples / chunk_factor`, remainder assigned to
/// shard 0 (spec.md §4.4; Open Question resolved in DESIGN.md: exact-total
/// semantics are preserved even though this skews shard 0's completion
/// time).
pub fn plan_shards(config: &GqfiConfig) -> Vec<ShardPlan> {
    let chunk_factor = config.chunk_factor as u64;
    let per_shard = config.samples / chunk_factor;
    let remainder = config.samples % chunk_factor;

    (0..config.chunk_factor)
        .map(|shard_id| {
            let extra = if shard_id == 0 { remainder } else { 0 };
            ShardPlan {
                shard_id,
                experiment_count: per_shard + extra,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, RuntimeReduction, TimeMode};
    use std::path::PathBuf;

    fn config(samples: u64, chunk_factor: u32) -> GqfiConfig {
        GqfiConfig {
            create_64_bit_elf_wrapper: false,
            output_folder_analyze: PathBuf::from("/tmp/a"),
            output_folder_qemu_snapshot: PathBuf::from("/tmp/s"),
            output_folder_fi_results: PathBuf::from("/tmp/r"),
            qemu_image_size_in_mb: 16,
            mode: Mode::SingleBitFlip,
            permanent_mode: None,
            time_mode: TimeMode::Instructions,
            timemode_runtime_method: RuntimeReduction::Median,
            samples,
            chunk_factor,
            marker_start: "_start".into(),
            marker_finished: "finished".into(),
            marker_detected: "detected".into(),
            marker_nmi_handler: "nmi_handler".into(),
            marker_stack_ready: "stack_ready".into(),
            marker_traps: vec![],
            mem_regions: vec![],
            timeout_multiplier: 3.0,
            run_parallel_in_cluster: false,
            cluster_list_file: None,
            watchguard_secs: 300,
        }
    }

    #[test]
    fn evenly_divisible_samples_split_equally() {
        let plans = plan_shards(&config(100, 4));
        assert_eq!(plans.len(), 4);
        for plan in &plans {
            assert_eq!(plan.experiment_count, 25);
        }
    }

    #[test]
    fn remainder_goes_entirely_to_shard_zero() {
        let plans = plan_shards(&config(101, 4));
        assert_eq!(plans[0].experiment_count, 26);
        assert_eq!(plans[1].experiment_count, 25);
        assert_eq!(plans[2].experiment_count, 25);
        assert_eq!(plans[3].experiment_count, 25);

        let total: u64 = plans.iter().map(|p| p.experiment_count).sum();
        assert_eq!(total, 101, "exact-total semantics must be preserved");
    }

    #[test]
    fn more_shards_than_samples_leaves_some_empty() {
        let plans = plan_shards(&config(2, 4));
        let total: u64 = plans.iter().map(|p| p.experiment_count).sum();
        assert_eq!(total, 2);
        assert_eq!(plans[0].experiment_count, 2);
        assert_eq!(plans[1].experiment_count, 0);
    }
}
