//! Per-shard supervision (spec.md §4.4 "Resumption" and "Shard restart").
//!
//! Replaces the original's `subprocess.Popen(shell=True)` retry loop
//! (rerun the whole shard script on a non-zero exit code) with explicit
//! supervision of one [`ExperimentEngine`]: a watchguard timeout tears
//! down the stuck emulator and gets a fresh engine, but experiments
//! already appended to the result file are never replayed.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::analyze::AnalysisArtifacts;
use crate::campaign::pool::{ShardOutcome, ShardUnit};
use crate::campaign::ShardPlan;
use crate::config::GqfiConfig;
use crate::driver::{BoxedDriver, EmulatorDriver, SymbolTable};
use crate::error::{GqfiError, Result};
use crate::inject::{ExperimentEngine, FaultStrategy, SampleSpace};
use crate::result::ResultStore;

/// Everything a shard needs to build a fresh emulator driver on restart.
/// Boxed rather than generic so [`ShardRunner`] can be type-erased into
/// [`ShardUnit`] trait objects for the worker pool.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> Box<dyn EmulatorDriver>;
}

pub trait StrategyFactory: Send + Sync {
    fn create(&self) -> Box<dyn FaultStrategy>;
}

pub struct ShardRunner {
    pub plan: ShardPlan,
    pub config: Arc<GqfiConfig>,
    pub symbols: Arc<dyn SymbolTable>,
    pub sample_space: Arc<SampleSpace>,
    pub golden: Arc<AnalysisArtifacts>,
    pub driver_factory: Arc<dyn DriverFactory>,
    pub strategy_factory: Arc<dyn StrategyFactory>,
    pub disk: PathBuf,
    pub image32: PathBuf,
    pub result_path: PathBuf,
}

#[async_trait]
impl ShardUnit for ShardRunner {
    async fn run(self: Box<Self>) -> Result<ShardOutcome> {
        let mut store = ResultStore::open(&self.result_path)?;
        let mut recorded_this_session = 0u64;

        loop {
            let already = store.records_on_open() + recorded_this_session;
            if already >= self.plan.experiment_count {
                break;
            }
            let remaining = self.plan.experiment_count - already;

            let driver = self.driver_factory.create();
            let strategy = self.strategy_factory.create();
            let mut engine = ExperimentEngine::new(
                BoxedDriver(driver),
                self.symbols.as_ref(),
                self.config.as_ref(),
                strategy,
                self.disk.clone(),
                self.image32.clone(),
            );

            let mut batch_recorded = 0u64;
            let outcome = engine
                .run_until_count(remaining, &self.sample_space, &self.golden, |record| {
                    batch_recorded += 1;
                    if let Err(e) = store.append(&record) {
                        tracing::error!(shard = self.plan.shard_id, "failed to append record: {e}");
                    }
                })
                .await;
            recorded_this_session += batch_recorded;

            match outcome {
                Ok(()) => break,
                Err(GqfiError::Scheduling(reason)) => {
                    tracing::warn!(
                        shard = self.plan.shard_id,
                        reason,
                        "watchguard fired, restarting shard with a fresh emulator"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(ShardOutcome {
            shard_id: self.plan.shard_id,
            records_written: store.records_on_open() + recorded_this_session,
        })
    }
}

