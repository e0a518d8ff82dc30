//! Experiment Engine (spec.md §4.3).
//!
//! REDESIGN FLAG #5: transient and permanent fault delivery share one
//! engine; only [`FaultStrategy::run_experiment`] differs between them.

pub mod classify;
pub mod context;
pub mod permanent;
pub mod sample_space;
pub mod serial;
pub mod transient;

use std::net::UdpSocket;
use std::time::Duration;

use async_trait::async_trait;

pub use classify::Outcome;
pub use context::ExperimentContext;
pub use sample_space::{BitAddress, SampleSpace};

use crate::analyze::AnalysisArtifacts;
use crate::config::GqfiConfig;
use crate::driver::{bind_serial_sink, EmulatorDriver, SymbolTable};
use crate::error::{GqfiError, Result};

/// One fault-delivery mechanism: NMI-on-PMU-overflow (transient) or
/// persistent-watchpoint (permanent). Returns `Ok(None)` for a void draw
/// that must be redrawn without recording (spec.md §4.3.1 step 4).
#[async_trait]
pub trait FaultStrategy: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn run_experiment(
        &self,
        driver: &mut dyn EmulatorDriver,
        symbols: &dyn SymbolTable,
        config: &GqfiConfig,
        bit_addr: BitAddress,
        time_to_stop: u64,
        golden: &AnalysisArtifacts,
        serial: &UdpSocket,
        ctx: &ExperimentContext,
    ) -> Result<Option<Outcome>>;
}

/// One recorded injection (spec.md §3 "Injection Record").
#[derive(Debug, Clone, Copy)]
pub struct InjectionRecord {
    pub addr: u64,
    pub bit: u8,
    pub time: u64,
    pub outcome: Outcome,
}

/// Owns one [`EmulatorDriver`] for the duration of a shard's worth of
/// experiments (spec.md §3 "Ownership").
pub struct ExperimentEngine<'a, D: EmulatorDriver> {
    driver: D,
    symbols: &'a dyn SymbolTable,
    config: &'a GqfiConfig,
    strategy: Box<dyn FaultStrategy>,
    disk: std::path::PathBuf,
    image32: std::path::PathBuf,
}

impl<'a, D: EmulatorDriver> ExperimentEngine<'a, D> {
    pub fn new(
        driver: D,
        symbols: &'a dyn SymbolTable,
        config: &'a GqfiConfig,
        strategy: Box<dyn FaultStrategy>,
        disk: std::path::PathBuf,
        image32: std::path::PathBuf,
    ) -> Self {
        Self {
            driver,
            symbols,
            config,
            strategy,
            disk,
            image32,
        }
    }

    /// Run experiments until `count` have been recorded, appending each to
    /// `on_record`. Void draws (no fault delivered) are retried silently
    /// and never reach `on_record`.
    pub async fn run_until_count(
        &mut self,
        count: u64,
        sample_space: &SampleSpace,
        golden: &AnalysisArtifacts,
        mut on_record: impl FnMut(InjectionRecord),
    ) -> Result<()> {
        let mut recorded = 0u64;
        while recorded < count {
            match self.run_one(sample_space, golden).await {
                Ok(Some(record)) => {
                    on_record(record);
                    recorded += 1;
                }
                Ok(None) => continue, // void draw, redraw without recording
                Err(GqfiError::Timeout { .. }) => {
                    // Watchguard fired: not recorded, shard-level restart
                    // is the caller's responsibility (spec.md §4.4).
                    return Err(GqfiError::Scheduling(
                        "watchguard timeout before fault-injection point".into(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Run exactly one fault-injection attempt: fresh emulator, draw a
    /// sample, delegate to the strategy, tear down. Returns `None` for a
    /// void draw (spec.md §4.3.1 step 4); the caller redraws.
    async fn run_one(
        &mut self,
        sample_space: &SampleSpace,
        golden: &AnalysisArtifacts,
    ) -> Result<Option<InjectionRecord>> {
        let mut rng = rand::thread_rng();
        let bit_addr = sample_space.draw(&mut rng)?;
        // Permanent faults have no fault instant; the result record always
        // carries `time=0` for them (spec.md §6 result file format).
        let time_to_stop = match self.config.mode {
            crate::config::Mode::SingleBitFlip => {
                let runtime = golden.reduced_runtime(self.config);
                sample_space::draw_time(&mut rng, runtime)
            }
            crate::config::Mode::Permanent => 0,
        };

        let (serial_socket, serial_port) = bind_serial_sink()?;
        self.driver
            .start(&self.image32, &self.disk, serial_port)
            .await?;

        // The watchguard only bounds the pre-injection phase (spec.md §5:
        // "if the engine appears wedged before ever reaching the
        // fault-injection point"); once a fault is confirmed delivered the
        // strategy's own per-run timeout (armed on `ctx` internally) takes
        // over, so the watchguard must not race the whole call here.
        let ctx = ExperimentContext::new(Duration::from_secs(self.config.watchguard_secs));

        let outcome = self
            .strategy
            .run_experiment(
                &mut self.driver,
                self.symbols,
                self.config,
                bit_addr,
                time_to_stop,
                golden,
                &serial_socket,
                &ctx,
            )
            .await;

        self.driver.quit().await?;

        let outcome = outcome?;

        Ok(outcome.map(|outcome| InjectionRecord {
            addr: bit_addr.addr,
            bit: bit_addr.bit,
            time: time_to_stop,
            outcome,
        }))
    }
}
