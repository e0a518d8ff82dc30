//! Transient (single-bit flip) state machine (spec.md §4.3.1).
//!
//! `PRIMED -> RUNNING_PRE_FAULT -> (NMI_DELIVERED -> INJECTED ->
//! RUNNING_POST_FAULT)* -> CLASSIFIED`

use std::net::UdpSocket;
use std::time::Duration;

use async_trait::async_trait;

use crate::analyze::AnalysisArtifacts;
use crate::config::GqfiConfig;
use crate::driver::{EmulatorDriver, HitSymbol, SymbolTable};
use crate::error::{GqfiError, Result};
use crate::inject::classify::{classify, HaltLocation, HaltObservation, Outcome};
use crate::inject::context::ExperimentContext;
use crate::inject::sample_space::BitAddress;
use crate::inject::serial::matches_golden;
use crate::inject::FaultStrategy;
use crate::pmu::{self, FixedCounter};

pub struct TransientStrategy {
    pub counter: FixedCounter,
}

fn resolve(symbols: &dyn SymbolTable, name: &str) -> Result<u64> {
    symbols
        .resolve(name)
        .ok_or_else(|| GqfiError::Injection(format!("unresolved symbol: {name}")))
}

/// `marker_detected` is not present in every target variant (baseline
/// builds with no self-check have no detection function at all), so unlike
/// the other markers its absence from the symbol table is not an error.
fn detected_marker_present(symbols: &dyn SymbolTable, config: &GqfiConfig) -> bool {
    symbols.resolve(&config.marker_detected).is_some()
}

#[async_trait]
impl FaultStrategy for TransientStrategy {
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
    ) -> Result<Option<Outcome>> {
        // PRIMED / RUNNING_PRE_FAULT, all under the watchguard (spec.md §5:
        // every suspension point here may block indefinitely, and nothing
        // but the fixed 300s fuse bounds it before a fault is confirmed
        // delivered).
        let detected_present = detected_marker_present(symbols, config);
        let ready = ctx
            .guard_pre_fault(async {
                driver.clear_breakpoints().await?;
                driver
                    .load_snapshot("sys_start_state", &config.marker_start)
                    .await?;
                driver
                    .set_hw_breakpoint(resolve(symbols, &config.marker_nmi_handler)?)
                    .await?;
                driver
                    .set_hw_breakpoint(resolve(symbols, &config.marker_finished)?)
                    .await?;
                if detected_present {
                    driver
                        .set_hw_breakpoint(resolve(symbols, &config.marker_detected)?)
                        .await?;
                }
                for trap in &config.marker_traps {
                    driver.set_hw_breakpoint(resolve(symbols, trap)?).await?;
                }

                // Arm the PMU counter so overflow fires exactly `time_to_stop`
                // ticks later.
                driver
                    .write_msr(pmu::IA32_FIXED_CTR_CTRL, self.counter.ctrl_pmi_value())
                    .await?;
                driver
                    .write_msr(
                        self.counter.msr_index(),
                        pmu::preload_for_ticks(time_to_stop),
                    )
                    .await?;
                driver
                    .write_msr(
                        pmu::IA32_PERF_GLOBAL_CTRL,
                        self.counter.global_enable_value(),
                    )
                    .await?;

                let mut pre_fault_symbols =
                    vec![config.marker_nmi_handler.as_str(), config.marker_finished.as_str()];
                if detected_present {
                    pre_fault_symbols.push(config.marker_detected.as_str());
                }
                pre_fault_symbols.extend(config.marker_traps.iter().map(String::as_str));
                let first_halt = driver.run_until(&pre_fault_symbols).await?;

                let at_nmi = matches!(&first_halt, HitSymbol::Symbol(s) if s == &config.marker_nmi_handler);
                if !at_nmi {
                    // Halted at `finished`, `detected`, or a trap before the
                    // counter overflowed: time_to_stop exceeded the
                    // remaining runtime. No fault was delivered (spec.md
                    // §4.3.1 step 4) — redraw without recording.
                    return Ok(false);
                }
                let status = driver.read_msr(pmu::IA32_PERF_GLOBAL_STATUS).await?;
                Ok(self.counter.overflowed(status))
            })
            .await?;

        if !ready {
            // Void draw: no fault was delivered, redraw without recording.
            return Ok(None);
        }

        // NMI_DELIVERED -> INJECTED
        let current = driver.read_byte(bit_addr.addr).await?;
        driver
            .write_byte(bit_addr.addr, current ^ (1 << bit_addr.bit))
            .await?;

        let timeout_secs = config.per_run_timeout_secs(golden.runtime_wall_seconds);
        let _timer = ctx.arm_timeout(Duration::from_secs_f64(timeout_secs));

        // RUNNING_POST_FAULT
        let mut post_fault_symbols = vec![config.marker_finished.as_str()];
        if detected_present {
            post_fault_symbols.push(config.marker_detected.as_str());
        }
        post_fault_symbols.extend(config.marker_traps.iter().map(String::as_str));
        let second_halt = tokio::select! {
            halt = driver.run_until(&post_fault_symbols) => halt?,
            _ = ctx.cancellation_token().cancelled() => {
                return Ok(Some(classify(&HaltObservation {
                    timed_out: true,
                    halt: HaltLocation::Other,
                    serial_matches_golden: None,
                })));
            }
        };

        let halt_location = match &second_halt {
            HitSymbol::Symbol(s) if s == &config.marker_finished => HaltLocation::Finished,
            HitSymbol::Symbol(s) if s == &config.marker_detected => HaltLocation::Detected,
            HitSymbol::Symbol(s) if config.marker_traps.contains(s) => HaltLocation::Trap,
            HitSymbol::Symbol(_) => HaltLocation::Other,
            HitSymbol::Disconnected => HaltLocation::Disconnected,
        };

        let serial_matches_golden = if matches!(halt_location, HaltLocation::Finished) {
            Some(matches_golden(serial, &golden.golden_output))
        } else {
            None
        };

        Ok(Some(classify(&HaltObservation {
            timed_out: ctx.is_cancelled(),
            halt: halt_location,
            serial_matches_golden,
        })))
    }
}
