//! Permanent (stuck-at) state machine (spec.md §4.3.2).
//!
//! `PRIMED -> WATCH_ACTIVE -> CLASSIFIED`

use std::net::UdpSocket;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::analyze::AnalysisArtifacts;
use crate::config::{GqfiConfig, PermanentMode};
use crate::driver::{EmulatorDriver, HitSymbol, SymbolTable};
use crate::error::{GqfiError, Result};
use crate::inject::classify::{classify, HaltLocation, HaltObservation, Outcome};
use crate::inject::context::ExperimentContext;
use crate::inject::sample_space::BitAddress;
use crate::inject::serial::matches_golden;
use crate::inject::FaultStrategy;

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

/// Resolve the configured `permanent_mode` into a concrete stuck value for
/// this one experiment, drawing a coin flip when it's `Random`.
fn stuck_value<R: Rng + ?Sized>(mode: PermanentMode, rng: &mut R) -> bool {
    match mode {
        PermanentMode::StuckAt0 => false,
        PermanentMode::StuckAt1 => true,
        PermanentMode::Random => rng.gen_bool(0.5),
    }
}

fn apply_mask(byte: u8, bit: u8, stuck_high: bool) -> u8 {
    if stuck_high {
        byte | (1 << bit)
    } else {
        byte & !(1 << bit)
    }
}

pub struct PermanentStrategy;

#[async_trait]
impl FaultStrategy for PermanentStrategy {
    async fn run_experiment(
        &self,
        driver: &mut dyn EmulatorDriver,
        symbols: &dyn SymbolTable,
        config: &GqfiConfig,
        bit_addr: BitAddress,
        _time_to_stop: u64,
        golden: &AnalysisArtifacts,
        serial: &UdpSocket,
        ctx: &ExperimentContext,
    ) -> Result<Option<Outcome>> {
        // Everything up to the stuck value actually landing in guest memory
        // is bounded by the watchguard only (spec.md §5); nothing bounds
        // `load_snapshot`/`step_one` otherwise if the guest never reaches a
        // runnable state.
        let mode = config.permanent_mode.unwrap_or(PermanentMode::StuckAt0);
        ctx.guard_pre_fault(async {
            driver
                .load_snapshot("sys_start_state", &config.marker_start)
                .await?;
            driver.step_one().await?;

            let mut rng = rand::thread_rng();
            let stuck_high = stuck_value(mode, &mut rng);

            let current = driver.read_byte(bit_addr.addr).await?;
            driver
                .write_byte(bit_addr.addr, apply_mask(current, bit_addr.bit, stuck_high))
                .await?;
            Ok(())
        })
        .await?;

        // Install the data watchpoint. The driver's stub re-applies the
        // stuck mask on every subsequent write to this byte without
        // halting the guest (spec.md §4.3.2 step 3; see DESIGN.md for the
        // preserved one-instruction visibility window this implies).
        let detected_present = detected_marker_present(symbols, config);
        driver.clear_breakpoints().await?;
        driver.clear_watchpoints().await?;
        driver.set_write_watchpoint(bit_addr.addr).await?;
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

        let timeout_secs = config.per_run_timeout_secs(golden.runtime_wall_seconds);
        let _timer = ctx.arm_timeout(Duration::from_secs_f64(timeout_secs));

        let mut watch_symbols = vec![config.marker_finished.as_str()];
        if detected_present {
            watch_symbols.push(config.marker_detected.as_str());
        }
        watch_symbols.extend(config.marker_traps.iter().map(String::as_str));
        let halt = tokio::select! {
            halt = driver.run_until(&watch_symbols) => halt?,
            _ = ctx.cancellation_token().cancelled() => {
                driver.clear_watchpoints().await?;
                return Ok(Some(classify(&HaltObservation {
                    timed_out: true,
                    halt: HaltLocation::Other,
                    serial_matches_golden: None,
                })));
            }
        };
        driver.clear_watchpoints().await?;

        let halt_location = match &halt {
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn mask_sets_and_clears_bit() {
        assert_eq!(apply_mask(0b1111_1111, 3, false), 0b1111_0111);
        assert_eq!(apply_mask(0b0000_0000, 3, true), 0b0000_1000);
    }

    #[test]
    fn stuck_value_is_deterministic_for_fixed_modes() {
        let mut rng = StepRng::new(0, 1);
        assert!(!stuck_value(PermanentMode::StuckAt0, &mut rng));
        assert!(stuck_value(PermanentMode::StuckAt1, &mut rng));
    }
}
