//! Concrete [`DriverFactory`]/[`StrategyFactory`] wiring for real
//! (non-test) campaign runs: one shared ELF-parsed symbol table backing a
//! fresh [`QemuRspDriver`] per shard restart, and the fault-delivery
//! mechanism selected once from [`crate::config::Mode`].

use std::sync::Arc;

use crate::campaign::shard::{DriverFactory, StrategyFactory};
use crate::config::{GqfiConfig, Mode, TimeMode};
use crate::driver::{EmulatorDriver, QemuRspDriver, SymbolTable};
use crate::inject::{permanent::PermanentStrategy, transient::TransientStrategy, FaultStrategy};
use crate::pmu::FixedCounter;

pub struct QemuDriverFactory {
    symbols: Arc<dyn SymbolTable>,
}

impl QemuDriverFactory {
    pub fn new(symbols: Arc<dyn SymbolTable>) -> Self {
        Self { symbols }
    }
}

impl DriverFactory for QemuDriverFactory {
    fn create(&self) -> Box<dyn EmulatorDriver> {
        Box::new(QemuRspDriver::new(self.symbols.clone()))
    }
}

/// Builds the [`FaultStrategy`] named by `config.mode`/`config.time_mode`
/// (spec.md §6). The counter feeding NMI-on-overflow delivery follows the
/// same `time_mode` the Analyzer used for golden timing, so the armed
/// counter and the runtime reduction it is compared against agree.
pub struct ConfiguredStrategyFactory {
    mode: Mode,
    counter: FixedCounter,
}

impl ConfiguredStrategyFactory {
    pub fn new(config: &GqfiConfig) -> Self {
        let counter = match config.time_mode {
            TimeMode::Instructions => FixedCounter::Instructions,
            TimeMode::Runtime => FixedCounter::ReferenceCycles,
        };
        Self {
            mode: config.mode,
            counter,
        }
    }
}

impl StrategyFactory for ConfiguredStrategyFactory {
    fn create(&self) -> Box<dyn FaultStrategy> {
        match self.mode {
            Mode::SingleBitFlip => Box::new(TransientStrategy {
                counter: self.counter,
            }),
            Mode::Permanent => Box::new(PermanentStrategy),
        }
    }
}
