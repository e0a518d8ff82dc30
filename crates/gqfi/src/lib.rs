//! QEMU-based fault injection harness for bare-metal x86 targets.
//!
//! This library exposes the Target Descriptor, Configuration, Emulator
//! Driver, Analyzer, Experiment Engine, Campaign Scheduler, Result Store,
//! and the optional monitor API; the `gqfi-*` binaries are thin CLI
//! wrappers around it.

pub mod analyze;
pub mod bootstrap;
pub mod campaign;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod inject;
pub mod monitor;
pub mod pmu;
pub mod result;
pub mod symbols;
pub mod target;
