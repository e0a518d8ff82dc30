//! Analyzer (spec.md §4.2): three sequential passes over a fresh emulator
//! per target, producing the Analysis Artifacts the Experiment Engine
//! consumes.

pub mod footprint;
pub mod mem_region;

use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{GqfiConfig, MemRegionKind, TimeMode};
use crate::driver::{bind_serial_sink, EmulatorDriver, SymbolTable};
use crate::error::{GqfiError, Result};
use crate::pmu::{self, FixedCounter};
use crate::target::Target;
use footprint::{canary_for_pointer_size, complete_analysis, stack_analysis};
use mem_region::MemoryRegion;

/// Golden timing repetitions for `RUNTIME` mode (spec.md §4.2 step 2).
const RUNTIME_REPETITIONS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisArtifacts {
    pub golden_output: Vec<u8>,
    pub runtime_samples: Vec<u64>,
    pub runtime_wall_seconds: f64,
    pub effective_regions: Vec<MemoryRegion>,
}

impl AnalysisArtifacts {
    pub fn reduced_runtime(&self, config: &GqfiConfig) -> u64 {
        config.timemode_runtime_method.reduce(&self.runtime_samples)
    }
}

/// Filenames for the five per-target artifacts (spec.md §6).
pub struct ArtifactPaths {
    pub runtime: PathBuf,
    pub runtime_seconds: PathBuf,
    pub output: PathBuf,
    pub memory_analysis: PathBuf,
    pub memory_size: PathBuf,
    pub disk_image: PathBuf,
}

pub fn artifact_paths(analyze_dir: &Path, snapshot_dir: &Path, name: &str) -> ArtifactPaths {
    ArtifactPaths {
        runtime: analyze_dir.join(format!("{name}_runtime.qgfi")),
        runtime_seconds: analyze_dir.join(format!("{name}_runtime_seconds.qgfi")),
        output: analyze_dir.join(format!("{name}_output.qgfi")),
        memory_analysis: analyze_dir.join(format!("{name}_memory_analysis.qgfi")),
        memory_size: analyze_dir.join(format!("{name}_memory_size.qgfi")),
        disk_image: snapshot_dir.join(format!("{name}.img")),
    }
}

/// `{"mem_regions": [[hexstart, hexend, kind], ...]}` (spec.md §6). Kind
/// serializes through [`MemRegionKind`]'s own `SCREAMING_SNAKE_CASE`
/// representation so the artifact round-trips byte-for-byte with the
/// configuration document's own region encoding.
#[derive(Serialize, Deserialize)]
struct MemRegionsJson {
    mem_regions: Vec<(String, String, MemRegionKind)>,
}

pub fn write_artifacts(paths: &ArtifactPaths, artifacts: &AnalysisArtifacts) -> Result<()> {
    let runtime_csv = artifacts
        .runtime_samples
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    std::fs::write(&paths.runtime, runtime_csv)?;
    std::fs::write(
        &paths.runtime_seconds,
        artifacts.runtime_wall_seconds.to_string(),
    )?;
    std::fs::write(&paths.output, &artifacts.golden_output)?;

    let total_size: u64 = artifacts.effective_regions.iter().map(|r| r.len()).sum();
    std::fs::write(&paths.memory_size, total_size.to_string())?;

    let json = MemRegionsJson {
        mem_regions: artifacts
            .effective_regions
            .iter()
            .map(|r| (format!("{:#x}", r.start), format!("{:#x}", r.end), r.kind))
            .collect(),
    };
    std::fs::write(&paths.memory_analysis, serde_json::to_string(&json)?)?;
    Ok(())
}

/// Inverse of [`write_artifacts`]: reload a target's cached analysis
/// artifacts so a campaign run doesn't re-run the Analyzer on every shard
/// restart. A shard process, the Campaign Scheduler, and `gqfi-analyze`
/// all agree on this artifact shape.
pub fn read_artifacts(paths: &ArtifactPaths) -> Result<AnalysisArtifacts> {
    let runtime_csv = std::fs::read_to_string(&paths.runtime)?;
    let runtime_samples = if runtime_csv.trim().is_empty() {
        Vec::new()
    } else {
        runtime_csv
            .trim()
            .split(',')
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| GqfiError::Analysis(format!("bad runtime sample: {s}")))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let runtime_wall_seconds = std::fs::read_to_string(&paths.runtime_seconds)?
        .trim()
        .parse::<f64>()
        .map_err(|_| GqfiError::Analysis("bad runtime_seconds artifact".into()))?;

    let golden_output = std::fs::read(&paths.output)?;

    let json: MemRegionsJson = serde_json::from_str(&std::fs::read_to_string(&paths.memory_analysis)?)?;
    let effective_regions = json
        .mem_regions
        .into_iter()
        .map(|(start, end, kind)| {
            let start = u64::from_str_radix(start.trim_start_matches("0x"), 16)
                .map_err(|_| GqfiError::Analysis(format!("bad region start: {start}")))?;
            let end = u64::from_str_radix(end.trim_start_matches("0x"), 16)
                .map_err(|_| GqfiError::Analysis(format!("bad region end: {end}")))?;
            Ok(MemoryRegion { start, end, kind })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(AnalysisArtifacts {
        golden_output,
        runtime_samples,
        runtime_wall_seconds,
        effective_regions,
    })
}

pub struct Analyzer<'a, D: EmulatorDriver> {
    driver: D,
    config: &'a GqfiConfig,
    symbols: &'a dyn SymbolTable,
}

impl<'a, D: EmulatorDriver> Analyzer<'a, D> {
    pub fn new(driver: D, config: &'a GqfiConfig, symbols: &'a dyn SymbolTable) -> Self {
        Self {
            driver,
            config,
            symbols,
        }
    }

    /// Run all three passes for one target and return the artifacts.
    /// Declared regions are resolved against `symbols` inside the memory
    /// footprint pass itself, once that pass has determined the target's
    /// real pointer size (see [`Self::measure_memory_footprint`]) — region
    /// bounds can't be aligned to a pointer width we haven't probed yet.
    pub async fn analyze(&mut self, target: &Target, disk: &Path) -> Result<AnalysisArtifacts> {
        let (golden_output, wall_seconds) = self.capture_golden_serial(target, disk).await?;
        let runtime_samples = self.measure_golden_timing(target, disk).await?;
        let effective_regions = self.measure_memory_footprint(target, disk).await?;

        Ok(AnalysisArtifacts {
            golden_output,
            runtime_samples,
            runtime_wall_seconds: wall_seconds,
            effective_regions,
        })
    }

    /// Pass 1: serial capture (spec.md §4.2 step 1).
    async fn capture_golden_serial(
        &mut self,
        target: &Target,
        disk: &Path,
    ) -> Result<(Vec<u8>, f64)> {
        let (socket, port) = bind_serial_sink()?;
        self.driver.start(&target.elf32_path, disk, port).await?;
        self.driver.run_until(&[&self.config.marker_start]).await?;
        let started = Instant::now();
        self.driver
            .run_until(&[&self.config.marker_finished])
            .await?;
        let wall_seconds = started.elapsed().as_secs_f64();
        self.driver.quit().await?;

        let output = drain_datagram(&socket);
        Ok((output, wall_seconds))
    }

    /// Pass 2: golden timing (spec.md §4.2 step 2).
    async fn measure_golden_timing(&mut self, target: &Target, disk: &Path) -> Result<Vec<u64>> {
        let counter = match self.config.time_mode {
            TimeMode::Instructions => FixedCounter::Instructions,
            TimeMode::Runtime => FixedCounter::ReferenceCycles,
        };
        let repetitions = match self.config.time_mode {
            TimeMode::Instructions => 1,
            TimeMode::Runtime => RUNTIME_REPETITIONS,
        };

        let (socket, port) = bind_serial_sink()?;
        self.driver.start(&target.elf32_path, disk, port).await?;
        self.driver.run_until(&[&self.config.marker_start]).await?;
        self.driver.save_snapshot("sys_start_state").await?;

        let mut samples = Vec::with_capacity(repetitions);
        for _ in 0..repetitions {
            self.driver
                .load_snapshot("sys_start_state", &self.config.marker_start)
                .await?;
            self.driver
                .write_msr(pmu::IA32_FIXED_CTR_CTRL, counter.ctrl_pmi_value())
                .await?;
            self.driver.write_msr(counter.msr_index(), 0).await?;
            self.driver
                .write_msr(pmu::IA32_PERF_GLOBAL_CTRL, counter.global_enable_value())
                .await?;
            self.driver
                .run_until(&[&self.config.marker_finished])
                .await?;
            let count = self.driver.read_msr(counter.msr_index()).await?;
            samples.push(count);
        }
        self.driver.quit().await?;
        Ok(samples)
    }

    /// Pass 3: memory footprint (spec.md §4.2 step 3). Region bounds can't
    /// be aligned to a pointer width until that width is known, so
    /// declared regions are resolved here, after the probe, rather than
    /// up front by the caller.
    async fn measure_memory_footprint(
        &mut self,
        target: &Target,
        disk: &Path,
    ) -> Result<Vec<MemoryRegion>> {
        let (socket, port) = bind_serial_sink()?;
        self.driver.start(&target.elf32_path, disk, port).await?;
        self.driver
            .run_until(&[&self.config.marker_stack_ready])
            .await?;

        let pointer_size = self.probe_pointer_size().await?;
        let regions =
            mem_region::resolve_regions(&self.config.mem_regions, self.symbols, pointer_size)?;

        // Verify the probed width against live guest memory before
        // committing to it: fill whichever declared region we're about to
        // fill for real anyway, so the check leaves no trace.
        let scratch_addr = regions
            .iter()
            .find(|r| r.kind != MemRegionKind::NoAnalysis)
            .or_else(|| regions.first())
            .map(|r| r.start)
            .ok_or_else(|| GqfiError::Analysis("mem_regions is empty".into()))?;
        self.verify_canary_round_trips(pointer_size, scratch_addr)
            .await?;

        let canary = canary_for_pointer_size(pointer_size);

        for region in &regions {
            if region.kind == MemRegionKind::NoAnalysis {
                continue;
            }
            self.fill_with_canary(region, canary, pointer_size).await?;
        }

        self.driver
            .run_until(&[&self.config.marker_finished])
            .await?;

        let mut effective = Vec::new();
        for region in &regions {
            match region.kind {
                MemRegionKind::NoAnalysis => effective.push(*region),
                MemRegionKind::StackAnalysis => {
                    let words = self.read_words(region, pointer_size).await?;
                    if let Some((used_start, used_end)) =
                        stack_analysis(region, &words, canary, pointer_size)
                    {
                        effective.push(MemoryRegion {
                            start: used_start,
                            end: used_end,
                            kind: region.kind,
                        });
                    }
                }
                MemRegionKind::CompleteAnalysis => {
                    let words = self.read_words(region, pointer_size).await?;
                    for (start, end) in complete_analysis(region, &words, canary, pointer_size) {
                        effective.push(MemoryRegion {
                            start,
                            end,
                            kind: region.kind,
                        });
                    }
                }
            }
        }
        self.driver.quit().await?;
        Ok(effective)
    }

    /// Determine the target's actual runtime pointer width (spec.md §4.2
    /// step 3). `IA32_EFER`'s LMA bit is set once the CPU has entered
    /// 64-bit long mode; a kernel booted through the 32-bit wrapper may
    /// have switched to long mode by the time it reaches `stack_ready`, so
    /// this has to be read live rather than assumed from any static ELF
    /// header (the wrapper is always `elf32-i386` by construction — see
    /// [`crate::bootstrap::wrap_elf64_to_32`] — regardless of what mode the
    /// kernel itself actually runs in).
    async fn probe_pointer_size(&mut self) -> Result<u64> {
        let efer = self.driver.read_msr(pmu::IA32_EFER).await?;
        Ok(if efer & (1 << pmu::EFER_LMA_BIT) != 0 { 8 } else { 4 })
    }

    /// Write then read back the canary pattern matching `pointer_size` at
    /// `scratch_addr`, failing the analysis if guest memory doesn't hold
    /// what was just written (spec.md §4.2 step 3's "writing and reading a
    /// canary pattern").
    async fn verify_canary_round_trips(
        &mut self,
        pointer_size: u64,
        scratch_addr: u64,
    ) -> Result<()> {
        let canary = canary_for_pointer_size(pointer_size);
        let bytes = canary.to_le_bytes();
        for i in 0..pointer_size {
            self.driver
                .write_byte(scratch_addr + i, bytes[i as usize])
                .await?;
        }
        let mut readback = [0u8; 8];
        for i in 0..pointer_size {
            readback[i as usize] = self.driver.read_byte(scratch_addr + i).await?;
        }
        if u64::from_le_bytes(readback) != canary {
            return Err(GqfiError::Analysis(format!(
                "pointer-size probe: {pointer_size}-byte canary did not round-trip at {scratch_addr:#x}"
            )));
        }
        Ok(())
    }

    async fn fill_with_canary(
        &mut self,
        region: &MemoryRegion,
        canary: u64,
        word_size: u64,
    ) -> Result<()> {
        let bytes = canary.to_le_bytes();
        let mut addr = region.start;
        while addr < region.end {
            for i in 0..word_size {
                self.driver.write_byte(addr + i, bytes[i as usize]).await?;
            }
            addr += word_size;
        }
        Ok(())
    }

    async fn read_words(&mut self, region: &MemoryRegion, word_size: u64) -> Result<Vec<u64>> {
        let mut words = Vec::new();
        let mut addr = region.start;
        while addr < region.end {
            let mut buf = [0u8; 8];
            for i in 0..word_size {
                buf[i as usize] = self.driver.read_byte(addr + i).await?;
            }
            words.push(u64::from_le_bytes(buf));
            addr += word_size;
        }
        Ok(words)
    }
}

/// Drain one datagram with a 500ms timeout, returning an empty vec on
/// timeout (spec.md §4.3.3: "no datagram arrived within 500 ms").
fn drain_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 4096];
    match socket.recv(&mut buf) {
        Ok(n) => buf[..n].to_vec(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let paths = artifact_paths(dir.path(), dir.path(), "kernel");

        let artifacts = AnalysisArtifacts {
            golden_output: b"hello\n".to_vec(),
            runtime_samples: vec![100, 110, 105],
            runtime_wall_seconds: 0.42,
            effective_regions: vec![
                MemoryRegion {
                    start: 0x1000,
                    end: 0x1010,
                    kind: crate::config::MemRegionKind::StackAnalysis,
                },
                MemoryRegion {
                    start: 0x2000,
                    end: 0x2004,
                    kind: crate::config::MemRegionKind::NoAnalysis,
                },
            ],
        };

        write_artifacts(&paths, &artifacts).unwrap();
        let reloaded = read_artifacts(&paths).unwrap();

        assert_eq!(reloaded.golden_output, artifacts.golden_output);
        assert_eq!(reloaded.runtime_samples, artifacts.runtime_samples);
        assert!((reloaded.runtime_wall_seconds - artifacts.runtime_wall_seconds).abs() < 1e-9);
        assert_eq!(reloaded.effective_regions, artifacts.effective_regions);
    }
}
