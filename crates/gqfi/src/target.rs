//! Target Descriptor: one program under test, immutable after discovery.

use std::path::{Path, PathBuf};

use crate::error::{GqfiError, Result};

/// One program under test. Created once by [`discover`], immutable
/// thereafter.
#[derive(Debug, Clone)]
pub struct Target {
    /// Logical name, derived from the 64-bit image's file stem.
    pub name: String,
    /// Path to the 64-bit ELF image as discovered on disk.
    pub elf64_path: PathBuf,
    /// Path to the derived 32-bit bootable variant.
    pub elf32_path: PathBuf,
}

impl Target {
    /// Campaign-unique name: logical name plus a shard suffix, matching the
    /// original's `File.fullname` convention of one name per disk-image copy.
    pub fn full_name(&self, shard_id: u32) -> String {
        format!("{}_shard{}", self.name, shard_id)
    }
}

/// Walk `folder` collecting every `*.elf` / `*.bin` 64-bit image paired with
/// its derived 32-bit sibling (`<stem>_32<ext>`, created by
/// [`crate::bootstrap::wrap_elf64_to_32`] when `create_64_bit_elf_wrapper`
/// is set).
pub fn discover(folder: &Path) -> Result<Vec<Target>> {
    let mut targets = Vec::new();
    let entries = std::fs::read_dir(folder)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_elf64 = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "elf" || e == "bin")
            .unwrap_or(false);
        if !is_elf64 {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| GqfiError::Configuration(format!("bad file name: {:?}", path)))?;
        if stem.ends_with("_32") {
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("elf");
        let elf32_path = path.with_file_name(format!("{stem}_32.{ext}"));
        targets.push(Target {
            name: stem.to_string(),
            elf64_path: path,
            elf32_path,
        });
    }
    targets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_elf_targets_and_skips_32_bit_variants() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kernel.elf"), b"fake").unwrap();
        std::fs::write(dir.path().join("kernel_32.elf"), b"fake32").unwrap();
        std::fs::write(dir.path().join("README.md"), b"ignore me").unwrap();

        let targets = discover(dir.path()).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "kernel");
        assert!(targets[0].elf32_path.ends_with("kernel_32.elf"));
    }

    #[test]
    fn full_name_is_shard_suffixed() {
        let t = Target {
            name: "kernel".into(),
            elf64_path: "kernel.elf".into(),
            elf32_path: "kernel_32.elf".into(),
        };
        assert_eq!(t.full_name(3), "kernel_shard3");
    }
}
