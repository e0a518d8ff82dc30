//! Thin external-collaborator wrappers.
//!
//! spec.md explicitly treats disk-image creation and 64-to-32-bit wrapping
//! as out of scope; these two functions are the minimal shelling-out needed
//! to produce the inputs the rest of the system assumes already exist. The
//! Emulator Driver and Analyzer never call these directly.

use std::path::Path;
use std::process::Command;

use crate::error::{GqfiError, Result};

/// Convert a 64-bit ELF into the 32-bit bootable variant expected by
/// [`crate::target::Target::elf32_path`] via `objcopy`.
pub fn wrap_elf64_to_32(elf64: &Path, elf32: &Path) -> Result<()> {
    let status = Command::new("objcopy")
        .args(["-I", "elf64-x86-64", "-O", "elf32-i386"])
        .arg(elf64)
        .arg(elf32)
        .status()?;
    if !status.success() {
        return Err(GqfiError::Configuration(format!(
            "objcopy failed converting {elf64:?} to {elf32:?}: {status}"
        )));
    }
    Ok(())
}

/// Create an empty qcow2 disk image of the configured size, read-only
/// thereafter except for the Analyzer's one write of the entry snapshot.
pub fn ensure_disk_image(path: &Path, size_mb: u64) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let status = Command::new("qemu-img")
        .args(["create", "-f", "qcow2"])
        .arg(path)
        .arg(format!("{size_mb}M"))
        .status()?;
    if !status.success() {
        return Err(GqfiError::Configuration(format!(
            "qemu-img create failed for {path:?}: {status}"
        )));
    }
    Ok(())
}
