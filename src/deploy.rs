//! Applies generated configuration to the live file: timestamped
//! backup, atomic temp-file-then-rename write, external syntax check.
//!
//! The write sequence guarantees a concurrent reader (the proxy process
//! reloading) never observes a partially written file. A failed syntax
//! check does NOT roll the file back: the previous content stays in the
//! backup and restoring it is an explicit operator decision.

use crate::report::OpReport;
use chrono::Local;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// External syntax validator run against the freshly written file.
/// Defaults to `nginx` (`nginx -t -c <file>`); tests substitute a stub.
#[derive(Debug, Clone)]
pub struct ConfValidator {
    program: PathBuf,
}

impl Default for ConfValidator {
    fn default() -> Self {
        Self {
            program: PathBuf::from("nginx"),
        }
    }
}

impl ConfValidator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run `<program> -t -c <conf>`, returning the exit status and the
    /// combined stdout+stderr verbatim.
    pub fn check(&self, conf: &Path) -> io::Result<(bool, String)> {
        let output = Command::new(&self.program)
            .arg("-t")
            .arg("-c")
            .arg(conf)
            .output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(program = %self.program.display(), ok = output.status.success(), "syntax check");
        Ok((output.status.success(), text))
    }
}

/// Copy the live file aside with a timestamp suffix
/// (`nginx.conf.bak.YYYYMMDD-HHMMSS`).
pub fn make_backup(path: &Path) -> io::Result<PathBuf> {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let backup = path.with_file_name(format!("{}.bak.{}", file_name, stamp));
    fs::copy(path, &backup)?;
    Ok(backup)
}

/// Write text to a temporary sibling, flush and sync it, then atomically
/// rename it over the target.
pub fn atomic_write(path: &Path, text: &str) -> io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
    tmp.write_all(text.as_bytes())?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// The full apply sequence: back up the current file when one exists,
/// atomically replace it, then run the external syntax check and surface
/// its output verbatim.
pub fn apply(path: &Path, text: &str, validator: &ConfValidator) -> OpReport {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(err) = fs::create_dir_all(parent) {
            return OpReport::failure(format!("cannot create {}: {}", parent.display(), err));
        }
    }

    let backup = if path.exists() {
        match make_backup(path) {
            Ok(backup) => {
                info!(backup = %backup.display(), "backed up current config");
                Some(backup)
            }
            Err(err) => {
                return OpReport::failure(format!(
                    "backup of {} failed: {}",
                    path.display(),
                    err
                ))
            }
        }
    } else {
        None
    };

    if let Err(err) = atomic_write(path, text) {
        return OpReport::failure(format!("write of {} failed: {}", path.display(), err));
    }
    info!(path = %path.display(), bytes = text.len(), "wrote config");

    let backup_note = backup
        .as_ref()
        .map(|b| format!(" (backup: {})", b.display()))
        .unwrap_or_default();

    match validator.check(path) {
        Ok((true, output)) => OpReport::success(format!(
            "wrote {}{}\nsyntax check OK\n{}",
            path.display(),
            backup_note,
            output.trim()
        )),
        Ok((false, output)) => OpReport::failure(format!(
            "wrote {}{} but the syntax check FAILED\n{}\nthe new file was left in place; restore the backup to roll back",
            path.display(),
            backup_note,
            output.trim()
        )),
        Err(err) => OpReport::failure(format!(
            "wrote {}{} but the syntax checker could not run: {}",
            path.display(),
            backup_note,
            err
        )),
    }
}
