use crate::procs::{self, DiscoveredVia, DEFAULT_GRACE};
use crate::registry::{AppRegistry, AppRow, EnvironmentRecord};
use crate::report::OpReport;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wait after a successful spawn for the PID file to materialize.
const SPAWN_SETTLE: Duration = Duration::from_millis(1200);

/// Resolved, path-bearing form of a registry entry. Built fresh on every
/// supervisor invocation and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSpec {
    pub name: String,
    pub port: u16,
    pub app_dir: PathBuf,
    pub venv_activate: PathBuf,
    pub entry_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl AppSpec {
    /// Join a registry row with the environment's project root using the
    /// `<name>_project/<name>_app/` directory convention.
    pub fn resolve(row: &AppRow, env: &EnvironmentRecord) -> Self {
        let app_dir = env
            .project_root
            .join(format!("{}_project", row.name))
            .join(format!("{}_app", row.name));
        Self {
            venv_activate: app_dir.join(".venv").join("bin").join("activate"),
            entry_file: app_dir.join("app.py"),
            pid_file: app_dir.join(".run").join(format!("{}.pid", row.name)),
            log_file: app_dir.join("logs").join(format!("{}.log", row.name)),
            name: row.name.clone(),
            port: row.port,
            app_dir,
        }
    }
}

/// One row of `status` output.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub app: String,
    pub port: u16,
    pub running: bool,
    pub pid: Option<i32>,
    pub discovered_via: Option<DiscoveredVia>,
}

/// Specs for every enabled registry entry with a usable port, in stable
/// name order.
pub fn discover_specs(registry: &AppRegistry, env: &EnvironmentRecord) -> Vec<AppSpec> {
    registry
        .active_rows()
        .iter()
        .map(|row| AppSpec::resolve(row, env))
        .collect()
}

/// Lifecycle operations over resolved app specs.
///
/// Calls are synchronous and blocking; the only suspension points are
/// the post-spawn settle wait and the kill-protocol grace period. The
/// PID file per app is the sole persisted liveness record: created on a
/// successful start, removed on a successful stop or when found stale.
#[derive(Debug, Clone)]
pub struct Supervisor {
    grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
        }
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the kill-protocol grace period (tests use short ones).
    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    /// Start an app. Idempotent: a live PID file or an already-bound
    /// port both count as "already running" rather than an error.
    pub fn start(&self, spec: &AppSpec) -> OpReport {
        if !spec.app_dir.is_dir() {
            return OpReport::failure(format!(
                "[{}] app directory missing: {}",
                spec.name,
                spec.app_dir.display()
            ));
        }
        if !spec.venv_activate.is_file() {
            return OpReport::failure(format!(
                "[{}] virtualenv activator missing: {}",
                spec.name,
                spec.venv_activate.display()
            ));
        }
        if !spec.entry_file.is_file() {
            return OpReport::failure(format!(
                "[{}] entry file missing: {}",
                spec.name,
                spec.entry_file.display()
            ));
        }

        if let Some(pid) = read_pid_file(&spec.pid_file) {
            if procs::pid_alive(pid) {
                debug!(app = %spec.name, pid, "already running");
                return OpReport::success(format!(
                    "[{}] already running (pid={})",
                    spec.name, pid
                ));
            }
        }

        // Tolerate externally started processes on the target port.
        match procs::find_pids_by_port(spec.port) {
            Ok(pids) if !pids.is_empty() => {
                return OpReport::success(format!(
                    "[{}] port {} already in use (pid={:?})",
                    spec.name, spec.port, pids
                ));
            }
            Ok(_) => {}
            Err(err) => return OpReport::failure(format!("[{}] {}", spec.name, err)),
        }

        for dir in [spec.pid_file.parent(), spec.log_file.parent()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = fs::create_dir_all(dir) {
                return OpReport::failure(format!(
                    "[{}] cannot create {}: {}",
                    spec.name,
                    dir.display(),
                    err
                ));
            }
        }

        let script = launch_script(spec);
        debug!(app = %spec.name, port = spec.port, "spawning");
        let output = match Command::new("bash").args(["-lc", &script]).output() {
            Ok(output) => output,
            Err(err) => {
                return OpReport::failure(format!(
                    "[{}] failed to run launcher: {}",
                    spec.name, err
                ))
            }
        };

        if !output.status.success() {
            return OpReport::failure(format!(
                "[{}] start failed\n{}",
                spec.name,
                combined_output(&output.stdout, &output.stderr)
            ));
        }

        thread::sleep(SPAWN_SETTLE);
        let pid_text = fs::read_to_string(&spec.pid_file)
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|_| "?".to_string());
        info!(app = %spec.name, port = spec.port, pid = %pid_text, "started");
        OpReport::success(format!(
            "[{}] started (pid={})\n  log: {}",
            spec.name,
            pid_text,
            spec.log_file.display()
        ))
    }

    /// Stop an app, PID file first, then port discovery. Finding nothing
    /// to stop is success, not an error.
    pub fn stop(&self, spec: &AppSpec) -> OpReport {
        if spec.pid_file.exists() {
            match read_pid_file(&spec.pid_file) {
                Some(pid) if procs::pid_alive(pid) => {
                    return match procs::kill_pids(&[pid], self.grace) {
                        Ok(report) => {
                            if let Err(err) = fs::remove_file(&spec.pid_file) {
                                warn!(app = %spec.name, error = %err, "could not remove pid file");
                            }
                            info!(app = %spec.name, pid, forced = report.forced.len(), "stopped");
                            OpReport::success(format!(
                                "[{}] stopped (pid={}, {})",
                                spec.name,
                                pid,
                                report.summary()
                            ))
                        }
                        Err(err) => OpReport::failure(format!(
                            "[{}] stop failed (pid={}): {}",
                            spec.name, pid, err
                        )),
                    };
                }
                _ => {
                    // stale or unreadable PID file; clear it, try the port
                    if let Err(err) = fs::remove_file(&spec.pid_file) {
                        warn!(app = %spec.name, error = %err, "could not remove stale pid file");
                    } else {
                        debug!(app = %spec.name, "removed stale pid file");
                    }
                }
            }
        }

        let pids = match procs::find_pids_by_port(spec.port) {
            Ok(pids) => pids,
            Err(err) => return OpReport::failure(format!("[{}] {}", spec.name, err)),
        };
        if !pids.is_empty() {
            return match procs::kill_pids(&pids, self.grace) {
                Ok(report) => {
                    info!(app = %spec.name, port = spec.port, ?pids, "stopped via port");
                    OpReport::success(format!(
                        "[{}] stopped (port={}, {})",
                        spec.name,
                        spec.port,
                        report.summary()
                    ))
                }
                Err(err) => OpReport::failure(format!(
                    "[{}] stop failed (port={}): {}",
                    spec.name, spec.port, err
                )),
            };
        }

        OpReport::success(format!("[{}] no running process", spec.name))
    }

    /// Read-only probe of every spec: PID file first, then the port.
    /// Never mutates or deletes stale PID files.
    pub fn status(&self, specs: &[AppSpec]) -> Vec<StatusRow> {
        specs
            .iter()
            .map(|spec| {
                if let Some(pid) = read_pid_file(&spec.pid_file) {
                    if procs::pid_alive(pid) {
                        return StatusRow {
                            app: spec.name.clone(),
                            port: spec.port,
                            running: true,
                            pid: Some(pid),
                            discovered_via: Some(DiscoveredVia::PidFile),
                        };
                    }
                }
                match procs::find_pids_by_port(spec.port) {
                    Ok(pids) if !pids.is_empty() => StatusRow {
                        app: spec.name.clone(),
                        port: spec.port,
                        running: true,
                        pid: pids.first().copied(),
                        discovered_via: Some(DiscoveredVia::Port),
                    },
                    Ok(_) => StatusRow {
                        app: spec.name.clone(),
                        port: spec.port,
                        running: false,
                        pid: None,
                        discovered_via: None,
                    },
                    Err(err) => {
                        warn!(app = %spec.name, error = %err, "port lookup failed during status");
                        StatusRow {
                            app: spec.name.clone(),
                            port: spec.port,
                            running: false,
                            pid: None,
                            discovered_via: None,
                        }
                    }
                }
            })
            .collect()
    }
}

/// The launch script handed to `bash -lc`: activate the app's
/// virtualenv, start the entry process detached with its output in the
/// log file, record the PID. The public base path equals the app name.
fn launch_script(spec: &AppSpec) -> String {
    let entry = spec
        .entry_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app.py".to_string());
    format!(
        "set -e\n\
         cd {dir}\n\
         . {venv}\n\
         nohup python -m streamlit run {entry} \
         --server.baseUrlPath={name} \
         --server.port={port} \
         --server.headless=true \
         > {log} 2>&1 < /dev/null &\n\
         echo $! > {pid}",
        dir = sh_quote(&spec.app_dir),
        venv = sh_quote(&spec.venv_activate),
        entry = shell_words::quote(&entry),
        name = shell_words::quote(&spec.name),
        port = spec.port,
        log = sh_quote(&spec.log_file),
        pid = sh_quote(&spec.pid_file),
    )
}

fn sh_quote(path: &Path) -> String {
    let text = path.to_string_lossy();
    shell_words::quote(&text).into_owned()
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(stderr));
    text
}

/// A PID file holds one decimal PID; anything unreadable counts as "no
/// recorded PID" and is handled by the caller.
fn read_pid_file(path: &Path) -> Option<i32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}
