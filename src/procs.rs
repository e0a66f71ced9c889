//! OS-facing process plumbing: liveness probes, the two-phase kill
//! protocol, and TCP-port-to-PID discovery via `lsof`.
//!
//! Every call that touches the OS returns an explicit `Result` with a
//! typed error kind; callers fold those into their report messages
//! instead of letting anything escape.

use crate::error::{PortLookupError, SignalError};
use std::fmt;
use std::io;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Default grace period between the graceful and the forceful signal.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

/// How a live PID was discovered during a status or stop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveredVia {
    PidFile,
    Port,
}

impl fmt::Display for DiscoveredVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveredVia::PidFile => f.write_str("pidfile"),
            DiscoveredVia::Port => f.write_str("port"),
        }
    }
}

/// Outcome of a two-phase kill: every PID that was sent the graceful
/// signal, and the subset that survived the grace period and had to be
/// killed forcefully.
#[derive(Debug, Clone, Default)]
pub struct KillReport {
    pub terminated: Vec<i32>,
    pub forced: Vec<i32>,
}

impl KillReport {
    /// Operator-facing summary distinguishing graceful from forced exits.
    pub fn summary(&self) -> String {
        if self.forced.is_empty() {
            format!("term={:?}", self.terminated)
        } else {
            format!("term={:?}, kill={:?}", self.terminated, self.forced)
        }
    }
}

/// Signal-0 liveness probe.
#[cfg(unix)]
pub fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: libc::c_int, name: &'static str) -> Result<(), SignalError> {
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // already gone
        debug!(pid, signal = name, "target already exited");
        return Ok(());
    }
    Err(SignalError {
        signal: name,
        pid,
        source: err,
    })
}

/// Two-phase kill: send SIGTERM to every PID, sleep out the grace
/// period, re-probe, and SIGKILL only the survivors. Any delivery
/// failure other than "no such process" aborts the whole call.
///
/// Blocks the calling thread for the grace period whenever the list is
/// non-empty.
#[cfg(unix)]
pub fn kill_pids(pids: &[i32], grace: Duration) -> Result<KillReport, SignalError> {
    if pids.is_empty() {
        return Ok(KillReport::default());
    }

    for &pid in pids {
        send_signal(pid, libc::SIGTERM, "SIGTERM")?;
    }

    std::thread::sleep(grace);

    let forced: Vec<i32> = pids.iter().copied().filter(|&pid| pid_alive(pid)).collect();
    for &pid in &forced {
        send_signal(pid, libc::SIGKILL, "SIGKILL")?;
    }

    if !forced.is_empty() {
        warn!(?forced, "grace period exceeded, sent SIGKILL");
    }

    Ok(KillReport {
        terminated: pids.to_vec(),
        forced,
    })
}

#[cfg(not(unix))]
pub fn kill_pids(pids: &[i32], _grace: Duration) -> Result<KillReport, SignalError> {
    Err(SignalError {
        signal: "SIGTERM",
        pid: pids.first().copied().unwrap_or(0),
        source: io::Error::new(
            io::ErrorKind::Unsupported,
            "process signals are only supported on unix",
        ),
    })
}

/// Parse decimal PIDs out of free-form text such as lsof output
/// ("1393\n2604\n2629").
pub fn parse_pids(text: &str) -> Vec<i32> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// All PIDs bound to a local TCP port, via `lsof -ti tcp:<port>`.
///
/// `lsof` exits nonzero when nothing matches; that means "no process",
/// not an error. A missing `lsof` binary also degrades to "no process"
/// so hosts without it can still run the supervisor.
pub fn find_pids_by_port(port: u16) -> Result<Vec<i32>, PortLookupError> {
    let output = match Command::new("lsof")
        .args(["-ti", &format!("tcp:{}", port)])
        .output()
    {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(port, "lsof not found, treating port as free");
            return Ok(Vec::new());
        }
        Err(source) => return Err(PortLookupError { port, source }),
    };

    let pids = parse_pids(&String::from_utf8_lossy(&output.stdout));
    debug!(port, ?pids, "port lookup");
    Ok(pids)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    /// Spawn a long sleeper detached from this process so it is reaped
    /// by init when it dies, keeping the liveness probe honest.
    fn spawn_detached_sleeper() -> i32 {
        let output = Command::new("sh")
            .args(["-c", "sleep 30 >/dev/null 2>&1 & echo $!"])
            .output()
            .expect("spawn sh");
        let pids = parse_pids(&String::from_utf8_lossy(&output.stdout));
        assert_eq!(pids.len(), 1, "expected one pid from: {:?}", output);
        pids[0]
    }

    #[test]
    fn parse_pids_extracts_decimal_tokens() {
        assert_eq!(parse_pids("1393\n2604\n2629"), vec![1393, 2604, 2629]);
        assert_eq!(parse_pids("  12 \nabc 34x\n"), vec![12, 34]);
        assert_eq!(parse_pids(""), Vec::<i32>::new());
        assert_eq!(parse_pids("no pids here"), Vec::<i32>::new());
    }

    #[test]
    fn pid_alive_sees_this_process() {
        assert!(pid_alive(std::process::id() as i32));
    }

    #[test]
    fn pid_alive_rejects_bogus_pid() {
        assert!(!pid_alive(999_999_999));
    }

    #[test]
    fn kill_pids_empty_list_is_a_no_op() {
        let report = kill_pids(&[], Duration::from_millis(1)).unwrap();
        assert!(report.terminated.is_empty());
        assert!(report.forced.is_empty());
    }

    #[test]
    fn cooperative_process_dies_without_force() {
        let pid = spawn_detached_sleeper();
        assert!(pid_alive(pid));

        let report = kill_pids(&[pid], Duration::from_millis(500)).unwrap();
        assert_eq!(report.terminated, vec![pid]);
        assert!(
            report.forced.is_empty(),
            "cooperative process must not be force-killed: {:?}",
            report
        );
        assert!(!pid_alive(pid));
    }

    #[test]
    fn stubborn_process_is_force_killed() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn sh");
        let pid = child.id() as i32;

        // give the shell a moment to install the trap
        std::thread::sleep(Duration::from_millis(200));

        let report = kill_pids(&[pid], Duration::from_millis(500)).unwrap();
        assert_eq!(report.terminated, vec![pid]);
        assert_eq!(report.forced, vec![pid]);

        let _ = child.wait();
    }

    #[test]
    fn kill_report_summary_mentions_forced_pids() {
        let graceful = KillReport {
            terminated: vec![100],
            forced: vec![],
        };
        assert_eq!(graceful.summary(), "term=[100]");

        let forced = KillReport {
            terminated: vec![100, 200],
            forced: vec![200],
        };
        assert!(forced.summary().contains("kill=[200]"));
    }

    #[test]
    fn port_lookup_on_unbound_port_is_empty() {
        // nothing in the test environment listens down here
        let pids = find_pids_by_port(47_911).unwrap();
        assert!(pids.is_empty());
    }
}
