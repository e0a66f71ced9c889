//! Error taxonomy for the registry loader, supervisor and generator.
//!
//! Only `ConfigError` ever escapes to a caller: it covers fatal
//! configuration-validation problems that make rendering or supervision
//! meaningless. Every other fault is caught at the operation boundary and
//! folded into the `(ok, message)` report contract.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration-validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file not found: {}", .0.display())]
    SettingsMissing(PathBuf),

    #[error("app registry not found: {}", .0.display())]
    RegistryMissing(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no environment selected: set `current` under [env] in the settings file")]
    NoEnvironmentSelected,

    #[error("unknown environment '{name}' (known environments: {known:?})")]
    UnknownEnvironment { name: String, known: Vec<String> },

    #[error("multiple sso_issuer apps in the registry: {apps:?} (at most one app may issue the SSO cookie)")]
    MultipleSsoIssuers { apps: Vec<String> },
}

/// Signal delivery failed for a reason other than "process already gone".
///
/// "No such process" is never an error during a kill: the target being
/// gone already is the outcome we wanted.
#[derive(Debug, Error)]
#[error("failed to send {signal} to pid {pid}: {source}")]
pub struct SignalError {
    pub signal: &'static str,
    pub pid: i32,
    #[source]
    pub source: io::Error,
}

/// The port-to-PID lookup subprocess could not be executed.
#[derive(Debug, Error)]
#[error("port lookup for tcp:{port} failed: {source}")]
pub struct PortLookupError {
    pub port: u16,
    #[source]
    pub source: io::Error,
}
