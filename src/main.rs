//! Opsdeck CLI - thin caller over the supervisor and the generator
//!
//! Usage:
//!   opsdeck status                  Show every app with its liveness
//!   opsdeck start <app>|--all       Start one or all enabled apps
//!   opsdeck stop <app>|--all        Stop one or all enabled apps
//!   opsdeck render [--tls]         Print the generated config (dry run)
//!   opsdeck diff [--tls]           Diff generated vs. applied config
//!   opsdeck apply [--tls]          Backup, write atomically, syntax-check
//!
//! Options:
//!   --apps <path>       App registry file (default: config/apps.toml)
//!   --settings <path>   Settings file (default: config/settings.toml)

use anyhow::{bail, Result};
use opsdeck::deploy::{self, ConfValidator};
use opsdeck::generator::{self, TlsMode};
use opsdeck::registry::{AppRegistry, Settings};
use opsdeck::supervisor::{discover_specs, AppSpec, Supervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

const DEFAULT_APPS_FILE: &str = "config/apps.toml";
const DEFAULT_SETTINGS_FILE: &str = "config/settings.toml";

#[derive(Debug, PartialEq, Eq)]
enum Target {
    One(String),
    All,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Status,
    Start(Target),
    Stop(Target),
    Render(TlsMode),
    Diff(TlsMode),
    Apply(TlsMode),
    Help,
}

#[derive(Debug)]
struct Cli {
    apps_file: PathBuf,
    settings_file: PathBuf,
    command: Command,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("opsdeck=info".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<bool> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    if cli.command == Command::Help {
        print!("{}", usage());
        return Ok(true);
    }

    let registry = AppRegistry::load(&cli.apps_file)?;
    let settings = Settings::load(&cli.settings_file)?;
    let (env_name, env) = settings.select()?;
    info!(environment = env_name, apps = registry.len(), "loaded configuration");

    let supervisor = Supervisor::new();
    let specs = discover_specs(&registry, env);

    match cli.command {
        Command::Status => {
            let rows = supervisor.status(&specs);
            println!("{:<16} {:>6}  {:<8} {:>8}  {}", "APP", "PORT", "STATE", "PID", "VIA");
            for row in rows {
                println!(
                    "{:<16} {:>6}  {:<8} {:>8}  {}",
                    row.app,
                    row.port,
                    if row.running { "running" } else { "stopped" },
                    row.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into()),
                    row.discovered_via
                        .map(|via| via.to_string())
                        .unwrap_or_else(|| "-".into()),
                );
            }
            Ok(true)
        }
        Command::Start(target) => {
            let mut all_ok = true;
            for spec in select_specs(&specs, &target)? {
                let report = supervisor.start(spec);
                println!("{}", report.message);
                all_ok &= report.ok;
            }
            Ok(all_ok)
        }
        Command::Stop(target) => {
            let mut all_ok = true;
            for spec in select_specs(&specs, &target)? {
                let report = supervisor.stop(spec);
                println!("{}", report.message);
                all_ok &= report.ok;
            }
            Ok(all_ok)
        }
        Command::Render(mode) => {
            print!("{}", generator::render(&registry, env, mode)?);
            Ok(true)
        }
        Command::Diff(mode) => {
            let generated = generator::render(&registry, env, mode)?;
            let conf = generator::conf_path(env);
            let current = std::fs::read_to_string(&conf).unwrap_or_default();
            let diff = generator::unified_diff(&current, &generated);
            if diff.is_empty() {
                println!("no differences ({})", conf.display());
            } else {
                print!("{}", diff);
            }
            Ok(true)
        }
        Command::Apply(mode) => {
            let generated = generator::render(&registry, env, mode)?;
            let conf = generator::conf_path(env);
            let report = deploy::apply(&conf, &generated, &ConfValidator::default());
            println!("{}", report.message);
            Ok(report.ok)
        }
        Command::Help => unreachable!("handled above"),
    }
}

fn select_specs<'a>(specs: &'a [AppSpec], target: &Target) -> Result<Vec<&'a AppSpec>> {
    match target {
        Target::All => Ok(specs.iter().collect()),
        Target::One(name) => {
            let Some(spec) = specs.iter().find(|spec| &spec.name == name) else {
                bail!(
                    "unknown or inactive app '{}' (active apps: {:?})",
                    name,
                    specs.iter().map(|spec| spec.name.as_str()).collect::<Vec<_>>()
                );
            };
            Ok(vec![spec])
        }
    }
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut apps_file = PathBuf::from(DEFAULT_APPS_FILE);
    let mut settings_file = PathBuf::from(DEFAULT_SETTINGS_FILE);
    let mut rest: Vec<&str> = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--apps" => {
                let Some(value) = iter.next() else {
                    bail!("--apps requires a path");
                };
                apps_file = PathBuf::from(value);
            }
            "--settings" => {
                let Some(value) = iter.next() else {
                    bail!("--settings requires a path");
                };
                settings_file = PathBuf::from(value);
            }
            other => rest.push(other),
        }
    }

    let command = match rest.split_first() {
        None => Command::Help,
        Some((&"help", _)) | Some((&"--help", _)) | Some((&"-h", _)) => Command::Help,
        Some((&"status", [])) => Command::Status,
        Some((&"start", operands)) => Command::Start(parse_target("start", operands)?),
        Some((&"stop", operands)) => Command::Stop(parse_target("stop", operands)?),
        Some((&"render", operands)) => Command::Render(parse_tls_mode("render", operands)?),
        Some((&"diff", operands)) => Command::Diff(parse_tls_mode("diff", operands)?),
        Some((&"apply", operands)) => Command::Apply(parse_tls_mode("apply", operands)?),
        Some((command, _)) => bail!("unknown command '{}'\n{}", command, usage()),
    };

    Ok(Cli {
        apps_file,
        settings_file,
        command,
    })
}

fn parse_target(command: &str, operands: &[&str]) -> Result<Target> {
    match operands {
        ["--all"] => Ok(Target::All),
        [name] if !name.starts_with('-') => Ok(Target::One((*name).to_string())),
        _ => bail!("usage: opsdeck {} <app>|--all", command),
    }
}

fn parse_tls_mode(command: &str, operands: &[&str]) -> Result<TlsMode> {
    match operands {
        [] => Ok(TlsMode::Plain),
        ["--tls"] => Ok(TlsMode::Tls),
        _ => bail!("usage: opsdeck {} [--tls]", command),
    }
}

fn usage() -> String {
    format!(
        "opsdeck - app supervision and nginx config generation\n\n\
         usage: opsdeck [--apps <path>] [--settings <path>] <command>\n\n\
         commands:\n\
         \x20 status                show every app with its liveness\n\
         \x20 start <app>|--all     start one or all enabled apps\n\
         \x20 stop <app>|--all      stop one or all enabled apps\n\
         \x20 render [--tls]        print the generated config (dry run)\n\
         \x20 diff [--tls]          diff generated vs. applied config\n\
         \x20 apply [--tls]         backup, write atomically, syntax-check\n\n\
         defaults: --apps {} --settings {}\n",
        DEFAULT_APPS_FILE, DEFAULT_SETTINGS_FILE
    )
}
