/// Version injected at compile time via STRATUM_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("STRATUM_VERSION") {
    Some(v) => v,
    None => "dev",
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use stratum::resource::snapshot::redact_fields;
use stratum::{Engine, ResolvedBundle};
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Inspect resolved resources and backend selection
#[derive(Parser, Debug)]
#[command(name = "stratum", version = VERSION, about, long_about = None)]
struct Args {
    /// Configuration document (defaults to the conventional search path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Availability and validity of every resource
    Status,
    /// One resolved bundle, secrets redacted
    Show { id: String },
    /// All bundles of one kind, secrets redacted
    Kind { kind: String },
    /// Probe a capability and print its candidate table
    Backends { capability: String },
    /// Switch a capability to another candidate
    Switch {
        capability: String,
        name: String,
        /// Skip the health check
        #[arg(long)]
        force: bool,
    },
    /// Probe every candidate of every capability
    Health,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {:?}", log_path))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("stratum {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("stratum").join("stratum.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".stratum").join("stratum.log");
    }
    PathBuf::from("stratum.log")
}

fn redacted(mut bundle: ResolvedBundle) -> ResolvedBundle {
    bundle.fields = redact_fields(&bundle.fields);
    bundle
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct SwitchResult {
    switched: bool,
    status: stratum::BackendStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level)?;

    let engine = Engine::from_path(args.config.as_deref())
        .await
        .context("Failed to initialize engine")?;

    let result = run(&engine, args.command).await;
    engine.flush_snapshots().await;
    result
}

async fn run(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            #[derive(Serialize)]
            struct Status {
                resources: BTreeMap<String, stratum::ResourceStatus>,
                issues: Vec<stratum::config::ConfigIssue>,
            }
            print_json(&Status {
                resources: engine.get_status(),
                issues: engine.config_issues(),
            })
        }
        Command::Show { id } => {
            let Some(bundle) = engine.get_by_id(&id) else {
                bail!("Unknown resource '{}'", id);
            };
            print_json(&redacted(bundle))
        }
        Command::Kind { kind } => {
            let bundles: BTreeMap<String, ResolvedBundle> = engine
                .get_by_kind(&kind)
                .into_iter()
                .map(|(id, b)| (id, redacted(b)))
                .collect();
            print_json(&bundles)
        }
        Command::Backends { capability } => {
            let Some(status) = engine.get_backend_status(&capability).await else {
                bail!("Unknown capability '{}'", capability);
            };
            print_json(&status)
        }
        Command::Switch {
            capability,
            name,
            force,
        } => {
            if !engine.capabilities().contains(&capability) {
                bail!("Unknown capability '{}'", capability);
            }
            let switched = engine.switch_backend(&capability, &name, force).await;
            let Some(status) = engine.get_backend_status(&capability).await else {
                bail!("Unknown capability '{}'", capability);
            };
            print_json(&SwitchResult { switched, status })
        }
        Command::Health => print_json(&engine.health_check().await),
    }
}
