#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fsp_block::{ByteDevice, FileByteDevice, RequestId, RequestStatus, read_region};
use fsp_core::{FaultSpec, IoCountersSnapshot, ObserverConfig, RegistrySummary, discover};
use fsp_harness::{ObservedImage, load_request_script};
use fsp_journal::ProtocolAutomaton;
use fsp_types::{FsVariant, JournalingMode};
use serde::Serialize;
use std::env::VarError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "FSPROBE_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<()> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(default_env_filter())
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "fsprobe",
    about = "Classify, validate and fail journaling-filesystem block traffic"
)]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `FSPROBE_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover an image's layout and print the registry.
    Inspect {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Filesystem variant (`ext3`, `reiserfs` or `jfs`).
        #[arg(long = "fs")]
        filesystem: FsVariant,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Print the journaling protocol automaton for a mode.
    Model {
        #[arg(long, default_value_t = JournalingMode::Ordered)]
        mode: JournalingMode,
    },
    /// Run a JSON-lines request script against an in-memory copy of an image.
    Replay(ReplayArgs),
}

#[derive(clap::Args)]
struct ReplayArgs {
    /// Path to the filesystem image. It is never modified.
    image: PathBuf,
    /// Observer configuration file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured filesystem variant.
    #[arg(long = "fs")]
    filesystem: Option<FsVariant>,
    /// Overrides the configured journaling mode.
    #[arg(long)]
    mode: Option<JournalingMode>,
    /// Request script, one JSON request per line.
    #[arg(long)]
    requests: PathBuf,
    /// Fault to queue before replay (JSON). Enables injection.
    #[arg(long)]
    fault: Option<PathBuf>,
    /// Crash the observed instance once a commit block is written.
    #[arg(long)]
    crash_after_commit: bool,
    /// Output the report, trace included, as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command {
        Command::Inspect {
            image,
            filesystem,
            json,
        } => {
            let summary = inspect(&image, filesystem)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary)
                        .context("failed to serialize inspect output")?
                );
            } else {
                println!("{summary}");
            }
            Ok(())
        }
        Command::Model { mode } => {
            println!("{}", ProtocolAutomaton::for_mode(mode));
            Ok(())
        }
        Command::Replay(args) => {
            let json = args.json;
            let report = replay(&args)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report)
                        .context("failed to serialize replay report")?
                );
            } else {
                print!("{report}");
            }
            Ok(())
        }
    }
}

// ── Inspect ─────────────────────────────────────────────────────────────────

fn inspect(path: &Path, filesystem: FsVariant) -> Result<RegistrySummary> {
    let device = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let registry = discover(filesystem, &device)
        .with_context(|| format!("failed to discover {filesystem} layout in {}", path.display()))?;
    Ok(registry.summary())
}

// ── Replay ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ReplayReport {
    registry: RegistrySummary,
    requests: usize,
    failed: usize,
    violations: u64,
    model_state: String,
    fault: String,
    fault_injected: bool,
    crashed: bool,
    counters: IoCountersSnapshot,
    /// Records evicted before they could be extracted.
    truncated: u64,
    trace: Vec<String>,
}

impl std::fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.trace {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "requests: {} failed: {}", self.requests, self.failed)?;
        writeln!(f, "violations: {}", self.violations)?;
        writeln!(f, "model: {}", self.model_state)?;
        writeln!(
            f,
            "fault: {} (injected: {})",
            self.fault, self.fault_injected
        )?;
        if self.crashed {
            writeln!(f, "crashed: yes")?;
        }
        if self.truncated > 0 {
            writeln!(f, "trace truncated: {} records", self.truncated)?;
        }
        writeln!(f, "{}", self.counters)
    }
}

fn load_config(args: &ReplayArgs) -> Result<ObserverConfig> {
    let mut config = match &args.config {
        Some(path) => ObserverConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ObserverConfig::default(),
    };
    if let Some(filesystem) = args.filesystem {
        config.filesystem = filesystem;
    }
    if let Some(mode) = args.mode {
        config.journaling_mode = mode;
    }
    if args.fault.is_some() {
        config.inject_faults = true;
    }
    config.validate().context("invalid observer configuration")?;
    Ok(config)
}

fn load_fault(path: &Path) -> Result<FaultSpec> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fault {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid fault {}", path.display()))
}

fn replay(args: &ReplayArgs) -> Result<ReplayReport> {
    let config = load_config(args)?;
    let fault = args.fault.as_deref().map(load_fault).transpose()?;
    let script = load_request_script(&args.requests)?;

    let file = FileByteDevice::open(&args.image)
        .with_context(|| format!("failed to open image {}", args.image.display()))?;
    let block_size = discover(config.filesystem, &file)
        .with_context(|| {
            format!(
                "failed to discover {} layout in {}",
                config.filesystem,
                args.image.display()
            )
        })?
        .block_size();
    let len = usize::try_from(file.len_bytes()).context("image does not fit in memory")?;
    let bytes = read_region(&file, 0, len)
        .with_context(|| format!("failed to read image {}", args.image.display()))?;

    let image = ObservedImage::from_bytes(bytes, block_size, config)?;
    let registry = image.start().context("failed to start observing")?;
    let observer = image.observer();

    if let Some(spec) = fault {
        let refined = spec.refinement.is_some();
        observer.queue_fault(spec).context("failed to queue fault")?;
        if refined {
            let resolved = observer
                .process_fault()
                .context("failed to resolve fault refinement")?;
            tracing::info!(target: "fsp::cli", fault = %resolved, "fault refinement resolved");
        }
    }
    if args.crash_after_commit {
        observer.arm_crash_after_commit()?;
    }

    observer.mark_workload(true)?;
    let mut failed = 0;
    for (index, scripted) in script.iter().enumerate() {
        let id = RequestId(u64::try_from(index + 1).unwrap_or(u64::MAX));
        let request = scripted
            .to_request(id, block_size)
            .with_context(|| format!("request {} of {}", index + 1, args.requests.display()))?;
        let done = image.run_one(request);
        if let RequestStatus::Failed(detail) = &done.status {
            failed += 1;
            tracing::warn!(
                target: "fsp::cli",
                request = id.0,
                block = scripted.block,
                detail = %detail,
                "request failed"
            );
        }
    }
    observer.mark_workload(false)?;

    let mut trace = Vec::new();
    let mut truncated = 0;
    loop {
        let chunk = observer.extract_trace()?;
        truncated += chunk.truncated;
        trace.extend(chunk.text.lines().map(str::to_owned));
        if chunk.complete {
            break;
        }
    }

    Ok(ReplayReport {
        registry,
        requests: script.len(),
        failed,
        violations: observer.violations()?,
        model_state: observer.model_state()?.1,
        fault: observer.describe_fault()?,
        fault_injected: observer.fault_injected()?,
        crashed: observer.is_crashed()?,
        counters: observer.counters(),
        truncated,
        trace,
    })
}
