//! Thin command-line adapter over the marker engine. Every command prints a
//! JSON result object on stdout; errors go to stderr as structured objects
//! with a stable `kind`, mapped onto the documented exit codes.

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tr_core::{Job, MarkerClass, SourceKind};
use tr_engine::{
    export_events, CancelToken, EngineDefaults, ExportLevel, MarkerEngine, RunError, RunOverrides,
};
use tr_markers::{load_and_register, validate_tree};
use tr_storage::{MarkerStore, StorageError};
use tracing_subscriber::EnvFilter;

const EXIT_UNEXPECTED: i32 = 1;
const EXIT_VALIDATION: i32 = 2;
const EXIT_JOB_NOT_FOUND: i32 = 3;
const EXIT_STORAGE: i32 = 4;
const EXIT_CANCELLED: i32 = 5;

#[derive(Parser)]
#[command(name = "transrapport")]
#[command(about = "TransRapport marker engine", long_about = None)]
struct Cli {
    /// Engine root holding markers/, schemas/, runtime/ and exports/.
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and list marker definitions
    Markers {
        #[command(subcommand)]
        action: MarkersCommand,
    },
    /// Manage scan jobs
    Job {
        #[command(subcommand)]
        action: JobCommand,
    },
    /// Run the marker pipeline
    Run {
        #[command(subcommand)]
        action: RunCommand,
    },
    /// Inspect runtime events
    View {
        #[command(subcommand)]
        action: ViewCommand,
    },
    /// Export runtime events
    Export {
        #[command(subcommand)]
        action: ExportCommand,
    },
    /// Manage runtime state
    Runtime {
        #[command(subcommand)]
        action: RuntimeCommand,
    },
}

#[derive(Subcommand)]
enum MarkersCommand {
    /// Load the marker tree and register definitions
    Load,
    /// Validate the marker tree without registering
    Validate {
        /// Skip the frame and examples rules
        #[arg(long)]
        lenient: bool,
    },
    /// List registered marker metadata
    List {
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        enabled_only: bool,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Create a scan job for a conversation
    Create {
        conv: String,
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "text")]
        kind: String,
        #[arg(long)]
        chunksize: Option<u32>,
        #[arg(long)]
        overlap: Option<u32>,
    },
}

#[derive(Subcommand)]
enum RunCommand {
    /// Run ATO → SEM → CLU → MEMA for a conversation
    Scan {
        conv: String,
        #[arg(long)]
        window_sem: Option<String>,
        #[arg(long)]
        window_clu: Option<String>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ViewCommand {
    /// Print a conversation's events for one level
    Events {
        conv: String,
        #[arg(long)]
        level: String,
        #[arg(long)]
        last: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ExportCommand {
    /// Write JSONL and CSV event dumps
    Events {
        conv: String,
        #[arg(long, default_value = "all")]
        level: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RuntimeCommand {
    /// Remove a conversation's runtime events and artifacts
    Clear { conv: String },
}

struct Failure {
    code: i32,
    kind: String,
    message: String,
    details: Option<serde_json::Value>,
}

impl Failure {
    fn unexpected(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_UNEXPECTED,
            kind: "unexpected".to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn validation(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: EXIT_VALIDATION,
            kind: "validation".to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

impl From<StorageError> for Failure {
    fn from(err: StorageError) -> Self {
        let code = match err {
            StorageError::NotFound(_) => EXIT_JOB_NOT_FOUND,
            _ => EXIT_STORAGE,
        };
        Self {
            code,
            kind: err.kind().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

impl From<RunError> for Failure {
    fn from(err: RunError) -> Self {
        let code = match &err {
            RunError::Storage(StorageError::NotFound(_)) => EXIT_JOB_NOT_FOUND,
            RunError::Storage(_) => EXIT_STORAGE,
            RunError::Validation(_) => EXIT_VALIDATION,
            RunError::Cancelled => EXIT_CANCELLED,
            RunError::Engine(_) => EXIT_UNEXPECTED,
        };
        Self {
            code,
            kind: err.kind().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match execute(&cli.root, cli.command) {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result).expect("encode result"));
        }
        Err(failure) => {
            let body = json!({
                "kind": failure.kind,
                "message": failure.message,
                "details": failure.details,
            });
            eprintln!("{}", serde_json::to_string_pretty(&body).expect("encode error"));
            std::process::exit(failure.code);
        }
    }
}

fn execute(root: &Path, command: Commands) -> Result<serde_json::Value, Failure> {
    match command {
        Commands::Markers { action } => markers_command(root, action),
        Commands::Job { action } => job_command(root, action),
        Commands::Run { action } => run_command(root, action),
        Commands::View { action } => view_command(root, action),
        Commands::Export { action } => export_command(root, action),
        Commands::Runtime { action } => runtime_command(root, action),
    }
}

fn open_store(root: &Path) -> Result<MarkerStore, Failure> {
    let runtime_dir = root.join("runtime");
    std::fs::create_dir_all(&runtime_dir)
        .map_err(|err| Failure::unexpected(format!("create runtime dir: {err}")))?;
    Ok(MarkerStore::open(runtime_dir.join("transrapport.db"))?)
}

fn engine_for(root: &Path) -> MarkerEngine {
    MarkerEngine::new(EngineDefaults::load(&root.join("schemas")))
}

fn markers_command(root: &Path, action: MarkersCommand) -> Result<serde_json::Value, Failure> {
    let markers_dir = root.join("markers");
    match action {
        MarkersCommand::Load => {
            let store = open_store(root)?;
            let engine = engine_for(root);
            let (_, report) =
                load_and_register(&markers_dir, &store, &engine.detector_names(), true)?;
            let result = json!({
                "loaded": report.loaded,
                "skipped": report.skipped.iter().map(|err| err.to_string()).collect::<Vec<_>>(),
                "errors": report.violations,
            });
            if report.ok() {
                Ok(result)
            } else {
                Err(Failure::validation("marker load failed validation", result))
            }
        }
        MarkersCommand::Validate { lenient } => {
            let engine = engine_for(root);
            let report = validate_tree(&markers_dir, &engine.detector_names(), !lenient);
            let result = json!({ "ok": report.ok(), "violations": report.violations });
            if report.ok() {
                Ok(result)
            } else {
                Err(Failure::validation("marker validation failed", result))
            }
        }
        MarkersCommand::List {
            class,
            enabled_only,
        } => {
            let class = class
                .map(|value| {
                    MarkerClass::from_str(&value)
                        .map_err(|err| Failure::unexpected(err))
                })
                .transpose()?;
            let store = open_store(root)?;
            let markers = store.list_markers(class, enabled_only)?;
            Ok(json!({ "items": markers }))
        }
    }
}

fn job_command(root: &Path, action: JobCommand) -> Result<serde_json::Value, Failure> {
    match action {
        JobCommand::Create {
            conv,
            source,
            kind,
            chunksize,
            overlap,
        } => {
            let source_kind =
                SourceKind::from_str(&kind).map_err(|err| Failure::unexpected(err))?;
            let defaults = EngineDefaults::load(&root.join("schemas"));
            let chunksize = chunksize.unwrap_or(defaults.chunksize);
            let overlap = overlap.unwrap_or(defaults.overlap);
            if overlap >= chunksize {
                return Err(Failure::unexpected(format!(
                    "overlap {overlap} must be smaller than chunksize {chunksize}"
                )));
            }

            let store = open_store(root)?;
            store.create_job(&Job {
                conv: conv.clone(),
                source_kind,
                source_path: source,
                chunksize,
                overlap,
                created_at: Utc::now(),
            })?;
            Ok(json!({ "conv": conv }))
        }
    }
}

fn run_command(root: &Path, action: RunCommand) -> Result<serde_json::Value, Failure> {
    match action {
        RunCommand::Scan {
            conv,
            window_sem,
            window_clu,
            seed,
            batch_size,
        } => {
            let store = open_store(root)?;
            let engine = engine_for(root);
            let (catalog, report) = load_and_register(
                &root.join("markers"),
                &store,
                &engine.detector_names(),
                true,
            )?;
            if !report.ok() {
                return Err(Failure::validation(
                    "marker load failed validation",
                    json!({ "violations": report.violations }),
                ));
            }

            let overrides = RunOverrides {
                window_sem,
                window_clu,
                seed,
                batch_size,
            };
            let summary = engine.run(&store, &catalog, &conv, &overrides, &CancelToken::new())?;
            Ok(serde_json::to_value(&summary)
                .map_err(|err| Failure::unexpected(err.to_string()))?)
        }
    }
}

fn view_command(root: &Path, action: ViewCommand) -> Result<serde_json::Value, Failure> {
    match action {
        ViewCommand::Events { conv, level, last } => {
            let level =
                MarkerClass::from_str(&level).map_err(|err| Failure::unexpected(err))?;
            let store = open_store(root)?;
            let events = store.query_events(level, &conv, last)?;
            Ok(json!({ "items": events }))
        }
    }
}

fn export_command(root: &Path, action: ExportCommand) -> Result<serde_json::Value, Failure> {
    match action {
        ExportCommand::Events { conv, level, out } => {
            let level =
                ExportLevel::from_str(&level).map_err(|err| Failure::unexpected(err))?;
            let out_dir = out.unwrap_or_else(|| root.join("exports"));
            let store = open_store(root)?;
            let files = export_events(&store, &conv, level, &out_dir)?;
            let files: Vec<String> = files
                .iter()
                .map(|path| path.display().to_string())
                .collect();
            Ok(json!({ "files": files }))
        }
    }
}

fn runtime_command(root: &Path, action: RuntimeCommand) -> Result<serde_json::Value, Failure> {
    match action {
        RuntimeCommand::Clear { conv } => {
            let store = open_store(root)?;
            store.clear_runtime(&conv)?;
            Ok(json!({ "ok": true }))
        }
    }
}
