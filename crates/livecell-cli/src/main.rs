//! `livecell` - run the code cells of a Markdown document against a kernel.

mod markdown;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use livecell::build::list_saved_sessions;
use livecell::config::DEFAULT_STORAGE_PREFIX;
use livecell::prompts::{split_input_prompts, split_output_prompts};
use livecell::store::default_store_path;
use livecell::{
    CellStatus, DiagnosticParser, EventBus, FileStore, JupyterBackend, KeyValueStore, MemoryStore,
    Page, PageEvent,
};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::markdown::MarkdownPage;

#[derive(Parser, Debug)]
#[command(name = "livecell")]
#[command(author, version, about = "Run the code cells of a Markdown document against a Jupyter kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Key/value store file (default: <data dir>/livecell/store.json)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the executable cells of a Markdown document
    Run(RunArgs),

    /// Print the source locations referenced by an error report
    Diagnose {
        /// Report file (reads stdin if not provided)
        report: Option<PathBuf>,
        /// Extension of the source files the report refers to
        #[arg(long, default_value = "agda")]
        extension: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Split an interactive-session transcript into cell sources
    StripPrompts {
        /// Transcript file (reads stdin if not provided)
        file: Option<PathBuf>,
        #[arg(long, default_value = ">>> ")]
        in_prompt: String,
        #[arg(long)]
        continuation_prompt: Option<String>,
        /// Split on output prompts instead of input prompts
        #[arg(long, conflicts_with_all = ["continuation_prompt"])]
        out_prompt: Option<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Saved build sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Markdown document holding the cells
    document: PathBuf,

    /// JSON file with options, applied over the document's own config blocks
    #[arg(long)]
    config: Option<PathBuf>,

    /// Jupyter server to start the kernel on
    #[arg(long)]
    server_url: Option<String>,

    /// Jupyter server token
    #[arg(long)]
    token: Option<String>,

    /// Kernel spec name (server default if not provided)
    #[arg(long)]
    kernel: Option<String>,

    /// Build an ephemeral server from this repository instead
    #[arg(long)]
    repo: Option<String>,

    /// Repository ref to build
    #[arg(long = "ref")]
    git_ref: Option<String>,

    /// Build service URL
    #[arg(long)]
    binder_url: Option<String>,

    /// Repository provider: gh, gl or git
    #[arg(long)]
    provider: Option<String>,

    /// Only run these cells (by id; repeatable)
    #[arg(long = "cell")]
    cells: Vec<String>,

    /// Keep nothing between runs
    #[arg(long)]
    no_store: bool,

    /// Leave the kernel running afterwards
    #[arg(long)]
    keep_kernel: bool,

    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum SessionCommands {
    /// List saved build sessions
    List {
        #[arg(long, default_value = DEFAULT_STORAGE_PREFIX)]
        prefix: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Forget every saved build session
    Clear {
        #[arg(long, default_value = DEFAULT_STORAGE_PREFIX)]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let store_path = cli.store.unwrap_or_else(default_store_path);
    match cli.command {
        Commands::Run(args) => run_document(args, &store_path).await,
        Commands::Diagnose {
            report,
            extension,
            json,
        } => diagnose(report.as_deref(), &extension, json).await,
        Commands::StripPrompts {
            file,
            in_prompt,
            continuation_prompt,
            out_prompt,
            json,
        } => {
            let text = read_input(file.as_deref()).await?;
            let cells = match out_prompt {
                Some(out_prompt) => split_output_prompts(&text, &out_prompt),
                None => split_input_prompts(&text, &in_prompt, continuation_prompt.as_deref()),
            };
            print_cells(cells.unwrap_or_else(|| vec![text]), json)
        }
        Commands::Sessions { command } => sessions(command, &store_path),
    }
}

async fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            use tokio::io::AsyncReadExt;
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            Ok(text)
        }
    }
}

fn open_store(path: &Path, in_memory: bool) -> Result<Arc<dyn KeyValueStore>> {
    if in_memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = FileStore::open(path)?;
    debug!("Using store {}", store.path().display());
    Ok(Arc::new(store))
}

// =============================================================================
// run
// =============================================================================

#[derive(Serialize)]
struct CellReport {
    id: String,
    status: CellStatus,
    output: String,
}

fn status_label(status: CellStatus) -> &'static str {
    match status {
        CellStatus::Unknown => "unknown",
        CellStatus::Running => "running",
        CellStatus::Ok => "ok",
        CellStatus::Error => "error",
        CellStatus::Holes => "holes",
    }
}

/// Put `value` at `path` inside `root`, creating objects on the way.
fn set_path(root: &mut Value, path: &[&str], value: Value) {
    let mut node = root;
    for key in path {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map.entry(key.to_string()).or_insert(Value::Null);
    }
    *node = value;
}

/// The call-site option layer: the `--config` file with flags on top.
fn run_overrides(args: &RunArgs, config: Option<&str>) -> Result<Value> {
    let mut overrides = match config {
        Some(raw) => serde_json::from_str(raw).context("config file is not valid JSON")?,
        None => json!({}),
    };
    if !overrides.is_object() {
        bail!("config file must hold a JSON object");
    }

    let flags: [(&[&str], &Option<String>); 7] = [
        (&["kernelOptions", "serverSettings", "baseUrl"], &args.server_url),
        (&["kernelOptions", "serverSettings", "token"], &args.token),
        (&["kernelOptions", "name"], &args.kernel),
        (&["binderOptions", "repo"], &args.repo),
        (&["binderOptions", "ref"], &args.git_ref),
        (&["binderOptions", "binderUrl"], &args.binder_url),
        (&["binderOptions", "repoProvider"], &args.provider),
    ];
    for (path, value) in flags {
        if let Some(value) = value {
            set_path(&mut overrides, path, Value::String(value.clone()));
        }
    }
    Ok(overrides)
}

async fn log_events(mut events: broadcast::Receiver<PageEvent>) {
    loop {
        match events.recv().await {
            Ok(PageEvent::Status { status, message }) => {
                info!("[kernel] {}: {}", status.as_str(), message)
            }
            Ok(PageEvent::KernelMessage { message }) => info!("[kernel] {}", message),
            Ok(PageEvent::RequestKernel) => debug!("[kernel] Kernel requested"),
            Err(RecvError::Lagged(skipped)) => debug!("Skipped {} page events", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn run_document(args: RunArgs, store_path: &Path) -> Result<()> {
    let text = read_input(Some(&args.document)).await?;
    let config = match &args.config {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        None => None,
    };
    let overrides = run_overrides(&args, config.as_deref())?;
    let store = open_store(store_path, args.no_store)?;

    let mut surface = MarkdownPage::parse(&text);
    let events = EventBus::default();
    tokio::spawn(log_events(events.subscribe()));

    let backend = Arc::new(JupyterBackend::new()?);
    let page = Page::builder(backend, store)
        .events(events)
        .overrides(overrides)
        .bootstrap(&mut surface)?;

    let selected: Vec<_> = page
        .cells()
        .iter()
        .filter(|cell| args.cells.is_empty() || args.cells.iter().any(|id| id == cell.id()))
        .cloned()
        .collect();
    if selected.is_empty() {
        warn!("No executable cells found in {}", args.document.display());
        return Ok(());
    }
    for id in &args.cells {
        if page.cell(id).is_none() {
            warn!("No cell with id {:?}", id);
        }
    }

    page.connect().await.context("could not get a kernel")?;

    let mut reports = Vec::new();
    for cell in &selected {
        let status = cell.run().await?;
        let output = surface
            .output(cell.id())
            .map(|output| output.text())
            .unwrap_or_default();
        reports.push(CellReport {
            id: cell.id().to_string(),
            status,
            output,
        });
    }

    page.shutdown().await;
    if !args.keep_kernel {
        if let Some(kernel) = page.kernel() {
            if let Err(e) = kernel.shutdown().await {
                warn!("Failed to shut down kernel {}: {}", kernel.kernel_id(), e);
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("── {} [{}]", report.id, status_label(report.status));
            if !report.output.is_empty() {
                println!("{}", report.output.trim_end());
            }
        }
    }

    let failed = reports
        .iter()
        .filter(|r| r.status == CellStatus::Error)
        .count();
    if failed > 0 {
        bail!("{failed} of {} cells failed", reports.len());
    }
    Ok(())
}

// =============================================================================
// diagnose / strip-prompts
// =============================================================================

#[derive(Serialize, Tabled)]
struct DiagnosticRow {
    #[tabled(rename = "FILE")]
    file: String,
    #[tabled(rename = "FROM")]
    line_from: usize,
    #[tabled(rename = "TO")]
    line_to: usize,
}

async fn diagnose(report: Option<&Path>, extension: &str, json_output: bool) -> Result<()> {
    let parser = DiagnosticParser::new(extension)?;
    let text = read_input(report).await?;
    let rows: Vec<DiagnosticRow> = parser
        .parse(&text)
        .into_iter()
        .map(|d| DiagnosticRow {
            file: d.file,
            line_from: d.line_from,
            line_to: d.line_to,
        })
        .collect();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("No locations found.");
    } else {
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    Ok(())
}

fn print_cells(cells: Vec<String>, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(&cells)?);
        return Ok(());
    }
    for (index, cell) in cells.iter().enumerate() {
        if index > 0 {
            println!();
        }
        print!("{cell}");
        if !cell.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

// =============================================================================
// sessions
// =============================================================================

#[derive(Serialize, Tabled)]
struct SessionRow {
    #[tabled(rename = "BUILD")]
    build_url: String,
    #[tabled(rename = "SERVER")]
    server_url: String,
    #[tabled(rename = "LAST USED")]
    last_used: String,
    #[tabled(rename = "AGE")]
    age: String,
}

fn format_age(seconds: i64) -> String {
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86400),
    }
}

fn sessions(command: SessionCommands, store_path: &Path) -> Result<()> {
    let store = FileStore::open(store_path)?;
    match command {
        SessionCommands::List { prefix, json } => {
            let now = Utc::now();
            let rows: Vec<SessionRow> = list_saved_sessions(&store, &prefix)?
                .into_iter()
                .map(|(build_url, record)| match record {
                    Some(record) => SessionRow {
                        build_url,
                        server_url: record.url,
                        last_used: record.last_used.to_rfc3339(),
                        age: format_age(now.signed_duration_since(record.last_used).num_seconds()),
                    },
                    None => SessionRow {
                        build_url,
                        server_url: "(unreadable)".to_string(),
                        last_used: "-".to_string(),
                        age: "-".to_string(),
                    },
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No saved sessions.");
            } else {
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
        SessionCommands::Clear { prefix } => {
            let sessions = list_saved_sessions(&store, &prefix)?;
            for (build_url, _) in &sessions {
                store.remove(&format!("{prefix}{build_url}"))?;
            }
            println!("Removed {} saved sessions.", sessions.len());
        }
    }
    Ok(())
}
