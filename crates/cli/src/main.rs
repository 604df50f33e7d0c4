//! Command-line front end for the Furrow task farm.
//!
//! Reads an ordered task list and a node list, runs the session, and streams
//! per-task status to stdout. The process exit code reflects the batch: 0 when
//! every task succeeded, 1 when any task failed, 2 when a stop was requested.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use furrow::{
    ComputeNode, LaunchMode, ScriptLauncher, Session, SessionError, SessionSettings, StatusSender,
    Task,
};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "furrow",
    about = "Run a batch of shell-command tasks across a pool of node-bound workers"
)]
struct Cli {
    /// JSON file with an ordered array of {id, launch_cmd, extra_paths} tasks.
    #[arg(long)]
    tasks: PathBuf,

    /// JSON file with an array of {address, cores} nodes. Defaults to the
    /// local machine with every detected core.
    #[arg(long)]
    nodes: Option<PathBuf>,

    /// JSON settings file; flags below override individual fields.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Execute launch scripts directly instead of through the parallel
    /// launcher.
    #[arg(long)]
    basic: bool,

    /// Parallel launcher binary used to pin tasks to hosts and cores.
    #[arg(long)]
    launcher_bin: Option<PathBuf>,

    #[arg(long)]
    cores_per_node: Option<u32>,

    #[arg(long)]
    cores_per_task: Option<u32>,

    /// Worker slots per node, overriding the value derived from core counts.
    #[arg(long)]
    processes_per_node: Option<u32>,

    /// Retain generated launch scripts after their task finishes.
    #[arg(long)]
    keep_scripts: bool,

    /// Directory where launch scripts are written.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Abort the session when this file appears.
    #[arg(long)]
    stop_file: Option<PathBuf>,

    /// Only honor the stop file when one of its lines contains this text.
    #[arg(long)]
    stop_magic: Option<String>,

    /// Kill tasks that run longer than this many seconds.
    #[arg(long)]
    task_timeout_secs: Option<f64>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> eyre::Result<T> {
    let file = File::open(path)
        .map_err(|error| eyre::eyre!("failed to open {}: {error}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|error| eyre::eyre!("failed to parse {}: {error}", path.display()))
}

fn build_settings(args: &Cli) -> eyre::Result<SessionSettings> {
    let mut settings = match &args.settings {
        Some(path) => read_json::<SessionSettings>(path)?,
        None => SessionSettings::default(),
    };

    if let Some(bin) = &args.launcher_bin {
        settings.launcher = LaunchMode::Wrapper { bin: bin.clone() };
    }
    if args.basic {
        settings.launcher = LaunchMode::Basic;
    }
    if let Some(cores) = args.cores_per_node {
        settings.cores_per_node = cores;
    }
    if let Some(cores) = args.cores_per_task {
        settings.cores_per_task = cores;
    }
    if args.processes_per_node.is_some() {
        settings.processes_per_node = args.processes_per_node;
    }
    if args.keep_scripts {
        settings.keep_scripts = true;
    }
    if let Some(dir) = &args.work_dir {
        settings.work_dir = dir.clone();
    }
    if args.stop_file.is_some() {
        settings.stop_file = args.stop_file.clone();
    }
    if let Some(magic) = &args.stop_magic {
        settings.stop_magic = magic.clone();
    }
    if let Some(secs) = args.task_timeout_secs {
        settings.task_timeout = Some(Duration::from_secs_f64(secs));
    }

    Ok(settings)
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();
    let settings = build_settings(&args)?;

    let tasks: Vec<Task> = read_json(&args.tasks)?;
    let nodes: Vec<ComputeNode> = match &args.nodes {
        Some(path) => read_json(path)?,
        None => vec![ComputeNode {
            address: "localhost".to_string(),
            cores: num_cpus::get() as u32,
        }],
    };

    event!(
        Level::INFO,
        num_tasks = tasks.len(),
        num_nodes = nodes.len(),
        "Starting task farm"
    );

    let (status, status_rx) = StatusSender::new();
    let printer = tokio::spawn(async move {
        while let Ok(item) = status_rx.recv_async().await {
            println!("{item}");
        }
    });

    let launcher = ScriptLauncher::new(&settings);
    let mut session = Session::new(settings, launcher, &nodes, tasks, status)
        .map_err(|error| eyre::eyre!("{error:?}"))?;

    let result = session.run().await;
    drop(session);
    printer.await.ok();

    match result {
        Ok(summary) if summary.all_succeeded() => {
            event!(Level::INFO, completed = summary.completed, "Batch succeeded");
            Ok(ExitCode::SUCCESS)
        }
        Ok(summary) => {
            for failed in &summary.failed {
                event!(Level::WARN, task = %failed.task_id, reason = ?failed.reason, "Task failed");
            }
            event!(
                Level::WARN,
                completed = summary.completed,
                failed = summary.failed.len(),
                "Batch finished with failures"
            );
            Ok(ExitCode::from(1))
        }
        Err(error) if matches!(error.current_context(), SessionError::StopRequested) => {
            event!(Level::WARN, "Batch aborted by stop file");
            Ok(ExitCode::from(2))
        }
        Err(error) => Err(eyre::eyre!("{error:?}")),
    }
}
