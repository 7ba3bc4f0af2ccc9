//! hoard-cli - run ensure-folder requests from a JSON scenario
//!
//! シナリオファイルでリポジトリの初期状態とリクエストを記述し、
//! リクエストごとに 1 行の JSON レポートを標準出力に書きます。
//!
//! ```text
//! RUST_LOG=hoard_core=debug hoard-cli --scenario demos/scenario.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hoard_core::app::{
    EnsureFolder, EnsureFolderReport, Scheduler, SchedulerConfig, SchedulerError, TaskError,
};
use hoard_core::domain::{AbortKind, FolderId};
use hoard_core::impls::{FetchMode, InMemoryFolderRepository};
use hoard_core::ports::{FolderRepository, IdGenerator, SystemClock, UlidGenerator};

#[derive(Debug, Parser)]
#[command(name = "hoard-cli")]
#[command(version, about = "Run ensure-folder requests against an in-memory repository", long_about = None)]
struct Cli {
    /// Scenario file (JSON)
    #[arg(long)]
    scenario: PathBuf,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read scenario {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Scenario file layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Scenario {
    scheduler: SchedulerConfig,
    /// Folders present before any request runs.
    folders: Vec<SeedFolder>,
    /// Keep the repository unusable for this long.
    ready_after_ms: u64,
    fetch: FetchSetting,
    requests: Vec<EnsureRequest>,
}

#[derive(Debug, Deserialize)]
struct SeedFolder {
    /// `/`-separated path below the root.
    path: String,
    #[serde(default)]
    children_known: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum FetchSetting {
    #[default]
    Immediate,
    Delayed { delay_ms: u64 },
}

impl From<FetchSetting> for FetchMode {
    fn from(setting: FetchSetting) -> Self {
        match setting {
            FetchSetting::Immediate => FetchMode::Immediate,
            FetchSetting::Delayed { delay_ms } => {
                FetchMode::Delayed(Duration::from_millis(delay_ms))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnsureRequest {
    #[serde(default)]
    name: String,
    /// Path of the parent folder; the root when absent.
    #[serde(default)]
    parent: Option<String>,
    /// Path of a folder to start from instead of searching by name.
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    create: bool,
    #[serde(default)]
    fetch_children: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum Outcome {
    Finished {
        #[serde(flatten)]
        report: EnsureFolderReport,
    },
    Aborted {
        kind: AbortKind,
        reason: String,
    },
    Cancelled,
    Dropped,
}

#[derive(Debug, Serialize)]
struct RequestLine<'a> {
    request: usize,
    name: &'a str,
    #[serde(flatten)]
    outcome: Outcome,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("hoard-cli: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let scenario = load_scenario(&cli.scenario)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    runtime.block_on(execute(scenario))
}

fn load_scenario(path: &Path) -> Result<Scenario, CliError> {
    let raw = fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CliError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

async fn execute(scenario: Scenario) -> Result<(), CliError> {
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
    let mut repo = InMemoryFolderRepository::with_id_generator(Arc::clone(&ids))
        .with_fetch_mode(scenario.fetch.into());
    if scenario.ready_after_ms > 0 {
        repo = repo.not_ready();
    }
    for seed in &scenario.folders {
        repo.insert_path(&seed.path, seed.children_known);
    }
    let repo = Arc::new(repo);
    info!(
        folders = scenario.folders.len(),
        requests = scenario.requests.len(),
        "scenario loaded"
    );

    if scenario.ready_after_ms > 0 {
        let repo = Arc::clone(&repo);
        let delay = Duration::from_millis(scenario.ready_after_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            repo.mark_ready();
        });
    }

    let scheduler = Scheduler::with_id_generator(scenario.scheduler.clone(), Arc::clone(&ids));

    // 順番に流す（後のリクエストが前のリクエストの作ったフォルダを見られるように）
    for (index, request) in scenario.requests.iter().enumerate() {
        let mut task = EnsureFolder::named(repo.clone(), request.name.clone())
            .create_if_missing(request.create)
            .fetch_children(request.fetch_children);
        if let Some(parent) = &request.parent {
            task = task.under(lookup(&repo, parent, ids.as_ref()));
        }
        if let Some(target) = &request.target {
            task = task.with_target(lookup(&repo, target, ids.as_ref()));
        }

        let outcome = match scheduler.submit(task)?.join().await {
            Ok(report) => Outcome::Finished { report },
            Err(TaskError::Aborted(err)) => Outcome::Aborted {
                kind: err.kind(),
                reason: err.to_string(),
            },
            Err(TaskError::Cancelled) => Outcome::Cancelled,
            Err(TaskError::Dropped) => Outcome::Dropped,
        };
        let line = RequestLine {
            request: index,
            name: &request.name,
            outcome,
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    let counts = scheduler.counts().await?;
    info!(finished = counts.finished, aborted = counts.aborted, "scenario complete");
    scheduler.shutdown_and_join().await;
    Ok(())
}

/// Resolve a `/`-separated path to an existing folder.
///
/// Unknown paths map to a fresh id that the repository has never seen, so the
/// task reports them the same way it reports any other unknown folder.
fn lookup(repo: &InMemoryFolderRepository, path: &str, ids: &dyn IdGenerator) -> FolderId {
    let mut current = repo.root_id();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let next = repo
            .direct_children(current)
            .into_iter()
            .find(|folder| folder.has_name(segment));
        match next {
            Some(folder) => current = folder.id,
            None => {
                warn!(path, "path does not exist in the repository");
                return ids.generate_folder_id();
            }
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scenario_uses_defaults() {
        let scenario: Scenario = serde_json::from_str("{}").unwrap();
        assert_eq!(scenario.scheduler, SchedulerConfig::default());
        assert!(scenario.requests.is_empty());
        assert!(matches!(scenario.fetch, FetchSetting::Immediate));
    }

    #[test]
    fn parses_delayed_fetch_and_requests() {
        let raw = r#"{
            "fetch": { "mode": "delayed", "delay_ms": 25 },
            "folders": [{ "path": "Textures/Old" }],
            "requests": [{ "name": "Old", "parent": "Textures", "fetch_children": true }]
        }"#;
        let scenario: Scenario = serde_json::from_str(raw).unwrap();
        assert_eq!(
            FetchMode::from(scenario.fetch),
            FetchMode::Delayed(Duration::from_millis(25))
        );
        assert_eq!(scenario.requests[0].parent.as_deref(), Some("Textures"));
        assert!(!scenario.requests[0].create);
        assert!(!scenario.folders[0].children_known);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<Scenario>(r#"{ "request": [] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn lookup_walks_existing_paths() {
        let ids = UlidGenerator::new(SystemClock);
        let repo = InMemoryFolderRepository::new();
        let leaf = repo.insert_path("Clothing/Hats", true);

        assert_eq!(lookup(&repo, "Clothing/Hats", &ids), leaf);
        assert_eq!(lookup(&repo, "", &ids), repo.root_id());
        assert!(!repo.contains(lookup(&repo, "Clothing/Shoes", &ids)));
    }

    #[test]
    fn finished_line_flattens_report() {
        let line = RequestLine {
            request: 0,
            name: "Missing",
            outcome: Outcome::Finished {
                report: EnsureFolderReport {
                    folder: None,
                    resolved: false,
                    created: false,
                    children_known: false,
                },
            },
        };
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["outcome"], "finished");
        assert_eq!(value["resolved"], false);
        assert!(value["folder"].is_null());
    }

    #[test]
    fn missing_scenario_file_is_a_read_error() {
        let err = load_scenario(Path::new("/nonexistent/scenario.json")).unwrap_err();
        assert!(matches!(err, CliError::Read { .. }));
    }
}
