//! Patch orchestration.
//!
//! [`patch`] resolves the image reference and working folder, parses the
//! report, then runs three tasks side by side:
//!
//! - build: runs the package managers and solves the patched image into an
//!   in-memory conduit;
//! - display: renders build status events;
//! - export: loads the archive read from the conduit.
//!
//! The first task error cancels the rest. The whole run is bounded by a
//! deadline; on expiry it is aborted and given a short grace period to clean
//! up.

mod build;
pub mod reference;
pub mod workdir;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::backend::{BuildClient, BuildError, LocalClient};
use crate::consts::{EXPORT_PIPE_CAPACITY, STATUS_CHANNEL_CAPACITY, TIMEOUT_GRACE_SECS};
use crate::load::{DockerLoader, ImageLoader, drain};
use crate::pkgmgr::{BuildOutputPolicy, InstallFailure, ManagerRegistry, PkgMgrError};
use crate::platform::DetectError;
use crate::progress::{self, DisplayMode, DisplaySummary};
use crate::report::{JsonSummaryWriter, NATIVE_SCANNER, ReportError, ReportParsers, VexWriter};

use build::{BuildJob, BuildOutcome, run_build};
pub use reference::{ImageReference, PatchTarget, ReferenceError, validate_tag};
pub use workdir::WorkingFolder;

/// Default deadline for a whole run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Parameters of one patch run.
#[derive(Debug, Clone)]
pub struct PatchOptions {
  pub image: String,
  /// Update manifest to drive the run; without one every OS package is upgraded.
  pub report: Option<PathBuf>,
  pub scanner: String,
  pub patched_tag: Option<String>,
  pub working_folder: Option<PathBuf>,
  pub ignore_errors: bool,
  /// Whether language builds ship their output in the patch.
  pub build_output: BuildOutputPolicy,
  /// Format of the patch statement written to `output`.
  pub format: String,
  pub output: Option<PathBuf>,
  pub timeout: Duration,
  /// Plain progress output and a retained working folder.
  pub debug: bool,
}

impl PatchOptions {
  pub fn new(image: impl Into<String>) -> Self {
    Self {
      image: image.into(),
      report: None,
      scanner: NATIVE_SCANNER.to_string(),
      patched_tag: None,
      working_folder: None,
      ignore_errors: false,
      build_output: BuildOutputPolicy::default(),
      format: "json".to_string(),
      output: None,
      timeout: DEFAULT_TIMEOUT,
      debug: false,
    }
  }
}

/// The services a run talks to.
#[derive(Clone)]
pub struct Collaborators {
  pub client: Arc<dyn BuildClient>,
  pub loader: Arc<dyn ImageLoader>,
  pub reports: Arc<ReportParsers>,
  pub vex: Arc<dyn VexWriter>,
  pub registry: Arc<ManagerRegistry>,
}

impl Collaborators {
  /// Docker-backed build and load with the built-in parsers and managers.
  pub fn local() -> Self {
    Self::with_client(Arc::new(LocalClient::docker()), Arc::new(DockerLoader::default()))
  }

  pub fn with_client(client: Arc<dyn BuildClient>, loader: Arc<dyn ImageLoader>) -> Self {
    Self {
      client,
      loader,
      reports: Arc::new(ReportParsers::with_defaults()),
      vex: Arc::new(JsonSummaryWriter),
      registry: Arc::new(ManagerRegistry::with_defaults()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
  Initializing,
  ReportParsed,
  BuildRunning,
  Succeeded,
  Failed,
  TimedOut,
}

impl fmt::Display for PatchState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PatchState::Initializing => "initializing",
      PatchState::ReportParsed => "report parsed",
      PatchState::BuildRunning => "build running",
      PatchState::Succeeded => "succeeded",
      PatchState::Failed => "failed",
      PatchState::TimedOut => "timed out",
    };
    f.write_str(name)
  }
}

/// Logs every state change of a run.
struct StateLog {
  image: String,
  state: PatchState,
}

impl StateLog {
  fn new(image: &str) -> Self {
    debug!(image, state = %PatchState::Initializing, "patch state");
    Self {
      image: image.to_string(),
      state: PatchState::Initializing,
    }
  }

  fn advance(&mut self, next: PatchState) {
    info!(image = %self.image, from = %self.state, to = %next, "patch state changed");
    self.state = next;
  }
}

/// Broad classes of failure, for callers that branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  InputValidation,
  UnsupportedOperation,
  VersionFormat,
  ApplyFailure,
  ValidationMismatch,
  Timeout,
  Backend,
  Io,
}

#[derive(Debug, Error)]
pub enum PatchError {
  #[error(transparent)]
  Reference(#[from] ReferenceError),

  #[error("failed to prepare working folder {path}: {source}")]
  WorkingFolder {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Report(#[from] ReportError),

  #[error("unable to read /etc/os-release from the image")]
  MissingOsRelease,

  #[error(transparent)]
  Detect(#[from] DetectError),

  #[error(transparent)]
  Manager(#[from] PkgMgrError),

  #[error(transparent)]
  Install(#[from] InstallFailure),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error("progress display failed: {0}")]
  Display(#[source] std::io::Error),

  #[error("export conduit failed: {0}")]
  Export(#[source] std::io::Error),

  #[error("patch exceeded timeout {0:?}")]
  Timeout(Duration),

  #[error("patch task failed: {0}")]
  Task(String),
}

impl PatchError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PatchError::Reference(_) => ErrorKind::InputValidation,
      PatchError::Report(ReportError::UnsupportedFormat(_)) => ErrorKind::UnsupportedOperation,
      PatchError::Report(ReportError::Write { .. }) => ErrorKind::Io,
      PatchError::Report(_) => ErrorKind::InputValidation,
      PatchError::MissingOsRelease | PatchError::Detect(_) => ErrorKind::UnsupportedOperation,
      PatchError::Manager(err) => manager_kind(err),
      PatchError::Install(failure) => manager_kind(&failure.source),
      PatchError::Build(_) | PatchError::Task(_) => ErrorKind::Backend,
      PatchError::WorkingFolder { .. } | PatchError::Display(_) | PatchError::Export(_) => ErrorKind::Io,
      PatchError::Timeout(_) => ErrorKind::Timeout,
    }
  }
}

fn manager_kind(err: &PkgMgrError) -> ErrorKind {
  match err {
    PkgMgrError::Dedup(_) => ErrorKind::VersionFormat,
    PkgMgrError::Apply(_) => ErrorKind::ApplyFailure,
    PkgMgrError::Validation(_) => ErrorKind::ValidationMismatch,
    PkgMgrError::Unsupported { .. } => ErrorKind::UnsupportedOperation,
  }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct PatchSummary {
  pub image: String,
  pub patched_image: String,
  pub managers: Vec<String>,
  /// Packages that could not be updated; only non-empty when errors were ignored.
  pub failed: Vec<String>,
  /// Updates from the report that were applied and validated.
  pub validated: usize,
  pub statement: Option<PathBuf>,
  pub state: PatchState,
  #[serde(serialize_with = "serialize_secs")]
  pub duration: Duration,
}

fn serialize_secs<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_f64(duration.as_secs_f64())
}

enum TaskOutcome {
  Build(BuildOutcome),
  Display(DisplaySummary),
  Export,
}

/// Aborts the spawned task when dropped, so a caller giving up on `patch`
/// stops the run too.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
  fn drop(&mut self) {
    self.0.abort();
  }
}

/// Patch an image, bounded by `options.timeout`.
pub async fn patch(options: PatchOptions, collaborators: Collaborators) -> Result<PatchSummary, PatchError> {
  let timeout = options.timeout;
  let image = options.image.clone();
  let mut task = AbortOnDrop(tokio::spawn(run(options, collaborators)));
  let handle = &mut task.0;

  tokio::select! {
    joined = &mut *handle => match joined {
      Ok(result) => result,
      Err(err) => Err(PatchError::Task(err.to_string())),
    },
    () = tokio::time::sleep(timeout) => {
      handle.abort();
      // Dropping the run's future removes its working folder and kills children.
      if tokio::time::timeout(Duration::from_secs(TIMEOUT_GRACE_SECS), &mut *handle).await.is_err() {
        warn!(image = %image, "patch task did not stop within the grace period");
      }
      let err = PatchError::Timeout(timeout);
      error!(image = %image, state = %PatchState::TimedOut, "{}", err);
      Err(err)
    }
  }
}

async fn run(options: PatchOptions, collaborators: Collaborators) -> Result<PatchSummary, PatchError> {
  let started = Instant::now();
  let mut state = StateLog::new(&options.image);
  match run_stages(&options, &collaborators, &mut state).await {
    Ok(mut summary) => {
      state.advance(PatchState::Succeeded);
      summary.state = PatchState::Succeeded;
      summary.duration = started.elapsed();
      Ok(summary)
    }
    Err(err) => {
      state.advance(PatchState::Failed);
      error!(image = %options.image, kind = ?err.kind(), "{}", err);
      Err(err)
    }
  }
}

async fn run_stages(
  options: &PatchOptions,
  collaborators: &Collaborators,
  state: &mut StateLog,
) -> Result<PatchSummary, PatchError> {
  let target = PatchTarget::resolve(&options.image, options.patched_tag.as_deref())?;
  info!(image = %target.source, patched = %target.patched_name, "resolved image reference");

  let working_folder = WorkingFolder::prepare(options.working_folder.as_deref(), options.debug).map_err(|source| {
    PatchError::WorkingFolder {
      path: options
        .working_folder
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| std::env::temp_dir().display().to_string()),
      source,
    }
  })?;

  let manifest = match &options.report {
    Some(path) => {
      let manifest = collaborators.reports.parse(path, &options.scanner)?;
      debug!(
        updates = manifest.updates.len(),
        lang_updates = manifest.lang_updates.len(),
        "parsed report"
      );
      Some(manifest)
    }
    None => None,
  };
  state.advance(PatchState::ReportParsed);

  let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
  let (writer, mut reader) = tokio::io::duplex(EXPORT_PIPE_CAPACITY);

  let job = BuildJob {
    client: collaborators.client.clone(),
    registry: collaborators.registry.clone(),
    vex: collaborators.vex.clone(),
    target: target.clone(),
    manifest,
    working_folder: working_folder.path().to_path_buf(),
    ignore_errors: options.ignore_errors,
    build_output: options.build_output,
    format: options.format.clone(),
    output: options.output.clone(),
  };
  let mode = if options.debug {
    DisplayMode::Plain
  } else {
    DisplayMode::Auto
  };
  let loader = collaborators.loader.clone();

  let mut tasks: JoinSet<Result<TaskOutcome, PatchError>> = JoinSet::new();
  tasks.spawn(async move { run_build(job, status_tx, writer).await.map(TaskOutcome::Build) });
  tasks.spawn(async move {
    progress::display(status_rx, mode, tokio::io::stderr())
      .await
      .map(TaskOutcome::Display)
      .map_err(PatchError::Display)
  });
  tasks.spawn(async move {
    export(loader.as_ref(), &mut reader).await?;
    Ok(TaskOutcome::Export)
  });
  state.advance(PatchState::BuildRunning);

  let mut outcome = None;
  while let Some(joined) = tasks.join_next().await {
    match joined {
      Ok(Ok(TaskOutcome::Build(built))) => outcome = Some(built),
      Ok(Ok(TaskOutcome::Display(shown))) => {
        debug!(completed = shown.completed, cached = shown.cached, errored = shown.errored, "display finished")
      }
      Ok(Ok(TaskOutcome::Export)) => debug!("export finished"),
      Ok(Err(err)) => {
        tasks.abort_all();
        return Err(err);
      }
      Err(err) if err.is_cancelled() => {}
      Err(err) => {
        tasks.abort_all();
        return Err(PatchError::Task(err.to_string()));
      }
    }
  }

  let outcome = outcome.ok_or_else(|| PatchError::Task("build task produced no result".to_string()))?;
  Ok(PatchSummary {
    image: target.source.to_string(),
    patched_image: target.patched_name,
    managers: outcome.managers.iter().map(|m| m.to_string()).collect(),
    failed: outcome.failed.into_iter().collect(),
    validated: outcome.validated,
    statement: outcome.statement,
    state: state.state,
    duration: Duration::ZERO,
  })
}

/// Load the exported archive. A load failure only warns, and whatever the
/// loader left unread is drained so the build side never blocks.
async fn export(loader: &dyn ImageLoader, reader: &mut tokio::io::DuplexStream) -> Result<(), PatchError> {
  if let Err(err) = loader.load(&mut *reader).await {
    warn!(error = %err, "failed to load the patched image");
  }
  let leftover = drain(&mut *reader).await.map_err(PatchError::Export)?;
  if leftover > 0 {
    debug!(bytes = leftover, "drained unread export data");
  }
  Ok(())
}
