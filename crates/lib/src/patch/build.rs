//! The build task: run the managers, solve, export and report.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{PatchError, PatchTarget};
use crate::backend::{BuildClient, BuildError, ExportRequest, Session, SessionRequest, SolveStatus};
use crate::consts::OS_RELEASE_PATH;
use crate::graph::Snapshot;
use crate::manifest::UpdateManifest;
use crate::platform::{Arch, OsFamily};
use crate::pkgmgr::{BuildOutputPolicy, FailedPackages, ManagerConfig, ManagerRegistry, PackageManager};
use crate::report::VexWriter;

pub(crate) struct BuildJob {
  pub client: Arc<dyn BuildClient>,
  pub registry: Arc<ManagerRegistry>,
  pub vex: Arc<dyn VexWriter>,
  pub target: PatchTarget,
  pub manifest: Option<UpdateManifest>,
  pub working_folder: PathBuf,
  pub ignore_errors: bool,
  pub build_output: BuildOutputPolicy,
  pub format: String,
  pub output: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub(crate) struct BuildOutcome {
  pub managers: Vec<&'static str>,
  /// Every failed name, across ecosystems.
  pub failed: FailedPackages,
  os_failed: FailedPackages,
  /// Failed names per language `type`.
  lang_failed: HashMap<String, FailedPackages>,
  pub validated: usize,
  pub statement: Option<PathBuf>,
}

/// Which part of the manifest a manager run covers.
#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
  Os,
  Lang(&'a str),
}

impl BuildOutcome {
  fn record_failed<'n>(&mut self, scope: Scope<'_>, names: impl IntoIterator<Item = &'n String>) {
    let scoped = match scope {
      Scope::Os => &mut self.os_failed,
      Scope::Lang(lang) => self.lang_failed.entry(lang.to_string()).or_default(),
    };
    for name in names {
      scoped.insert(name.clone());
      self.failed.insert(name.clone());
    }
  }

  /// The updates of `manifest` no manager reported as failed.
  fn validated(&self, manifest: &UpdateManifest) -> UpdateManifest {
    manifest.retain_split(
      |update| !self.os_failed.contains(&update.name),
      |update| {
        !self
          .lang_failed
          .get(&update.pkg_type)
          .is_some_and(|failed| failed.contains(&update.name))
      },
    )
  }
}

/// Run the build task to completion.
///
/// The status stream is closed and the export writer shut down whether or
/// not the build succeeds, so the display and export tasks always finish.
pub(crate) async fn run_build(
  job: BuildJob,
  status: mpsc::Sender<SolveStatus>,
  mut writer: impl AsyncWrite + Send + Unpin,
) -> Result<BuildOutcome, PatchError> {
  let request = SessionRequest {
    image: job.target.source.to_string(),
    working_folder: job.working_folder.clone(),
    status,
  };
  let session = job.client.open_session(request).await?;

  let result = build_and_export(&job, &session, &mut writer).await;

  session.close_status();
  if let Err(err) = writer.shutdown().await {
    debug!(error = %err, "export conduit already closed");
  }
  result
}

async fn build_and_export(
  job: &BuildJob,
  session: &Arc<dyn Session>,
  writer: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<BuildOutcome, PatchError> {
  let config = ManagerConfig::new(session.clone(), &job.working_folder).with_build_output(job.build_output);
  let mut outcome = BuildOutcome::default();

  let state = match &job.manifest {
    None => update_all(job, session.as_ref(), config, &mut outcome).await?,
    Some(manifest) => {
      warn_on_arch_mismatch(manifest, config.image_config.architecture.as_deref());
      apply_manifest(job, manifest, config, &mut outcome).await?
    }
  };

  let definition = state.marshal().map_err(BuildError::from)?;
  debug!(nodes = definition.len(), "marshalled patched image state");
  session
    .solve(
      &definition,
      ExportRequest {
        name: &job.target.patched_name,
        writer,
      },
    )
    .await?;
  info!(image = %job.target.patched_name, "patched image exported");

  if let Some(manifest) = &job.manifest {
    let validated = outcome.validated(manifest);
    outcome.validated = validated.updates.len() + validated.lang_updates.len();
    // An empty statement is not worth writing.
    if let Some(output) = &job.output
      && outcome.validated > 0
    {
      job
        .vex
        .write(&validated, &outcome.managers, &job.target.patched_name, &job.format, output)?;
      info!(path = %output.display(), fixed = outcome.validated, "wrote patch statement");
      outcome.statement = Some(output.clone());
    }
  }

  Ok(outcome)
}

async fn update_all(
  job: &BuildJob,
  session: &dyn Session,
  config: ManagerConfig,
  outcome: &mut BuildOutcome,
) -> Result<Snapshot, PatchError> {
  let os_release = session
    .read_file(&config.image_state, OS_RELEASE_PATH)
    .await?
    .ok_or(PatchError::MissingOsRelease)?;
  let family = OsFamily::detect(&os_release)?;
  info!(os = %family, "no report given, updating all packages");

  let manager = job.registry.os_manager(family, config)?;
  install(manager.as_ref(), Scope::Os, None, job.ignore_errors, outcome).await
}

async fn apply_manifest(
  job: &BuildJob,
  manifest: &UpdateManifest,
  config: ManagerConfig,
  outcome: &mut BuildOutcome,
) -> Result<Snapshot, PatchError> {
  let mut state = config.image_state.clone();

  if manifest.updates.is_empty() {
    debug!("no OS updates in report");
  } else {
    let manager = job
      .registry
      .os_manager_for_tag(&manifest.metadata.os.os_type, config.clone())?;
    state = install(manager.as_ref(), Scope::Os, Some(manifest), job.ignore_errors, outcome).await?;
  }

  for lang in manifest.lang_types() {
    let manager = job.registry.lang_manager(lang, config.clone().with_state(state.clone()))?;
    state = install(manager.as_ref(), Scope::Lang(lang), Some(manifest), job.ignore_errors, outcome).await?;
  }

  Ok(state)
}

async fn install(
  manager: &dyn PackageManager,
  scope: Scope<'_>,
  manifest: Option<&UpdateManifest>,
  ignore_errors: bool,
  outcome: &mut BuildOutcome,
) -> Result<Snapshot, PatchError> {
  let name = manager.name();
  outcome.managers.push(name);
  match manager.install_updates(manifest, ignore_errors).await {
    Ok(installed) => {
      if !installed.failed.is_empty() {
        warn!(manager = name, failed = ?installed.failed, "packages failed to update");
      }
      outcome.record_failed(scope, &installed.failed);
      Ok(installed.state)
    }
    Err(failure) => {
      outcome.record_failed(scope, &failure.failed);
      Err(failure.into())
    }
  }
}

fn warn_on_arch_mismatch(manifest: &UpdateManifest, image_arch: Option<&str>) {
  let reported = manifest.metadata.config.arch.as_str();
  let Some(image_arch) = image_arch.filter(|_| !reported.is_empty()) else {
    return;
  };
  let same = match (Arch::parse(reported), Arch::parse(image_arch)) {
    (Some(a), Some(b)) => a == b,
    _ => reported.eq_ignore_ascii_case(image_arch),
  };
  if !same {
    warn!(
      report = %reported,
      image = %image_arch,
      "report architecture does not match the image"
    );
  }
}
