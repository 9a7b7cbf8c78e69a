//! The install flow shared by every manager.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use super::dedup::unique_latest_updates;
use super::validate::validate_installed;
use super::{FailedPackages, InstallFailure, Installed, ManagerConfig, PkgMgrError};
use crate::consts::{RESULTS_MANIFEST, RESULTS_PATH};
use crate::graph::Snapshot;
use crate::manifest::{UpdateManifest, UpdatePackage};
use crate::util::shell::quote;
use crate::version::VersionComparer;

/// What a manager contributes to the shared flow.
pub(crate) trait UpdateRecipe: Send + Sync {
  fn recipe_name(&self) -> &'static str;

  fn config(&self) -> &ManagerConfig;

  /// This ecosystem's entries from the manifest.
  fn select(&self, manifest: &UpdateManifest) -> Vec<UpdatePackage>;

  fn comparer(&self) -> &dyn VersionComparer;

  /// Build the graph steps applying `updates` on top of the image.
  ///
  /// The returned snapshot is both where the package listing is extracted
  /// from and what the shipped patch is computed against.
  fn apply(&self, updates: &[UpdatePackage], ignore_errors: bool) -> Snapshot;

  /// Command printing the installed package list on stdout.
  fn listing_command(&self) -> &'static str;

  fn parse_listing(&self, listing: &[u8]) -> HashMap<String, String>;

  /// Steps upgrading every package, used when there is no manifest.
  fn upgrade_all(&self) -> Option<Snapshot> {
    None
  }
}

/// `cmd`, or `cmd` with its failure downgraded to a printed warning.
pub(crate) fn guarded(cmd: &str, warning: &str, ignore_errors: bool) -> String {
  if ignore_errors {
    format!("{} || echo {}", cmd, quote(&format!("WARN: {}", warning)))
  } else {
    cmd.to_string()
  }
}

fn results_file() -> String {
  format!("{}/{}", RESULTS_PATH, RESULTS_MANIFEST)
}

fn extraction_script(listing_command: &str) -> String {
  let results = results_file();
  format!(
    "mkdir -p {dir} && {{ {cmd} > {file} || echo {warn}; }}",
    dir = quote(RESULTS_PATH),
    cmd = listing_command,
    file = quote(&results),
    warn = quote(&format!("WARN: {} failed", listing_command)),
  )
}

/// `image_state` plus only what changed between it and `applied`.
pub(crate) fn minimise(image_state: &Snapshot, applied: &Snapshot) -> Snapshot {
  Snapshot::merge(&[image_state.clone(), Snapshot::diff(image_state, applied)])
}

pub(crate) async fn install_updates<R: UpdateRecipe + ?Sized>(
  recipe: &R,
  manifest: Option<&UpdateManifest>,
  ignore_errors: bool,
) -> Result<Installed, InstallFailure> {
  let manager = recipe.recipe_name();
  let config = recipe.config();
  let original = config.image_state.clone();

  let Some(manifest) = manifest else {
    return Ok(match recipe.upgrade_all() {
      Some(upgraded) => {
        info!(manager, "upgrading all packages");
        Installed::unchanged(minimise(&original, &upgraded))
      }
      None => {
        debug!(manager, "no manifest, nothing to update");
        Installed::unchanged(original)
      }
    });
  };

  let requested = recipe.select(manifest);
  if requested.is_empty() {
    debug!(manager, "no updates for this ecosystem");
    return Ok(Installed::unchanged(original));
  }
  debug!(manager, count = requested.len(), "selected updates");

  let unique = match unique_latest_updates(&requested, recipe.comparer(), ignore_errors) {
    Ok(unique) => unique,
    Err(err) => {
      return Err(InstallFailure {
        state: original,
        failed: requested.iter().map(|u| u.name.clone()).collect(),
        source: err.into(),
      });
    }
  };

  let mut failed: FailedPackages = unique.failed;
  if unique.updates.is_empty() {
    warn!(manager, "no update packages were specified to apply");
    return Ok(Installed { state: original, failed });
  }
  let attempted = unique.updates;
  info!(manager, count = attempted.len(), "applying updates");

  let applied = recipe.apply(&attempted, ignore_errors);
  let extracted = applied.run(config.run_spec(extraction_script(recipe.listing_command())));
  let results_layer = Snapshot::diff(&applied, &extracted);

  let listing = match config.session.read_file(&results_layer, &results_file()).await {
    Ok(listing) => listing,
    Err(err) => {
      error!(manager, error = %err, "failed to apply updates");
      failed.extend(attempted.iter().map(|u| u.name.clone()));
      if ignore_errors {
        warn!(manager, "update failure ignored, keeping the original image state");
        return Ok(Installed { state: original, failed });
      }
      return Err(InstallFailure {
        state: original,
        failed,
        source: PkgMgrError::Apply(err),
      });
    }
  };

  if let Some(bytes) = &listing {
    let artifact = config.working_folder.join(format!("{}-{}", manager, RESULTS_MANIFEST));
    match tokio::fs::write(&artifact, bytes).await {
      Ok(()) => debug!(manager, path = %artifact.display(), "wrote results artifact"),
      Err(err) => warn!(manager, path = %artifact.display(), error = %err, "could not write results artifact"),
    }
  }

  let installed = listing.as_deref().map(|bytes| recipe.parse_listing(bytes));
  let report = validate_installed(installed.as_ref(), &attempted, recipe.comparer());
  failed.extend(report.failed.iter().cloned());

  let state = minimise(&original, &applied);

  if !report.is_clean() {
    if !ignore_errors {
      return Err(InstallFailure {
        state,
        failed,
        source: PkgMgrError::Validation(report.summary()),
      });
    }
    warn!(manager, issues = %report.summary(), "validation issues ignored");
  }

  if failed.is_empty() {
    info!(manager, "all packages updated and validated");
  } else {
    info!(manager, failed = ?failed, "some packages could not be updated");
  }
  Ok(Installed { state, failed })
}
