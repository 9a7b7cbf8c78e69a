//! Package manager plugins.
//!
//! Each ecosystem turns the update manifest into a chain of build-graph
//! steps, extracts the resulting package list from inside the sandbox,
//! validates it, and returns a minimised snapshot that differs from the
//! image only by the patch.

pub mod apt;
pub mod dedup;
pub mod dotnet;
mod install;
pub mod registry;
pub mod validate;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexSet;
use thiserror::Error;

use crate::backend::{BuildError, ImageConfig, Session};
use crate::graph::{RunSpec, Snapshot};
use crate::manifest::UpdateManifest;

pub use apt::AptManager;
pub use dedup::{DedupError, UniqueUpdates, unique_latest_updates};
pub use dotnet::{BuildOutputPolicy, DotnetManager};
pub use registry::{Ecosystem, LangEcosystem, ManagerFactory, ManagerRegistry};
pub use validate::{ValidationReport, validate_installed};

/// Names of packages that failed to update, in first-seen order.
pub type FailedPackages = IndexSet<String>;

/// Host proxy variables forwarded into every sandboxed step.
const PROXY_VARS: &[&str] = &[
  "HTTP_PROXY",
  "HTTPS_PROXY",
  "NO_PROXY",
  "http_proxy",
  "https_proxy",
  "no_proxy",
];

/// Proxy settings from the host environment.
pub fn proxy_env() -> BTreeMap<String, String> {
  PROXY_VARS
    .iter()
    .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
    .collect()
}

/// Everything a manager needs to build on top of the image.
#[derive(Clone)]
pub struct ManagerConfig {
  pub session: Arc<dyn Session>,
  /// Reference point every patch diff is taken against.
  pub image_state: Snapshot,
  pub image_config: ImageConfig,
  /// Where managers leave their extracted results for inspection.
  pub working_folder: PathBuf,
  /// Whether language managers ship their build output in the patch.
  pub build_output: BuildOutputPolicy,
}

impl ManagerConfig {
  pub fn new(session: Arc<dyn Session>, working_folder: impl Into<PathBuf>) -> Self {
    Self {
      image_state: session.image_state(),
      image_config: session.image_config().clone(),
      working_folder: working_folder.into(),
      build_output: BuildOutputPolicy::default(),
      session,
    }
  }

  pub fn with_build_output(mut self, policy: BuildOutputPolicy) -> Self {
    self.build_output = policy;
    self
  }

  /// Start from `image_state` instead of the session's image root.
  pub fn with_state(mut self, state: Snapshot) -> Self {
    self.image_state = state;
    self
  }

  /// A step running `script` in the image's working directory with the
  /// image environment and host proxy settings.
  pub fn run_spec(&self, script: impl Into<String>) -> RunSpec {
    let mut env: BTreeMap<String, String> = self
      .image_config
      .env_pairs()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    env.extend(proxy_env());
    RunSpec::new(script)
      .cwd(self.image_config.working_dir.as_deref())
      .envs(&env)
  }
}

#[derive(Debug, Error)]
pub enum PkgMgrError {
  /// A requested fixed version could not be parsed by the ecosystem's comparer.
  #[error(transparent)]
  Dedup(#[from] DedupError),

  /// A build step failed while applying or extracting.
  #[error("package update failed: {0}")]
  Apply(#[from] BuildError),

  /// The installed versions did not match the request.
  #[error("validation failed: {0}")]
  Validation(String),

  /// No manager is registered for this ecosystem.
  #[error("unsupported {kind}: {tag}")]
  Unsupported { kind: &'static str, tag: String },
}

/// Successful outcome of a manager run.
#[derive(Debug, Clone)]
pub struct Installed {
  pub state: Snapshot,
  pub failed: FailedPackages,
}

impl Installed {
  pub fn unchanged(state: Snapshot) -> Self {
    Self {
      state,
      failed: FailedPackages::new(),
    }
  }
}

/// Fatal outcome of a manager run. Still carries a usable snapshot.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct InstallFailure {
  pub state: Snapshot,
  pub failed: FailedPackages,
  pub source: PkgMgrError,
}

#[async_trait]
pub trait PackageManager: Send + Sync {
  fn name(&self) -> &'static str;

  /// Apply the manifest's updates for this ecosystem.
  ///
  /// Without a manifest, OS managers upgrade everything and language
  /// managers do nothing.
  async fn install_updates(
    &self,
    manifest: Option<&UpdateManifest>,
    ignore_errors: bool,
  ) -> Result<Installed, InstallFailure>;
}
