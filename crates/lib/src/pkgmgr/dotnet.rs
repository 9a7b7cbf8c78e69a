//! .NET (NuGet) package manager.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use super::install::{UpdateRecipe, guarded, install_updates};
use super::{InstallFailure, Installed, ManagerConfig, PackageManager};
use crate::graph::Snapshot;
use crate::manifest::{UpdateManifest, UpdatePackage};
use crate::util::shell::quote;
use crate::version::{SemverComparer, VersionComparer};

/// Manifest `type` handled by this manager.
pub const DOTNET_TYPE: &str = "dotnet-core";

/// Markers `dotnet list package` prints next to package names.
const LISTING_MARKERS: &[&str] = &["(A)", "(D)"];

/// Whether the `dotnet build` output ships in the patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildOutputPolicy {
  /// Run `dotnet build` and take the patch from the built project.
  #[default]
  Include,
  /// Skip the build; the patch holds restored packages only.
  Exclude,
}

pub struct DotnetManager {
  config: ManagerConfig,
  policy: BuildOutputPolicy,
}

impl DotnetManager {
  /// A manager following the config's build output policy.
  pub fn new(config: ManagerConfig) -> Self {
    Self {
      policy: config.build_output,
      config,
    }
  }
}

/// Parse `dotnet list package` output into `name -> version`.
///
/// Package lines look like `> Name  Requested  Resolved`. The last column
/// is the resolved version; requested ranges such as `[1.0.0, )` may span
/// several fields.
pub fn parse_package_list(listing: &[u8]) -> HashMap<String, String> {
  let text = String::from_utf8_lossy(listing);
  let mut packages = HashMap::new();

  for line in text.lines() {
    let Some(rest) = line.trim().strip_prefix('>') else {
      continue;
    };
    let fields: Vec<&str> = rest
      .split_whitespace()
      .filter(|f| !LISTING_MARKERS.contains(f))
      .collect();
    if let [name, .., version] = fields.as_slice() {
      packages.insert(name.to_string(), version.to_string());
    }
  }

  packages
}

impl UpdateRecipe for DotnetManager {
  fn recipe_name(&self) -> &'static str {
    "dotnet"
  }

  fn config(&self) -> &ManagerConfig {
    &self.config
  }

  fn select(&self, manifest: &UpdateManifest) -> Vec<UpdatePackage> {
    manifest
      .lang_updates
      .iter()
      .filter(|u| u.pkg_type == DOTNET_TYPE)
      .cloned()
      .collect()
  }

  fn comparer(&self) -> &dyn VersionComparer {
    &SemverComparer
  }

  fn apply(&self, updates: &[UpdatePackage], ignore_errors: bool) -> Snapshot {
    let config = &self.config;
    let mut state = config.image_state.run(config.run_spec("dotnet clean"));

    for update in updates {
      let (cmd, warning) = if update.fixed_version.is_empty() {
        warn!(package = %update.name, "no fixed version, adding latest");
        (
          format!("dotnet add package {}", quote(&update.name)),
          format!("dotnet add package failed for {}", update.name),
        )
      } else {
        (
          format!(
            "dotnet add package {} --version {}",
            quote(&update.name),
            quote(&update.fixed_version)
          ),
          format!("failed to update {} to {}", update.name, update.fixed_version),
        )
      };
      state = state.run(config.run_spec(guarded(&cmd, &warning, ignore_errors)));
    }

    let restored = state.run(config.run_spec(guarded(
      "dotnet restore --force --no-cache --nologo",
      "dotnet restore had issues but continuing",
      ignore_errors,
    )));

    match self.policy {
      BuildOutputPolicy::Exclude => restored,
      BuildOutputPolicy::Include => restored.run(config.run_spec(guarded(
        "dotnet build --no-restore --nologo",
        "dotnet build had issues but continuing",
        ignore_errors,
      ))),
    }
  }

  fn listing_command(&self) -> &'static str {
    "dotnet list package"
  }

  fn parse_listing(&self, listing: &[u8]) -> HashMap<String, String> {
    parse_package_list(listing)
  }
}

#[async_trait]
impl PackageManager for DotnetManager {
  fn name(&self) -> &'static str {
    "dotnet"
  }

  async fn install_updates(
    &self,
    manifest: Option<&UpdateManifest>,
    ignore_errors: bool,
  ) -> Result<Installed, InstallFailure> {
    install_updates(self, manifest, ignore_errors).await
  }
}
