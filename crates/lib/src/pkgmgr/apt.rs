//! Debian/Ubuntu package manager.

use std::collections::HashMap;

use async_trait::async_trait;

use super::install::{UpdateRecipe, guarded, install_updates};
use super::{InstallFailure, Installed, ManagerConfig, PackageManager};
use crate::graph::{RunSpec, Snapshot};
use crate::manifest::{UpdateManifest, UpdatePackage};
use crate::platform::OsFamily;
use crate::util::shell::quote;
use crate::version::{DebianComparer, VersionComparer};

const CLEAN: &str = "apt-get clean && rm -rf /var/lib/apt/lists/*";

pub struct AptManager {
  config: ManagerConfig,
  family: OsFamily,
}

impl AptManager {
  pub fn new(config: ManagerConfig, family: OsFamily) -> Self {
    Self { config, family }
  }

  pub fn family(&self) -> OsFamily {
    self.family
  }

  fn step(&self, script: impl Into<String>) -> RunSpec {
    let mut spec = self.config.run_spec(script);
    spec
      .env
      .insert("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string());
    spec
  }
}

/// `dpkg-query` output (`name<TAB>version` per line) as a map.
pub fn parse_dpkg_listing(listing: &[u8]) -> HashMap<String, String> {
  String::from_utf8_lossy(listing)
    .lines()
    .filter_map(|line| line.split_once('\t'))
    .map(|(name, version)| (name.trim().to_string(), version.trim().to_string()))
    .filter(|(name, version)| !name.is_empty() && !version.is_empty())
    .collect()
}

impl UpdateRecipe for AptManager {
  fn recipe_name(&self) -> &'static str {
    "apt"
  }

  fn config(&self) -> &ManagerConfig {
    &self.config
  }

  fn select(&self, manifest: &UpdateManifest) -> Vec<UpdatePackage> {
    manifest.updates.clone()
  }

  fn comparer(&self) -> &dyn VersionComparer {
    &DebianComparer
  }

  fn apply(&self, updates: &[UpdatePackage], ignore_errors: bool) -> Snapshot {
    let mut state = self.config.image_state.run(self.step("apt-get update"));

    for update in updates {
      let target = if update.fixed_version.is_empty() {
        update.name.clone()
      } else {
        format!("{}={}", update.name, update.fixed_version)
      };
      let cmd = format!(
        "apt-get install -y --no-install-recommends --only-upgrade {}",
        quote(&target)
      );
      let warning = format!("failed to update {}", target);
      state = state.run(self.step(guarded(&cmd, &warning, ignore_errors)));
    }

    state.run(self.step(CLEAN))
  }

  fn listing_command(&self) -> &'static str {
    r"dpkg-query -W -f='${Package}\t${Version}\n'"
  }

  fn parse_listing(&self, listing: &[u8]) -> HashMap<String, String> {
    parse_dpkg_listing(listing)
  }

  fn upgrade_all(&self) -> Option<Snapshot> {
    let updated = self.config.image_state.run(self.step("apt-get update"));
    let upgraded = updated.run(self.step("apt-get upgrade -y"));
    Some(upgraded.run(self.step(CLEAN)))
  }
}

#[async_trait]
impl PackageManager for AptManager {
  fn name(&self) -> &'static str {
    "apt"
  }

  async fn install_updates(
    &self,
    manifest: Option<&UpdateManifest>,
    ignore_errors: bool,
  ) -> Result<Installed, InstallFailure> {
    install_updates(self, manifest, ignore_errors).await
  }
}
