//! Manifest types for imgpatch.
//!
//! # Serialization
//!
//! Field names follow the JSON layout produced by report parsers:
//!
//! ```json
//! {
//!   "metadata": {
//!     "os": { "type": "debian", "version": "12" },
//!     "config": { "arch": "amd64" }
//!   },
//!   "updates": [
//!     { "name": "openssl", "installedVersion": "3.0.11-1", "fixedVersion": "3.0.13-1" }
//!   ],
//!   "langUpdates": [
//!     { "name": "Newtonsoft.Json", "type": "dotnet-core", "fixedVersion": "13.0.1" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};

/// The set of package updates a run should attempt.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
  #[serde(default)]
  pub metadata: Metadata,
  /// OS package updates, handled by the manager for `metadata.os.type`.
  #[serde(default)]
  pub updates: Vec<UpdatePackage>,
  /// Language package updates, dispatched by each entry's `type`.
  #[serde(default, rename = "langUpdates")]
  pub lang_updates: Vec<UpdatePackage>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
  #[serde(default)]
  pub os: OsInfo,
  #[serde(default)]
  pub config: ImageArch,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
  #[serde(default, rename = "type")]
  pub os_type: String,
  #[serde(default)]
  pub version: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArch {
  #[serde(default)]
  pub arch: String,
}

/// A single requested package update.
///
/// An empty `fixed_version` means "upgrade to whatever is latest".
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePackage {
  pub name: String,
  #[serde(default, rename = "type")]
  pub pkg_type: String,
  #[serde(default)]
  pub installed_version: String,
  #[serde(default)]
  pub fixed_version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub vendor_fixed_version: Option<String>,
}

impl UpdatePackage {
  pub fn new(name: impl Into<String>, fixed_version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      fixed_version: fixed_version.into(),
      ..Self::default()
    }
  }

  pub fn with_type(mut self, pkg_type: impl Into<String>) -> Self {
    self.pkg_type = pkg_type.into();
    self
  }

  pub fn with_installed(mut self, installed_version: impl Into<String>) -> Self {
    self.installed_version = installed_version.into();
    self
  }
}

impl UpdateManifest {
  /// Returns a copy carrying the same metadata but only the updates accepted by `keep`.
  pub fn retain(&self, keep: impl Fn(&UpdatePackage) -> bool) -> UpdateManifest {
    self.retain_split(&keep, &keep)
  }

  /// Like [`retain`](Self::retain), judging OS and language updates separately.
  pub fn retain_split(
    &self,
    keep_os: impl Fn(&UpdatePackage) -> bool,
    keep_lang: impl Fn(&UpdatePackage) -> bool,
  ) -> UpdateManifest {
    UpdateManifest {
      metadata: self.metadata.clone(),
      updates: self.updates.iter().filter(|u| keep_os(u)).cloned().collect(),
      lang_updates: self.lang_updates.iter().filter(|u| keep_lang(u)).cloned().collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.updates.is_empty() && self.lang_updates.is_empty()
  }

  /// Distinct language `type` tags in order of first appearance.
  pub fn lang_types(&self) -> Vec<&str> {
    let mut seen: Vec<&str> = Vec::new();
    for update in &self.lang_updates {
      if !seen.contains(&update.pkg_type.as_str()) {
        seen.push(&update.pkg_type);
      }
    }
    seen
  }
}
