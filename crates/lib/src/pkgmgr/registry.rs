//! Maps ecosystems to manager constructors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{AptManager, DotnetManager, ManagerConfig, PackageManager, PkgMgrError};
use crate::platform::OsFamily;

/// Language ecosystems that can appear as `type` in `langUpdates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LangEcosystem {
  DotnetCore,
}

impl LangEcosystem {
  pub fn as_str(&self) -> &'static str {
    match self {
      LangEcosystem::DotnetCore => super::dotnet::DOTNET_TYPE,
    }
  }

  pub fn from_tag(tag: &str) -> Option<Self> {
    [LangEcosystem::DotnetCore].into_iter().find(|eco| eco.as_str() == tag)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ecosystem {
  Os(OsFamily),
  Lang(LangEcosystem),
}

impl fmt::Display for Ecosystem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Ecosystem::Os(family) => write!(f, "{}", family),
      Ecosystem::Lang(lang) => write!(f, "{}", lang.as_str()),
    }
  }
}

pub type ManagerFactory = Arc<dyn Fn(ManagerConfig) -> Box<dyn PackageManager> + Send + Sync>;

/// Explicit ecosystem to manager table.
#[derive(Clone, Default)]
pub struct ManagerRegistry {
  factories: HashMap<Ecosystem, ManagerFactory>,
}

impl ManagerRegistry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// apt for Debian and Ubuntu, dotnet for `dotnet-core`.
  pub fn with_defaults() -> Self {
    let mut registry = Self::new();
    for family in [OsFamily::Debian, OsFamily::Ubuntu] {
      registry.register(Ecosystem::Os(family), move |config| -> Box<dyn PackageManager> {
        Box::new(AptManager::new(config, family))
      });
    }
    registry.register(Ecosystem::Lang(LangEcosystem::DotnetCore), |config| -> Box<dyn PackageManager> {
      Box::new(DotnetManager::new(config))
    });
    registry
  }

  pub fn register(
    &mut self,
    ecosystem: Ecosystem,
    factory: impl Fn(ManagerConfig) -> Box<dyn PackageManager> + Send + Sync + 'static,
  ) {
    self.factories.insert(ecosystem, Arc::new(factory));
  }

  pub fn contains(&self, ecosystem: Ecosystem) -> bool {
    self.factories.contains_key(&ecosystem)
  }

  pub fn os_manager(&self, family: OsFamily, config: ManagerConfig) -> Result<Box<dyn PackageManager>, PkgMgrError> {
    self
      .factories
      .get(&Ecosystem::Os(family))
      .map(|factory| factory(config))
      .ok_or_else(|| PkgMgrError::Unsupported {
        kind: "OS type",
        tag: family.to_string(),
      })
  }

  /// Manager for an OS `type` tag from a manifest.
  pub fn os_manager_for_tag(&self, tag: &str, config: ManagerConfig) -> Result<Box<dyn PackageManager>, PkgMgrError> {
    let family = OsFamily::from_tag(tag).map_err(|_| PkgMgrError::Unsupported {
      kind: "OS type",
      tag: tag.to_string(),
    })?;
    self.os_manager(family, config)
  }

  /// Manager for a language `type` tag from a manifest.
  pub fn lang_manager(&self, tag: &str, config: ManagerConfig) -> Result<Box<dyn PackageManager>, PkgMgrError> {
    LangEcosystem::from_tag(tag)
      .and_then(|lang| self.factories.get(&Ecosystem::Lang(lang)))
      .map(|factory| factory(config))
      .ok_or_else(|| PkgMgrError::Unsupported {
        kind: "language type",
        tag: tag.to_string(),
      })
  }
}
