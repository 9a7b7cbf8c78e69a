//! Unique-latest selection of requested updates.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use super::FailedPackages;
use crate::manifest::UpdatePackage;
use crate::version::VersionComparer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DedupError {
  #[error("invalid version {version} for package {name}")]
  InvalidVersion { name: String, version: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqueUpdates {
  /// One entry per package name, sorted by name.
  pub updates: Vec<UpdatePackage>,
  /// Names dropped for an invalid fixed version (only when ignoring errors).
  pub failed: FailedPackages,
}

/// Reduce `requested` to the single highest fixed version per package name.
///
/// Entries without a fixed version are not candidates; a name with no
/// candidates left is skipped. An invalid fixed version fails the call
/// unless `ignore_errors` is set, in which case the entry is dropped and its
/// name recorded as failed. Among equal versions the first seen wins.
pub fn unique_latest_updates(
  requested: &[UpdatePackage],
  comparer: &dyn VersionComparer,
  ignore_errors: bool,
) -> Result<UniqueUpdates, DedupError> {
  let mut groups: BTreeMap<&str, Vec<&UpdatePackage>> = BTreeMap::new();
  for update in requested {
    groups.entry(update.name.as_str()).or_default().push(update);
  }

  let mut result = UniqueUpdates::default();
  for (name, candidates) in groups {
    let mut best: Option<&UpdatePackage> = None;

    for candidate in candidates.into_iter().filter(|c| !c.fixed_version.is_empty()) {
      if !comparer.is_valid(&candidate.fixed_version) {
        if !ignore_errors {
          return Err(DedupError::InvalidVersion {
            name: name.to_string(),
            version: candidate.fixed_version.clone(),
          });
        }
        warn!(package = %name, version = %candidate.fixed_version, "ignoring update with invalid version");
        result.failed.insert(name.to_string());
        continue;
      }

      match best {
        Some(current) if !comparer.less_than(&current.fixed_version, &candidate.fixed_version) => {}
        _ => best = Some(candidate),
      }
    }

    if let Some(best) = best {
      result.updates.push(best.clone());
    }
  }

  Ok(result)
}
