//! Post-patch validation of installed versions.

use std::collections::HashMap;

use tracing::{info, warn};

use super::FailedPackages;
use crate::manifest::UpdatePackage;
use crate::version::VersionComparer;

/// Outcome of comparing the extracted package list with the attempted updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
  pub failed: FailedPackages,
  pub issues: Vec<String>,
}

impl ValidationReport {
  pub fn is_clean(&self) -> bool {
    self.issues.is_empty()
  }

  /// All issues joined with `"; "`.
  pub fn summary(&self) -> String {
    self.issues.join("; ")
  }

  fn fail(&mut self, name: &str, issue: String) {
    warn!("{}", issue);
    self.failed.insert(name.to_string());
    self.issues.push(issue);
  }
}

/// Check `attempted` against the installed `name -> version` listing.
///
/// `None` means the listing could not be extracted; every attempted package
/// fails. A requested fixed version must be matched exactly.
pub fn validate_installed(
  installed: Option<&HashMap<String, String>>,
  attempted: &[UpdatePackage],
  comparer: &dyn VersionComparer,
) -> ValidationReport {
  let mut report = ValidationReport::default();

  let Some(installed) = installed else {
    for update in attempted {
      report.fail(&update.name, format!("package {}: no package list data to validate", update.name));
    }
    return report;
  };

  for update in attempted {
    let name = &update.name;
    let Some(actual) = installed.get(name) else {
      report.fail(name, format!("package {} was not found post-update", name));
      continue;
    };

    if !comparer.is_valid(actual) {
      report.fail(name, format!("package {} has an invalid version format: {}", name, actual));
      continue;
    }

    if !update.fixed_version.is_empty() {
      if !comparer.is_valid(&update.fixed_version) {
        report.fail(
          name,
          format!("package {} has an invalid fixed version format: {}", name, update.fixed_version),
        );
      } else if !comparer.equal(actual, &update.fixed_version) {
        report.fail(
          name,
          format!("package {}: expected version {}, but found {}", name, update.fixed_version, actual),
        );
      }
      continue;
    }

    let previous = &update.installed_version;
    if previous.is_empty() || !comparer.is_valid(previous) {
      info!(package = %name, version = %actual, "package updated");
    } else if comparer.less_than(actual, previous) {
      warn!(package = %name, from = %previous, to = %actual, "package is older than the previously installed version");
    } else if comparer.equal(actual, previous) {
      info!(package = %name, version = %actual, "package version unchanged");
    } else {
      info!(package = %name, from = %previous, to = %actual, "package upgraded");
    }
  }

  report
}
