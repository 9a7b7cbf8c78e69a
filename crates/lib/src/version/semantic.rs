use semver::{BuildMetadata, Prerelease, Version};
use tracing::warn;

use super::VersionComparer;

/// Semantic versions as written by NuGet and most language registries.
///
/// Parsing is lenient: a leading `v` is accepted and missing minor/patch
/// components are treated as zero (`13.0` == `13.0.0`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SemverComparer;

impl VersionComparer for SemverComparer {
  fn is_valid(&self, version: &str) -> bool {
    parse_lenient(version).is_some()
  }

  fn less_than(&self, a: &str, b: &str) -> bool {
    let Some(va) = parse_lenient(a) else {
      warn!(version = %a, "unparsable semantic version");
      return false;
    };
    let Some(vb) = parse_lenient(b) else {
      warn!(version = %b, "unparsable semantic version");
      return false;
    };
    precedence(&va) < precedence(&vb)
  }
}

/// Build metadata does not take part in precedence.
fn precedence(v: &Version) -> (u64, u64, u64, &Prerelease) {
  (v.major, v.minor, v.patch, &v.pre)
}

/// Parse a version string, padding a short `major[.minor]` core.
pub fn parse_lenient(version: &str) -> Option<Version> {
  let v = version.trim();
  let v = v.strip_prefix('v').or_else(|| v.strip_prefix('V')).unwrap_or(v);
  if v.is_empty() {
    return None;
  }

  let (rest, build) = match v.split_once('+') {
    Some((rest, build)) => (rest, Some(build)),
    None => (v, None),
  };
  let (core, pre) = match rest.split_once('-') {
    Some((core, pre)) => (core, Some(pre)),
    None => (rest, None),
  };

  let mut numbers = [0u64; 3];
  let parts: Vec<&str> = core.split('.').collect();
  if parts.len() > 3 {
    return None;
  }
  for (slot, part) in numbers.iter_mut().zip(&parts) {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }
    *slot = part.parse().ok()?;
  }

  let mut parsed = Version::new(numbers[0], numbers[1], numbers[2]);
  if let Some(pre) = pre {
    parsed.pre = Prerelease::new(pre).ok()?;
  }
  if let Some(build) = build {
    parsed.build = BuildMetadata::new(build).ok()?;
  }
  Some(parsed)
}
