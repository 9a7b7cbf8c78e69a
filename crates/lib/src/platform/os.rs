use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, error};

/// Operating system families a patch run can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
  Alpine,
  Debian,
  Ubuntu,
  Amazon,
  CentOs,
  CblMariner,
  RedHat,
}

/// Substring markers checked against the lower-cased `NAME` field, first match wins.
const NAME_MARKERS: [(&str, OsFamily); 7] = [
  ("alpine", OsFamily::Alpine),
  ("debian", OsFamily::Debian),
  ("ubuntu", OsFamily::Ubuntu),
  ("amazon", OsFamily::Amazon),
  ("centos", OsFamily::CentOs),
  ("mariner", OsFamily::CblMariner),
  ("red hat", OsFamily::RedHat),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectError {
  #[error("os-release data has no NAME field")]
  MissingName,

  #[error("unsupported operating system: {0}")]
  Unsupported(String),
}

impl OsFamily {
  /// Returns the canonical tag used in update manifests.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Alpine => "alpine",
      Self::Debian => "debian",
      Self::Ubuntu => "ubuntu",
      Self::Amazon => "amazon",
      Self::CentOs => "centos",
      Self::CblMariner => "cbl-mariner",
      Self::RedHat => "redhat",
    }
  }

  /// Parse a canonical tag (case-insensitive).
  pub fn from_tag(tag: &str) -> Result<Self, DetectError> {
    let tag = tag.trim().to_lowercase();
    NAME_MARKERS
      .iter()
      .map(|(_, family)| *family)
      .find(|family| family.as_str() == tag)
      .ok_or(DetectError::Unsupported(tag))
  }

  /// Classify raw `/etc/os-release` contents.
  pub fn detect(os_release: &[u8]) -> Result<Self, DetectError> {
    let fields = parse_os_release(os_release);
    let name = fields.get("NAME").ok_or(DetectError::MissingName)?.to_lowercase();

    match NAME_MARKERS.iter().find(|(marker, _)| name.contains(marker)) {
      Some((_, family)) => {
        debug!(name = %name, family = %family, "detected os family");
        Ok(*family)
      }
      None => {
        error!(name = %name, "unsupported os type");
        Err(DetectError::Unsupported(name))
      }
    }
  }
}

impl fmt::Display for OsFamily {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Parse `KEY=value` lines as written in os-release files.
///
/// Blank lines, comments and lines without `=` are skipped. Values may be
/// unquoted, single-quoted, or double-quoted with backslash escapes.
pub fn parse_os_release(data: &[u8]) -> BTreeMap<String, String> {
  let text = String::from_utf8_lossy(data);
  let mut fields = BTreeMap::new();

  for line in text.lines() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let Some((key, raw)) = line.split_once('=') else {
      debug!(line = %line, "skipping malformed os-release line");
      continue;
    };
    fields.insert(key.trim().to_string(), unquote(raw.trim()));
  }

  fields
}

fn unquote(raw: &str) -> String {
  if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
    return raw[1..raw.len() - 1].to_string();
  }
  if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
      if c == '\\'
        && let Some(next) = chars.next()
      {
        out.push(next);
        continue;
      }
      out.push(c);
    }
    return out;
  }
  raw.to_string()
}
