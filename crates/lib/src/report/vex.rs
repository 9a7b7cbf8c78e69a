//! Reporting which updates were actually applied.

use std::path::Path;

use serde::Serialize;

use super::ReportError;
use crate::consts::APP_NAME;
use crate::manifest::{UpdateManifest, UpdatePackage};

pub trait VexWriter: Send + Sync {
  /// Write a statement covering the `validated` updates of `patched_image`.
  fn write(
    &self,
    validated: &UpdateManifest,
    managers: &[&str],
    patched_image: &str,
    format: &str,
    output: &Path,
  ) -> Result<(), ReportError>;
}

#[derive(Serialize)]
struct PatchStatement<'a> {
  author: &'a str,
  image: &'a str,
  managers: &'a [&'a str],
  os: &'a str,
  os_version: &'a str,
  arch: &'a str,
  fixed: Vec<&'a UpdatePackage>,
}

/// Writes a plain JSON summary of the fixed packages (`json` format).
pub struct JsonSummaryWriter;

impl VexWriter for JsonSummaryWriter {
  fn write(
    &self,
    validated: &UpdateManifest,
    managers: &[&str],
    patched_image: &str,
    format: &str,
    output: &Path,
  ) -> Result<(), ReportError> {
    if format != "json" {
      return Err(ReportError::UnsupportedFormat(format.to_string()));
    }

    let statement = PatchStatement {
      author: APP_NAME,
      image: patched_image,
      managers,
      os: &validated.metadata.os.os_type,
      os_version: &validated.metadata.os.version,
      arch: &validated.metadata.config.arch,
      fixed: validated.updates.iter().chain(&validated.lang_updates).collect(),
    };

    let data = serde_json::to_vec_pretty(&statement).map_err(|err| ReportError::Write {
      path: output.to_path_buf(),
      source: std::io::Error::other(err),
    })?;
    std::fs::write(output, data).map_err(|source| ReportError::Write {
      path: output.to_path_buf(),
      source,
    })
  }
}
