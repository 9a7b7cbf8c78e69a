//! Scan report parsing and patch reporting.
//!
//! Scanner-specific formats plug in through [`ScanReportParser`]; only the
//! tool's own JSON update manifest (`native`) is built in.

pub mod vex;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::manifest::UpdateManifest;

pub use vex::{JsonSummaryWriter, VexWriter};

/// Name of the built-in parser for native update manifests.
pub const NATIVE_SCANNER: &str = "native";

#[derive(Debug, Error)]
pub enum ReportError {
  #[error("unknown scanner: {0}")]
  UnknownScanner(String),

  #[error("failed to read report {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse report {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unsupported output format: {0}")]
  UnsupportedFormat(String),

  #[error("failed to write report {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

pub trait ScanReportParser: Send + Sync {
  fn parse(&self, path: &Path) -> Result<UpdateManifest, ReportError>;
}

/// Reads an [`UpdateManifest`] serialized as JSON.
pub struct NativeReportParser;

impl ScanReportParser for NativeReportParser {
  fn parse(&self, path: &Path) -> Result<UpdateManifest, ReportError> {
    let data = std::fs::read(path).map_err(|source| ReportError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_slice(&data).map_err(|source| ReportError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// Scanner name to parser table.
#[derive(Clone, Default)]
pub struct ReportParsers {
  parsers: HashMap<String, Arc<dyn ScanReportParser>>,
}

impl ReportParsers {
  pub fn with_defaults() -> Self {
    let mut parsers = Self::default();
    parsers.register(NATIVE_SCANNER, Arc::new(NativeReportParser));
    parsers
  }

  pub fn register(&mut self, scanner: impl Into<String>, parser: Arc<dyn ScanReportParser>) {
    self.parsers.insert(scanner.into(), parser);
  }

  pub fn parse(&self, path: &Path, scanner: &str) -> Result<UpdateManifest, ReportError> {
    let parser = self
      .parsers
      .get(scanner)
      .ok_or_else(|| ReportError::UnknownScanner(scanner.to_string()))?;
    debug!(scanner, path = %path.display(), "parsing scan report");
    parser.parse(path)
  }
}
