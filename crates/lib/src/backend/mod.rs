//! Build backends.
//!
//! A [`BuildClient`] opens a [`Session`] for one image. The session exposes
//! the image's root snapshot and configuration, evaluates snapshots to read
//! files out of them, and finally solves a [`Definition`] into an image
//! archive streamed to a writer.
//!
//! The bundled [`local::LocalClient`] pulls images through the docker CLI and
//! evaluates `Run` operations with a [`runner::CommandRunner`].

pub mod archive;
pub mod eval;
pub mod local;
pub mod runner;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::graph::{Definition, GraphError, Snapshot};
use crate::util::hash::ObjectHash;

pub use archive::{ArchiveError, ImageArchive};
pub use local::{DockerImageSource, ImageSource, LocalClient};
pub use runner::{ChrootRunner, CommandRunner, RunOutput};
pub use status::{SolveStatus, StatusEvent, StatusSink};

/// Errors raised by a build backend.
#[derive(Debug, Error)]
pub enum BuildError {
  /// A sandboxed command exited unsuccessfully.
  #[error("command failed with exit code {code:?}: {cmd}: {stderr}")]
  CommandFailed {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  /// The image could not be fetched.
  #[error("failed to fetch image {image}: {message}")]
  Fetch { image: String, message: String },

  /// A definition referenced an image other than the session's.
  #[error("definition references image {found}, session holds {expected}")]
  UnknownSource { expected: String, found: String },

  #[error("evaluation of {0} produced no result")]
  MissingResult(ObjectHash),

  #[error("archive error: {0}")]
  Archive(#[from] ArchiveError),

  #[error("graph error: {0}")]
  Graph(#[from] GraphError),

  #[error("background task failed: {0}")]
  Task(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl From<tokio::task::JoinError> for BuildError {
  fn from(err: tokio::task::JoinError) -> Self {
    BuildError::Task(err.to_string())
  }
}

/// The parts of an image's configuration managers care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
  pub working_dir: Option<String>,
  pub architecture: Option<String>,
  /// `KEY=value` pairs from the image's `Env`.
  pub env: Vec<String>,
}

impl ImageConfig {
  /// Extract the relevant fields from a raw image config document.
  pub fn from_raw(raw: &serde_json::Value) -> Self {
    let working_dir = raw
      .pointer("/config/WorkingDir")
      .and_then(|v| v.as_str())
      .filter(|s| !s.is_empty())
      .map(str::to_string);
    let architecture = raw.get("architecture").and_then(|v| v.as_str()).map(str::to_string);
    let env = raw
      .pointer("/config/Env")
      .and_then(|v| v.as_array())
      .map(|vars| vars.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
      .unwrap_or_default();
    Self {
      working_dir,
      architecture,
      env,
    }
  }

  /// Image environment as key/value pairs; malformed entries are skipped.
  pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
    self.env.iter().filter_map(|kv| kv.split_once('='))
  }
}

pub struct SessionRequest {
  /// Normalised image reference.
  pub image: String,
  pub working_folder: PathBuf,
  pub status: mpsc::Sender<SolveStatus>,
}

/// Destination for the solved image.
pub struct ExportRequest<'a> {
  /// Reference the exported image is tagged with.
  pub name: &'a str,
  pub writer: &'a mut (dyn AsyncWrite + Send + Unpin),
}

#[async_trait]
pub trait BuildClient: Send + Sync {
  async fn open_session(&self, request: SessionRequest) -> Result<Arc<dyn Session>, BuildError>;
}

#[async_trait]
pub trait Session: Send + Sync {
  /// Root snapshot of the pulled image.
  fn image_state(&self) -> Snapshot;

  fn image_config(&self) -> &ImageConfig;

  /// Evaluate `snapshot` and read a regular file from it.
  ///
  /// Returns `Ok(None)` when the file does not exist in the result.
  async fn read_file(&self, snapshot: &Snapshot, path: &str) -> Result<Option<Vec<u8>>, BuildError>;

  /// Evaluate `definition` and stream the resulting image archive.
  async fn solve(&self, definition: &Definition, export: ExportRequest<'_>) -> Result<(), BuildError>;

  /// Close the status stream; later events are dropped.
  fn close_status(&self);
}
