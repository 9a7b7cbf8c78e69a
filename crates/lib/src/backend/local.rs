//! Local build backend driven by the docker CLI.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::archive::ImageArchive;
use super::eval::Evaluator;
use super::runner::{ChrootRunner, CommandRunner};
use super::status::{SolveStatus, StatusEvent, StatusSink};
use super::{BuildClient, BuildError, ExportRequest, ImageConfig, Session, SessionRequest};
use crate::graph::{Definition, FileTree, Snapshot};

/// Where images come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
  async fn fetch(&self, image: &str) -> Result<ImageArchive, BuildError>;
}

/// Fetches images with `docker save`, pulling first when needed.
pub struct DockerImageSource {
  program: String,
}

impl Default for DockerImageSource {
  fn default() -> Self {
    Self::new("docker")
  }
}

impl DockerImageSource {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
    }
  }

  async fn docker(&self, image: &str, args: &[&str]) -> Result<Vec<u8>, BuildError> {
    debug!(program = %self.program, args = ?args, "running docker");
    let output = Command::new(&self.program).args(args).kill_on_drop(true).output().await?;
    if !output.status.success() {
      return Err(BuildError::Fetch {
        image: image.to_string(),
        message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }
    Ok(output.stdout)
  }
}

#[async_trait]
impl ImageSource for DockerImageSource {
  async fn fetch(&self, image: &str) -> Result<ImageArchive, BuildError> {
    let bytes = match self.docker(image, &["save", image]).await {
      Ok(bytes) => bytes,
      Err(err) => {
        warn!(image = %image, error = %err, "image not available locally, pulling");
        self.docker(image, &["pull", image]).await?;
        self.docker(image, &["save", image]).await?
      }
    };
    let archive = tokio::task::spawn_blocking(move || ImageArchive::read(bytes.as_slice())).await??;
    Ok(archive)
  }
}

/// Build client that evaluates graphs on this host.
pub struct LocalClient {
  source: Arc<dyn ImageSource>,
  runner: Option<Arc<dyn CommandRunner>>,
}

impl LocalClient {
  pub fn new(source: Arc<dyn ImageSource>) -> Self {
    Self { source, runner: None }
  }

  /// Client using the docker CLI and a chroot runner in the working folder.
  pub fn docker() -> Self {
    Self::new(Arc::new(DockerImageSource::default()))
  }

  pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
    self.runner = Some(runner);
    self
  }
}

#[async_trait]
impl BuildClient for LocalClient {
  async fn open_session(&self, request: SessionRequest) -> Result<Arc<dyn Session>, BuildError> {
    info!(image = %request.image, "fetching image");
    let archive = Arc::new(self.source.fetch(&request.image).await?);

    let layers = archive.clone();
    let rootfs = tokio::task::spawn_blocking(move || layers.rootfs()).await??;
    debug!(image = %request.image, entries = rootfs.len(), "loaded image filesystem");

    let runner: Arc<dyn CommandRunner> = match &self.runner {
      Some(runner) => runner.clone(),
      None => Arc::new(ChrootRunner::new(&request.working_folder)),
    };
    let status = StatusSink::new(request.status);

    Ok(Arc::new(LocalSession {
      config: archive.image_config(),
      image_state: Snapshot::image(&request.image),
      evaluator: Evaluator::new(request.image, Arc::new(rootfs), runner, status.clone()),
      archive,
      status,
    }))
  }
}

struct LocalSession {
  archive: Arc<ImageArchive>,
  config: ImageConfig,
  image_state: Snapshot,
  evaluator: Evaluator,
  status: StatusSink,
}

#[async_trait]
impl Session for LocalSession {
  fn image_state(&self) -> Snapshot {
    self.image_state.clone()
  }

  fn image_config(&self) -> &ImageConfig {
    &self.config
  }

  async fn read_file(&self, snapshot: &Snapshot, path: &str) -> Result<Option<Vec<u8>>, BuildError> {
    let tree = self.evaluator.evaluate(&snapshot.marshal()?).await?;
    Ok(tree.read_file(path).map(<[u8]>::to_vec))
  }

  async fn solve(&self, definition: &Definition, export: ExportRequest<'_>) -> Result<(), BuildError> {
    let tree = self.evaluator.evaluate(definition).await?;

    let label = format!("export {}", export.name);
    self
      .status
      .emit(SolveStatus::new(&definition.root, label.clone(), StatusEvent::Started))
      .await;
    let started = std::time::Instant::now();

    let patch = FileTree::diff(self.evaluator.rootfs(), &tree);
    info!(image = %export.name, changed = patch.len(), "exporting patched image");

    let archive = self.archive.clone();
    let name = export.name.to_string();
    let bytes = tokio::task::spawn_blocking(move || {
      let mut out = Vec::new();
      archive.write_patched(&patch, &name, &mut out).map(|_| out)
    })
    .await??;

    export.writer.write_all(&bytes).await?;
    export.writer.flush().await?;

    self
      .status
      .emit(SolveStatus::new(
        &definition.root,
        label,
        StatusEvent::Completed {
          elapsed: started.elapsed(),
        },
      ))
      .await;
    Ok(())
  }

  fn close_status(&self) {
    self.status.close();
  }
}
