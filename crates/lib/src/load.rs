//! Loading exported image archives into a local image store.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("failed to start {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("image load exited with code {0:?}")]
  Failed(Option<i32>),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ImageLoader: Send + Sync {
  /// Consume an image archive stream until EOF.
  async fn load(&self, archive: &mut (dyn AsyncRead + Send + Unpin)) -> Result<(), LoadError>;
}

/// Pipes the archive into `docker load`.
pub struct DockerLoader {
  program: String,
  args: Vec<String>,
}

impl Default for DockerLoader {
  fn default() -> Self {
    Self::with_command("docker", ["load"])
  }
}

impl DockerLoader {
  pub fn with_command(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self {
      program: program.into(),
      args: args.into_iter().map(Into::into).collect(),
    }
  }
}

#[derive(Clone, Copy)]
enum Level {
  Info,
  Warn,
}

async fn log_lines(reader: Option<impl AsyncRead + Unpin>, level: Level) {
  let Some(reader) = reader else {
    return;
  };
  let mut lines = BufReader::new(reader).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    match level {
      Level::Info => info!("{}", line),
      Level::Warn => warn!("{}", line),
    }
  }
}

#[async_trait]
impl ImageLoader for DockerLoader {
  async fn load(&self, archive: &mut (dyn AsyncRead + Send + Unpin)) -> Result<(), LoadError> {
    debug!(program = %self.program, args = ?self.args, "loading image");
    let mut child = Command::new(&self.program)
      .args(&self.args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| LoadError::Spawn {
        program: self.program.clone(),
        source,
      })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let feed = async move {
      let Some(mut stdin) = stdin else {
        return Ok(0);
      };
      let copied = tokio::io::copy(archive, &mut stdin).await?;
      stdin.shutdown().await?;
      Ok::<_, std::io::Error>(copied)
    };

    let (fed, (), ()) = tokio::join!(feed, log_lines(stdout, Level::Info), log_lines(stderr, Level::Warn));
    let status = child.wait().await?;

    if !status.success() {
      return Err(LoadError::Failed(status.code()));
    }
    let bytes = fed?;
    debug!(bytes, "image archive loaded");
    Ok(())
  }
}

/// Read and discard the rest of `reader` so its writer never blocks.
pub async fn drain(reader: &mut (dyn AsyncRead + Send + Unpin)) -> std::io::Result<u64> {
  tokio::io::copy(reader, &mut tokio::io::sink()).await
}
