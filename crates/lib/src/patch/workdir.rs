//! The folder managers leave their intermediate results in.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::consts::APP_NAME;

const FOLDER_MODE: u32 = 0o744;

/// A working folder that removes itself on drop when this run created it.
#[derive(Debug)]
pub struct WorkingFolder {
  path: PathBuf,
  owned: bool,
  retain: bool,
}

impl WorkingFolder {
  /// Resolve the working folder for a run.
  ///
  /// Without `requested`, a fresh temporary folder is created. A requested
  /// folder that does not exist yet is created and owned; an existing one is
  /// reused and left in place. `retain` keeps owned folders for inspection.
  pub fn prepare(requested: Option<&Path>, retain: bool) -> io::Result<Self> {
    let (path, owned) = match requested {
      None => {
        let dir = tempfile::Builder::new()
          .prefix(&format!("{}-", APP_NAME))
          .disable_cleanup(true)
          .tempdir()?;
        (dir.path().to_path_buf(), true)
      }
      Some(path) if path.is_dir() => (path.to_path_buf(), false),
      Some(path) if path.exists() => {
        return Err(io::Error::new(
          io::ErrorKind::AlreadyExists,
          format!("{} exists and is not a directory", path.display()),
        ));
      }
      Some(path) => {
        std::fs::create_dir_all(path)?;
        (path.to_path_buf(), true)
      }
    };

    if owned {
      set_mode(&path)?;
    }
    debug!(path = %path.display(), owned, "using working folder");
    Ok(Self { path, owned, retain })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Whether the folder will be removed on drop.
  pub fn removes_on_drop(&self) -> bool {
    self.owned && !self.retain
  }
}

#[cfg(unix)]
fn set_mode(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(FOLDER_MODE))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path) -> io::Result<()> {
  Ok(())
}

impl Drop for WorkingFolder {
  fn drop(&mut self) {
    if !self.owned {
      return;
    }
    if self.retain {
      warn!(path = %self.path.display(), "working folder retained and needs to be cleaned up manually");
      return;
    }
    if let Err(err) = std::fs::remove_dir_all(&self.path) {
      warn!(path = %self.path.display(), error = %err, "failed to remove working folder");
    }
  }
}
