//! Executing `Run` operations against a filesystem tree.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use rustix::process::{Pid, Signal, kill_process_group};
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::BuildError;
use crate::graph::{Entry, FileTree, RunSpec};
use crate::util::shell::quote;

/// Top-level directories owned by the kernel; never captured from a run.
const VOLATILE_DIRS: &[&str] = &["dev", "proc", "sys"];

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub struct RunOutput {
  pub tree: FileTree,
  /// Combined stdout and stderr of the command.
  pub log: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
  /// Run `spec` with `root` as the filesystem and return the resulting tree.
  async fn run(&self, root: &FileTree, spec: &RunSpec) -> Result<RunOutput, BuildError>;
}

/// Runs commands with `chroot(8)` in a scratch copy of the tree.
///
/// Requires root privileges on a Linux host.
pub struct ChrootRunner {
  scratch: PathBuf,
}

impl ChrootRunner {
  pub fn new(scratch: impl Into<PathBuf>) -> Self {
    Self {
      scratch: scratch.into(),
    }
  }
}

/// The full shell script for `spec`, including the working directory change.
pub fn script_for(spec: &RunSpec) -> String {
  match &spec.cwd {
    Some(cwd) => format!("cd {} && {}", quote(cwd), spec.script),
    None => spec.script.clone(),
  }
}

#[async_trait]
impl CommandRunner for ChrootRunner {
  async fn run(&self, root: &FileTree, spec: &RunSpec) -> Result<RunOutput, BuildError> {
    let rootfs = tempfile::Builder::new().prefix("rootfs-").tempdir_in(&self.scratch)?;
    let dir = rootfs.path().to_path_buf();

    let tree = root.clone();
    let target = dir.clone();
    tokio::task::spawn_blocking(move || materialize(&tree, &target)).await??;

    let script = script_for(spec);
    info!(cmd = %spec.script, "executing command");

    let mut command = Command::new("chroot");
    command
      .arg(&dir)
      .arg("/bin/sh")
      .arg("-c")
      .arg(&script)
      .env_clear()
      .env("PATH", DEFAULT_PATH)
      .env("HOME", "/root")
      .env("LANG", "C");
    for (key, value) in &spec.env {
      command.env(key, value);
    }

    debug!(rootfs = ?dir, "spawning chroot");
    let output = output_in_group(command).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
      if !stdout.is_empty() {
        debug!(stdout = %stdout, "command stdout");
      }
      return Err(BuildError::CommandFailed {
        cmd: spec.script.clone(),
        code: output.status.code(),
        stderr: stderr.trim().to_string(),
      });
    }

    let log = format!("{}{}", stdout, stderr);
    let mut tree = tokio::task::spawn_blocking(move || read_tree(&dir)).await??;
    preserve_volatile(root, &mut tree);

    Ok(RunOutput { tree, log })
  }
}

/// Kills a process group when dropped, unless disarmed first.
struct GroupKill(Option<Pid>);

impl GroupKill {
  fn disarm(&mut self) {
    self.0 = None;
  }
}

impl Drop for GroupKill {
  fn drop(&mut self) {
    if let Some(pgid) = self.0.take() {
      debug!(pgid = ?pgid, "killing cancelled command group");
      let _ = kill_process_group(pgid, Signal::KILL);
    }
  }
}

/// Run `command` to completion in a fresh process group.
///
/// Dropping the returned future kills the whole group, so processes the
/// shell forked do not outlive a cancelled build.
pub async fn output_in_group(mut command: Command) -> std::io::Result<Output> {
  command
    .process_group(0)
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
  let child = command.spawn()?;
  let mut guard = GroupKill(child.id().and_then(|id| i32::try_from(id).ok()).and_then(Pid::from_raw));
  let output = child.wait_with_output().await;
  guard.disarm();
  output
}

fn preserve_volatile(before: &FileTree, after: &mut FileTree) {
  let captured: Vec<String> = after
    .iter()
    .filter(|(path, _)| is_volatile(path))
    .map(|(path, _)| path.to_string())
    .collect();
  for path in captured {
    after.remove(&path);
  }
  for (path, entry) in before.iter().filter(|(path, _)| is_volatile(path)) {
    after.insert(path, entry.clone());
  }
}

fn is_volatile(path: &str) -> bool {
  let top = path.split('/').next().unwrap_or_default();
  VOLATILE_DIRS.contains(&top)
}

/// Write `tree` below `dir`. Layer markers are skipped.
pub fn materialize(tree: &FileTree, dir: &Path) -> std::io::Result<()> {
  let mut dir_modes = Vec::new();

  for (path, entry) in tree.iter() {
    let target = dir.join(path);
    match entry {
      Entry::Dir { mode } | Entry::OpaqueDir { mode } => {
        fs::create_dir_all(&target)?;
        dir_modes.push((target, *mode));
      }
      Entry::File { mode, data } => {
        if let Some(parent) = target.parent() {
          fs::create_dir_all(parent)?;
        }
        fs::write(&target, data)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(*mode))?;
      }
      Entry::Symlink { target: link } => {
        if let Some(parent) = target.parent() {
          fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(link, &target)?;
      }
      Entry::Whiteout => {}
    }
  }

  // Children first, so read-only directories do not block their own contents.
  for (target, mode) in dir_modes.into_iter().rev() {
    fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
  }
  Ok(())
}

/// Read the directory below `dir` back into a tree.
pub fn read_tree(dir: &Path) -> std::io::Result<FileTree> {
  let mut tree = FileTree::new();

  for entry in WalkDir::new(dir).follow_links(false).min_depth(1) {
    let entry = entry.map_err(std::io::Error::other)?;
    let Ok(relative) = entry.path().strip_prefix(dir) else {
      continue;
    };
    let path = relative.to_string_lossy();
    let file_type = entry.file_type();
    let metadata = entry.metadata().map_err(std::io::Error::other)?;
    let mode = metadata.permissions().mode() & 0o7777;

    if file_type.is_symlink() {
      let target = fs::read_link(entry.path())?;
      tree.insert(
        &path,
        Entry::Symlink {
          target: target.to_string_lossy().into_owned(),
        },
      );
    } else if file_type.is_dir() {
      tree.insert(&path, Entry::Dir { mode });
    } else if file_type.is_file() {
      tree.insert(&path, Entry::file(fs::read(entry.path())?, mode));
    } else {
      debug!(path = %path, "skipping special file");
    }
  }

  Ok(tree)
}
