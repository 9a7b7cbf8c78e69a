//! Shared fixtures: in-memory images, a runner that imitates apt and dotnet,
//! and a loader that captures exported archives.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use imgpatch_lib::backend::{
  BuildClient, BuildError, CommandRunner, ImageArchive, ImageSource, LocalClient, RunOutput, Session, SessionRequest,
};
use imgpatch_lib::consts::{RESULTS_MANIFEST, RESULTS_PATH};
use imgpatch_lib::graph::{FileTree, RunSpec};
use imgpatch_lib::load::{ImageLoader, LoadError};
use imgpatch_lib::patch::Collaborators;
use imgpatch_lib::pkgmgr::ManagerConfig;

pub const IMAGE: &str = "docker.io/library/app:1.0";

/// `name<TAB>version` lines standing in for the dpkg database.
pub const DPKG_DB: &str = "/var/lib/dpkg/sim-status";
/// `name version` lines standing in for the restored NuGet packages.
pub const NUGET_DB: &str = "/app/obj/sim-packages";
pub const APT_LISTS: &str = "/var/lib/apt/lists";

pub fn debian_tree(packages: &[(&str, &str)]) -> FileTree {
  let mut tree = FileTree::new();
  tree.write_file(
    "/etc/os-release",
    "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nNAME=\"Debian GNU/Linux\"\nID=debian\n",
    0o644,
  );
  tree.mkdir_all(APT_LISTS);
  tree.write_file(DPKG_DB, render_db(packages.iter().copied(), '\t'), 0o644);
  tree
}

pub fn dotnet_tree(os_packages: &[(&str, &str)], nuget: &[(&str, &str)]) -> FileTree {
  let mut tree = debian_tree(os_packages);
  tree.write_file("/app/app.csproj", "<Project Sdk=\"Microsoft.NET.Sdk\" />\n", 0o644);
  tree.write_file(NUGET_DB, render_db(nuget.iter().copied(), ' '), 0o644);
  tree
}

fn render_db<'a>(packages: impl Iterator<Item = (&'a str, &'a str)>, sep: char) -> String {
  packages.map(|(name, version)| format!("{}{}{}\n", name, sep, version)).collect()
}

fn parse_db(data: Option<&[u8]>, sep: char) -> BTreeMap<String, String> {
  let text = data.map(String::from_utf8_lossy).unwrap_or_default();
  text
    .lines()
    .filter_map(|line| line.split_once(sep))
    .map(|(name, version)| (name.to_string(), version.to_string()))
    .collect()
}

pub fn installed(tree: &FileTree, db: &str) -> BTreeMap<String, String> {
  let sep = if db == DPKG_DB { '\t' } else { ' ' };
  parse_db(tree.read_file(db), sep)
}

pub fn archive_for(tree: &FileTree) -> ImageArchive {
  let config = json!({
    "architecture": "amd64",
    "os": "linux",
    "config": { "WorkingDir": "/app", "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"] },
    "rootfs": { "type": "layers", "diff_ids": [] },
    "history": []
  });
  ImageArchive::from_tree(tree, config).unwrap()
}

pub struct StaticSource(pub ImageArchive);

#[async_trait]
impl ImageSource for StaticSource {
  async fn fetch(&self, _image: &str) -> Result<ImageArchive, BuildError> {
    Ok(self.0.clone())
  }
}

pub struct MissingSource;

#[async_trait]
impl ImageSource for MissingSource {
  async fn fetch(&self, image: &str) -> Result<ImageArchive, BuildError> {
    Err(BuildError::Fetch {
      image: image.to_string(),
      message: "manifest unknown".to_string(),
    })
  }
}

/// Imitates apt-get, dpkg-query and the dotnet CLI on the in-memory tree.
///
/// `offer` decides which version the "repository" installs for a package,
/// whatever version was asked for; packages not offered cannot be installed.
#[derive(Default)]
pub struct ScriptedRunner {
  offered: HashMap<String, String>,
  fail_on: Option<String>,
  delay: Option<Duration>,
  scripts: Mutex<Vec<String>>,
}

impl ScriptedRunner {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn offer(mut self, name: &str, version: &str) -> Self {
    self.offered.insert(name.to_string(), version.to_string());
    self
  }

  /// Fail every step whose script contains `needle`.
  pub fn fail_on(mut self, needle: &str) -> Self {
    self.fail_on = Some(needle.to_string());
    self
  }

  pub fn delayed(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn scripts(&self) -> Vec<String> {
    self.scripts.lock().unwrap().clone()
  }

  fn install(&self, tree: &mut FileTree, db: &str, sep: char, name: &str) -> Result<(), String> {
    let version = self
      .offered
      .get(name)
      .ok_or_else(|| format!("Unable to locate package {}", name))?;
    let mut packages = parse_db(tree.read_file(db), sep);
    packages.insert(name.to_string(), version.clone());
    tree.write_file(db, render_db(packages.iter().map(|(n, v)| (n.as_str(), v.as_str())), sep), 0o644);
    Ok(())
  }

  fn upgrade_all(&self, tree: &mut FileTree) {
    let mut packages = parse_db(tree.read_file(DPKG_DB), '\t');
    for (name, version) in packages.iter_mut() {
      if let Some(offered) = self.offered.get(name) {
        *version = offered.clone();
      }
    }
    tree.write_file(
      DPKG_DB,
      render_db(packages.iter().map(|(n, v)| (n.as_str(), v.as_str())), '\t'),
      0o644,
    );
  }

  fn step(&self, tree: &mut FileTree, script: &str) -> Result<(), String> {
    if let Some(needle) = &self.fail_on
      && script.contains(needle.as_str())
    {
      return Err(format!("{} failed", needle));
    }

    let results = format!("{}/{}", RESULTS_PATH, RESULTS_MANIFEST);
    if script.contains("dpkg-query") {
      let listing = render_db(
        installed(tree, DPKG_DB).iter().map(|(n, v)| (n.as_str(), v.as_str())),
        '\t',
      );
      tree.write_file(&results, listing, 0o644);
    } else if script.contains("dotnet list package") {
      let mut listing = String::from("Project 'app' has the following package references\n   [net8.0]:\n");
      listing.push_str("   Top-level Package      Requested   Resolved\n");
      for (name, version) in installed(tree, NUGET_DB) {
        listing.push_str(&format!("   > {:<20} {:<11} {}\n", name, version, version));
      }
      tree.write_file(&results, listing, 0o644);
    } else if script.starts_with("apt-get update") {
      tree.write_file(&format!("{}/sim-index", APT_LISTS), "index", 0o644);
    } else if script.starts_with("apt-get upgrade") {
      self.upgrade_all(tree);
    } else if script.starts_with("apt-get install") {
      let target = quoted(script).ok_or("no package given")?;
      let name = target.split_once('=').map_or(target, |(name, _)| name);
      self.install(tree, DPKG_DB, '\t', name)?;
    } else if script.starts_with("apt-get clean") {
      tree.remove(APT_LISTS);
      tree.mkdir_all(APT_LISTS);
    } else if script.starts_with("dotnet add package") {
      let name = quoted(script).ok_or("no package given")?;
      self.install(tree, NUGET_DB, ' ', name)?;
    } else if script.starts_with("dotnet restore") {
      tree.write_file("/app/obj/project.assets.json", "{}", 0o644);
    } else if script.starts_with("dotnet build") {
      tree.write_file("/app/bin/app.dll", "MZ", 0o755);
    } else if script.starts_with("dotnet clean") {
      tree.remove("/app/bin");
    } else {
      return Err(format!("unexpected script: {}", script));
    }
    Ok(())
  }
}

/// First single-quoted argument of a script.
fn quoted(script: &str) -> Option<&str> {
  script.split('\'').nth(1)
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
  async fn run(&self, root: &FileTree, spec: &RunSpec) -> Result<RunOutput, BuildError> {
    self.scripts.lock().unwrap().push(spec.script.clone());
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    let mut tree = root.clone();
    match self.step(&mut tree, &spec.script) {
      Ok(()) => Ok(RunOutput { tree, log: String::new() }),
      // A guarded step swallows the failure and leaves the tree untouched.
      Err(message) if spec.script.contains("|| echo") => Ok(RunOutput {
        tree: root.clone(),
        log: format!("E: {}\nWARN", message),
      }),
      Err(message) => Err(BuildError::CommandFailed {
        cmd: spec.script.clone(),
        code: Some(100),
        stderr: message,
      }),
    }
  }
}

/// Keeps every archive it is handed.
#[derive(Default)]
pub struct CapturingLoader {
  archives: Mutex<Vec<Vec<u8>>>,
}

impl CapturingLoader {
  pub fn archives(&self) -> Vec<ImageArchive> {
    self
      .archives
      .lock()
      .unwrap()
      .iter()
      .map(|bytes| ImageArchive::read(bytes.as_slice()).unwrap())
      .collect()
  }
}

#[async_trait]
impl ImageLoader for CapturingLoader {
  async fn load(&self, archive: &mut (dyn AsyncRead + Send + Unpin)) -> Result<(), LoadError> {
    let mut bytes = Vec::new();
    archive.read_to_end(&mut bytes).await?;
    self.archives.lock().unwrap().push(bytes);
    Ok(())
  }
}

/// Reads nothing and fails, like a missing docker daemon.
pub struct RefusingLoader;

#[async_trait]
impl ImageLoader for RefusingLoader {
  async fn load(&self, _archive: &mut (dyn AsyncRead + Send + Unpin)) -> Result<(), LoadError> {
    Err(LoadError::Failed(Some(1)))
  }
}

pub fn local_client(tree: &FileTree, runner: Arc<ScriptedRunner>) -> Arc<LocalClient> {
  Arc::new(LocalClient::new(Arc::new(StaticSource(archive_for(tree)))).with_runner(runner))
}

/// A session on `tree` plus a manager config rooted in a temporary folder.
pub struct ManagerFixture {
  pub session: Arc<dyn Session>,
  pub config: ManagerConfig,
  pub work: TempDir,
}

impl ManagerFixture {
  pub async fn open(tree: &FileTree, runner: Arc<ScriptedRunner>) -> Self {
    let work = TempDir::new().unwrap();
    // Dropping the receiver makes status events no-ops.
    let (status, _) = mpsc::channel(1);
    let session = local_client(tree, runner)
      .open_session(SessionRequest {
        image: IMAGE.to_string(),
        working_folder: work.path().to_path_buf(),
        status,
      })
      .await
      .unwrap();
    let config = ManagerConfig::new(session.clone(), work.path());
    Self { session, config, work }
  }

  /// Evaluate `state` and read `db` out of it.
  pub async fn packages(&self, state: &imgpatch_lib::graph::Snapshot, db: &str) -> BTreeMap<String, String> {
    let data = self.session.read_file(state, db).await.unwrap();
    parse_db(data.as_deref(), if db == DPKG_DB { '\t' } else { ' ' })
  }
}

pub fn collaborators(client: Arc<LocalClient>, loader: Arc<dyn ImageLoader>) -> Collaborators {
  Collaborators::with_client(client, loader)
}
