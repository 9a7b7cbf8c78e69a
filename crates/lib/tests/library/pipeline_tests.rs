//! End-to-end runs of the patch pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use imgpatch_lib::backend::{ImageArchive, LocalClient};
use imgpatch_lib::consts::RESULTS_PATH;
use imgpatch_lib::graph::FileTree;
use imgpatch_lib::manifest::{UpdateManifest, UpdatePackage};
use imgpatch_lib::patch::{Collaborators, ErrorKind, PatchOptions, PatchState, patch};
use imgpatch_lib::pkgmgr::BuildOutputPolicy;
use imgpatch_lib::pkgmgr::dotnet::DOTNET_TYPE;

use super::common::{
  APT_LISTS, CapturingLoader, DPKG_DB, IMAGE, MissingSource, NUGET_DB, RefusingLoader, ScriptedRunner, collaborators,
  dotnet_tree, installed, local_client,
};

const PATCHED: &str = "docker.io/library/app:1.0-patched";

fn app_tree() -> FileTree {
  dotnet_tree(&[("libc6", "2.36-9"), ("openssl", "3.0.11-1")], &[("Newtonsoft.Json", "12.0.1")])
}

fn full_manifest() -> UpdateManifest {
  let mut manifest = UpdateManifest::default();
  manifest.metadata.os.os_type = "debian".to_string();
  manifest.metadata.os.version = "12".to_string();
  manifest.metadata.config.arch = "amd64".to_string();
  manifest.updates = vec![UpdatePackage::new("openssl", "3.0.13-1").with_installed("3.0.11-1")];
  manifest.lang_updates = vec![UpdatePackage::new("Newtonsoft.Json", "13.0.1").with_type(DOTNET_TYPE)];
  manifest
}

fn write_report(dir: &Path, manifest: &UpdateManifest) -> PathBuf {
  let path = dir.join("report.json");
  std::fs::write(&path, serde_json::to_vec_pretty(manifest).unwrap()).unwrap();
  path
}

fn options(report: Option<PathBuf>) -> PatchOptions {
  let mut options = PatchOptions::new(IMAGE);
  options.report = report;
  options.timeout = Duration::from_secs(30);
  options
}

fn offering_all() -> Arc<ScriptedRunner> {
  Arc::new(
    ScriptedRunner::new()
      .offer("openssl", "3.0.13-1")
      .offer("Newtonsoft.Json", "13.0.1"),
  )
}

fn exported(loader: &CapturingLoader) -> ImageArchive {
  let mut archives = loader.archives();
  assert_eq!(archives.len(), 1);
  archives.remove(0)
}

#[tokio::test(flavor = "multi_thread")]
async fn report_run_exports_one_patch_layer() {
  let temp = TempDir::new().unwrap();
  let mut options = options(Some(write_report(temp.path(), &full_manifest())));
  let statement = temp.path().join("statement.json");
  options.output = Some(statement.clone());
  let loader = Arc::new(CapturingLoader::default());

  let summary = patch(options, collaborators(local_client(&app_tree(), offering_all()), loader.clone()))
    .await
    .unwrap();

  assert_eq!(summary.patched_image, PATCHED);
  assert_eq!(summary.managers, vec!["apt", "dotnet"]);
  assert!(summary.failed.is_empty());
  assert_eq!(summary.validated, 2);
  assert_eq!(summary.state, PatchState::Succeeded);
  assert_eq!(summary.statement.as_deref(), Some(statement.as_path()));

  let archive = exported(&loader);
  assert_eq!(archive.repo_tags(), [PATCHED.to_string()]);
  assert_eq!(archive.layers().len(), 2);
  let diff_ids = archive.config()["rootfs"]["diff_ids"].as_array().unwrap().len();
  assert_eq!(diff_ids, 2);

  let rootfs = archive.rootfs().unwrap();
  assert_eq!(installed(&rootfs, DPKG_DB)["openssl"], "3.0.13-1");
  assert_eq!(installed(&rootfs, NUGET_DB)["Newtonsoft.Json"], "13.0.1");
  assert!(rootfs.get(&format!("{}/sim-index", APT_LISTS)).is_none());
  assert!(rootfs.get(RESULTS_PATH).is_none());

  let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&statement).unwrap()).unwrap();
  assert_eq!(written["image"], PATCHED);
  assert_eq!(written["fixed"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn excluded_build_output_reaches_the_language_manager() {
  let temp = TempDir::new().unwrap();
  let mut options = options(Some(write_report(temp.path(), &full_manifest())));
  options.build_output = BuildOutputPolicy::Exclude;
  let runner = offering_all();
  let loader = Arc::new(CapturingLoader::default());

  let summary = patch(options, collaborators(local_client(&app_tree(), runner.clone()), loader.clone()))
    .await
    .unwrap();

  assert_eq!(summary.validated, 2);
  assert!(runner.scripts().iter().all(|s| !s.starts_with("dotnet build")));
  let rootfs = exported(&loader).rootfs().unwrap();
  assert_eq!(installed(&rootfs, NUGET_DB)["Newtonsoft.Json"], "13.0.1");
  assert!(rootfs.get("/app/bin/app.dll").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn nothing_to_patch_only_retags() {
  let temp = TempDir::new().unwrap();
  let mut manifest = full_manifest();
  manifest.updates.clear();
  manifest.lang_updates.clear();
  let mut options = options(Some(write_report(temp.path(), &manifest)));
  let statement = temp.path().join("statement.json");
  options.output = Some(statement.clone());
  let runner = offering_all();
  let loader = Arc::new(CapturingLoader::default());

  let summary = patch(options, collaborators(local_client(&app_tree(), runner.clone()), loader.clone()))
    .await
    .unwrap();

  assert!(summary.managers.is_empty());
  assert_eq!(summary.validated, 0);
  assert!(summary.statement.is_none());
  assert!(!statement.exists());
  assert!(runner.scripts().is_empty());

  let archive = exported(&loader);
  assert_eq!(archive.layers().len(), 1);
  assert_eq!(archive.repo_tags(), [PATCHED.to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn ignored_failures_are_summarised() {
  let temp = TempDir::new().unwrap();
  let mut manifest = full_manifest();
  manifest.updates.clear();
  manifest
    .lang_updates
    .push(UpdatePackage::new("Bad.Pkg", "not-a-version").with_type(DOTNET_TYPE));
  let mut options = options(Some(write_report(temp.path(), &manifest)));
  options.ignore_errors = true;
  let statement = temp.path().join("statement.json");
  options.output = Some(statement.clone());
  let loader = Arc::new(CapturingLoader::default());

  let summary = patch(options, collaborators(local_client(&app_tree(), offering_all()), loader))
    .await
    .unwrap();

  assert_eq!(summary.failed, vec!["Bad.Pkg"]);
  assert_eq!(summary.validated, 1);
  let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&statement).unwrap()).unwrap();
  assert_eq!(written["fixed"][0]["name"], "Newtonsoft.Json");
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_mismatch_fails_the_run() {
  let temp = TempDir::new().unwrap();
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.14-1"));
  let mut manifest = full_manifest();
  manifest.lang_updates.clear();

  let err = patch(
    options(Some(write_report(temp.path(), &manifest))),
    collaborators(local_client(&app_tree(), runner), Arc::new(CapturingLoader::default())),
  )
  .await
  .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::ValidationMismatch);
  assert!(err.to_string().contains("expected version 3.0.13-1, but found 3.0.14-1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_os_fails_the_run() {
  let temp = TempDir::new().unwrap();
  let mut manifest = full_manifest();
  manifest.metadata.os.os_type = "alpine".to_string();

  let err = patch(
    options(Some(write_report(temp.path(), &manifest))),
    collaborators(local_client(&app_tree(), offering_all()), Arc::new(CapturingLoader::default())),
  )
  .await
  .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
  assert!(err.to_string().contains("alpine"));
}

#[tokio::test(flavor = "multi_thread")]
async fn without_report_the_detected_os_is_upgraded() {
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.15-1"));
  let loader = Arc::new(CapturingLoader::default());

  let summary = patch(options(None), collaborators(local_client(&app_tree(), runner), loader.clone()))
    .await
    .unwrap();

  assert_eq!(summary.managers, vec!["apt"]);
  assert_eq!(summary.validated, 0);
  let rootfs = exported(&loader).rootfs().unwrap();
  assert_eq!(installed(&rootfs, DPKG_DB)["openssl"], "3.0.15-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn undetectable_os_is_unsupported() {
  let mut tree = app_tree();
  tree.write_file("/etc/os-release", "NAME=\"Alpine Linux\"\nID=alpine\n", 0o644);

  let err = patch(
    options(None),
    collaborators(local_client(&tree, offering_all()), Arc::new(CapturingLoader::default())),
  )
  .await
  .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_failure_is_a_backend_error() {
  let client = Arc::new(LocalClient::new(Arc::new(MissingSource)));
  let err = patch(
    options(None),
    Collaborators::with_client(client, Arc::new(CapturingLoader::default())),
  )
  .await
  .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Backend);
  assert!(err.to_string().contains("manifest unknown"));
}

#[tokio::test(flavor = "multi_thread")]
async fn load_failure_does_not_fail_the_run() {
  let temp = TempDir::new().unwrap();
  let summary = patch(
    options(Some(write_report(temp.path(), &full_manifest()))),
    collaborators(local_client(&app_tree(), offering_all()), Arc::new(RefusingLoader)),
  )
  .await
  .unwrap();

  assert_eq!(summary.state, PatchState::Succeeded);
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_aborts_and_cleans_up() {
  let temp = TempDir::new().unwrap();
  let work = temp.path().join("work");
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.13-1").delayed(Duration::from_secs(30)));
  let mut options = options(Some(write_report(temp.path(), &full_manifest())));
  options.timeout = Duration::from_millis(200);
  options.working_folder = Some(work.clone());

  let started = Instant::now();
  let err = patch(
    options,
    collaborators(local_client(&app_tree(), runner), Arc::new(CapturingLoader::default())),
  )
  .await
  .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Timeout);
  assert!(started.elapsed() < Duration::from_secs(5));
  assert!(!work.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_patch_stops_the_run() {
  let temp = TempDir::new().unwrap();
  let work = temp.path().join("work");
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.13-1").delayed(Duration::from_secs(30)));
  let mut options = options(Some(write_report(temp.path(), &full_manifest())));
  options.working_folder = Some(work.clone());

  let abandoned = tokio::time::timeout(
    Duration::from_millis(300),
    patch(
      options,
      collaborators(local_client(&app_tree(), runner), Arc::new(CapturingLoader::default())),
    ),
  )
  .await;
  assert!(abandoned.is_err());

  let deadline = Instant::now() + Duration::from_secs(3);
  while work.exists() && Instant::now() < deadline {
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  assert!(!work.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_working_folder_is_kept_with_results() {
  let temp = TempDir::new().unwrap();
  let mut options = options(Some(write_report(temp.path(), &full_manifest())));
  options.working_folder = Some(temp.path().to_path_buf());

  patch(
    options,
    collaborators(local_client(&app_tree(), offering_all()), Arc::new(CapturingLoader::default())),
  )
  .await
  .unwrap();

  assert!(temp.path().join("apt-results.manifest").exists());
  assert!(temp.path().join("dotnet-results.manifest").exists());
}

#[tokio::test]
async fn unknown_scanner_is_rejected_up_front() {
  let temp = TempDir::new().unwrap();
  let mut options = options(Some(write_report(temp.path(), &full_manifest())));
  options.scanner = "trivy".to_string();
  let runner = offering_all();

  let err = patch(
    options,
    collaborators(local_client(&app_tree(), runner.clone()), Arc::new(CapturingLoader::default())),
  )
  .await
  .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::InputValidation);
  assert!(runner.scripts().is_empty());
}
