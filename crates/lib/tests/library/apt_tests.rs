//! apt manager against a simulated Debian image.

use std::sync::Arc;

use imgpatch_lib::manifest::{UpdateManifest, UpdatePackage};
use imgpatch_lib::pkgmgr::{AptManager, PackageManager, PkgMgrError};
use imgpatch_lib::platform::OsFamily;

use super::common::{APT_LISTS, DPKG_DB, ManagerFixture, ScriptedRunner, debian_tree};

fn manifest(updates: Vec<UpdatePackage>) -> UpdateManifest {
  let mut manifest = UpdateManifest::default();
  manifest.metadata.os.os_type = "debian".to_string();
  manifest.metadata.os.version = "12".to_string();
  manifest.updates = updates;
  manifest
}

fn base_tree() -> imgpatch_lib::graph::FileTree {
  debian_tree(&[("libc6", "2.36-9"), ("openssl", "3.0.11-1")])
}

#[tokio::test]
async fn upgrades_requested_packages() {
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.13-1"));
  let fx = ManagerFixture::open(&base_tree(), runner.clone()).await;
  let apt = AptManager::new(fx.config.clone(), OsFamily::Debian);

  let updates = manifest(vec![UpdatePackage::new("openssl", "3.0.13-1").with_installed("3.0.11-1")]);
  let installed = apt.install_updates(Some(&updates), false).await.unwrap();

  assert!(installed.failed.is_empty());
  let packages = fx.packages(&installed.state, DPKG_DB).await;
  assert_eq!(packages["openssl"], "3.0.13-1");
  assert_eq!(packages["libc6"], "2.36-9");
  assert!(fx.work.path().join("apt-results.manifest").exists());

  let scripts = runner.scripts();
  assert!(scripts.iter().any(|s| s.contains("--only-upgrade 'openssl=3.0.13-1'")));
  assert!(scripts.iter().all(|s| !s.contains("|| echo 'WARN: failed to update")));
}

#[tokio::test]
async fn package_indexes_do_not_reach_the_patch() {
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.13-1"));
  let fx = ManagerFixture::open(&base_tree(), runner).await;
  let apt = AptManager::new(fx.config.clone(), OsFamily::Debian);

  let updates = manifest(vec![UpdatePackage::new("openssl", "3.0.13-1")]);
  let installed = apt.install_updates(Some(&updates), false).await.unwrap();

  let index = format!("{}/sim-index", APT_LISTS);
  assert!(fx.session.read_file(&installed.state, &index).await.unwrap().is_none());
  assert!(installed.state.is_derived_from(&fx.config.image_state));
}

#[tokio::test]
async fn unexpected_version_fails_validation() {
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.14-1"));
  let fx = ManagerFixture::open(&base_tree(), runner).await;
  let apt = AptManager::new(fx.config.clone(), OsFamily::Debian);

  let updates = manifest(vec![UpdatePackage::new("openssl", "3.0.13-1")]);
  let failure = apt.install_updates(Some(&updates), false).await.unwrap_err();

  assert!(failure.failed.contains("openssl"));
  match failure.source {
    PkgMgrError::Validation(message) => {
      assert_eq!(message, "package openssl: expected version 3.0.13-1, but found 3.0.14-1")
    }
    other => panic!("unexpected error: {other}"),
  }
}

#[tokio::test]
async fn unavailable_package_is_recorded_when_ignoring_errors() {
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.13-1"));
  let fx = ManagerFixture::open(&base_tree(), runner).await;
  let apt = AptManager::new(fx.config.clone(), OsFamily::Debian);

  let updates = manifest(vec![
    UpdatePackage::new("openssl", "3.0.13-1"),
    UpdatePackage::new("zlib1g", "1:1.2.13.dfsg-1"),
  ]);
  let installed = apt.install_updates(Some(&updates), true).await.unwrap();

  assert_eq!(installed.failed.iter().collect::<Vec<_>>(), vec!["zlib1g"]);
  let packages = fx.packages(&installed.state, DPKG_DB).await;
  assert_eq!(packages["openssl"], "3.0.13-1");
}

#[tokio::test]
async fn failing_step_keeps_original_state() {
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.13-1").fail_on("apt-get update"));
  let fx = ManagerFixture::open(&base_tree(), runner).await;
  let apt = AptManager::new(fx.config.clone(), OsFamily::Debian);

  let updates = manifest(vec![UpdatePackage::new("openssl", "3.0.13-1")]);
  let failure = apt.install_updates(Some(&updates), false).await.unwrap_err();

  assert!(matches!(failure.source, PkgMgrError::Apply(_)));
  assert_eq!(failure.state, fx.config.image_state);
  assert!(failure.failed.contains("openssl"));
}

#[tokio::test]
async fn without_manifest_everything_is_upgraded() {
  let runner = Arc::new(ScriptedRunner::new().offer("openssl", "3.0.15-1"));
  let fx = ManagerFixture::open(&base_tree(), runner.clone()).await;
  let apt = AptManager::new(fx.config.clone(), OsFamily::Debian);

  let installed = apt.install_updates(None, false).await.unwrap();

  assert!(installed.failed.is_empty());
  let packages = fx.packages(&installed.state, DPKG_DB).await;
  assert_eq!(packages["openssl"], "3.0.15-1");
  assert_eq!(packages["libc6"], "2.36-9");
  assert!(runner.scripts().iter().any(|s| s.starts_with("apt-get upgrade -y")));
}
