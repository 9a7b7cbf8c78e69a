//! dotnet manager against a simulated .NET application image.

use std::sync::Arc;

use imgpatch_lib::graph::FileTree;
use imgpatch_lib::manifest::{UpdateManifest, UpdatePackage};
use imgpatch_lib::pkgmgr::dotnet::DOTNET_TYPE;
use imgpatch_lib::pkgmgr::{BuildOutputPolicy, DotnetManager, PackageManager, PkgMgrError};

use super::common::{ManagerFixture, NUGET_DB, ScriptedRunner, dotnet_tree};

fn lang(name: &str, fixed: &str) -> UpdatePackage {
  UpdatePackage::new(name, fixed).with_type(DOTNET_TYPE)
}

fn manifest(lang_updates: Vec<UpdatePackage>) -> UpdateManifest {
  UpdateManifest {
    lang_updates,
    ..UpdateManifest::default()
  }
}

fn app_tree() -> FileTree {
  dotnet_tree(
    &[("libc6", "2.36-9")],
    &[("Newtonsoft.Json", "12.0.1"), ("Serilog", "2.10.0")],
  )
}

#[tokio::test]
async fn updates_packages_and_ships_build_output() {
  let runner = Arc::new(ScriptedRunner::new().offer("Newtonsoft.Json", "13.0.1"));
  let fx = ManagerFixture::open(&app_tree(), runner.clone()).await;
  let dotnet = DotnetManager::new(fx.config.clone());

  let installed = dotnet
    .install_updates(Some(&manifest(vec![lang("Newtonsoft.Json", "13.0.1")])), false)
    .await
    .unwrap();

  assert!(installed.failed.is_empty());
  let packages = fx.packages(&installed.state, NUGET_DB).await;
  assert_eq!(packages["Newtonsoft.Json"], "13.0.1");
  assert_eq!(packages["Serilog"], "2.10.0");
  assert!(fx.session.read_file(&installed.state, "/app/bin/app.dll").await.unwrap().is_some());

  let scripts = runner.scripts();
  let order: Vec<&str> = ["dotnet clean", "dotnet add package", "dotnet restore", "dotnet build"]
    .into_iter()
    .filter(|step| scripts.iter().any(|s| s.starts_with(step)))
    .collect();
  assert_eq!(order.len(), 4);
  assert!(scripts.iter().any(|s| s == "dotnet restore --force --no-cache --nologo"));
}

#[tokio::test]
async fn exclude_policy_skips_the_build() {
  let runner = Arc::new(ScriptedRunner::new().offer("Newtonsoft.Json", "13.0.1"));
  let fx = ManagerFixture::open(&app_tree(), runner.clone()).await;
  let dotnet = DotnetManager::new(fx.config.clone().with_build_output(BuildOutputPolicy::Exclude));

  let installed = dotnet
    .install_updates(Some(&manifest(vec![lang("Newtonsoft.Json", "13.0.1")])), false)
    .await
    .unwrap();

  assert!(fx.session.read_file(&installed.state, "/app/bin/app.dll").await.unwrap().is_none());
  assert!(runner.scripts().iter().all(|s| !s.starts_with("dotnet build")));
}

#[tokio::test]
async fn nothing_for_this_ecosystem_is_a_noop() {
  let runner = Arc::new(ScriptedRunner::new());
  let fx = ManagerFixture::open(&app_tree(), runner.clone()).await;
  let dotnet = DotnetManager::new(fx.config.clone());

  let mut updates = manifest(vec![]);
  updates.updates.push(UpdatePackage::new("openssl", "3.0.13-1"));
  let installed = dotnet.install_updates(Some(&updates), false).await.unwrap();

  assert_eq!(installed.state, fx.config.image_state);
  assert!(installed.failed.is_empty());
  assert!(runner.scripts().is_empty());
}

#[tokio::test]
async fn without_manifest_nothing_happens() {
  let runner = Arc::new(ScriptedRunner::new());
  let fx = ManagerFixture::open(&app_tree(), runner.clone()).await;

  let installed = DotnetManager::new(fx.config.clone()).install_updates(None, false).await.unwrap();

  assert_eq!(installed.state, fx.config.image_state);
  assert!(runner.scripts().is_empty());
}

#[tokio::test]
async fn highest_fixed_version_wins() {
  let runner = Arc::new(ScriptedRunner::new().offer("Newtonsoft.Json", "13.0.3"));
  let fx = ManagerFixture::open(&app_tree(), runner.clone()).await;

  let updates = manifest(vec![lang("Newtonsoft.Json", "13.0.1"), lang("Newtonsoft.Json", "13.0.3")]);
  let installed = DotnetManager::new(fx.config.clone())
    .install_updates(Some(&updates), false)
    .await
    .unwrap();

  assert!(installed.failed.is_empty());
  let scripts = runner.scripts();
  assert!(scripts.iter().any(|s| s.contains("--version '13.0.3'")));
  assert!(scripts.iter().all(|s| !s.contains("--version '13.0.1'")));
}

#[tokio::test]
async fn invalid_version_is_skipped_when_ignoring_errors() {
  let runner = Arc::new(ScriptedRunner::new().offer("Newtonsoft.Json", "13.0.1"));
  let fx = ManagerFixture::open(&app_tree(), runner).await;

  let updates = manifest(vec![lang("Bad.Pkg", "not-a-version"), lang("Newtonsoft.Json", "13.0.1")]);
  let installed = DotnetManager::new(fx.config.clone())
    .install_updates(Some(&updates), true)
    .await
    .unwrap();

  assert_eq!(installed.failed.iter().collect::<Vec<_>>(), vec!["Bad.Pkg"]);
  let packages = fx.packages(&installed.state, NUGET_DB).await;
  assert_eq!(packages["Newtonsoft.Json"], "13.0.1");
}

#[tokio::test]
async fn invalid_version_fails_every_package_otherwise() {
  let runner = Arc::new(ScriptedRunner::new().offer("Newtonsoft.Json", "13.0.1"));
  let fx = ManagerFixture::open(&app_tree(), runner.clone()).await;

  let updates = manifest(vec![lang("Bad.Pkg", "not-a-version"), lang("Newtonsoft.Json", "13.0.1")]);
  let failure = DotnetManager::new(fx.config.clone())
    .install_updates(Some(&updates), false)
    .await
    .unwrap_err();

  assert!(matches!(failure.source, PkgMgrError::Dedup(_)));
  assert!(failure.failed.contains("Bad.Pkg"));
  assert!(failure.failed.contains("Newtonsoft.Json"));
  assert_eq!(failure.state, fx.config.image_state);
  assert!(runner.scripts().is_empty());
}

#[tokio::test]
async fn restore_failure_reports_every_attempted_package() {
  let runner = Arc::new(
    ScriptedRunner::new()
      .offer("Newtonsoft.Json", "13.0.1")
      .offer("Serilog", "2.12.0")
      .fail_on("dotnet restore"),
  );
  let fx = ManagerFixture::open(&app_tree(), runner).await;

  let updates = manifest(vec![lang("Newtonsoft.Json", "13.0.1"), lang("Serilog", "2.12.0")]);
  let failure = DotnetManager::new(fx.config.clone())
    .install_updates(Some(&updates), false)
    .await
    .unwrap_err();

  assert!(matches!(failure.source, PkgMgrError::Apply(_)));
  assert_eq!(failure.failed.len(), 2);
  assert_eq!(failure.state, fx.config.image_state);
}

#[tokio::test]
async fn missing_listing_fails_validation_when_ignored() {
  let runner = Arc::new(
    ScriptedRunner::new()
      .offer("Newtonsoft.Json", "13.0.1")
      .fail_on("dotnet list package"),
  );
  let fx = ManagerFixture::open(&app_tree(), runner).await;

  let installed = DotnetManager::new(fx.config.clone())
    .install_updates(Some(&manifest(vec![lang("Newtonsoft.Json", "13.0.1")])), true)
    .await
    .unwrap();

  assert_eq!(installed.failed.iter().collect::<Vec<_>>(), vec!["Newtonsoft.Json"]);
  assert_ne!(installed.state, fx.config.image_state);
}
