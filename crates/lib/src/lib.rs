//! imgpatch-lib: patch vulnerable packages in container images.
//!
//! The crate is organised around a content-addressed build graph:
//! - `graph`: `Snapshot` DAG of image, run, diff and merge operations
//! - `backend`: build sessions that evaluate snapshots and export archives
//! - `pkgmgr`: package manager plugins turning update manifests into snapshots
//! - `patch`: the orchestrator running build, display and export under a deadline

pub mod backend;
pub mod consts;
pub mod graph;
pub mod load;
pub mod manifest;
pub mod patch;
pub mod pkgmgr;
pub mod platform;
pub mod progress;
pub mod report;
pub mod util;
pub mod version;
