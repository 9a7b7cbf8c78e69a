//! Build graph: immutable snapshots and the filesystem semantics behind them.
//!
//! A [`Snapshot`] is a node in a persistent, content-addressed DAG. New
//! snapshots are only ever derived from existing ones via `run`, `diff` and
//! `merge`; nothing is mutated in place. Backends evaluate a marshalled
//! [`Definition`] into [`FileTree`]s.

pub mod definition;
pub mod snapshot;
pub mod tree;

use thiserror::Error;

use crate::util::hash::ObjectHash;

pub use definition::{Definition, DefinitionNode};
pub use snapshot::{Op, RunSpec, Snapshot};
pub use tree::{Entry, FileTree};

#[derive(Debug, Error)]
pub enum GraphError {
  /// Topological sort found a cycle (cannot happen for graphs built via `Snapshot`).
  #[error("build graph contains a cycle at node {0}")]
  Cycle(ObjectHash),

  #[error("definition references unknown node {0}")]
  MissingNode(ObjectHash),

  #[error("node {digest} expects {expected} inputs, found {found}")]
  InputCount {
    digest: ObjectHash,
    expected: usize,
    found: usize,
  },
}
