use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::util::hash::{Hashable, ObjectHash};

/// The operation that produced a snapshot from its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
  /// Root filesystem of a pulled image. No inputs.
  Image { reference: String },
  /// Run a shell script on top of the single input.
  Run(RunSpec),
  /// Changed-files delta from input 0 (lower) to input 1 (upper).
  Diff,
  /// Inputs layered in order, later inputs on top.
  Merge,
}

/// A shell script executed inside the sandbox with `/bin/sh -c`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunSpec {
  pub script: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cwd: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
}

impl RunSpec {
  pub fn new(script: impl Into<String>) -> Self {
    Self {
      script: script.into(),
      ..Self::default()
    }
  }

  pub fn cwd(mut self, cwd: Option<&str>) -> Self {
    self.cwd = cwd.map(str::to_string);
    self
  }

  pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
    self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    self
  }
}

#[derive(Debug)]
struct Node {
  op: Op,
  inputs: Vec<Snapshot>,
  digest: ObjectHash,
}

#[derive(Serialize)]
struct NodeKey<'a> {
  op: &'a Op,
  inputs: Vec<&'a ObjectHash>,
}

impl Hashable for NodeKey<'_> {}

/// Immutable handle to a filesystem state in the build graph.
///
/// Cloning is cheap. Two snapshots compare equal when they were derived by
/// the same operations from the same inputs.
#[derive(Clone)]
pub struct Snapshot(Arc<Node>);

impl Snapshot {
  fn derive(op: Op, inputs: Vec<Snapshot>) -> Self {
    let key = NodeKey {
      op: &op,
      inputs: inputs.iter().map(|s| s.digest()).collect(),
    };
    // Ops only hold strings and string-keyed maps.
    let digest = key.compute_hash().expect("snapshot ops serialize to JSON");
    Self(Arc::new(Node { op, inputs, digest }))
  }

  /// Root snapshot for an image's filesystem.
  pub fn image(reference: impl Into<String>) -> Self {
    Self::derive(
      Op::Image {
        reference: reference.into(),
      },
      Vec::new(),
    )
  }

  /// Derive a snapshot by running `spec` on top of this one.
  pub fn run(&self, spec: RunSpec) -> Self {
    Self::derive(Op::Run(spec), vec![self.clone()])
  }

  /// Delta that turns `lower` into `upper`.
  pub fn diff(lower: &Snapshot, upper: &Snapshot) -> Self {
    Self::derive(Op::Diff, vec![lower.clone(), upper.clone()])
  }

  /// Compose `layers` in order, later layers on top.
  pub fn merge(layers: &[Snapshot]) -> Self {
    Self::derive(Op::Merge, layers.to_vec())
  }

  pub fn digest(&self) -> &ObjectHash {
    &self.0.digest
  }

  pub fn op(&self) -> &Op {
    &self.0.op
  }

  pub fn inputs(&self) -> &[Snapshot] {
    &self.0.inputs
  }

  /// Returns true if `ancestor` is this snapshot or appears anywhere in its derivation.
  pub fn is_derived_from(&self, ancestor: &Snapshot) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![self.clone()];
    while let Some(node) = stack.pop() {
      if node.digest() == ancestor.digest() {
        return true;
      }
      if seen.insert(node.digest().clone()) {
        stack.extend(node.inputs().iter().cloned());
      }
    }
    false
  }

  /// Human-readable label for progress output.
  pub fn description(&self) -> String {
    describe(self.op(), self.inputs().len())
  }
}

pub(crate) fn describe(op: &Op, input_count: usize) -> String {
  match op {
    Op::Image { reference } => format!("load {}", reference),
    Op::Run(spec) => {
      let first_line = spec.script.lines().next().unwrap_or_default();
      format!("run {}", first_line)
    }
    Op::Diff => "diff".to_string(),
    Op::Merge => format!("merge ({} layers)", input_count),
  }
}

impl PartialEq for Snapshot {
  fn eq(&self, other: &Self) -> bool {
    self.digest() == other.digest()
  }
}

impl Eq for Snapshot {}

impl fmt::Debug for Snapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Snapshot")
      .field("digest", &self.0.digest.0)
      .field("op", &self.0.op)
      .field("inputs", &self.0.inputs.len())
      .finish()
  }
}
