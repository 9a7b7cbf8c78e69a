//! Serialized form of a snapshot graph, ordered for evaluation.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use super::GraphError;
use super::snapshot::{Op, Snapshot, describe};
use crate::util::hash::ObjectHash;

/// One operation in a marshalled graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionNode {
  pub digest: ObjectHash,
  pub op: Op,
  pub inputs: Vec<ObjectHash>,
}

impl DefinitionNode {
  pub fn description(&self) -> String {
    describe(&self.op, self.inputs.len())
  }
}

/// A snapshot graph flattened into dependency order.
///
/// Every node appears after all of its inputs; `root` is the last node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
  pub root: ObjectHash,
  pub nodes: Vec<DefinitionNode>,
}

impl Definition {
  pub fn node(&self, digest: &ObjectHash) -> Option<&DefinitionNode> {
    self.nodes.iter().find(|n| &n.digest == digest)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

impl Snapshot {
  /// Flatten the graph reachable from this snapshot into a [`Definition`].
  ///
  /// Shared sub-graphs are emitted once.
  pub fn marshal(&self) -> Result<Definition, GraphError> {
    let mut graph: DiGraph<Snapshot, ()> = DiGraph::new();
    let mut indices: HashMap<ObjectHash, NodeIndex> = HashMap::new();

    let root_idx = graph.add_node(self.clone());
    indices.insert(self.digest().clone(), root_idx);
    let mut pending = vec![self.clone()];

    while let Some(node) = pending.pop() {
      let node_idx = indices[node.digest()];
      for input in node.inputs() {
        let input_idx = match indices.get(input.digest()) {
          Some(idx) => *idx,
          None => {
            let idx = graph.add_node(input.clone());
            indices.insert(input.digest().clone(), idx);
            pending.push(input.clone());
            idx
          }
        };
        // Edges run from dependency to dependent.
        graph.update_edge(input_idx, node_idx, ());
      }
    }

    let order = toposort(&graph, None).map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].digest().clone()))?;

    let nodes = order
      .into_iter()
      .map(|idx| {
        let snapshot = &graph[idx];
        DefinitionNode {
          digest: snapshot.digest().clone(),
          op: snapshot.op().clone(),
          inputs: snapshot.inputs().iter().map(|i| i.digest().clone()).collect(),
        }
      })
      .collect();

    Ok(Definition {
      root: self.digest().clone(),
      nodes,
    })
  }
}
