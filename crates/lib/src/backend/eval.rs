//! Evaluates marshalled definitions into filesystem trees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, error};

use super::runner::CommandRunner;
use super::status::{SolveStatus, StatusEvent, StatusSink};
use super::BuildError;
use crate::graph::{Definition, DefinitionNode, FileTree, GraphError, Op};
use crate::util::hash::ObjectHash;

/// Evaluates definitions for one image, memoising every node by digest.
pub struct Evaluator {
  source: String,
  rootfs: Arc<FileTree>,
  runner: Arc<dyn CommandRunner>,
  status: StatusSink,
  cache: Mutex<HashMap<ObjectHash, Arc<FileTree>>>,
}

impl Evaluator {
  pub fn new(source: String, rootfs: Arc<FileTree>, runner: Arc<dyn CommandRunner>, status: StatusSink) -> Self {
    Self {
      source,
      rootfs,
      runner,
      status,
      cache: Mutex::new(HashMap::new()),
    }
  }

  /// Root filesystem of the source image.
  pub fn rootfs(&self) -> &Arc<FileTree> {
    &self.rootfs
  }

  pub async fn evaluate(&self, definition: &Definition) -> Result<Arc<FileTree>, BuildError> {
    for node in &definition.nodes {
      let name = node.description();

      if self.cache.lock().await.contains_key(&node.digest) {
        self
          .status
          .emit(SolveStatus::new(&node.digest, name, StatusEvent::Cached))
          .await;
        continue;
      }

      self
        .status
        .emit(SolveStatus::new(&node.digest, name.clone(), StatusEvent::Started))
        .await;
      let started = Instant::now();

      match self.evaluate_node(node).await {
        Ok(tree) => {
          debug!(vertex = %node.digest, entries = tree.len(), "evaluated node");
          self.cache.lock().await.insert(node.digest.clone(), tree);
          self
            .status
            .emit(SolveStatus::new(
              &node.digest,
              name,
              StatusEvent::Completed {
                elapsed: started.elapsed(),
              },
            ))
            .await;
        }
        Err(err) => {
          error!(vertex = %node.digest, error = %err, "evaluation failed");
          self
            .status
            .emit(SolveStatus::new(&node.digest, name, StatusEvent::Errored(err.to_string())))
            .await;
          return Err(err);
        }
      }
    }

    self
      .cache
      .lock()
      .await
      .get(&definition.root)
      .cloned()
      .ok_or_else(|| BuildError::MissingResult(definition.root.clone()))
  }

  async fn evaluate_node(&self, node: &DefinitionNode) -> Result<Arc<FileTree>, BuildError> {
    let inputs = {
      let cache = self.cache.lock().await;
      node
        .inputs
        .iter()
        .map(|digest| {
          cache
            .get(digest)
            .cloned()
            .ok_or_else(|| GraphError::MissingNode(digest.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?
    };

    let arity = |expected: usize| -> Result<(), BuildError> {
      if inputs.len() == expected {
        Ok(())
      } else {
        Err(
          GraphError::InputCount {
            digest: node.digest.clone(),
            expected,
            found: inputs.len(),
          }
          .into(),
        )
      }
    };

    match &node.op {
      Op::Image { reference } => {
        if reference != &self.source {
          return Err(BuildError::UnknownSource {
            expected: self.source.clone(),
            found: reference.clone(),
          });
        }
        Ok(self.rootfs.clone())
      }
      Op::Run(spec) => {
        arity(1)?;
        let output = self.runner.run(&inputs[0], spec).await?;
        for line in output.log.lines().filter(|l| !l.trim().is_empty()) {
          self
            .status
            .emit(SolveStatus::new(&node.digest, node.description(), StatusEvent::Log(line.to_string())))
            .await;
        }
        Ok(Arc::new(output.tree))
      }
      Op::Diff => {
        arity(2)?;
        Ok(Arc::new(FileTree::diff(&inputs[0], &inputs[1])))
      }
      Op::Merge => Ok(Arc::new(FileTree::merge(inputs.iter().map(|t| &**t)))),
    }
  }
}
