//! Progress events emitted while a definition is evaluated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::util::hash::ObjectHash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
  Started,
  /// Result was already evaluated in this session.
  Cached,
  Completed { elapsed: Duration },
  Errored(String),
  /// One line of command output.
  Log(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveStatus {
  pub vertex: ObjectHash,
  pub name: String,
  pub event: StatusEvent,
}

impl SolveStatus {
  pub fn new(vertex: &ObjectHash, name: impl Into<String>, event: StatusEvent) -> Self {
    Self {
      vertex: vertex.clone(),
      name: name.into(),
      event,
    }
  }
}

/// Shared handle to the status stream that can be closed from any clone.
///
/// Once closed, or once the receiving side is gone, events are discarded.
#[derive(Debug, Clone, Default)]
pub struct StatusSink(Arc<Mutex<Option<mpsc::Sender<SolveStatus>>>>);

impl StatusSink {
  pub fn new(tx: mpsc::Sender<SolveStatus>) -> Self {
    Self(Arc::new(Mutex::new(Some(tx))))
  }

  pub async fn emit(&self, status: SolveStatus) {
    let tx = self.0.lock().ok().and_then(|guard| guard.clone());
    if let Some(tx) = tx {
      let _ = tx.send(status).await;
    }
  }

  /// Drop the sender so the receiving display sees end-of-stream.
  pub fn close(&self) {
    if let Ok(mut guard) = self.0.lock() {
      guard.take();
    }
  }
}
