//! In-memory filesystem trees and layer arithmetic.
//!
//! Paths are stored relative to the root, `/`-separated, without leading or
//! trailing slashes. A tree that came out of [`FileTree::diff`] is a *layer*:
//! it may contain [`Entry::Whiteout`] and [`Entry::OpaqueDir`] markers that
//! only have meaning when applied on top of another tree.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

const MAX_SYMLINK_HOPS: usize = 40;
const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
  Dir { mode: u32 },
  File { mode: u32, data: Arc<[u8]> },
  Symlink { target: String },
  /// Removes the path and everything below it when applied as a layer.
  Whiteout,
  /// Directory that hides all lower-layer children when applied as a layer.
  OpaqueDir { mode: u32 },
}

impl Entry {
  pub fn file(data: impl Into<Vec<u8>>, mode: u32) -> Self {
    Entry::File {
      mode,
      data: Arc::from(data.into()),
    }
  }

  pub fn is_dir(&self) -> bool {
    matches!(self, Entry::Dir { .. } | Entry::OpaqueDir { .. })
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
  entries: BTreeMap<String, Entry>,
}

/// Normalize `path` to the tree's relative form.
///
/// Returns `None` for the root itself and for paths that try to escape it
/// with `..`.
pub fn normalize(path: &str) -> Option<String> {
  let mut parts = Vec::new();
  for part in path.split('/') {
    match part {
      "" | "." => continue,
      ".." => return None,
      p => parts.push(p),
    }
  }
  if parts.is_empty() { None } else { Some(parts.join("/")) }
}

fn parent_of(path: &str) -> Option<&str> {
  path.rsplit_once('/').map(|(parent, _)| parent)
}

impl FileTree {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, path: &str) -> Option<&Entry> {
    normalize(path).and_then(|p| self.entries.get(&p))
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v))
  }

  /// Insert a raw entry. Parents are not created.
  pub fn insert(&mut self, path: &str, entry: Entry) {
    if let Some(path) = normalize(path) {
      self.entries.insert(path, entry);
    }
  }

  /// Remove `path` and everything below it.
  pub fn remove(&mut self, path: &str) {
    if let Some(path) = normalize(path) {
      self.remove_subtree(&path);
    }
  }

  /// Write a regular file, creating missing parent directories.
  pub fn write_file(&mut self, path: &str, data: impl Into<Vec<u8>>, mode: u32) {
    if let Some(path) = normalize(path) {
      self.ensure_parents(&path);
      self.entries.insert(path, Entry::file(data, mode));
    }
  }

  /// Create a directory and any missing parents.
  pub fn mkdir_all(&mut self, path: &str) {
    if let Some(path) = normalize(path) {
      self.ensure_parents(&path);
      self.entries.entry(path).or_insert(Entry::Dir { mode: DEFAULT_DIR_MODE });
    }
  }

  pub fn symlink(&mut self, path: &str, target: &str) {
    if let Some(path) = normalize(path) {
      self.ensure_parents(&path);
      self.entries.insert(
        path,
        Entry::Symlink {
          target: target.to_string(),
        },
      );
    }
  }

  /// Read a regular file, following symlinks along the way.
  pub fn read_file(&self, path: &str) -> Option<&[u8]> {
    let resolved = self.resolve(path)?;
    match self.entries.get(&resolved)? {
      Entry::File { data, .. } => Some(data.as_ref()),
      _ => None,
    }
  }

  /// Resolve symlinks in every component of `path`.
  fn resolve(&self, path: &str) -> Option<String> {
    let mut pending: VecDeque<String> = path.split('/').map(str::to_string).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
      match part.as_str() {
        "" | "." => continue,
        ".." => {
          resolved.pop();
          continue;
        }
        _ => resolved.push(part),
      }

      if let Some(Entry::Symlink { target }) = self.entries.get(&resolved.join("/")) {
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
          return None;
        }
        resolved.pop();
        if target.starts_with('/') {
          resolved.clear();
        }
        let mut next: VecDeque<String> = target.split('/').map(str::to_string).collect();
        next.extend(pending.drain(..));
        pending = next;
      }
    }

    if resolved.is_empty() { None } else { Some(resolved.join("/")) }
  }

  fn ensure_parents(&mut self, path: &str) {
    let mut current = parent_of(path);
    let mut missing = Vec::new();
    while let Some(dir) = current {
      if self.entries.contains_key(dir) {
        break;
      }
      missing.push(dir.to_string());
      current = parent_of(dir);
    }
    for dir in missing {
      self.entries.insert(dir, Entry::Dir { mode: DEFAULT_DIR_MODE });
    }
  }

  fn children_keys(&self, path: &str) -> Vec<String> {
    let prefix = format!("{}/", path);
    self
      .entries
      .range::<String, _>((Bound::Included(&prefix), Bound::Unbounded))
      .map(|(k, _)| k)
      .take_while(|k| k.starts_with(&prefix))
      .cloned()
      .collect()
  }

  fn remove_children(&mut self, path: &str) {
    for key in self.children_keys(path) {
      self.entries.remove(&key);
    }
  }

  fn remove_subtree(&mut self, path: &str) {
    self.remove_children(path);
    self.entries.remove(path);
  }

  /// Apply `layer` on top of this tree.
  ///
  /// Whiteouts delete the named path with its descendants, opaque directories
  /// drop lower children, and a non-directory replacing a directory drops
  /// the directory's contents.
  pub fn apply_layer(&mut self, layer: &FileTree) {
    for (path, entry) in &layer.entries {
      match entry {
        Entry::Whiteout => self.remove_subtree(path),
        Entry::OpaqueDir { mode } => {
          self.remove_children(path);
          self.ensure_parents(path);
          self.entries.insert(path.clone(), Entry::Dir { mode: *mode });
        }
        Entry::Dir { mode } => {
          self.ensure_parents(path);
          match self.entries.get_mut(path) {
            Some(Entry::Dir { mode: existing }) => *existing = *mode,
            _ => {
              self.entries.insert(path.clone(), Entry::Dir { mode: *mode });
            }
          }
        }
        other => {
          self.remove_children(path);
          self.ensure_parents(path);
          self.entries.insert(path.clone(), other.clone());
        }
      }
    }
  }

  /// Compose layers bottom to top into a plain tree (no markers).
  pub fn merge<'a>(layers: impl IntoIterator<Item = &'a FileTree>) -> FileTree {
    let mut merged = FileTree::new();
    for layer in layers {
      merged.apply_layer(layer);
    }
    merged
  }

  /// Compute the layer that turns `lower` into `upper`.
  ///
  /// Both inputs are plain trees. Removed paths become whiteouts; only the
  /// top-most removed path of a subtree is recorded.
  pub fn diff(lower: &FileTree, upper: &FileTree) -> FileTree {
    let mut layer = FileTree::new();

    for (path, entry) in &upper.entries {
      if lower.entries.get(path) != Some(entry) {
        layer.entries.insert(path.clone(), entry.clone());
      }
    }

    for path in lower.entries.keys() {
      if upper.entries.contains_key(path) {
        continue;
      }
      let parent_kept = match parent_of(path) {
        None => true,
        Some(parent) => matches!(upper.entries.get(parent), Some(e) if e.is_dir()),
      };
      if parent_kept {
        layer.entries.insert(path.clone(), Entry::Whiteout);
      }
    }

    layer
  }
}
