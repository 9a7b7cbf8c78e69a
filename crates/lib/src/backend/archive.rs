//! Docker image archives (`docker save` / `docker load` format).
//!
//! Layers are tar streams, optionally gzip-compressed. Deletions are encoded
//! as OCI whiteout files (`.wh.<name>`) and opaque directories as
//! `.wh..wh..opq` markers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use tracing::debug;

use super::ImageConfig;
use crate::consts::APP_NAME;
use crate::graph::tree::normalize;
use crate::graph::{Entry, FileTree};
use crate::util::hash::sha256_hex;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";
const MANIFEST_FILE: &str = "manifest.json";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum ArchiveError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid JSON in {file}: {source}")]
  Json {
    file: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("archive is missing {0}")]
  MissingEntry(String),

  #[error("archive manifest lists no images")]
  EmptyManifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
  config: String,
  #[serde(default)]
  repo_tags: Option<Vec<String>>,
  layers: Vec<String>,
}

/// An image held in memory: raw config plus layer blobs, bottom first.
#[derive(Debug, Clone)]
pub struct ImageArchive {
  config: Value,
  layers: Vec<Vec<u8>>,
  repo_tags: Vec<String>,
}

impl ImageArchive {
  pub fn new(config: Value, layers: Vec<Vec<u8>>) -> Self {
    Self {
      config,
      layers,
      repo_tags: Vec::new(),
    }
  }

  /// Build a single-layer archive from a plain tree.
  pub fn from_tree(tree: &FileTree, config: Value) -> Result<Self, ArchiveError> {
    let layer = encode_layer(tree)?;
    let mut config = config;
    append_layer_to_config(&mut config, &layer, false);
    Ok(Self::new(config, vec![layer]))
  }

  /// Read the first image of a docker-archive tar stream.
  pub fn read(reader: impl Read) -> Result<Self, ArchiveError> {
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    let mut links: HashMap<String, String> = HashMap::new();

    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
      let mut entry = entry?;
      let raw_path = entry.path()?.to_string_lossy().into_owned();
      let Some(path) = normalize(&raw_path) else {
        continue;
      };
      let entry_type = entry.header().entry_type();
      match entry_type {
        EntryType::Regular => {
          let mut data = Vec::new();
          entry.read_to_end(&mut data)?;
          files.insert(path, data);
        }
        EntryType::Symlink => {
          if let Some(target) = entry.link_name()? {
            let base = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or_default();
            let joined = format!("{}/{}", base, target.to_string_lossy());
            if let Some(resolved) = resolve_relative(&joined) {
              links.insert(path, resolved);
            }
          }
        }
        _ => {}
      }
    }

    let lookup = |name: &str| find_entry(&files, &links, name);

    let manifest: Vec<ManifestEntry> =
      serde_json::from_slice(lookup(MANIFEST_FILE)?).map_err(|source| ArchiveError::Json {
        file: MANIFEST_FILE.to_string(),
        source,
      })?;
    let image = manifest.into_iter().next().ok_or(ArchiveError::EmptyManifest)?;

    let config = serde_json::from_slice(lookup(image.config.as_str())?).map_err(|source| ArchiveError::Json {
      file: image.config.clone(),
      source,
    })?;
    let layers = image
      .layers
      .iter()
      .map(|layer| lookup(layer.as_str()).map(<[u8]>::to_vec))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      config,
      layers,
      repo_tags: image.repo_tags.unwrap_or_default(),
    })
  }

  pub fn config(&self) -> &Value {
    &self.config
  }

  pub fn image_config(&self) -> ImageConfig {
    ImageConfig::from_raw(&self.config)
  }

  pub fn layers(&self) -> &[Vec<u8>] {
    &self.layers
  }

  pub fn repo_tags(&self) -> &[String] {
    &self.repo_tags
  }

  /// The image's root filesystem: every layer applied in order.
  pub fn rootfs(&self) -> Result<FileTree, ArchiveError> {
    let mut tree = FileTree::new();
    for layer in &self.layers {
      tree.apply_layer(&decode_layer(layer)?);
    }
    Ok(tree)
  }

  /// Write this image tagged `name`, with `patch` appended as one extra layer.
  ///
  /// An empty patch adds no layer; the image is only re-tagged.
  pub fn write_patched(&self, patch: &FileTree, name: &str, out: impl Write) -> Result<(), ArchiveError> {
    let patch_layer = if patch.is_empty() { None } else { Some(encode_layer(patch)?) };
    let mut config = self.config.clone();
    let mut blobs: Vec<&[u8]> = self.layers.iter().map(Vec::as_slice).collect();
    if let Some(layer) = &patch_layer {
      append_layer_to_config(&mut config, layer, true);
      blobs.push(layer);
    }

    let config_bytes = serde_json::to_vec(&config).map_err(|source| ArchiveError::Json {
      file: "config".to_string(),
      source,
    })?;
    let config_name = format!("{}.json", sha256_hex(&config_bytes));

    let layer_paths: Vec<String> = blobs
      .iter()
      .map(|blob| format!("{}/layer.tar", sha256_hex(blob)))
      .collect();

    let manifest = vec![ManifestEntry {
      config: config_name.clone(),
      repo_tags: Some(vec![name.to_string()]),
      layers: layer_paths.clone(),
    }];
    let manifest_bytes = serde_json::to_vec(&manifest).map_err(|source| ArchiveError::Json {
      file: MANIFEST_FILE.to_string(),
      source,
    })?;

    let mut builder = Builder::new(out);
    append_file(&mut builder, MANIFEST_FILE, &manifest_bytes, 0o644)?;
    append_file(&mut builder, &config_name, &config_bytes, 0o644)?;

    let mut written = HashSet::new();
    for (path, blob) in layer_paths.iter().zip(&blobs) {
      if written.insert(path.as_str()) {
        append_file(&mut builder, path, blob, 0o644)?;
      }
    }
    builder.into_inner()?.flush()?;

    debug!(image = %name, layers = blobs.len(), "wrote image archive");
    Ok(())
  }
}

fn find_entry<'a>(
  files: &'a HashMap<String, Vec<u8>>,
  links: &HashMap<String, String>,
  name: &str,
) -> Result<&'a [u8], ArchiveError> {
  let key = normalize(name).unwrap_or_default();
  files
    .get(&key)
    .or_else(|| links.get(&key).and_then(|target| files.get(target)))
    .map(Vec::as_slice)
    .ok_or_else(|| ArchiveError::MissingEntry(name.to_string()))
}

fn append_layer_to_config(config: &mut Value, layer: &[u8], record_history: bool) {
  let diff_id = format!("sha256:{}", sha256_hex(layer));
  let Some(obj) = config.as_object_mut() else {
    return;
  };

  let rootfs = obj
    .entry("rootfs")
    .or_insert_with(|| json!({ "type": "layers", "diff_ids": [] }));
  if let Some(rootfs) = rootfs.as_object_mut()
    && let Some(ids) = rootfs.entry("diff_ids").or_insert_with(|| json!([])).as_array_mut()
  {
    ids.push(Value::String(diff_id));
  }

  // Only extend an existing history; a partial history would not match the layer count.
  if record_history && let Some(history) = obj.get_mut("history").and_then(Value::as_array_mut) {
    history.push(json!({
      "created_by": APP_NAME,
      "comment": "patched packages",
    }));
  }
}

/// Normalize a path that may contain `..` components, staying inside the root.
fn resolve_relative(path: &str) -> Option<String> {
  let mut parts: Vec<&str> = Vec::new();
  for part in path.split('/') {
    match part {
      "" | "." => {}
      ".." => {
        parts.pop()?;
      }
      p => parts.push(p),
    }
  }
  if parts.is_empty() { None } else { Some(parts.join("/")) }
}

fn new_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
  let mut header = Header::new_gnu();
  header.set_entry_type(entry_type);
  header.set_mode(mode);
  header.set_size(size);
  header.set_mtime(0);
  header.set_uid(0);
  header.set_gid(0);
  header
}

fn append_file<W: Write>(builder: &mut Builder<W>, path: &str, data: &[u8], mode: u32) -> std::io::Result<()> {
  let mut header = new_header(EntryType::Regular, mode, data.len() as u64);
  builder.append_data(&mut header, path, data)
}

fn join(parent: Option<&str>, name: &str) -> String {
  match parent {
    Some(parent) => format!("{}/{}", parent, name),
    None => name.to_string(),
  }
}

/// Encode a layer tree as an uncompressed tar stream.
pub fn encode_layer(layer: &FileTree) -> Result<Vec<u8>, ArchiveError> {
  let mut builder = Builder::new(Vec::new());

  for (path, entry) in layer.iter() {
    match entry {
      Entry::Dir { mode } => {
        let mut header = new_header(EntryType::Directory, *mode, 0);
        builder.append_data(&mut header, path, std::io::empty())?;
      }
      Entry::OpaqueDir { mode } => {
        let mut header = new_header(EntryType::Directory, *mode, 0);
        builder.append_data(&mut header, path, std::io::empty())?;
        append_file(&mut builder, &format!("{}/{}", path, OPAQUE_MARKER), &[], 0o644)?;
      }
      Entry::File { mode, data } => append_file(&mut builder, path, data, *mode)?,
      Entry::Symlink { target } => {
        let mut header = new_header(EntryType::Symlink, 0o777, 0);
        builder.append_link(&mut header, path, target)?;
      }
      Entry::Whiteout => {
        let (parent, name) = match path.rsplit_once('/') {
          Some((parent, name)) => (Some(parent), name),
          None => (None, path),
        };
        let marker = join(parent, &format!("{}{}", WHITEOUT_PREFIX, name));
        append_file(&mut builder, &marker, &[], 0o644)?;
      }
    }
  }

  Ok(builder.into_inner()?)
}

/// Decode a layer tar stream (plain or gzip) into a layer tree.
pub fn decode_layer(bytes: &[u8]) -> Result<FileTree, ArchiveError> {
  let reader: Box<dyn Read + '_> = if bytes.starts_with(&GZIP_MAGIC) {
    Box::new(GzDecoder::new(bytes))
  } else {
    Box::new(bytes)
  };

  let mut layer = FileTree::new();
  let mut opaque = BTreeSet::new();
  let mut archive = Archive::new(reader);

  for entry in archive.entries()? {
    let mut entry = entry?;
    let raw_path = entry.path()?.to_string_lossy().into_owned();
    let Some(path) = normalize(&raw_path) else {
      continue;
    };
    let (parent, name) = match path.rsplit_once('/') {
      Some((parent, name)) => (Some(parent), name),
      None => (None, path.as_str()),
    };

    if name == OPAQUE_MARKER {
      if let Some(parent) = parent {
        opaque.insert(parent.to_string());
      }
      continue;
    }
    if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
      layer.insert(&join(parent, hidden), Entry::Whiteout);
      continue;
    }

    let entry_type = entry.header().entry_type();
    let mode = entry.header().mode()? & 0o7777;
    match entry_type {
      EntryType::Directory => layer.insert(&path, Entry::Dir { mode }),
      EntryType::Regular | EntryType::Continuous => {
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        layer.insert(&path, Entry::file(data, mode));
      }
      EntryType::Symlink => {
        let target = entry
          .link_name()?
          .map(|t| t.to_string_lossy().into_owned())
          .unwrap_or_default();
        layer.insert(&path, Entry::Symlink { target });
      }
      EntryType::Link => {
        let target = entry.link_name()?.and_then(|t| normalize(&t.to_string_lossy()));
        match target.as_deref().and_then(|t| layer.get(t)).cloned() {
          Some(file @ Entry::File { .. }) => layer.insert(&path, file),
          _ => debug!(path = %path, "skipping hard link to unknown target"),
        }
      }
      other => debug!(path = %path, entry_type = ?other, "skipping special entry"),
    }
  }

  for dir in opaque {
    let mode = match layer.get(&dir) {
      Some(Entry::Dir { mode }) => *mode,
      _ => 0o755,
    };
    layer.insert(&dir, Entry::OpaqueDir { mode });
  }

  Ok(layer)
}
