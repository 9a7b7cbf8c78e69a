//! Docker-style image references.
//!
//! Parsing follows the docker CLI's normalisation: references without a
//! registry live on `docker.io`, single-component names there gain a
//! `library/` prefix, and name-only references are tagged `latest`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::consts::{DEFAULT_PATCHED_TAG_SUFFIX, DEFAULT_REGISTRY, DEFAULT_TAG};

const LEGACY_REGISTRY: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const NAME_MAX_LEN: usize = 255;

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?$")
    .expect("invalid domain pattern")
});
static PATH_COMPONENT: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("invalid path pattern"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("invalid tag pattern"));
static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$").expect("invalid digest pattern")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
  #[error("invalid reference format: {0}")]
  InvalidFormat(String),

  #[error("invalid reference format: repository name ({0}) must be lowercase")]
  Uppercase(String),

  #[error("repository name must not be more than {NAME_MAX_LEN} characters: {0}")]
  NameTooLong(String),

  #[error("invalid tag format: {0}")]
  InvalidTag(String),

  #[error("invalid digest format: {0}")]
  InvalidDigest(String),
}

/// A normalised `[domain/]path[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
  domain: String,
  path: String,
  tag: Option<String>,
  digest: Option<String>,
}

impl ImageReference {
  pub fn parse_normalized(input: &str) -> Result<Self, ReferenceError> {
    if input.is_empty() {
      return Err(ReferenceError::InvalidFormat(input.to_string()));
    }

    let (rest, digest) = match input.split_once('@') {
      Some((rest, digest)) => {
        if !DIGEST.is_match(digest) {
          return Err(ReferenceError::InvalidDigest(digest.to_string()));
        }
        (rest, Some(digest.to_string()))
      }
      None => (input, None),
    };

    // A colon after the last slash separates the tag; earlier ones are ports.
    let (name, tag) = match rest.rfind(':') {
      Some(idx) if !rest[idx..].contains('/') => (&rest[..idx], Some(&rest[idx + 1..])),
      _ => (rest, None),
    };
    if let Some(tag) = tag {
      validate_tag(tag)?;
    }

    let (domain, path) = split_domain(name);
    if path.is_empty() || !DOMAIN.is_match(&domain) {
      return Err(ReferenceError::InvalidFormat(input.to_string()));
    }
    if path.chars().any(|c| c.is_ascii_uppercase()) {
      return Err(ReferenceError::Uppercase(path));
    }
    if !path.split('/').all(|component| PATH_COMPONENT.is_match(component)) {
      return Err(ReferenceError::InvalidFormat(input.to_string()));
    }
    if domain.len() + 1 + path.len() > NAME_MAX_LEN {
      return Err(ReferenceError::NameTooLong(format!("{}/{}", domain, path)));
    }

    Ok(Self {
      domain,
      path,
      tag: tag.map(str::to_string),
      digest,
    })
  }

  /// Registry host, e.g. `docker.io`.
  pub fn domain(&self) -> &str {
    &self.domain
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  /// Fully qualified repository name without tag or digest.
  pub fn name(&self) -> String {
    format!("{}/{}", self.domain, self.path)
  }

  pub fn tag(&self) -> Option<&str> {
    self.tag.as_deref()
  }

  pub fn digest(&self) -> Option<&str> {
    self.digest.as_deref()
  }

  pub fn is_name_only(&self) -> bool {
    self.tag.is_none() && self.digest.is_none()
  }

  /// Tag name-only references with `latest`.
  pub fn with_default_tag(mut self) -> Self {
    if self.is_name_only() {
      self.tag = Some(DEFAULT_TAG.to_string());
    }
    self
  }
}

impl fmt::Display for ImageReference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())?;
    if let Some(tag) = &self.tag {
      write!(f, ":{}", tag)?;
    }
    if let Some(digest) = &self.digest {
      write!(f, "@{}", digest)?;
    }
    Ok(())
  }
}

impl FromStr for ImageReference {
  type Err = ReferenceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse_normalized(s)
  }
}

fn split_domain(name: &str) -> (String, String) {
  let (domain, path) = match name.split_once('/') {
    Some((first, rest)) if first.contains(['.', ':']) || first == "localhost" || first.chars().any(char::is_uppercase) => {
      (first.to_string(), rest.to_string())
    }
    _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
  };
  let domain = if domain == LEGACY_REGISTRY {
    DEFAULT_REGISTRY.to_string()
  } else {
    domain
  };
  if domain == DEFAULT_REGISTRY && !path.contains('/') {
    return (domain, format!("{}{}", OFFICIAL_REPO_PREFIX, path));
  }
  (domain, path)
}

pub fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
  if TAG.is_match(tag) {
    Ok(())
  } else {
    Err(ReferenceError::InvalidTag(tag.to_string()))
  }
}

/// The source image and the name its patched copy is tagged with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
  pub source: ImageReference,
  pub patched_tag: String,
  /// `<name>:<patched tag>`.
  pub patched_name: String,
}

impl PatchTarget {
  /// Normalise `image` and derive the patched tag.
  ///
  /// An explicit non-empty `patched_tag` wins; otherwise the source tag gets
  /// a `-patched` suffix, and digest-only references use `patched`.
  pub fn resolve(image: &str, patched_tag: Option<&str>) -> Result<Self, ReferenceError> {
    let mut source = ImageReference::parse_normalized(image)?;
    if source.is_name_only() {
      warn!(image, "image name has no tag or digest, using {} as tag", DEFAULT_TAG);
      source = source.with_default_tag();
    }

    let patched_tag = match (patched_tag.filter(|t| !t.is_empty()), source.tag()) {
      (Some(explicit), _) => explicit.to_string(),
      (None, Some(tag)) => format!("{}-{}", tag, DEFAULT_PATCHED_TAG_SUFFIX),
      (None, None) => {
        warn!(
          image,
          "no output tag specified for digest-referenced image, defaulting to `{}`", DEFAULT_PATCHED_TAG_SUFFIX
        );
        DEFAULT_PATCHED_TAG_SUFFIX.to_string()
      }
    };
    validate_tag(&patched_tag)?;

    let patched_name = format!("{}:{}", source.name(), patched_tag);
    Ok(Self {
      source,
      patched_tag,
      patched_name,
    })
  }
}
