use std::fmt;

/// CPU architectures as named in image configs (`amd64`, `arm64`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  Amd64,
  Arm64,
  Arm,
  I386,
  Ppc64le,
  S390x,
}

impl Arch {
  /// Parse an architecture name, accepting kernel-style aliases.
  pub fn parse(name: &str) -> Option<Self> {
    match name.trim().to_lowercase().as_str() {
      "amd64" | "x86_64" => Some(Self::Amd64),
      "arm64" | "aarch64" => Some(Self::Arm64),
      "arm" | "armhf" | "armv7l" => Some(Self::Arm),
      "386" | "i386" | "i686" => Some(Self::I386),
      "ppc64le" => Some(Self::Ppc64le),
      "s390x" => Some(Self::S390x),
      _ => None,
    }
  }

  /// Returns the image-config identifier for this architecture
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Amd64 => "amd64",
      Self::Arm64 => "arm64",
      Self::Arm => "arm",
      Self::I386 => "386",
      Self::Ppc64le => "ppc64le",
      Self::S390x => "s390x",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
