use std::cmp::Ordering;

use super::VersionComparer;

/// dpkg version ordering: `[epoch:]upstream[-revision]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebianComparer;

impl VersionComparer for DebianComparer {
  fn is_valid(&self, version: &str) -> bool {
    DebVersion::parse(version).is_some()
  }

  fn less_than(&self, a: &str, b: &str) -> bool {
    match (DebVersion::parse(a), DebVersion::parse(b)) {
      (Some(va), Some(vb)) => va.compare(&vb) == Ordering::Less,
      _ => false,
    }
  }
}

#[derive(Debug, PartialEq, Eq)]
struct DebVersion<'a> {
  epoch: u64,
  upstream: &'a str,
  revision: &'a str,
}

impl<'a> DebVersion<'a> {
  fn parse(version: &'a str) -> Option<Self> {
    let v = version.trim();
    if v.is_empty() || v.chars().any(char::is_whitespace) {
      return None;
    }

    let (epoch, rest) = match v.split_once(':') {
      Some((epoch, rest)) => {
        if epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
          return None;
        }
        (epoch.parse::<u64>().ok()?, rest)
      }
      None => (0, v),
    };

    let (upstream, revision) = match rest.rfind('-') {
      Some(idx) => (&rest[..idx], &rest[idx + 1..]),
      None => (rest, ""),
    };
    if rest.contains('-') && revision.is_empty() {
      return None;
    }

    let starts_with_digit = upstream.bytes().next().is_some_and(|b| b.is_ascii_digit());
    let upstream_ok = upstream
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b".+~-:".contains(&b));
    let revision_ok = revision.bytes().all(|b| b.is_ascii_alphanumeric() || b".+~".contains(&b));
    if !starts_with_digit || !upstream_ok || !revision_ok {
      return None;
    }

    Some(Self {
      epoch,
      upstream,
      revision,
    })
  }

  fn compare(&self, other: &Self) -> Ordering {
    self
      .epoch
      .cmp(&other.epoch)
      .then_with(|| verrevcmp(self.upstream, other.upstream))
      .then_with(|| verrevcmp(self.revision, other.revision))
  }
}

/// Weight of a non-digit character: `~` before end-of-string before letters before symbols.
fn order(c: Option<u8>) -> i32 {
  match c {
    None => 0,
    Some(c) if c.is_ascii_digit() => 0,
    Some(c) if c.is_ascii_alphabetic() => c as i32,
    Some(b'~') => -1,
    Some(c) => c as i32 + 256,
  }
}

fn verrevcmp(a: &str, b: &str) -> Ordering {
  let (a, b) = (a.as_bytes(), b.as_bytes());
  let (mut i, mut j) = (0, 0);
  let is_digit = |s: &[u8], k: usize| s.get(k).is_some_and(u8::is_ascii_digit);

  while i < a.len() || j < b.len() {
    while (i < a.len() && !is_digit(a, i)) || (j < b.len() && !is_digit(b, j)) {
      let ac = order(a.get(i).copied());
      let bc = order(b.get(j).copied());
      if ac != bc {
        return ac.cmp(&bc);
      }
      i += 1;
      j += 1;
    }

    while a.get(i) == Some(&b'0') {
      i += 1;
    }
    while b.get(j) == Some(&b'0') {
      j += 1;
    }

    let mut first_diff = 0i32;
    while is_digit(a, i) && is_digit(b, j) {
      if first_diff == 0 {
        first_diff = a[i] as i32 - b[j] as i32;
      }
      i += 1;
      j += 1;
    }
    if is_digit(a, i) {
      return Ordering::Greater;
    }
    if is_digit(b, j) {
      return Ordering::Less;
    }
    if first_diff != 0 {
      return first_diff.cmp(&0);
    }
  }
  Ordering::Equal
}
