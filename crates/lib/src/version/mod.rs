//! Per-ecosystem version ordering.
//!
//! No ordering between version strings is assumed outside a matching
//! comparer: each ecosystem supplies its own validity and ordering rules.

mod debian;
mod semantic;

pub use debian::DebianComparer;
pub use semantic::{SemverComparer, parse_lenient};

/// Validity and strict ordering predicates for one ecosystem's versions.
pub trait VersionComparer: Send + Sync {
  fn is_valid(&self, version: &str) -> bool;

  /// Returns true if `a` sorts strictly before `b`.
  ///
  /// Invalid input on either side compares as not-less.
  fn less_than(&self, a: &str, b: &str) -> bool;

  fn equal(&self, a: &str, b: &str) -> bool {
    self.is_valid(a) && self.is_valid(b) && !self.less_than(a, b) && !self.less_than(b, a)
  }
}
