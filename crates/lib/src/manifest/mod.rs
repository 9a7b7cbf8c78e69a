//! Update manifest types.
//!
//! The manifest is produced once per run by a report parser and is read-only
//! afterwards. It lists OS package updates and language package updates.

mod types;

pub use types::*;
