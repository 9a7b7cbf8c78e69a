//! Platform identification for images being patched.
//!
//! - `os`: OS family detection from `/etc/os-release`
//! - `arch`: CPU architecture names as found in image configs and reports

pub mod arch;
pub mod os;

pub use arch::Arch;
pub use os::{DetectError, OsFamily, parse_os_release};
