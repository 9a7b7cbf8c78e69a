mod patch;

pub use patch::{PatchArgs, cmd_patch};
