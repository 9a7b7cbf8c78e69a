pub mod hash;
pub mod shell;
