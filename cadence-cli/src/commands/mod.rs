//! CLI command implementations.

pub mod check;
pub mod run;

pub use check::check_manifest;
pub use run::{run_manifest, RunOptions};
