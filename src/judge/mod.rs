//! Language adapters.
//!
//! The sandbox executor stays language-agnostic. Adapters define the source
//! file name, the sandbox profile, and the compile/run command lines for
//! each language.

pub mod adapter;
pub mod languages;
pub mod registry;

/// Path at which a job's scratch directory is bind-mounted inside the
/// sandbox. Every command line an adapter produces refers to files under it.
pub const SANDBOX_WORK_DIR: &str = "/tmp/work";
