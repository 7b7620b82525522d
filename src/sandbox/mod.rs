//! Sandbox execution.
//!
//! One call to [`Executor::execute`] performs one complete isolated run of a
//! job and returns a classified result. User-attributable failures are
//! verdicts, never errors; only an unusable sandbox tool or scratch
//! directory surfaces as `Err`.

pub mod cgroup;
pub mod executor;
pub mod output;

pub use executor::SandboxExecutor;

use crate::cancel::CancellationToken;
use crate::domain::{ExecutionRequest, ExecutionResult, Result};

/// Seam between the orchestration pipeline and the sandbox.
pub trait Executor: Send + Sync {
    /// Run the request to completion, honoring the cancellation token.
    ///
    /// On return, every process spawned for this call has been reaped or
    /// killed and the scratch workspace is gone.
    fn execute(&self, token: &CancellationToken, req: &ExecutionRequest) -> Result<ExecutionResult>;
}
