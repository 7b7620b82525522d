//! Core types shared across the worker: the broker wire format, execution
//! requests/results, job lifecycle states, and the crate-wide error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default wall-clock budget applied when the intake omitted the field.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 5_000;
/// Default memory budget applied when the intake omitted the field.
pub const DEFAULT_MEMORY_LIMIT_KB: u64 = 262_144;

/// Legal range for the per-job wall-clock budget, in milliseconds.
pub const TIME_LIMIT_RANGE_MS: (u64, u64) = (1, 30_000);
/// Legal range for the per-job memory budget, in KiB.
pub const MEMORY_LIMIT_RANGE_KB: (u64, u64) = (1_024, 524_288);

/// Supported languages. The set is closed: any other value on the wire is a
/// deserialization failure and the message is dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job in the durable store.
///
/// `Queued` is written by the intake service; the worker transitions a job
/// through `Compiling`/`Running` into exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Compiling,
    Running,
    Success,
    CompilationError,
    RuntimeError,
    Timeout,
    MemoryLimitExceeded,
    InternalError,
}

impl ExecutionStatus {
    /// Terminal states are monotone: no transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::CompilationError
                | ExecutionStatus::RuntimeError
                | ExecutionStatus::Timeout
                | ExecutionStatus::MemoryLimitExceeded
                | ExecutionStatus::InternalError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::Compiling => "COMPILING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::CompilationError => "COMPILATION_ERROR",
            ExecutionStatus::RuntimeError => "RUNTIME_ERROR",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            ExecutionStatus::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as it arrives on the work queue.
///
/// Unknown JSON fields are tolerated and ignored. `time_limit_ms` and
/// `memory_limit_kb` default to 0 here ("absent"); [`Job::execution_request`]
/// substitutes the configured defaults and clamps into the legal ranges.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub language: Language,
    pub source_code: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub time_limit_ms: u64,
    #[serde(default)]
    pub memory_limit_kb: u64,
}

/// Execution limits with their configured defaults.
#[derive(Debug, Clone, Copy)]
pub struct LimitDefaults {
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        LimitDefaults {
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            memory_limit_kb: DEFAULT_MEMORY_LIMIT_KB,
        }
    }
}

impl Job {
    /// Derive the sandbox request, defaulting absent limits and clamping
    /// both into their legal ranges. The intake validates these upstream;
    /// the clamp keeps a forged queue message from stalling a worker.
    pub fn execution_request(&self, defaults: &LimitDefaults) -> ExecutionRequest {
        let time_limit_ms = if self.time_limit_ms == 0 {
            defaults.time_limit_ms
        } else {
            self.time_limit_ms
        }
        .clamp(TIME_LIMIT_RANGE_MS.0, TIME_LIMIT_RANGE_MS.1);

        let memory_limit_kb = if self.memory_limit_kb == 0 {
            defaults.memory_limit_kb
        } else {
            self.memory_limit_kb
        }
        .clamp(MEMORY_LIMIT_RANGE_KB.0, MEMORY_LIMIT_RANGE_KB.1);

        ExecutionRequest {
            job_id: self.job_id,
            language: self.language,
            source_code: self.source_code.clone(),
            stdin: self.stdin.clone(),
            time_limit_ms,
            memory_limit_kb,
        }
    }
}

/// Input to the sandbox executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    pub language: Language,
    pub source_code: String,
    pub stdin: String,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
}

/// Exit-code sentinel for a child that was killed before exiting.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Outcome of one sandbox execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub status: ExecutionStatus,
    pub time_used_ms: u64,
    pub memory_used_kb: u64,
}

/// Worker-wide error type. User-code outcomes are never errors; they are
/// encoded as verdicts in [`ExecutionResult`].
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("lock store error: {0}")]
    Lock(String),

    #[error("job store error: {0}")]
    Store(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    Cancelled,
}

impl WorkerError {
    /// Whether a broker redelivery can plausibly succeed where this attempt
    /// failed. Lock/store round-trips and shutdown aborts are transient;
    /// everything else is deterministic for the payload and dead-letters.
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            WorkerError::Lock(_) | WorkerError::Store(_) | WorkerError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
