//! Durable state and distributed locking, behind traits so the pipeline and
//! tests stay independent of the concrete backends.

pub mod postgres;
pub mod redis;

pub use postgres::PgJobStore;
pub use redis::RedisIdempotencyStore;

use uuid::Uuid;

use crate::domain::{ExecutionResult, ExecutionStatus, Result};

/// Durable per-job state transitions.
pub trait JobStore: Send + Sync {
    /// Set the job's status and bump `updated_at`.
    fn update_status(&self, job_id: Uuid, status: ExecutionStatus) -> Result<()>;

    /// Atomically store the terminal result. Never overwrites an existing
    /// terminal state.
    fn set_result(&self, job_id: Uuid, result: &ExecutionResult) -> Result<()>;

    /// Liveness probe for the health endpoint.
    fn ping(&self) -> Result<()>;
}

/// Exclusive per-job processing rights on top of at-least-once delivery.
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim the job. `Ok(true)` on first claim, `Ok(false)` when
    /// another delivery already holds it. Fail-closed: store errors must
    /// propagate, never default to `true`.
    fn acquire(&self, job_id: Uuid) -> Result<bool>;

    /// Reset the claim's TTL so late duplicates stay suppressed while the
    /// record is eventually garbage-collected.
    fn release(&self, job_id: Uuid) -> Result<()>;

    /// Liveness probe for the health endpoint.
    fn ping(&self) -> Result<()>;
}
