//! Per-job orchestration: idempotency gate, state transitions, sandbox
//! execution, result persistence.

use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::domain::{ExecutionStatus, Job, Language, LimitDefaults, Result, WorkerError};
use crate::observability::metrics;
use crate::sandbox::Executor;
use crate::store::{IdempotencyStore, JobStore};

/// Binds the gate, the store, and the executor into the per-job state
/// machine. The return value of [`process`](Self::process) tells the worker
/// pool what to do with the broker message:
///
/// - `Ok(false)` — terminal state durably written, ack.
/// - `Ok(true)`  — duplicate delivery, ack without side effects.
/// - `Err(_)`    — requeue or dead-letter according to the error kind.
pub struct ExecutionPipeline {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn IdempotencyStore>,
    executor: Arc<dyn Executor>,
    defaults: LimitDefaults,
}

impl ExecutionPipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn IdempotencyStore>,
        executor: Arc<dyn Executor>,
        defaults: LimitDefaults,
    ) -> Self {
        ExecutionPipeline {
            store,
            locks,
            executor,
            defaults,
        }
    }

    /// Process one delivery to completion. Returns `Ok(true)` when another
    /// delivery of the same job already holds (or held) the processing lock.
    pub fn process(&self, token: &CancellationToken, job: &Job) -> Result<bool> {
        if token.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let acquired = self.locks.acquire(job.job_id).map_err(|e| {
            log::error!("acquire idempotency lock failed: job_id={} err={e}", job.job_id);
            metrics().record_execution_error(job.language);
            e
        })?;
        if !acquired {
            log::info!("duplicate delivery detected, skipping: job_id={}", job.job_id);
            return Ok(true);
        }

        // Non-terminal visibility for pollers while the sandbox runs.
        let initial = if job.language == Language::Cpp {
            ExecutionStatus::Compiling
        } else {
            ExecutionStatus::Running
        };
        if let Err(e) = self.store.update_status(job.job_id, initial) {
            log::error!("update initial status failed: job_id={} err={e}", job.job_id);
            metrics().record_execution_error(job.language);
            return Err(e);
        }

        let request = job.execution_request(&self.defaults);
        let result = match self.executor.execute(token, &request) {
            Ok(result) => result,
            Err(e) => {
                log::error!("sandbox execution failed: job_id={} err={e}", job.job_id);
                // Best-effort: pollers should see the failure even though the
                // message is headed to the dead-letter queue.
                let _ = self
                    .store
                    .update_status(job.job_id, ExecutionStatus::InternalError);
                metrics().sandbox_failures.inc();
                metrics().record_execution(job.language, ExecutionStatus::InternalError);
                return Err(e);
            }
        };

        if let Err(e) = self.store.set_result(job.job_id, &result) {
            log::error!("store result failed: job_id={} err={e}", job.job_id);
            metrics().record_execution_error(job.language);
            return Err(e);
        }

        // Release extends the record's TTL so late duplicates stay
        // suppressed; failure here must not fail the job.
        if let Err(e) = self.locks.release(job.job_id) {
            log::warn!("release idempotency lock failed: job_id={} err={e}", job.job_id);
        }

        metrics().record_execution(job.language, result.status);
        log::info!(
            "job executed: job_id={} status={} time_used_ms={} memory_used_kb={}",
            job.job_id,
            result.status,
            result.time_used_ms,
            result.memory_used_kb
        );

        Ok(false)
    }
}
