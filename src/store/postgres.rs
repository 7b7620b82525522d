//! PostgreSQL-backed job state.

use std::sync::Mutex;

use chrono::Utc;
use postgres::{Client, NoTls};
use uuid::Uuid;

use crate::domain::{ExecutionResult, ExecutionStatus, Result, WorkerError};
use crate::store::JobStore;

/// Terminal set used by the conditional result write, keeping terminal
/// states monotone even under replays.
const TERMINAL_GUARD: &str = "('SUCCESS', 'COMPILATION_ERROR', 'RUNTIME_ERROR', \
                              'TIMEOUT', 'MEMORY_LIMIT_EXCEEDED', 'INTERNAL_ERROR')";

/// Job state adapter over a single lazily reconnecting Postgres client.
pub struct PgJobStore {
    url: String,
    client: Mutex<Option<Client>>,
}

impl PgJobStore {
    pub fn connect(url: &str) -> Result<Self> {
        let client = Client::connect(url, NoTls)
            .map_err(|e| WorkerError::Store(format!("connect postgres: {e}")))?;
        Ok(PgJobStore {
            url: url.to_string(),
            client: Mutex::new(Some(client)),
        })
    }

    /// Run `op` against the cached client, dropping it on error so the next
    /// call reconnects.
    fn with_client<T>(
        &self,
        op: impl FnOnce(&mut Client) -> std::result::Result<T, postgres::Error>,
    ) -> Result<T> {
        let mut guard = self.client.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(
                Client::connect(&self.url, NoTls)
                    .map_err(|e| WorkerError::Store(format!("reconnect postgres: {e}")))?,
            );
        }
        let client = guard.as_mut().expect("client populated above");
        match op(client) {
            Ok(value) => Ok(value),
            Err(e) => {
                *guard = None;
                Err(WorkerError::Store(e.to_string()))
            }
        }
    }
}

impl JobStore for PgJobStore {
    fn update_status(&self, job_id: Uuid, status: ExecutionStatus) -> Result<()> {
        let rows = self.with_client(|client| {
            client.execute(
                "UPDATE execution_jobs SET status = $1, updated_at = $2 WHERE job_id = $3",
                &[&status.as_str(), &Utc::now(), &job_id],
            )
        })?;
        if rows == 0 {
            return Err(WorkerError::JobNotFound(job_id));
        }
        Ok(())
    }

    fn set_result(&self, job_id: Uuid, result: &ExecutionResult) -> Result<()> {
        let query = format!(
            "UPDATE execution_jobs \
             SET stdout = $1, stderr = $2, status = $3, exit_code = $4, \
                 time_used_ms = $5, memory_used_kb = $6, updated_at = $7 \
             WHERE job_id = $8 AND status NOT IN {TERMINAL_GUARD}"
        );
        let time_used_ms = result.time_used_ms as i64;
        let memory_used_kb = result.memory_used_kb as i64;
        let rows = self.with_client(|client| {
            client.execute(
                query.as_str(),
                &[
                    &result.stdout,
                    &result.stderr,
                    &result.status.as_str(),
                    &result.exit_code,
                    &time_used_ms,
                    &memory_used_kb,
                    &Utc::now(),
                    &job_id,
                ],
            )
        })?;
        if rows > 0 {
            return Ok(());
        }

        // Zero rows: either the job does not exist, or it is already
        // terminal and the write is an idempotent no-op.
        let existing = self.with_client(|client| {
            client.query_opt(
                "SELECT status FROM execution_jobs WHERE job_id = $1",
                &[&job_id],
            )
        })?;
        match existing {
            None => Err(WorkerError::JobNotFound(job_id)),
            Some(row) => {
                let status: String = row.get(0);
                log::warn!(
                    "refusing to overwrite terminal state: job_id={job_id} existing_status={status}"
                );
                Ok(())
            }
        }
    }

    fn ping(&self) -> Result<()> {
        self.with_client(|client| client.simple_query("SELECT 1"))?;
        Ok(())
    }
}
