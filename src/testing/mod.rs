//! Test doubles shared by unit and integration tests: recording
//! store/gate implementations, a scriptable executor, and a counting
//! broker completer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::domain::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, Job, Language, Result, WorkerError,
};
use crate::message::{Completer, JobMessage};
use crate::sandbox::Executor;
use crate::store::{IdempotencyStore, JobStore};

/// Job store double that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingJobStore {
    pub fail_update_status: AtomicBool,
    pub fail_set_result: AtomicBool,
    status_updates: Mutex<Vec<(Uuid, ExecutionStatus)>>,
    results: Mutex<Vec<(Uuid, ExecutionResult, Instant)>>,
}

impl RecordingJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_updates(&self) -> Vec<(Uuid, ExecutionStatus)> {
        self.status_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn results(&self) -> Vec<(Uuid, ExecutionResult, Instant)> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl JobStore for RecordingJobStore {
    fn update_status(&self, job_id: Uuid, status: ExecutionStatus) -> Result<()> {
        if self.fail_update_status.load(Ordering::SeqCst) {
            return Err(WorkerError::Store("scripted update_status failure".into()));
        }
        self.status_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job_id, status));
        Ok(())
    }

    fn set_result(&self, job_id: Uuid, result: &ExecutionResult) -> Result<()> {
        if self.fail_set_result.load(Ordering::SeqCst) {
            return Err(WorkerError::Store("scripted set_result failure".into()));
        }
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job_id, result.clone(), Instant::now()));
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory idempotency gate with the same winner-takes-it semantics as
/// the real store: concurrent acquires for one id admit exactly one caller.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    pub fail_acquire: AtomicBool,
    held: Mutex<HashSet<Uuid>>,
    acquires: Mutex<Vec<Uuid>>,
    releases: Mutex<Vec<Uuid>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-claim an id, simulating a previous delivery that already holds
    /// the lock.
    pub fn preclaim(&self, job_id: Uuid) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id);
    }

    pub fn acquire_calls(&self) -> Vec<Uuid> {
        self.acquires
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn release_calls(&self) -> Vec<Uuid> {
        self.releases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn acquire(&self, job_id: Uuid) -> Result<bool> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(WorkerError::Lock("scripted acquire failure".into()));
        }
        self.acquires
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job_id);
        let acquired = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id);
        Ok(acquired)
    }

    fn release(&self, job_id: Uuid) -> Result<()> {
        self.releases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job_id);
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// How a [`ScriptedExecutor`] behaves for every request.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedBehavior {
    Succeed,
    Fail,
    Panic,
}

/// Executor double with a fixed behavior and an optional artificial delay.
pub struct ScriptedExecutor {
    behavior: ScriptedBehavior,
    delay: Duration,
    pub calls: AtomicU32,
}

impl ScriptedExecutor {
    pub fn new(behavior: ScriptedBehavior) -> Self {
        ScriptedExecutor {
            behavior,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_delay(behavior: ScriptedBehavior, delay: Duration) -> Self {
        ScriptedExecutor {
            behavior,
            delay,
            calls: AtomicU32::new(0),
        }
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, _token: &CancellationToken, req: &ExecutionRequest) -> Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match self.behavior {
            ScriptedBehavior::Succeed => Ok(success_result()),
            ScriptedBehavior::Fail => Err(WorkerError::Sandbox(format!(
                "scripted sandbox failure for {}",
                req.job_id
            ))),
            ScriptedBehavior::Panic => panic!("scripted executor panic"),
        }
    }
}

/// Shared tally of how a batch of [`JobMessage`]s was settled.
#[derive(Default)]
pub struct CompletionLog {
    pub acks: AtomicU32,
    pub requeues: AtomicU32,
    pub dead_letters: AtomicU32,
    ack_times: Mutex<Vec<(Uuid, Instant)>>,
}

impl CompletionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn settled(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
            + self.requeues.load(Ordering::SeqCst)
            + self.dead_letters.load(Ordering::SeqCst)
    }

    pub fn ack_times(&self) -> Vec<(Uuid, Instant)> {
        self.ack_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct CountingCompleter {
    job_id: Uuid,
    log: Arc<CompletionLog>,
}

impl Completer for CountingCompleter {
    fn ack(self: Box<Self>) -> Result<()> {
        self.log.acks.fetch_add(1, Ordering::SeqCst);
        self.log
            .ack_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((self.job_id, Instant::now()));
        Ok(())
    }

    fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        if requeue {
            self.log.requeues.fetch_add(1, Ordering::SeqCst);
        } else {
            self.log.dead_letters.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Wrap a job in a message whose settlement lands in `log`.
pub fn counted_message(job: Job, log: &Arc<CompletionLog>) -> JobMessage {
    let completer = CountingCompleter {
        job_id: job.job_id,
        log: Arc::clone(log),
    };
    JobMessage::new(job, Box::new(completer))
}

pub fn sample_job(language: Language) -> Job {
    Job {
        job_id: Uuid::new_v4(),
        language,
        source_code: match language {
            Language::Python => "print('hello sentinel')".to_string(),
            Language::Cpp => {
                "#include <iostream>\nint main(){std::cout<<\"hello cpp\"<<std::endl;return 0;}"
                    .to_string()
            }
        },
        stdin: String::new(),
        time_limit_ms: 5_000,
        memory_limit_kb: 262_144,
    }
}

pub fn success_result() -> ExecutionResult {
    ExecutionResult {
        stdout: "hello sentinel\n".to_string(),
        stderr: String::new(),
        exit_code: 0,
        status: ExecutionStatus::Success,
        time_used_ms: 42,
        memory_used_kb: 8_192,
    }
}
