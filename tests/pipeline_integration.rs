//! Pipeline-level behavior: idempotency, state transitions, and error
//! routing, exercised against the in-crate test doubles.

use std::sync::Arc;
use std::thread;

use sentinel_worker::cancel::CancellationToken;
use sentinel_worker::domain::{ExecutionStatus, Language, LimitDefaults, WorkerError};
use sentinel_worker::pipeline::ExecutionPipeline;
use sentinel_worker::testing::{
    sample_job, InMemoryIdempotencyStore, RecordingJobStore, ScriptedBehavior, ScriptedExecutor,
};

struct Harness {
    store: Arc<RecordingJobStore>,
    locks: Arc<InMemoryIdempotencyStore>,
    executor: Arc<ScriptedExecutor>,
    pipeline: Arc<ExecutionPipeline>,
}

fn harness(behavior: ScriptedBehavior) -> Harness {
    let store = Arc::new(RecordingJobStore::new());
    let locks = Arc::new(InMemoryIdempotencyStore::new());
    let executor = Arc::new(ScriptedExecutor::new(behavior));
    let pipeline = Arc::new(ExecutionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        Arc::clone(&executor),
        LimitDefaults::default(),
    ));
    Harness {
        store,
        locks,
        executor,
        pipeline,
    }
}

#[test]
fn python_job_runs_and_persists_a_terminal_result() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();

    let duplicate = h.pipeline.process(&token, &job).expect("process succeeds");
    assert!(!duplicate);

    let updates = h.store.status_updates();
    assert_eq!(updates, vec![(job.job_id, ExecutionStatus::Running)]);

    let results = h.store.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, job.job_id);
    assert_eq!(results[0].1.status, ExecutionStatus::Success);

    assert_eq!(h.locks.acquire_calls(), vec![job.job_id]);
    assert_eq!(h.locks.release_calls(), vec![job.job_id]);
}

#[test]
fn cpp_job_is_marked_compiling_first() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Cpp);
    let token = CancellationToken::new();

    h.pipeline.process(&token, &job).expect("process succeeds");

    assert_eq!(
        h.store.status_updates(),
        vec![(job.job_id, ExecutionStatus::Compiling)]
    );
}

#[test]
fn duplicate_delivery_is_skipped_without_side_effects() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();
    h.locks.preclaim(job.job_id);

    let duplicate = h.pipeline.process(&token, &job).expect("process succeeds");

    assert!(duplicate);
    assert!(h.store.status_updates().is_empty());
    assert!(h.store.results().is_empty());
    assert_eq!(h.executor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

// Replaying an identical envelope after a completed run must not touch the
// durable result again: the retained lock record suppresses it.
#[test]
fn replay_after_success_writes_no_second_result() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();

    assert!(!h.pipeline.process(&token, &job).unwrap());
    assert!(h.pipeline.process(&token, &job).unwrap());

    assert_eq!(h.store.results().len(), 1);
    assert_eq!(h.store.status_updates().len(), 1);
}

// However many concurrent deliveries race on one job id, exactly one
// produces the side effects.
#[test]
fn at_most_once_under_concurrent_redelivery() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = Arc::clone(&h.pipeline);
        let job = job.clone();
        let token = token.clone();
        handles.push(thread::spawn(move || pipeline.process(&token, &job)));
    }

    let outcomes: Vec<bool> = handles
        .into_iter()
        .map(|handle| handle.join().expect("no panic").expect("no error"))
        .collect();

    let winners = outcomes.iter().filter(|duplicate| !**duplicate).count();
    assert_eq!(winners, 1, "exactly one delivery may win the gate");
    assert_eq!(h.store.results().len(), 1);
    assert_eq!(h.store.status_updates().len(), 1);
}

#[test]
fn lock_store_failure_fails_closed_with_a_requeueable_error() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();
    h.locks
        .fail_acquire
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h.pipeline.process(&token, &job).unwrap_err();

    assert!(matches!(err, WorkerError::Lock(_)));
    assert!(err.is_requeueable());
    assert_eq!(h.executor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(h.store.results().is_empty());
}

#[test]
fn status_update_failure_is_requeueable_and_skips_the_sandbox() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();
    h.store
        .fail_update_status
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h.pipeline.process(&token, &job).unwrap_err();

    assert!(err.is_requeueable());
    assert_eq!(h.executor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn sandbox_failure_marks_internal_error_and_dead_letters() {
    let h = harness(ScriptedBehavior::Fail);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();

    let err = h.pipeline.process(&token, &job).unwrap_err();

    assert!(matches!(err, WorkerError::Sandbox(_)));
    assert!(!err.is_requeueable());
    // Best-effort INTERNAL_ERROR status was written for pollers.
    let updates = h.store.status_updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].1, ExecutionStatus::InternalError);
    assert!(h.store.results().is_empty());
}

#[test]
fn result_write_failure_is_requeueable() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();
    h.store
        .fail_set_result
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h.pipeline.process(&token, &job).unwrap_err();

    assert!(matches!(err, WorkerError::Store(_)));
    assert!(err.is_requeueable());
    // The lock is intentionally not released on this path; the redelivery
    // window is covered by the TTL.
    assert!(h.locks.release_calls().is_empty());
}

#[test]
fn cancelled_token_aborts_before_any_round_trip() {
    let h = harness(ScriptedBehavior::Succeed);
    let job = sample_job(Language::Python);
    let token = CancellationToken::new();
    token.cancel();

    let err = h.pipeline.process(&token, &job).unwrap_err();

    assert!(matches!(err, WorkerError::Cancelled));
    assert!(err.is_requeueable());
    assert!(h.locks.acquire_calls().is_empty());
    assert!(h.store.status_updates().is_empty());
}
