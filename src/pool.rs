//! Fixed-size worker pool.
//!
//! Workers block on the dispatch channel, run each job through the
//! pipeline, and settle the broker message afterwards. A panic inside the
//! pipeline is recovered and dead-letters the message; the worker thread
//! survives.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::cancel::CancellationToken;
use crate::message::JobMessage;
use crate::observability::metrics;
use crate::pipeline::ExecutionPipeline;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Launch `size` worker threads draining `jobs`.
    pub fn start(
        size: usize,
        jobs: Receiver<JobMessage>,
        pipeline: Arc<ExecutionPipeline>,
        token: CancellationToken,
    ) -> Self {
        log::info!("starting worker pool: pool_size={size}");
        let handles = (0..size)
            .map(|id| {
                let jobs = jobs.clone();
                let pipeline = Arc::clone(&pipeline);
                let token = token.clone();
                thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || worker_loop(id, jobs, pipeline, token))
                    .expect("spawn worker thread")
            })
            .collect();
        WorkerPool { handles }
    }

    /// Wait for every worker to exit. Workers exit once the dispatch
    /// channel is disconnected and drained.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("worker thread panicked outside the recovery guard");
            }
        }
        log::info!("worker pool stopped");
    }
}

fn worker_loop(
    id: usize,
    jobs: Receiver<JobMessage>,
    pipeline: Arc<ExecutionPipeline>,
    token: CancellationToken,
) {
    log::debug!("worker {id} started");

    // recv drains messages still buffered after the consumer drops its
    // sender, then reports disconnection; nothing is silently abandoned.
    while let Ok(message) = jobs.recv() {
        if token.is_cancelled() {
            requeue_on_shutdown(message);
            continue;
        }
        handle_message(id, message, &pipeline, &token);
    }

    log::debug!("worker {id} exiting: dispatch channel closed");
}

fn requeue_on_shutdown(message: JobMessage) {
    let job_id = message.job.job_id;
    log::debug!("shutdown drain, requeueing: job_id={job_id}");
    if let Err(e) = message.nack(true) {
        // The broker requeues unacked deliveries when the connection
        // closes, so a failed nack here does not lose the message.
        log::debug!("requeue nack failed during shutdown: job_id={job_id} err={e}");
    }
}

fn handle_message(
    id: usize,
    message: JobMessage,
    pipeline: &ExecutionPipeline,
    token: &CancellationToken,
) {
    let job_id = message.job.job_id;
    let language = message.job.language;
    log::info!("worker {id} processing job: job_id={job_id} language={language}");

    metrics().workers_active.inc();
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| pipeline.process(token, &message.job)));
    let elapsed = started.elapsed();
    metrics().workers_active.dec();
    metrics().observe_duration(language, elapsed);

    match outcome {
        Err(panic_payload) => {
            log::error!(
                "worker {id} recovered panic: job_id={job_id} payload={:?}",
                panic_payload_str(&panic_payload)
            );
            metrics().record_execution_error(language);
            if let Err(e) = message.nack(false) {
                log::error!("failed to dead-letter after panic: job_id={job_id} err={e}");
            }
        }
        Ok(Err(e)) => {
            let requeue = e.is_requeueable();
            log::error!(
                "job execution failed: job_id={job_id} requeue={requeue} err={e}"
            );
            if let Err(nack_err) = message.nack(requeue) {
                log::error!("failed to nack message: job_id={job_id} err={nack_err}");
            }
        }
        Ok(Ok(true)) => {
            log::debug!("duplicate job acked: job_id={job_id}");
            if let Err(e) = message.ack() {
                log::error!("failed to ack duplicate: job_id={job_id} err={e}");
            }
        }
        Ok(Ok(false)) => {
            if let Err(e) = message.ack() {
                log::error!("failed to ack message: job_id={job_id} err={e}");
            }
        }
    }
}

fn panic_payload_str(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
