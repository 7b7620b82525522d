//! Process entry: wiring, signal handling, and the ordered shutdown
//! sequence that keeps in-flight messages from being lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::consumer::Consumer;
use crate::observability::MetricsServer;
use crate::pipeline::ExecutionPipeline;
use crate::pool::WorkerPool;
use crate::sandbox::SandboxExecutor;
use crate::store::{IdempotencyStore, JobStore, PgJobStore, RedisIdempotencyStore};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    // Async-signal-safe: just flip the flag, the main loop does the rest.
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

pub fn run() -> anyhow::Result<()> {
    env_logger::init();
    install_signal_handlers();

    let cfg = Config::parse();
    log::info!(
        "starting sentinel worker: pool_size={} queue_host={}",
        cfg.pool_size,
        cfg.broker_url
            .split('@')
            .next_back()
            .unwrap_or("<unparsed>")
    );

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::connect(&cfg.store_url)?);
    log::info!("connected to job store");
    let locks: Arc<dyn IdempotencyStore> =
        Arc::new(RedisIdempotencyStore::connect(&cfg.lock_store_url)?);
    log::info!("connected to lock store");

    let executor = Arc::new(SandboxExecutor::new(
        &cfg.sandbox_tool_path,
        &cfg.sandbox_config_dir,
    ));
    let pipeline = Arc::new(ExecutionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        executor,
        cfg.limit_defaults(),
    ));

    let token = CancellationToken::new();
    let (jobs_tx, jobs_rx) = crossbeam_channel::bounded(cfg.dispatch_capacity());

    let pool = WorkerPool::start(cfg.pool_size, jobs_rx, pipeline, token.clone());

    let consumer = Consumer::new(cfg.broker_url.clone(), jobs_tx, token.clone());
    let consumer_handle = thread::Builder::new()
        .name("consumer".to_string())
        .spawn(move || {
            if let Err(e) = consumer.run() {
                log::error!("consumer terminated with error: {e}");
            }
        })?;

    let metrics_server = MetricsServer::spawn(
        cfg.metrics_port,
        Arc::clone(&store),
        Arc::clone(&locks),
        token.clone(),
    )?;

    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    log::info!("shutdown signal received, draining");

    // Order matters: cancel stops the consumer first (no further
    // deliveries); joining it drops the dispatch sender, so workers drain
    // the remaining buffered messages as requeues and exit on disconnect.
    token.cancel();
    if consumer_handle.join().is_err() {
        log::error!("consumer thread panicked");
    }
    pool.join();
    metrics_server.join();

    log::info!("worker stopped");
    Ok(())
}
