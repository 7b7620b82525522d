//! Metrics and health HTTP endpoint.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tiny_http::{Header, Method, Response, Server};

use crate::cancel::CancellationToken;
use crate::domain::{Result, WorkerError};
use crate::observability::metrics;
use crate::store::{IdempotencyStore, JobStore};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Serves `GET /metrics` (Prometheus text) and `GET /healthz` (store and
/// lock-store liveness) until the token cancels.
pub struct MetricsServer {
    handle: JoinHandle<()>,
}

impl MetricsServer {
    pub fn spawn(
        port: u16,
        store: Arc<dyn JobStore>,
        locks: Arc<dyn IdempotencyStore>,
        token: CancellationToken,
    ) -> Result<Self> {
        let server = Server::http(("0.0.0.0", port))
            .map_err(|e| WorkerError::Config(format!("bind metrics port {port}: {e}")))?;
        log::info!("metrics endpoint listening on :{port}");

        let handle = thread::spawn(move || serve(server, store, locks, token));
        Ok(MetricsServer { handle })
    }

    /// Wait for the serving thread to observe cancellation and exit.
    pub fn join(self) {
        if self.handle.join().is_err() {
            log::error!("metrics server thread panicked");
        }
    }
}

fn serve(
    server: Server,
    store: Arc<dyn JobStore>,
    locks: Arc<dyn IdempotencyStore>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            return;
        }
        match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => handle_request(request, store.as_ref(), locks.as_ref()),
            Ok(None) => continue,
            Err(e) => {
                log::warn!("metrics server receive error: {e}");
            }
        }
    }
}

fn handle_request(request: tiny_http::Request, store: &dyn JobStore, locks: &dyn IdempotencyStore) {
    let response = match (request.method(), request.url()) {
        (Method::Get, "/metrics") => {
            plain_text(metrics().export_prometheus(), 200)
        }
        (Method::Get, "/healthz") => {
            if let Err(e) = store.ping() {
                plain_text(format!("job store unreachable: {e}\n"), 503)
            } else if let Err(e) = locks.ping() {
                plain_text(format!("lock store unreachable: {e}\n"), 503)
            } else {
                plain_text("ok\n".to_string(), 200)
            }
        }
        _ => plain_text("not found\n".to_string(), 404),
    };
    if let Err(e) = request.respond(response) {
        log::warn!("metrics server respond error: {e}");
    }
}

fn plain_text(body: String, status: u32) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body).with_status_code(status as u16);
    if let Ok(header) =
        Header::from_bytes(&b"Content-Type"[..], &b"text/plain; charset=utf-8"[..])
    {
        response = response.with_header(header);
    }
    response
}
