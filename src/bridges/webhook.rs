use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, info, warn};

use crate::bridges::telegram::validate_update_shape;
use crate::capture::WorkItem;
use crate::error::{CaptureError, CaptureResult};

const MAX_BODY_BYTES: u64 = 1024 * 1024;
const ACCEPT_WAIT: Duration = Duration::from_millis(250);
const MAX_SYNC_WAITERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Webhook,
    Sync,
    Health,
    NotFound,
}

fn route(method: &Method, url: &str) -> Route {
    let path = url.split('?').next().unwrap_or(url).trim_end_matches('/');
    match (method, path) {
        (Method::Post, "/webhook") => Route::Webhook,
        (Method::Post, "/sync") => Route::Sync,
        (Method::Get, "/health") | (Method::Get, "") => Route::Health,
        _ => Route::NotFound,
    }
}

pub(crate) fn parse_json_body(request: &mut Request) -> Result<Value, String> {
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
        .map_err(|e| format!("read body: {e}"))?;
    if body.trim().is_empty() {
        return Err("empty body".to_string());
    }
    serde_json::from_str(&body).map_err(|e| format!("json: {e}"))
}

fn json_response(status: u16, body: Value) -> Response<Cursor<Vec<u8>>> {
    let response = Response::from_string(body.to_string()).with_status_code(status);
    match Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn respond(request: Request, response: Response<Cursor<Vec<u8>>>) {
    if let Err(err) = request.respond(response) {
        debug!(error = %err, "client went away before the response");
    }
}

/// Binds and serves until `shutdown` is set.
pub(crate) fn run_webhook_server(
    bind: &str,
    port: u16,
    tx: Sender<WorkItem>,
    sync_wait: Duration,
    shutdown: &AtomicBool,
) -> CaptureResult<()> {
    let addr = format!("{bind}:{port}");
    let server = Server::http(&addr).map_err(|e| CaptureError::Config(format!("bind {addr}: {e}")))?;
    info!(%addr, "webhook endpoint listening");
    serve(&server, tx, sync_wait, shutdown)
}

/// Releases a `/sync` slot when the waiting thread finishes.
struct SyncSlot(Arc<AtomicUsize>);

impl SyncSlot {
    fn acquire(waiters: &Arc<AtomicUsize>) -> Option<Self> {
        if waiters.fetch_add(1, Ordering::SeqCst) >= MAX_SYNC_WAITERS {
            waiters.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self(Arc::clone(waiters)))
    }
}

impl Drop for SyncSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn serve(server: &Server, tx: Sender<WorkItem>, sync_wait: Duration, shutdown: &AtomicBool) -> CaptureResult<()> {
    let sync_waiters = Arc::new(AtomicUsize::new(0));
    while !shutdown.load(Ordering::SeqCst) {
        let mut request = match server.recv_timeout(ACCEPT_WAIT) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, "failed to accept request");
                continue;
            }
        };
        match route(request.method(), request.url()) {
            Route::Webhook => {
                let response = accept_update(&mut request, &tx);
                respond(request, response);
            }
            Route::Sync => {
                let Some(slot) = SyncSlot::acquire(&sync_waiters) else {
                    warn!("too many manual syncs waiting, refusing another");
                    respond(
                        request,
                        json_response(429, serde_json::json!({ "ok": false, "error": "sync already in progress" })),
                    );
                    continue;
                };
                let tx = tx.clone();
                // The reply waits on a full cycle; keep accepting deliveries meanwhile.
                thread::spawn(move || {
                    let _slot = slot;
                    let response = run_manual_sync(&tx, sync_wait);
                    respond(request, response);
                });
            }
            Route::Health => respond(request, json_response(200, serde_json::json!({ "ok": true }))),
            Route::NotFound => respond(
                request,
                json_response(404, serde_json::json!({ "ok": false, "error": "not found" })),
            ),
        }
    }
    info!("webhook endpoint stopped");
    Ok(())
}

/// Always acknowledges decodable-or-not payloads: the source would
/// otherwise redeliver the same garbage forever. Only a dead worker makes
/// the delivery fail so that it is retried.
fn accept_update(request: &mut Request, tx: &Sender<WorkItem>) -> Response<Cursor<Vec<u8>>> {
    let payload = match parse_json_body(request) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "discarding unreadable webhook body");
            return json_response(200, serde_json::json!({ "ok": true }));
        }
    };
    let update_id = match validate_update_shape(&payload) {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "discarding webhook payload");
            return json_response(200, serde_json::json!({ "ok": true }));
        }
    };
    if tx.send(WorkItem::Update(payload)).is_err() {
        warn!(update_id, "capture worker is gone, refusing delivery");
        return json_response(503, serde_json::json!({ "ok": false, "error": CaptureError::WorkerGone.to_string() }));
    }
    debug!(update_id, "update queued");
    json_response(200, serde_json::json!({ "ok": true }))
}

fn run_manual_sync(tx: &Sender<WorkItem>, wait: Duration) -> Response<Cursor<Vec<u8>>> {
    let (reply_tx, reply_rx) = mpsc::channel();
    if tx.send(WorkItem::Sync(reply_tx)).is_err() {
        return json_response(503, serde_json::json!({ "ok": false, "error": CaptureError::WorkerGone.to_string() }));
    }
    match reply_rx.recv_timeout(wait) {
        Ok(Ok(report)) => {
            info!(added = report.added, total = report.total, "manual sync finished");
            json_response(
                200,
                serde_json::json!({
                    "ok": true,
                    "added": report.added,
                    "total": report.total,
                    "cursor": report.cursor,
                    "summary": report.summary(),
                }),
            )
        }
        Ok(Err(err)) => json_response(500, serde_json::json!({ "ok": false, "error": err })),
        Err(_) => json_response(504, serde_json::json!({ "ok": false, "error": "sync did not finish in time" })),
    }
}
