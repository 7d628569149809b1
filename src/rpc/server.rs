//! RPC server.
//!
//! Reads request frames from a duplex, dispatches to a [`StoreHandler`],
//! and writes response frames back. A handler implements any subset of
//! `{get, put, del, append, scan}`; unimplemented methods answer
//! `{Unknown, "Unknown method"}` at dispatch time.
//!
//! Policies:
//! - oversized payloads are refused with `PayloadTooLarge` before the
//!   handler sees them;
//! - a full inflight table answers `NotReady` and destroys the duplex,
//!   so hitting the limit is never silent;
//! - client cancel drops the scan stream and suppresses any terminal for
//!   that request id; a running unary handler is never aborted, only its
//!   reply is suppressed;
//! - transport teardown cancels every inflight entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use tokio::sync::{mpsc, Notify};

use super::settings::RpcSettings;
use super::wire::{
    AppendRequest, Envelope, KeyRequest, Method, PutRequest, RpcFrame, ScanRequest,
};
use crate::duplex::{PlexStream, StreamHandle};
use crate::error::ErrorCode;

/// Boxed future returned by unary handler methods.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Envelope> + Send>>;

/// Stream of scan rows; an `Err` item terminates the scan with a failure.
pub type ScanStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Envelope, HandlerError>> + Send>>;

/// Failure raised inside a handler, converted to a failure envelope.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Wire code; unrecognised conditions use `Unknown`.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl HandlerError {
    /// Build a handler error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_envelope(&self) -> Envelope {
        Envelope::err(self.code, self.message.clone())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

fn unknown_method() -> HandlerFuture {
    Box::pin(async { Envelope::err(ErrorCode::Unknown, "Unknown method") })
}

/// Store operations served over RPC.
///
/// Every method has a default body, so implementors pick their subset.
pub trait StoreHandler: Send + Sync + 'static {
    /// Read a value by key.
    fn get(&self, req: KeyRequest) -> HandlerFuture {
        let _ = req;
        unknown_method()
    }

    /// Write a value under a key.
    fn put(&self, req: PutRequest) -> HandlerFuture {
        let _ = req;
        unknown_method()
    }

    /// Delete a key.
    fn del(&self, req: KeyRequest) -> HandlerFuture {
        let _ = req;
        unknown_method()
    }

    /// Append a value to the store's log.
    fn append(&self, req: AppendRequest) -> HandlerFuture {
        let _ = req;
        unknown_method()
    }

    /// Stream matching entries. Each `Ok` row is sent with the stream
    /// continuing; an `Err` ends it with a failure envelope.
    fn scan(&self, req: ScanRequest) -> ScanStream {
        let _ = req;
        Box::pin(futures::stream::once(async {
            Err(HandlerError::new(ErrorCode::Unknown, "Scan not supported"))
        }))
    }
}

#[derive(Clone)]
struct Inflight {
    cancelled: Arc<AtomicBool>,
    cancel: Arc<Notify>,
}

type InflightMap = Arc<Mutex<HashMap<u32, Inflight>>>;

/// A running RPC server bound to one duplex.
///
/// The read task runs until the duplex dies; [`shutdown`] forces that.
///
/// [`shutdown`]: RpcServer::shutdown
pub struct RpcServer {
    stream: StreamHandle,
    inflight: InflightMap,
}

impl RpcServer {
    /// Serve `handler` on the given duplex.
    pub fn serve(
        stream: PlexStream,
        handler: Arc<dyn StoreHandler>,
        settings: RpcSettings,
    ) -> RpcServer {
        let (handle, inbound, _events) = stream.into_parts();
        let inflight: InflightMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(read_loop(
            handle.clone(),
            inbound,
            handler,
            settings,
            inflight.clone(),
        ));

        RpcServer {
            stream: handle,
            inflight,
        }
    }

    /// Write handle of the underlying duplex.
    pub fn stream_handle(&self) -> StreamHandle {
        self.stream.clone()
    }

    /// Number of requests currently being served.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Destroy the duplex and cancel every inflight request.
    pub fn shutdown(&self) {
        self.stream.destroy();
    }
}

async fn read_loop(
    handle: StreamHandle,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    handler: Arc<dyn StoreHandler>,
    settings: RpcSettings,
    inflight: InflightMap,
) {
    while let Some(msg) = inbound.recv().await {
        let frame = match RpcFrame::decode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping malformed rpc frame: {}", e);
                continue;
            }
        };

        match frame {
            RpcFrame::Request {
                rid,
                method,
                payload,
            } => {
                let limit = settings.max_server_routes;
                if limit > 0 && inflight.lock().unwrap().len() >= limit {
                    tracing::warn!(rid, "inflight limit reached, resetting transport");
                    send_terminal(
                        &handle,
                        rid,
                        method,
                        Envelope::err(ErrorCode::NotReady, "Too many in-flight requests"),
                    )
                    .await;
                    handle.destroy();
                    break;
                }

                if payload.len() > settings.max_request_bytes {
                    send_terminal(
                        &handle,
                        rid,
                        method,
                        Envelope::err(ErrorCode::PayloadTooLarge, "Request payload too large"),
                    )
                    .await;
                    continue;
                }

                let Some(parsed) = Method::from_u8(method) else {
                    send_terminal(
                        &handle,
                        rid,
                        method,
                        Envelope::err(ErrorCode::Unknown, "Unknown method"),
                    )
                    .await;
                    continue;
                };

                let entry = Inflight {
                    cancelled: Arc::new(AtomicBool::new(false)),
                    cancel: Arc::new(Notify::new()),
                };
                inflight.lock().unwrap().insert(rid, entry.clone());
                if crate::trace::rpc_enabled() {
                    crate::trace::rpc_event(&serde_json::json!({
                        "layer": "server",
                        "event": "request",
                        "rid": rid,
                        "method": parsed.name(),
                        "bytes": payload.len(),
                    }));
                }

                tokio::spawn(handle_request(
                    handle.clone(),
                    handler.clone(),
                    inflight.clone(),
                    rid,
                    parsed,
                    payload,
                    entry,
                ));
            }
            RpcFrame::Cancel { rid, .. } => {
                let entry = inflight.lock().unwrap().remove(&rid);
                if let Some(entry) = entry {
                    tracing::debug!(rid, "request cancelled by client");
                    entry.cancelled.store(true, Ordering::Release);
                    entry.cancel.notify_one();
                }
            }
            RpcFrame::Response { rid, .. } => {
                tracing::warn!(rid, "ignoring response frame on server side");
            }
        }
    }

    // Transport teardown: cancel everything still inflight.
    let entries: Vec<Inflight> = {
        let mut map = inflight.lock().unwrap();
        map.drain().map(|(_, entry)| entry).collect()
    };
    for entry in entries {
        entry.cancelled.store(true, Ordering::Release);
        entry.cancel.notify_one();
    }
}

async fn handle_request(
    handle: StreamHandle,
    handler: Arc<dyn StoreHandler>,
    inflight: InflightMap,
    rid: u32,
    method: Method,
    payload: Bytes,
    entry: Inflight,
) {
    match method {
        Method::Scan => {
            let req = match ScanRequest::decode(payload) {
                Ok(req) => req,
                Err(_) => {
                    finish(&handle, &inflight, rid, method, bad_payload()).await;
                    return;
                }
            };
            serve_scan(handle, handler, inflight, rid, req, entry).await;
        }
        _ => {
            let outcome = match method {
                Method::Get => match KeyRequest::decode(payload) {
                    Ok(req) => handler.get(req).await,
                    Err(_) => bad_payload(),
                },
                Method::Put => match PutRequest::decode(payload) {
                    Ok(req) => handler.put(req).await,
                    Err(_) => bad_payload(),
                },
                Method::Del => match KeyRequest::decode(payload) {
                    Ok(req) => handler.del(req).await,
                    Err(_) => bad_payload(),
                },
                Method::Append => match AppendRequest::decode(payload) {
                    Ok(req) => handler.append(req).await,
                    Err(_) => bad_payload(),
                },
                Method::Scan => unreachable!(),
            };
            finish(&handle, &inflight, rid, method, outcome).await;
        }
    }
}

async fn serve_scan(
    handle: StreamHandle,
    handler: Arc<dyn StoreHandler>,
    inflight: InflightMap,
    rid: u32,
    req: ScanRequest,
    entry: Inflight,
) {
    let mut rows = handler.scan(req);
    loop {
        tokio::select! {
            _ = entry.cancel.notified() => {
                // Entry already removed; dropping the stream stops the
                // producer and nothing further is sent for this rid.
                return;
            }
            item = rows.next() => match item {
                Some(Ok(row)) => {
                    if entry.cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    let frame = RpcFrame::Response {
                        rid,
                        method: Method::Scan.as_u8(),
                        more: true,
                        payload: row.encode(),
                    };
                    if handle.write(frame.encode()).await.is_err() {
                        return;
                    }
                }
                Some(Err(failure)) => {
                    finish(&handle, &inflight, rid, Method::Scan, failure.to_envelope()).await;
                    return;
                }
                None => {
                    // Clean end: terminal frame with empty payload.
                    if inflight.lock().unwrap().remove(&rid).is_some() {
                        let frame = RpcFrame::Response {
                            rid,
                            method: Method::Scan.as_u8(),
                            more: false,
                            payload: Bytes::new(),
                        };
                        let _ = handle.write(frame.encode()).await;
                    }
                    return;
                }
            }
        }
    }
}

fn bad_payload() -> Envelope {
    Envelope::err(ErrorCode::Unknown, "Bad request payload")
}

/// Send the terminal response iff the request is still inflight; a cancel
/// or teardown that raced us wins and the terminal is suppressed.
async fn finish(
    handle: &StreamHandle,
    inflight: &InflightMap,
    rid: u32,
    method: Method,
    outcome: Envelope,
) {
    if inflight.lock().unwrap().remove(&rid).is_some() {
        send_terminal(handle, rid, method.as_u8(), outcome).await;
    }
}

async fn send_terminal(handle: &StreamHandle, rid: u32, method: u8, outcome: Envelope) {
    let frame = RpcFrame::Response {
        rid,
        method,
        more: false,
        payload: outcome.encode(),
    };
    let _ = handle.write(frame.encode()).await;
}
