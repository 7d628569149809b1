//! RPC client proxy.
//!
//! Issues unary calls (`get`, `put`, `del`, `append`) and streaming calls
//! (`scan`) over one duplex. Every call gets a monotonically increasing
//! request id and a route entry; a single reader task resolves routes as
//! response frames arrive:
//!
//! ```text
//! caller ──► route table ──► request frame ──► duplex
//! duplex ──► reader task ──► route table ──► oneshot / scan queue
//! ```
//!
//! Cancellation has three sources (explicit iterator cancel, abort signal,
//! hard timeout); each sends one cancel frame and completes the route with
//! a locally synthesised envelope. Responses that arrive after a route
//! closed are downgraded to a debug trace while the id sits in the
//! recently-closed set, and warned about afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::settings::RpcSettings;
use super::wire::{
    AppendRequest, Envelope, KeyRequest, Method, PutRequest, RpcFrame, ScanRange, ScanRequest,
};
use crate::duplex::{PlexStream, StreamHandle};
use crate::error::{ErrorCode, PlexError, Result};

/// Reason attached to an [`AbortHandle::abort`].
#[derive(Debug, Clone)]
pub struct AbortReason {
    /// Wire code for the synthesised failure; `Destroyed` when absent.
    pub code: Option<ErrorCode>,
    /// Reason message.
    pub message: String,
}

/// Abort side of a cancellation pair.
pub struct AbortHandle {
    tx: watch::Sender<Option<AbortReason>>,
}

/// Signal side of a cancellation pair, attachable to any call.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<AbortReason>>,
}

impl AbortHandle {
    /// Create a connected handle/signal pair.
    pub fn new() -> (AbortHandle, AbortSignal) {
        let (tx, rx) = watch::channel(None);
        (AbortHandle { tx }, AbortSignal { rx })
    }

    /// Abort with a plain reason; calls complete as `{Destroyed, reason}`.
    pub fn abort(&self, message: impl Into<String>) {
        self.tx.send_replace(Some(AbortReason {
            code: None,
            message: message.into(),
        }));
    }

    /// Abort with an explicit wire code carried in the reason.
    pub fn abort_with(&self, code: ErrorCode, message: impl Into<String>) {
        self.tx.send_replace(Some(AbortReason {
            code: Some(code),
            message: message.into(),
        }));
    }
}

impl AbortSignal {
    /// True once the handle fired.
    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the abort reason. Pends forever if the handle is dropped
    /// without firing.
    pub async fn fired(&self) -> AbortReason {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Transport-level options for one call, kept out of the payload.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Per-call timeout; `None` uses the settings default, zero disables.
    pub timeout: Option<Duration>,
    /// Abort signal wired to the route.
    pub signal: Option<AbortSignal>,
    /// Capability token injected into the request payload.
    pub caps: Option<Bytes>,
}

impl CallOptions {
    /// Set the per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach an abort signal.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Attach a capability token.
    pub fn caps(mut self, caps: impl Into<Bytes>) -> Self {
        self.caps = Some(caps.into());
        self
    }
}

/// Query half of a `scan` call; `caps` rides in [`CallOptions`].
#[derive(Debug, Clone, Default)]
pub struct ScanQuery {
    pub prefix: Option<Bytes>,
    pub reverse: bool,
    pub range: ScanRange,
}

enum UnaryOutcome {
    Envelope(Envelope),
    Failed(PlexError),
}

enum ScanItem {
    Row(Envelope),
    End,
    Failed(PlexError),
}

enum RouteKind {
    Unary {
        done: Option<oneshot::Sender<UnaryOutcome>>,
        result: Option<Envelope>,
    },
    Stream {
        tx: mpsc::UnboundedSender<ScanItem>,
    },
}

/// Diagnostic context logged by the stall and pending timers.
#[derive(Debug, Clone, Default)]
struct RouteMeta {
    key_hex: Option<String>,
    value_len: Option<usize>,
    timeout_ms: Option<u64>,
}

struct Route {
    method: Method,
    started: Instant,
    kind: RouteKind,
    /// Timeout, abort-watcher, and reminder tasks; aborted on closure.
    cleanup: Vec<JoinHandle<()>>,
    /// One-shot stall warning; also aborted by the first response frame.
    stall_timer: Option<JoinHandle<()>>,
    meta: RouteMeta,
}

struct RouteTable {
    routes: HashMap<u32, Route>,
    /// rid → closed-at, for orphan-response tolerance.
    recently_closed: HashMap<u32, Instant>,
}

struct ClientShared {
    stream: StreamHandle,
    settings: RpcSettings,
    table: Mutex<RouteTable>,
    next_rid: AtomicU32,
}

/// How a closing route delivers its terminal outcome.
enum Deliver {
    /// Synthesised envelope (timeout, abort): unary resolves with it, a
    /// stream observes it as its last row before ending.
    Envelope(Envelope),
    /// Server terminal: unary resolves the stored envelope (default ok),
    /// a stream ends cleanly.
    Stored,
    /// Transport death: unary rejects, a stream surfaces the error.
    Failure(PlexError),
    /// Close without delivering anything (iterator cancel).
    Nothing,
}

/// Client proxy for the store RPC methods on one duplex.
pub struct StoreClient {
    shared: Arc<ClientShared>,
}

impl StoreClient {
    /// Bind a client to a duplex with environment-derived settings.
    pub fn new(stream: PlexStream) -> StoreClient {
        Self::with_settings(stream, RpcSettings::from_env())
    }

    /// Bind a client to a duplex with explicit settings.
    pub fn with_settings(stream: PlexStream, settings: RpcSettings) -> StoreClient {
        let (handle, inbound, _events) = stream.into_parts();
        let shared = Arc::new(ClientShared {
            stream: handle,
            settings,
            table: Mutex::new(RouteTable {
                routes: HashMap::new(),
                recently_closed: HashMap::new(),
            }),
            next_rid: AtomicU32::new(1),
        });
        tokio::spawn(read_loop(shared.clone(), inbound));
        StoreClient { shared }
    }

    /// Read a value by key.
    pub async fn get(&self, key: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        let key = key.into();
        let meta = RouteMeta {
            key_hex: Some(hex_trunc(&key)),
            ..RouteMeta::default()
        };
        let payload = KeyRequest {
            key,
            caps: opts.caps.clone(),
        }
        .encode();
        self.call_unary(Method::Get, payload, &opts, meta).await
    }

    /// Write a value under a key.
    pub async fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        opts: CallOptions,
    ) -> Result<Envelope> {
        let key = key.into();
        let value = value.into();
        let meta = RouteMeta {
            key_hex: Some(hex_trunc(&key)),
            value_len: Some(value.len()),
            ..RouteMeta::default()
        };
        let payload = PutRequest {
            key,
            value,
            caps: opts.caps.clone(),
        }
        .encode();
        self.call_unary(Method::Put, payload, &opts, meta).await
    }

    /// Delete a key.
    pub async fn del(&self, key: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        let key = key.into();
        let meta = RouteMeta {
            key_hex: Some(hex_trunc(&key)),
            ..RouteMeta::default()
        };
        let payload = KeyRequest {
            key,
            caps: opts.caps.clone(),
        }
        .encode();
        self.call_unary(Method::Del, payload, &opts, meta).await
    }

    /// Append a value to the store's log.
    pub async fn append(&self, value: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        let value = value.into();
        let meta = RouteMeta {
            value_len: Some(value.len()),
            ..RouteMeta::default()
        };
        let payload = AppendRequest {
            value,
            caps: opts.caps.clone(),
        }
        .encode();
        self.call_unary(Method::Append, payload, &opts, meta).await
    }

    /// Stream entries matching the query.
    pub async fn scan(&self, query: ScanQuery, opts: CallOptions) -> Result<ScanIter> {
        let meta = RouteMeta {
            key_hex: query.prefix.as_deref().map(hex_trunc),
            ..RouteMeta::default()
        };
        let payload = ScanRequest {
            prefix: query.prefix,
            reverse: query.reverse,
            range: query.range,
            caps: opts.caps.clone(),
        }
        .encode();

        let (tx, rx) = mpsc::unbounded_channel();
        let rid = self
            .start_route(
                Method::Scan,
                payload,
                &opts,
                meta,
                RouteKind::Stream { tx },
            )
            .await?;
        Ok(ScanIter {
            rid,
            rx,
            shared: self.shared.clone(),
            done: false,
        })
    }

    /// Wait until the underlying channel is open.
    pub async fn wait_ready(&self) -> Result<()> {
        self.shared.stream.wait_connected().await
    }

    /// Gracefully close the underlying duplex.
    pub async fn close(&self) {
        self.shared.stream.close().await
    }

    /// Destroy the underlying duplex; pending routes fail.
    pub fn destroy(&self) {
        self.shared.stream.destroy()
    }

    /// Passthrough to the underlying duplex write handle.
    pub fn stream_handle(&self) -> StreamHandle {
        self.shared.stream.clone()
    }

    /// Number of routes currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.shared.table.lock().unwrap().routes.len()
    }

    async fn call_unary(
        &self,
        method: Method,
        payload: Bytes,
        opts: &CallOptions,
        meta: RouteMeta,
    ) -> Result<Envelope> {
        let (done_tx, done_rx) = oneshot::channel();
        self.start_route(
            method,
            payload,
            opts,
            meta,
            RouteKind::Unary {
                done: Some(done_tx),
                result: None,
            },
        )
        .await?;

        match done_rx.await {
            Ok(UnaryOutcome::Envelope(env)) => Ok(env),
            Ok(UnaryOutcome::Failed(err)) => Err(err),
            Err(_) => Err(PlexError::ConnectionClosed),
        }
    }

    /// Shared front half of every call: limits, size check, route insert,
    /// request frame, timers, abort wiring.
    async fn start_route(
        &self,
        method: Method,
        payload: Bytes,
        opts: &CallOptions,
        mut meta: RouteMeta,
        kind: RouteKind,
    ) -> Result<u32> {
        let shared = &self.shared;

        let limit = shared.settings.max_client_routes;
        if limit > 0 && shared.table.lock().unwrap().routes.len() >= limit {
            tracing::warn!(
                method = method.name(),
                "client route limit reached, resetting transport"
            );
            shared.stream.destroy();
            return Err(PlexError::call(
                ErrorCode::NotReady,
                "Too many in-flight requests",
            ));
        }

        if payload.len() > shared.settings.max_request_bytes {
            return Err(PlexError::call(
                ErrorCode::PayloadTooLarge,
                format!(
                    "Request payload of {} bytes exceeds limit of {}",
                    payload.len(),
                    shared.settings.max_request_bytes
                ),
            ));
        }

        let timeout = match opts.timeout {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => shared.settings.client_timeout,
        };
        meta.timeout_ms = timeout.map(|d| d.as_millis() as u64);

        let rid = self.alloc_rid();
        {
            let mut table = shared.table.lock().unwrap();
            table.routes.insert(
                rid,
                Route {
                    method,
                    started: Instant::now(),
                    kind,
                    cleanup: Vec::new(),
                    stall_timer: None,
                    meta: meta.clone(),
                },
            );
        }
        if crate::trace::rpc_enabled() {
            crate::trace::rpc_event(&serde_json::json!({
                "layer": "client",
                "event": "request",
                "rid": rid,
                "method": method.name(),
                "bytes": payload.len(),
                "timeout_ms": meta.timeout_ms,
            }));
        }

        let frame = RpcFrame::Request {
            rid,
            method: method.as_u8(),
            payload,
        };
        if let Err(err) = shared.stream.write(frame.encode()).await {
            close_route(shared, rid, false, Deliver::Nothing);
            return Err(err);
        }

        self.attach_watchers(rid, timeout, opts.signal.clone(), meta);
        Ok(rid)
    }

    fn attach_watchers(
        &self,
        rid: u32,
        timeout: Option<Duration>,
        signal: Option<AbortSignal>,
        meta: RouteMeta,
    ) {
        let shared = &self.shared;
        let mut cleanup = Vec::new();
        let mut stall_timer = None;

        if let Some(d) = timeout {
            let s = shared.clone();
            let ms = d.as_millis() as u64;
            cleanup.push(tokio::spawn(async move {
                tokio::time::sleep(d).await;
                close_route(
                    &s,
                    rid,
                    true,
                    Deliver::Envelope(Envelope::err(
                        ErrorCode::Timeout,
                        format!("Request timed out after {}ms", ms),
                    )),
                );
            }));
        }

        if let Some(signal) = signal {
            let s = shared.clone();
            cleanup.push(tokio::spawn(async move {
                let reason = signal.fired().await;
                let code = reason.code.unwrap_or(ErrorCode::Destroyed);
                close_route(
                    &s,
                    rid,
                    true,
                    Deliver::Envelope(Envelope::err(code, reason.message)),
                );
            }));
        }

        if let Some(d) = shared.settings.stall_warn {
            let s = shared.clone();
            let m = meta.clone();
            stall_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(d).await;
                if let Some(method) = route_method(&s, rid) {
                    tracing::warn!(
                        rid,
                        method = method.name(),
                        key = m.key_hex.as_deref().unwrap_or(""),
                        "no response after {:?}",
                        d
                    );
                }
            }));
        }

        if let Some(d) = shared.settings.pending_log {
            let s = shared.clone();
            let m = meta;
            cleanup.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(d);
                tick.tick().await; // first tick fires immediately
                loop {
                    tick.tick().await;
                    match route_age(&s, rid) {
                        Some((method, age)) => tracing::debug!(
                            rid,
                            method = method.name(),
                            key = m.key_hex.as_deref().unwrap_or(""),
                            value_len = m.value_len.unwrap_or(0),
                            "still pending after {:?}",
                            age
                        ),
                        None => return,
                    }
                }
            }));
        }

        // Attach to the live route; if it already closed, stop the tasks.
        let mut table = shared.table.lock().unwrap();
        match table.routes.get_mut(&rid) {
            Some(route) => {
                route.cleanup = cleanup;
                route.stall_timer = stall_timer;
            }
            None => {
                for handle in cleanup {
                    handle.abort();
                }
                if let Some(handle) = stall_timer {
                    handle.abort();
                }
            }
        }
    }

    fn alloc_rid(&self) -> u32 {
        loop {
            let rid = self.shared.next_rid.fetch_add(1, Ordering::Relaxed);
            if rid != 0 {
                debug_assert!(
                    !self.shared.table.lock().unwrap().routes.contains_key(&rid),
                    "request id collision"
                );
                return rid;
            }
        }
    }
}

fn route_method(shared: &Arc<ClientShared>, rid: u32) -> Option<Method> {
    shared
        .table
        .lock()
        .unwrap()
        .routes
        .get(&rid)
        .map(|r| r.method)
}

fn route_age(shared: &Arc<ClientShared>, rid: u32) -> Option<(Method, Duration)> {
    shared
        .table
        .lock()
        .unwrap()
        .routes
        .get(&rid)
        .map(|r| (r.method, r.started.elapsed()))
}

fn hex_trunc(bytes: &[u8]) -> String {
    const MAX: usize = 16;
    let mut out = String::with_capacity(MAX * 2 + 1);
    for b in bytes.iter().take(MAX) {
        out.push_str(&format!("{:02x}", b));
    }
    if bytes.len() > MAX {
        out.push('+');
    }
    out
}

/// Pull-model iterator over a streaming `scan` call.
pub struct ScanIter {
    rid: u32,
    rx: mpsc::UnboundedReceiver<ScanItem>,
    shared: Arc<ClientShared>,
    done: bool,
}

impl ScanIter {
    /// Next envelope, `Ok(None)` on clean end, `Err` on transport failure.
    pub async fn next(&mut self) -> Result<Option<Envelope>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(ScanItem::Row(env)) => Ok(Some(env)),
            Some(ScanItem::End) => {
                self.done = true;
                Ok(None)
            }
            Some(ScanItem::Failed(err)) => {
                self.done = true;
                Err(err)
            }
            None => {
                self.done = true;
                Err(PlexError::ConnectionClosed)
            }
        }
    }

    /// Stop consuming: sends one cancel frame and closes the route. No
    /// further envelopes are yielded.
    pub fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            close_route(&self.shared, self.rid, true, Deliver::Nothing);
        }
    }
}

impl Drop for ScanIter {
    fn drop(&mut self) {
        if !self.done {
            close_route(&self.shared, self.rid, true, Deliver::Nothing);
        }
    }
}

async fn read_loop(shared: Arc<ClientShared>, mut inbound: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(msg) = inbound.recv().await {
        match RpcFrame::decode(msg) {
            Ok(RpcFrame::Response {
                rid,
                more,
                payload,
                ..
            }) => on_response(&shared, rid, more, payload),
            Ok(_) => tracing::warn!("ignoring non-response frame on client side"),
            Err(e) => tracing::warn!("dropping malformed rpc frame: {}", e),
        }
    }

    // Transport teardown: every pending route fails.
    let rids: Vec<u32> = shared
        .table
        .lock()
        .unwrap()
        .routes
        .keys()
        .copied()
        .collect();
    for rid in rids {
        close_route(
            &shared,
            rid,
            false,
            Deliver::Failure(PlexError::ConnectionClosed),
        );
    }
}

enum AfterDispatch {
    Done,
    CloseStored,
    CloseFailure(Envelope),
}

fn on_response(shared: &Arc<ClientShared>, rid: u32, more: bool, payload: Bytes) {
    let action = {
        let mut table = shared.table.lock().unwrap();
        let ttl = shared.settings.orphan_ttl;
        match table.routes.get_mut(&rid) {
            None => {
                let now = Instant::now();
                match table.recently_closed.get(&rid) {
                    Some(closed_at) if now.duration_since(*closed_at) <= ttl => {
                        tracing::debug!(rid, "late response for recently closed route");
                    }
                    _ => {
                        tracing::warn!(rid, "response for unknown route");
                    }
                }
                AfterDispatch::Done
            }
            Some(route) => {
                if let Some(timer) = route.stall_timer.take() {
                    timer.abort();
                }
                if payload.is_empty() {
                    if more {
                        AfterDispatch::Done
                    } else {
                        AfterDispatch::CloseStored
                    }
                } else {
                    match Envelope::decode(payload) {
                        Ok(env) => {
                            match &mut route.kind {
                                RouteKind::Unary { result, .. } => *result = Some(env),
                                RouteKind::Stream { tx } => {
                                    let _ = tx.send(ScanItem::Row(env));
                                }
                            }
                            if more {
                                AfterDispatch::Done
                            } else {
                                AfterDispatch::CloseStored
                            }
                        }
                        Err(_) => AfterDispatch::CloseFailure(Envelope::err(
                            ErrorCode::CodecError,
                            "Bad response payload",
                        )),
                    }
                }
            }
        }
    };

    match action {
        AfterDispatch::Done => {}
        AfterDispatch::CloseStored => close_route(shared, rid, false, Deliver::Stored),
        AfterDispatch::CloseFailure(env) => {
            close_route(shared, rid, false, Deliver::Envelope(env))
        }
    }
}

/// Remove a route, stop its timers, remember its id for orphan tolerance,
/// optionally send one cancel frame, and deliver the terminal outcome.
fn close_route(shared: &Arc<ClientShared>, rid: u32, send_cancel: bool, deliver: Deliver) {
    let mut route = {
        let mut table = shared.table.lock().unwrap();
        let Some(route) = table.routes.remove(&rid) else {
            return;
        };
        let now = Instant::now();
        let ttl = shared.settings.orphan_ttl;
        table
            .recently_closed
            .retain(|_, closed_at| now.duration_since(*closed_at) <= ttl);
        table.recently_closed.insert(rid, now);
        route
    };

    for handle in route.cleanup.drain(..) {
        handle.abort();
    }
    if let Some(handle) = route.stall_timer.take() {
        handle.abort();
    }

    // close_route runs at most once per rid (the map remove gates it), so
    // at most one cancel frame ever goes out for a route.
    if send_cancel {
        send_cancel_frame(shared, rid, route.method);
    }

    if crate::trace::rpc_enabled() {
        crate::trace::rpc_event(&serde_json::json!({
            "layer": "client",
            "event": "route_closed",
            "rid": rid,
            "method": route.method.name(),
            "elapsed_ms": route.started.elapsed().as_millis() as u64,
            "key": route.meta.key_hex,
            "value_len": route.meta.value_len,
            "timeout_ms": route.meta.timeout_ms,
        }));
    }

    match route.kind {
        RouteKind::Unary { done, result } => {
            let outcome = match deliver {
                Deliver::Envelope(env) => UnaryOutcome::Envelope(env),
                Deliver::Stored => UnaryOutcome::Envelope(result.unwrap_or_else(Envelope::ok)),
                Deliver::Failure(err) => UnaryOutcome::Failed(err),
                Deliver::Nothing => return,
            };
            if let Some(done) = done {
                let _ = done.send(outcome);
            }
        }
        RouteKind::Stream { tx } => match deliver {
            Deliver::Envelope(env) => {
                let _ = tx.send(ScanItem::Row(env));
                let _ = tx.send(ScanItem::End);
            }
            Deliver::Stored => {
                let _ = tx.send(ScanItem::End);
            }
            Deliver::Failure(err) => {
                let _ = tx.send(ScanItem::Failed(err));
            }
            Deliver::Nothing => {}
        },
    }
}

/// Send one cancel frame without blocking the closing context.
fn send_cancel_frame(shared: &Arc<ClientShared>, rid: u32, method: Method) {
    let frame = RpcFrame::Cancel {
        rid,
        method: method.as_u8(),
    }
    .encode();
    let stream = shared.stream.clone();
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                let _ = stream.write(frame).await;
            });
        }
        Err(_) => stream.try_write(frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_signal_fires_with_reason() {
        let (handle, signal) = AbortHandle::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.fired().await }
        });
        assert!(!signal.is_aborted());
        handle.abort("stop");
        let reason = waiter.await.unwrap();
        assert_eq!(reason.message, "stop");
        assert!(reason.code.is_none());
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_with_code() {
        let (handle, signal) = AbortHandle::new();
        handle.abort_with(ErrorCode::Timeout, "deadline");
        let reason = signal.fired().await;
        assert_eq!(reason.code, Some(ErrorCode::Timeout));
        assert_eq!(reason.message, "deadline");
    }

    #[test]
    fn test_hex_trunc() {
        assert_eq!(hex_trunc(b"\x01\x02"), "0102");
        let long = [0xffu8; 32];
        let out = hex_trunc(&long);
        assert_eq!(out.len(), 33);
        assert!(out.ends_with('+'));
    }
}
