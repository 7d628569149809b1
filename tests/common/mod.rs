//! Shared harness for the integration tests: an in-memory store handler
//! plus helpers wiring a served store port to a client over an in-memory
//! transport pair.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use plex::rpc::server::{HandlerFuture, ScanStream, StoreHandler};
use plex::rpc::wire::{AppendRequest, KeyRequest, PutRequest, ScanRequest};
use plex::{
    connect_store_port, expose_store_port, Envelope, ErrorCode, FramedDuplex, Peer, PortOptions,
    RpcSettings, ServerPort, StoreClient,
};

/// In-memory store used as the RPC handler in tests.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<MemStoreInner>,
}

#[derive(Default)]
struct MemStoreInner {
    map: Mutex<BTreeMap<Vec<u8>, Bytes>>,
    log: Mutex<Vec<Bytes>>,
    /// Rows actually yielded by scan streams.
    rows_emitted: AtomicUsize,
    /// Unary handlers that ran to completion.
    completed: AtomicUsize,
    unary_delay: Mutex<Option<Duration>>,
    scan_delay: Mutex<Option<Duration>>,
    expected_caps: Mutex<Option<Bytes>>,
    last_put: Mutex<Option<(Bytes, Bytes)>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    /// Sleep this long inside every unary handler before acting.
    pub fn set_unary_delay(&self, delay: Duration) {
        *self.inner.unary_delay.lock().unwrap() = Some(delay);
    }

    /// Sleep this long before yielding each scan row.
    pub fn set_scan_delay(&self, delay: Duration) {
        *self.inner.scan_delay.lock().unwrap() = Some(delay);
    }

    /// Reject calls whose caps token differs from this one.
    pub fn require_caps(&self, token: impl Into<Bytes>) {
        *self.inner.expected_caps.lock().unwrap() = Some(token.into());
    }

    pub fn rows_emitted(&self) -> usize {
        self.inner.rows_emitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn last_put(&self) -> Option<(Bytes, Bytes)> {
        self.inner.last_put.lock().unwrap().clone()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.map.lock().unwrap().contains_key(key)
    }

    fn caps_rejection(&self, caps: &Option<Bytes>) -> Option<Envelope> {
        let expected = self.inner.expected_caps.lock().unwrap().clone();
        match expected {
            Some(expected) if caps.as_ref() != Some(&expected) => Some(Envelope::err(
                ErrorCode::CapabilityDenied,
                "capability token rejected",
            )),
            _ => None,
        }
    }

    fn unary_delay(&self) -> Option<Duration> {
        *self.inner.unary_delay.lock().unwrap()
    }
}

impl StoreHandler for MemStore {
    fn get(&self, req: KeyRequest) -> HandlerFuture {
        let rejected = self.caps_rejection(&req.caps);
        let delay = self.unary_delay();
        let inner = self.inner.clone();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(env) = rejected {
                return env;
            }
            let value = inner.map.lock().unwrap().get(req.key.as_ref()).cloned();
            inner.completed.fetch_add(1, Ordering::SeqCst);
            Envelope::Ok { value, key: None }
        })
    }

    fn put(&self, req: PutRequest) -> HandlerFuture {
        let rejected = self.caps_rejection(&req.caps);
        let delay = self.unary_delay();
        let inner = self.inner.clone();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(env) = rejected {
                return env;
            }
            inner
                .map
                .lock()
                .unwrap()
                .insert(req.key.to_vec(), req.value.clone());
            *inner.last_put.lock().unwrap() = Some((req.key, req.value));
            inner.completed.fetch_add(1, Ordering::SeqCst);
            Envelope::ok()
        })
    }

    fn del(&self, req: KeyRequest) -> HandlerFuture {
        let rejected = self.caps_rejection(&req.caps);
        let delay = self.unary_delay();
        let inner = self.inner.clone();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(env) = rejected {
                return env;
            }
            inner.map.lock().unwrap().remove(req.key.as_ref());
            inner.completed.fetch_add(1, Ordering::SeqCst);
            Envelope::ok()
        })
    }

    fn append(&self, req: AppendRequest) -> HandlerFuture {
        let rejected = self.caps_rejection(&req.caps);
        let inner = self.inner.clone();
        Box::pin(async move {
            if let Some(env) = rejected {
                return env;
            }
            inner.log.lock().unwrap().push(req.value);
            inner.completed.fetch_add(1, Ordering::SeqCst);
            Envelope::ok()
        })
    }

    fn scan(&self, req: ScanRequest) -> ScanStream {
        if let Some(env) = self.caps_rejection(&req.caps) {
            let code = env.code().unwrap_or(ErrorCode::Unknown);
            let message = env.message().unwrap_or_default().to_string();
            return Box::pin(stream::once(async move {
                Err(plex::HandlerError::new(code, message))
            }));
        }

        let rows: Vec<(Vec<u8>, Bytes)> = {
            let map = self.inner.map.lock().unwrap();
            let mut rows: Vec<_> = map
                .iter()
                .filter(|(key, _)| key_matches(key, &req))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            if req.reverse {
                rows.reverse();
            }
            rows
        };
        let delay = *self.inner.scan_delay.lock().unwrap();
        let inner = self.inner.clone();

        Box::pin(stream::unfold(
            (rows.into_iter(), inner),
            move |(mut rows, inner)| async move {
                let (key, value) = rows.next()?;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                inner.rows_emitted.fetch_add(1, Ordering::SeqCst);
                Some((Ok(Envelope::ok_entry(key, value)), (rows, inner)))
            },
        ))
    }
}

fn key_matches(key: &[u8], req: &ScanRequest) -> bool {
    if let Some(prefix) = &req.prefix {
        if !key.starts_with(prefix) {
            return false;
        }
    }
    if let Some(gte) = &req.range.gte {
        if key < gte.as_ref() {
            return false;
        }
    }
    if let Some(gt) = &req.range.gt {
        if key <= gt.as_ref() {
            return false;
        }
    }
    if let Some(lte) = &req.range.lte {
        if key > lte.as_ref() {
            return false;
        }
    }
    if let Some(lt) = &req.range.lt {
        if key >= lt.as_ref() {
            return false;
        }
    }
    true
}

/// A served store wired to a client over an in-memory transport pair.
pub struct Fixture {
    pub client: StoreClient,
    pub store: MemStore,
    pub port: ServerPort,
    pub server_peer: Arc<Peer>,
    pub client_peer: Arc<Peer>,
}

/// Channel id used by the end-to-end scenarios.
pub const STORE_ID: &[u8] = &[0xaa];

pub async fn fixture(settings: RpcSettings) -> Fixture {
    fixture_with_store(settings, MemStore::new()).await
}

pub async fn fixture_with_store(settings: RpcSettings, store: MemStore) -> Fixture {
    let (a, b) = FramedDuplex::pair();
    let server_peer = Peer::new(a);
    let client_peer = Peer::new(b);

    let port = expose_store_port(
        &server_peer,
        PortOptions::new(STORE_ID).settings(settings.clone()),
        Arc::new(store.clone()),
    )
    .expect("expose store port");

    let client = connect_store_port(&client_peer, PortOptions::new(STORE_ID).settings(settings))
        .await
        .expect("connect store port");

    Fixture {
        client,
        store,
        port,
        server_peer,
        client_peer,
    }
}

/// Spin up a served peer for pool tests; returns the pool-side peer and
/// its backing store.
pub async fn pooled_peer(settings: RpcSettings) -> (Arc<Peer>, MemStore, ServerPort) {
    let (a, b) = FramedDuplex::pair();
    let server_peer = Peer::new(a);
    let client_peer = Peer::new(b);
    let store = MemStore::new();

    let port = expose_store_port(
        &server_peer,
        PortOptions::new(STORE_ID).settings(settings),
        Arc::new(store.clone()),
    )
    .expect("expose store port");

    (client_peer, store, port)
}
