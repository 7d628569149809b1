//! Peer pool: policy-based selection and health tracking.
//!
//! A pool holds weighted peers with optional locality metadata and routes
//! store calls through a per-peer cached RPC client. Selection policies:
//!
//! - **round-robin**: a counter over the eligible set, advanced exactly
//!   once per call start;
//! - **weighted**: sampling proportional to an effective weight combining
//!   static weight, locality, failure count, and EWMA latency;
//! - **sticky**: a caller-supplied key function hashed (djb2) onto the
//!   eligible set, stable for a fixed eligibility set and key.
//!
//! A peer that throws enters a cooldown window and is ineligible until it
//! expires. Every call updates EWMA latency (α = 0.2) and success/failure
//! counters, and emits observer events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{PlexError, Result};
use crate::peer::Peer;
use crate::rpc::client::{CallOptions, ScanIter, ScanQuery, StoreClient};
use crate::rpc::settings::RpcSettings;
use crate::rpc::wire::{Envelope, Method};

/// EWMA smoothing factor for per-peer latency.
const LATENCY_ALPHA: f64 = 0.2;
/// Cooldown applied to a peer whose call threw.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);
/// Floor for effective selection weights.
const WEIGHT_FLOOR: f64 = 1e-4;

/// Network locality of a peer, used by the weighted policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    Local,
    Lan,
    Wan,
}

impl Locality {
    fn weight(self) -> f64 {
        match self {
            Locality::Local => 8.0,
            Locality::Lan => 4.0,
            Locality::Wan => 1.0,
        }
    }
}

/// Caller-supplied peer metadata.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PeerMeta {
    /// Free-form origin tag (how the peer was discovered).
    pub source: Option<String>,
    /// Locality class; anything unset weighs like `wan`.
    pub locality: Option<Locality>,
}

/// What a sticky key function sees about the call being placed.
pub struct CallDescriptor<'a> {
    /// Method being invoked.
    pub method: Method,
    /// Primary key bytes of the call, when the method has one.
    pub key: Option<&'a [u8]>,
}

/// Sticky-policy key extractor; an empty key falls back to round-robin.
pub type StickyKeyFn = Arc<dyn Fn(&CallDescriptor<'_>) -> Bytes + Send + Sync>;

/// Peer selection policy.
#[derive(Clone)]
pub enum Policy {
    /// Rotate through the eligible set.
    RoundRobin,
    /// Sample by effective weight; `prefer_local` doubles local peers.
    Weighted { prefer_local: bool },
    /// Hash a caller-derived key onto the eligible set.
    Sticky(StickyKeyFn),
}

/// Pool construction parameters.
pub struct PoolConfig {
    /// Channel id used for every peer's RPC lane.
    pub id: Bytes,
    /// Custom lane suffix; `None` uses the rpc lane.
    pub lane: Option<String>,
    /// Selection policy.
    pub policy: Policy,
    /// Cooldown applied when a call throws.
    pub cooldown: Duration,
    /// RPC settings handed to every cached client.
    pub settings: RpcSettings,
}

impl PoolConfig {
    /// Defaults: rpc lane, round-robin, 2s cooldown, env settings.
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            lane: None,
            policy: Policy::RoundRobin,
            cooldown: DEFAULT_COOLDOWN,
            settings: RpcSettings::from_env(),
        }
    }

    /// Set the selection policy.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Use a custom lane suffix.
    pub fn lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    /// Override the RPC settings for cached clients.
    pub fn settings(mut self, settings: RpcSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Snapshot of one pool entry's counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerStats {
    pub id: u64,
    pub weight: u32,
    pub meta: PeerMeta,
    pub in_flight: usize,
    pub failures: u64,
    pub successes: u64,
    pub latency_ms: f64,
    /// Remaining cooldown in milliseconds, when cooling down.
    pub cooldown_ms: Option<u64>,
}

/// Observer events emitted by the pool.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PoolEvent {
    /// A call found no eligible peer.
    NoPeer { method: &'static str },
    /// A call completed with an envelope.
    Complete {
        peer: u64,
        method: &'static str,
        elapsed_ms: u64,
        ok: bool,
    },
    /// A call threw.
    Error {
        peer: u64,
        method: &'static str,
        elapsed_ms: u64,
    },
    /// Updated counters for one peer.
    PeerStats(PeerStats),
}

struct PoolEntry {
    pid: u64,
    peer: Arc<Peer>,
    weight: u32,
    meta: PeerMeta,
    in_flight: AtomicUsize,
    failures: AtomicU64,
    successes: AtomicU64,
    latency_ms: Mutex<f64>,
    cooldown_until: Mutex<Option<Instant>>,
    clients: tokio::sync::Mutex<HashMap<(Bytes, String), Arc<StoreClient>>>,
}

impl PoolEntry {
    fn eligible(&self, now: Instant) -> bool {
        match *self.cooldown_until.lock().unwrap() {
            Some(until) => now >= until,
            None => true,
        }
    }

    fn stats(&self) -> PeerStats {
        let now = Instant::now();
        let cooldown_ms = self.cooldown_until.lock().unwrap().and_then(|until| {
            (until > now).then(|| until.duration_since(now).as_millis() as u64)
        });
        PeerStats {
            id: self.pid,
            weight: self.weight,
            meta: self.meta.clone(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            latency_ms: *self.latency_ms.lock().unwrap(),
            cooldown_ms,
        }
    }
}

struct PoolInner {
    id: Bytes,
    lane: Option<String>,
    policy: Policy,
    cooldown: Duration,
    settings: RpcSettings,
    entries: Mutex<Vec<Arc<PoolEntry>>>,
    rr: AtomicUsize,
    next_pid: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PoolEvent>>>,
    rng: Mutex<XorShift64>,
}

/// Handle returned by [`PeerPool::add`]; removes its peer when asked.
pub struct PoolMembership {
    inner: std::sync::Weak<PoolInner>,
    pid: u64,
}

impl PoolMembership {
    /// Remove the peer, destroying its cached clients.
    pub async fn remove(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_pid(self.pid).await;
        }
    }
}

/// A set of weighted peers behind a store-call facade.
pub struct PeerPool {
    inner: Arc<PoolInner>,
}

impl PeerPool {
    /// Create a pool from config.
    pub fn new(config: PoolConfig) -> PeerPool {
        PeerPool {
            inner: Arc::new(PoolInner {
                id: config.id,
                lane: config.lane,
                policy: config.policy,
                cooldown: config.cooldown,
                settings: config.settings,
                entries: Mutex::new(Vec::new()),
                rr: AtomicUsize::new(0),
                next_pid: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
                rng: Mutex::new(XorShift64::seeded()),
            }),
        }
    }

    /// Add a peer with a static weight (clamped to ≥ 1) and metadata.
    pub fn add(&self, peer: Arc<Peer>, weight: u32, meta: PeerMeta) -> PoolMembership {
        let pid = self.inner.next_pid.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(PoolEntry {
            pid,
            peer,
            weight: weight.max(1),
            meta,
            in_flight: AtomicUsize::new(0),
            failures: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            latency_ms: Mutex::new(0.0),
            cooldown_until: Mutex::new(None),
            clients: tokio::sync::Mutex::new(HashMap::new()),
        });
        self.inner.entries.lock().unwrap().push(entry);
        PoolMembership {
            inner: Arc::downgrade(&self.inner),
            pid,
        }
    }

    /// Remove a peer by reference, destroying its cached clients.
    pub async fn remove(&self, peer: &Arc<Peer>) {
        let pid = self
            .inner
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| Arc::ptr_eq(&e.peer, peer))
            .map(|e| e.pid);
        if let Some(pid) = pid {
            self.inner.remove_pid(pid).await;
        }
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Snapshot of every entry's counters.
    pub fn stats(&self) -> Vec<PeerStats> {
        let entries = self.inner.entries.lock().unwrap().clone();
        entries.iter().map(|e| e.stats()).collect()
    }

    /// Gracefully close every cached client.
    pub async fn close(&self) {
        for client in self.inner.all_clients().await {
            client.close().await;
        }
    }

    /// Destroy every cached client.
    pub async fn destroy(&self) {
        for client in self.inner.all_clients().await {
            client.destroy();
        }
    }

    /// Routed `get`.
    pub async fn get(&self, key: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        let key = key.into();
        let entry = self.inner.select(&CallDescriptor {
            method: Method::Get,
            key: Some(&key),
        })?;
        let inner = self.inner.clone();
        let target = entry.clone();
        self.inner
            .track_unary(&entry, Method::Get, async move {
                let client = inner.client_for(&target).await?;
                client.get(key, opts).await
            })
            .await
    }

    /// Routed `put`.
    pub async fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        opts: CallOptions,
    ) -> Result<Envelope> {
        let key = key.into();
        let value = value.into();
        let entry = self.inner.select(&CallDescriptor {
            method: Method::Put,
            key: Some(&key),
        })?;
        let inner = self.inner.clone();
        let target = entry.clone();
        self.inner
            .track_unary(&entry, Method::Put, async move {
                let client = inner.client_for(&target).await?;
                client.put(key, value, opts).await
            })
            .await
    }

    /// Routed `del`.
    pub async fn del(&self, key: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        let key = key.into();
        let entry = self.inner.select(&CallDescriptor {
            method: Method::Del,
            key: Some(&key),
        })?;
        let inner = self.inner.clone();
        let target = entry.clone();
        self.inner
            .track_unary(&entry, Method::Del, async move {
                let client = inner.client_for(&target).await?;
                client.del(key, opts).await
            })
            .await
    }

    /// Routed `append`.
    pub async fn append(&self, value: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        let value = value.into();
        let entry = self.inner.select(&CallDescriptor {
            method: Method::Append,
            key: None,
        })?;
        let inner = self.inner.clone();
        let target = entry.clone();
        self.inner
            .track_unary(&entry, Method::Append, async move {
                let client = inner.client_for(&target).await?;
                client.append(value, opts).await
            })
            .await
    }

    /// Routed streaming `scan`; bookkeeping settles when the stream does.
    pub async fn scan(&self, query: ScanQuery, opts: CallOptions) -> Result<PoolScan> {
        let entry = self.inner.select(&CallDescriptor {
            method: Method::Scan,
            key: query.prefix.as_deref(),
        })?;

        entry.in_flight.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let attempt = {
            let inner = self.inner.clone();
            let target = entry.clone();
            async move {
                let client = inner.client_for(&target).await?;
                client.scan(query, opts).await
            }
        };
        match attempt.await {
            Ok(iter) => Ok(PoolScan {
                iter,
                inner: self.inner.clone(),
                entry,
                started,
                last_ok: true,
                finished: false,
            }),
            Err(err) => {
                self.inner
                    .settle(&entry, Method::Scan, started.elapsed(), Settled::Threw);
                entry.in_flight.fetch_sub(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

enum Settled {
    Envelope { ok: bool },
    Threw,
}

impl PoolInner {
    fn select(&self, desc: &CallDescriptor<'_>) -> Result<Arc<PoolEntry>> {
        let now = Instant::now();
        let eligible: Vec<Arc<PoolEntry>> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.eligible(now))
            .cloned()
            .collect();

        if eligible.is_empty() {
            self.emit(PoolEvent::NoPeer {
                method: desc.method.name(),
            });
            return Err(PlexError::NoPeers);
        }

        let entry = match &self.policy {
            Policy::RoundRobin => self.round_robin(&eligible),
            Policy::Weighted { prefer_local } => self.weighted(&eligible, *prefer_local),
            Policy::Sticky(key_fn) => {
                let key = key_fn(desc);
                if key.is_empty() {
                    self.round_robin(&eligible)
                } else {
                    eligible[djb2(&key) as usize % eligible.len()].clone()
                }
            }
        };
        Ok(entry)
    }

    fn round_robin(&self, eligible: &[Arc<PoolEntry>]) -> Arc<PoolEntry> {
        let i = self.rr.fetch_add(1, Ordering::Relaxed);
        eligible[i % eligible.len()].clone()
    }

    fn weighted(&self, eligible: &[Arc<PoolEntry>], prefer_local: bool) -> Arc<PoolEntry> {
        let weights: Vec<f64> = eligible
            .iter()
            .map(|e| effective_weight(e, prefer_local))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut roll = self.rng.lock().unwrap().next_f64() * total;
        for (entry, w) in eligible.iter().zip(&weights) {
            roll -= w;
            if roll <= 0.0 {
                return entry.clone();
            }
        }
        eligible[eligible.len() - 1].clone()
    }

    async fn client_for(&self, entry: &Arc<PoolEntry>) -> Result<Arc<StoreClient>> {
        let lane = self.lane.clone().unwrap_or_default();
        let cache_key = (self.id.clone(), lane);

        let mut clients = entry.clients.lock().await;
        if let Some(client) = clients.get(&cache_key) {
            return Ok(client.clone());
        }
        let stream = match &self.lane {
            Some(lane) => entry.peer.connect_lane(self.id.clone(), lane).await?,
            None => entry.peer.connect_rpc(self.id.clone()).await?,
        };
        let client = Arc::new(StoreClient::with_settings(stream, self.settings.clone()));
        clients.insert(cache_key, client.clone());
        Ok(client)
    }

    async fn track_unary(
        &self,
        entry: &Arc<PoolEntry>,
        method: Method,
        call: impl std::future::Future<Output = Result<Envelope>>,
    ) -> Result<Envelope> {
        entry.in_flight.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = call.await;
        let settled = match &result {
            Ok(env) => Settled::Envelope { ok: env.is_ok() },
            Err(_) => Settled::Threw,
        };
        self.settle(entry, method, started.elapsed(), settled);
        entry.in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn settle(&self, entry: &Arc<PoolEntry>, method: Method, elapsed: Duration, settled: Settled) {
        let elapsed_ms = elapsed.as_millis() as u64;
        {
            let mut latency = entry.latency_ms.lock().unwrap();
            *latency = *latency * (1.0 - LATENCY_ALPHA) + elapsed.as_secs_f64() * 1e3 * LATENCY_ALPHA;
        }
        match settled {
            Settled::Envelope { ok } => {
                if ok {
                    entry.successes.fetch_add(1, Ordering::Relaxed);
                } else {
                    entry.failures.fetch_add(1, Ordering::Relaxed);
                }
                self.emit(PoolEvent::Complete {
                    peer: entry.pid,
                    method: method.name(),
                    elapsed_ms,
                    ok,
                });
            }
            Settled::Threw => {
                entry.failures.fetch_add(1, Ordering::Relaxed);
                *entry.cooldown_until.lock().unwrap() = Some(Instant::now() + self.cooldown);
                self.emit(PoolEvent::Error {
                    peer: entry.pid,
                    method: method.name(),
                    elapsed_ms,
                });
            }
        }
        self.emit(PoolEvent::PeerStats(entry.stats()));
    }

    async fn remove_pid(&self, pid: u64) {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            match entries.iter().position(|e| e.pid == pid) {
                Some(i) => Some(entries.remove(i)),
                None => None,
            }
        };
        if let Some(entry) = entry {
            let clients: Vec<Arc<StoreClient>> =
                entry.clients.lock().await.drain().map(|(_, c)| c).collect();
            for client in clients {
                client.destroy();
            }
        }
    }

    async fn all_clients(&self) -> Vec<Arc<StoreClient>> {
        let entries = self.entries.lock().unwrap().clone();
        let mut out = Vec::new();
        for entry in entries {
            out.extend(entry.clients.lock().await.values().cloned());
        }
        out
    }

    fn emit(&self, event: PoolEvent) {
        crate::trace::pool_event(&event);
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Streaming call wrapper that settles pool bookkeeping exactly once, on
/// end, failure, cancel, or drop.
pub struct PoolScan {
    iter: ScanIter,
    inner: Arc<PoolInner>,
    entry: Arc<PoolEntry>,
    started: Instant,
    last_ok: bool,
    finished: bool,
}

impl PoolScan {
    /// Next envelope; see [`ScanIter::next`].
    pub async fn next(&mut self) -> Result<Option<Envelope>> {
        match self.iter.next().await {
            Ok(Some(env)) => {
                self.last_ok = env.is_ok();
                Ok(Some(env))
            }
            Ok(None) => {
                self.settle(false);
                Ok(None)
            }
            Err(err) => {
                self.settle(true);
                Err(err)
            }
        }
    }

    /// Cancel the underlying stream and settle bookkeeping.
    pub fn cancel(&mut self) {
        self.iter.cancel();
        self.settle(false);
    }

    fn settle(&mut self, threw: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let settled = if threw {
            Settled::Threw
        } else {
            Settled::Envelope { ok: self.last_ok }
        };
        self.inner
            .settle(&self.entry, Method::Scan, self.started.elapsed(), settled);
        self.entry.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for PoolScan {
    fn drop(&mut self) {
        self.settle(false);
    }
}

fn effective_weight(entry: &PoolEntry, prefer_local: bool) -> f64 {
    let locality = entry.meta.locality;
    let mut w = entry.weight as f64 * locality.map(Locality::weight).unwrap_or(1.0);
    if prefer_local && locality == Some(Locality::Local) {
        w *= 2.0;
    }
    w /= 1.0 + entry.failures.load(Ordering::Relaxed) as f64;
    w /= 1.0 + *entry.latency_ms.lock().unwrap() / 20.0;
    w.max(WEIGHT_FLOOR)
}

/// djb2 over the key bytes, unsigned 32-bit.
fn djb2(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Small clock-seeded PRNG for weighted sampling.
struct XorShift64(u64);

impl XorShift64 {
    fn seeded() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let pid = std::process::id() as u64;
        XorShift64((nanos ^ pid).wrapping_mul(0x517c_c1b7_2722_0a95) | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
