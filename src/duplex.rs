//! Stream-style duplex wrapper over a substrate channel.
//!
//! [`PlexStream`] presents one `(id, protocol)` channel as a byte-message
//! duplex. Two modes exist:
//!
//! - **connect**: the local OPEN goes out immediately (or, when lazy, on
//!   the first write or readiness wait);
//! - **listen**: the channel is paired and the local OPEN answers the
//!   remote's.
//!
//! Writes issued before the channel is open are buffered in order and
//! flushed when the open event fires. Destruction is symmetric: closing
//! either side makes both observe [`StreamEvent::Close`] followed by
//! [`StreamEvent::Destroy`]. Writes after destroy are silently dropped;
//! nothing ever re-opens a destroyed channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::channel::{self, ChannelConfig};
use crate::error::{PlexError, Result};
use crate::mux::{ChannelEvent, ChannelKey, Mux};

/// Maximum writes buffered before the channel opens.
pub const DEFAULT_PENDING_WRITES: usize = 1024;

/// Lifecycle events surfaced to the duplex owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The remote side opened the channel; carries its handshake.
    RemoteOpen(Bytes),
    /// Alias of `RemoteOpen`, emitted immediately after it.
    Connection(Bytes),
    /// The channel closed; the readable side is terminated.
    Close,
    /// The channel is gone. Always follows `Close`.
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Readiness {
    Pending,
    Connected,
    Dead,
}

struct StreamShared {
    mux: Arc<Mux>,
    key: ChannelKey,
    handshake: Bytes,
    lazy: bool,
    opened: AtomicBool,
    connected: AtomicBool,
    alive: AtomicBool,
    pending: Mutex<VecDeque<Bytes>>,
    pending_cap: usize,
    ready: watch::Sender<Readiness>,
}

/// Cloneable write/lifecycle handle for a [`PlexStream`].
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    /// Write one message. Buffered until the channel opens; silently
    /// dropped once the duplex is destroyed.
    pub async fn write(&self, msg: Bytes) -> Result<()> {
        let shared = &self.shared;
        if !shared.alive.load(Ordering::Acquire) {
            return Ok(());
        }
        if shared.lazy {
            self.ensure_open().await?;
        }
        {
            let mut queue = shared.pending.lock().unwrap();
            if !shared.connected.load(Ordering::Acquire) {
                if queue.len() >= shared.pending_cap {
                    return Err(PlexError::BufferFull);
                }
                queue.push_back(msg);
                return Ok(());
            }
        }
        shared.mux.send(&shared.key, msg).await
    }

    /// Best-effort write for non-async contexts. Buffers like [`write`]
    /// when the channel is not yet open; drops the message instead of
    /// waiting when the transport is saturated.
    ///
    /// [`write`]: StreamHandle::write
    pub fn try_write(&self, msg: Bytes) {
        let shared = &self.shared;
        if !shared.alive.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = shared.pending.lock().unwrap();
            if !shared.connected.load(Ordering::Acquire) {
                if queue.len() < shared.pending_cap {
                    queue.push_back(msg);
                }
                return;
            }
        }
        shared.mux.try_send(&shared.key, msg);
    }

    /// True iff the duplex is alive and the channel fully open.
    pub fn is_connected(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire) && self.shared.connected.load(Ordering::Acquire)
    }

    /// True until the duplex is destroyed.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Wait until the channel is open (triggering a lazy OPEN if needed).
    pub async fn wait_connected(&self) -> Result<()> {
        if self.shared.lazy {
            self.ensure_open().await?;
        }
        let mut rx = self.shared.ready.subscribe();
        loop {
            match *rx.borrow_and_update() {
                Readiness::Connected => return Ok(()),
                Readiness::Dead => return Err(PlexError::ConnectionClosed),
                Readiness::Pending => {}
            }
            rx.changed()
                .await
                .map_err(|_| PlexError::ConnectionClosed)?;
        }
    }

    /// Gracefully close the channel; both sides observe close then destroy.
    pub async fn close(&self) {
        channel_teardown(&self.shared);
        self.shared.mux.close(&self.shared.key).await;
    }

    /// Tear the channel down without awaiting transport writes.
    pub fn destroy(&self) {
        channel_teardown(&self.shared);
        self.shared.mux.try_close(&self.shared.key);
    }

    /// The channel identity behind this duplex.
    pub fn key(&self) -> &ChannelKey {
        &self.shared.key
    }

    async fn ensure_open(&self) -> Result<()> {
        if !self.shared.opened.swap(true, Ordering::AcqRel) {
            self.shared
                .mux
                .open(&self.shared.key, self.shared.handshake.clone())
                .await?;
        }
        Ok(())
    }
}

fn channel_teardown(shared: &StreamShared) {
    // Unpair so a not-yet-paired remote is not answered later.
    shared.mux.unpair(&shared.key);
}

/// A channel presented as a stream-style byte duplex.
pub struct PlexStream {
    handle: StreamHandle,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl PlexStream {
    /// Connect-mode duplex: ensures the channel and sends the local OPEN.
    ///
    /// With `eager` false the OPEN is deferred until the first write or
    /// readiness wait.
    pub async fn connect(mux: Arc<Mux>, cfg: ChannelConfig, eager: bool) -> Result<PlexStream> {
        let stream = Self::build(mux, cfg, !eager, false)?;
        if eager {
            stream.handle.ensure_open().await?;
        }
        Ok(stream)
    }

    /// Listen-mode duplex: pairs the channel; the local OPEN answers the
    /// remote's and the connection events fire after the remote initiates.
    pub fn listen(mux: Arc<Mux>, cfg: ChannelConfig) -> Result<PlexStream> {
        Self::build(mux, cfg, false, true)
    }

    fn build(mux: Arc<Mux>, mut cfg: ChannelConfig, lazy: bool, listen: bool) -> Result<PlexStream> {
        cfg.normalize();
        let key = cfg.key();
        let channel_events = channel::ensure(&mux, &cfg).ok_or_else(|| {
            if mux.is_closed() {
                PlexError::ConnectionClosed
            } else {
                PlexError::Protocol(format!("channel already claimed: {}", key.protocol))
            }
        })?;
        if listen {
            channel::pair(&mux, &cfg);
        }

        let (ready, _) = watch::channel(Readiness::Pending);
        let shared = Arc::new(StreamShared {
            mux,
            key,
            handshake: cfg.handshake(),
            lazy,
            // Listen-side OPEN is owned by the pair registration.
            opened: AtomicBool::new(listen),
            connected: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            pending: Mutex::new(VecDeque::new()),
            pending_cap: DEFAULT_PENDING_WRITES,
            ready,
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(shared.clone(), channel_events, inbound_tx, event_tx));

        Ok(PlexStream {
            handle: StreamHandle { shared },
            inbound: inbound_rx,
            events: event_rx,
        })
    }

    /// Cloneable write/lifecycle handle.
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Receive the next inbound message; `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Next lifecycle event, in emission order.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// See [`StreamHandle::write`].
    pub async fn write(&self, msg: Bytes) -> Result<()> {
        self.handle.write(msg).await
    }

    /// See [`StreamHandle::is_connected`].
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// See [`StreamHandle::wait_connected`].
    pub async fn wait_connected(&self) -> Result<()> {
        self.handle.wait_connected().await
    }

    /// See [`StreamHandle::close`].
    pub async fn close(&self) {
        self.handle.close().await
    }

    /// See [`StreamHandle::destroy`].
    pub fn destroy(&self) {
        self.handle.destroy()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        StreamHandle,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        (self.handle, self.inbound, self.events)
    }
}

async fn pump(
    shared: Arc<StreamShared>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    inbound: mpsc::UnboundedSender<Bytes>,
    user: mpsc::UnboundedSender<StreamEvent>,
) {
    let mut inbound = Some(inbound);
    let mut destroyed = false;

    while let Some(event) = channel_events.recv().await {
        match event {
            ChannelEvent::Open(handshake) => {
                flush_pending(&shared).await;
                let _ = user.send(StreamEvent::RemoteOpen(handshake.clone()));
                let _ = user.send(StreamEvent::Connection(handshake));
            }
            ChannelEvent::Message(msg) => {
                if let Some(tx) = &inbound {
                    let _ = tx.send(msg);
                }
            }
            ChannelEvent::Close => {
                shared.connected.store(false, Ordering::Release);
                inbound.take();
                let _ = user.send(StreamEvent::Close);
            }
            ChannelEvent::Destroy => {
                shared.alive.store(false, Ordering::Release);
                shared.ready.send_replace(Readiness::Dead);
                let _ = user.send(StreamEvent::Destroy);
                destroyed = true;
                break;
            }
        }
    }

    // Substrate dropped without a destroy event: tear down anyway.
    if !destroyed {
        shared.connected.store(false, Ordering::Release);
        shared.alive.store(false, Ordering::Release);
        shared.ready.send_replace(Readiness::Dead);
        inbound.take();
        let _ = user.send(StreamEvent::Close);
        let _ = user.send(StreamEvent::Destroy);
    }
}

/// Drain buffered writes in order, then mark the duplex connected.
///
/// Writers queue while `connected` is false and both sides of that flag
/// flip under the pending-queue lock, so no write can overtake the flush.
async fn flush_pending(shared: &Arc<StreamShared>) {
    loop {
        let batch: Vec<Bytes> = {
            let mut queue = shared.pending.lock().unwrap();
            if queue.is_empty() {
                shared.connected.store(true, Ordering::Release);
                shared.ready.send_replace(Readiness::Connected);
                return;
            }
            queue.drain(..).collect()
        };
        for msg in batch {
            if shared.mux.send(&shared.key, msg).await.is_err() {
                return;
            }
        }
    }
}
