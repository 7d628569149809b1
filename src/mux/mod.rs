//! Multiplex substrate.
//!
//! Maps one framed transport to many sub-channels keyed by
//! `(id, protocol)`. The substrate owns the transport's read half through
//! a single reader task and fans decoded frames out to per-channel
//! lifecycle-event receivers:
//!
//! ```text
//! transport ─► reader task ─► MuxFrame ─┬─► channel (id1, proto1) events
//!                                       ├─► channel (id2, proto1) events
//!                                       └─► channel (id1, proto2) events
//! ```
//!
//! Attaching consumes the [`FramedDuplex`], so a transport has exactly one
//! substrate; everything sharing the transport shares the same [`Mux`]
//! through its `Arc`.
//!
//! Open semantics follow the pair/open lifecycle: both sides announce OPEN
//! for the key; a channel is open once the local OPEN was sent and the
//! remote OPEN observed. A paired (listen-side) channel answers the remote
//! OPEN automatically before surfacing the open event. CLOSE from either
//! side tears the channel down symmetrically: observers always see `Close`
//! followed by `Destroy`.

mod wire;

pub use wire::MuxFrame;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{PlexError, Result};
use crate::transport::FramedDuplex;

/// Identity of a sub-channel: opaque id bytes plus protocol string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    /// Opaque channel id, compared bytewise.
    pub id: Bytes,
    /// Full protocol string including any lane suffix.
    pub protocol: String,
}

impl ChannelKey {
    /// Build a key from id bytes and a protocol string.
    pub fn new(id: impl Into<Bytes>, protocol: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol: protocol.into(),
        }
    }
}

/// Lifecycle events delivered to a channel's single observer.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The remote side opened the channel; carries its handshake payload.
    Open(Bytes),
    /// One inbound channel message.
    Message(Bytes),
    /// The channel closed (either side).
    Close,
    /// The channel is gone; always follows `Close`.
    Destroy,
}

struct ChannelSlot {
    local_open: bool,
    remote_open: bool,
    /// Listen-mode flag: answer a remote OPEN with our own OPEN.
    accept_on_remote: bool,
    handshake: Bytes,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

struct MuxInner {
    channels: HashMap<ChannelKey, ChannelSlot>,
    closed: bool,
}

/// The multiplex substrate over one transport.
pub struct Mux {
    out_tx: mpsc::Sender<Bytes>,
    inner: Mutex<MuxInner>,
}

impl Mux {
    /// Attach a substrate to a transport, consuming it.
    pub fn attach(transport: FramedDuplex) -> Arc<Mux> {
        let (out_tx, rx) = transport.split();
        let mux = Arc::new(Mux {
            out_tx,
            inner: Mutex::new(MuxInner {
                channels: HashMap::new(),
                closed: false,
            }),
        });

        let reader = mux.clone();
        tokio::spawn(async move {
            reader.read_loop(rx).await;
        });

        mux
    }

    /// True if a channel slot exists for this key.
    pub fn has_channel(&self, key: &ChannelKey) -> bool {
        self.inner.lock().unwrap().channels.contains_key(key)
    }

    /// True iff the channel is fully open (local OPEN sent, remote OPEN seen).
    pub fn is_open(&self, key: &ChannelKey) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .channels
            .get(key)
            .map(|slot| slot.local_open && slot.remote_open)
            .unwrap_or(false)
    }

    /// True once the transport has closed underneath the substrate.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Create the channel slot for `key` if absent.
    ///
    /// Returns the lifecycle-event receiver on first creation; `None` when
    /// the slot already existed (the original observer keeps it).
    pub fn ensure(&self, key: &ChannelKey) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.channels.contains_key(key) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.channels.insert(
            key.clone(),
            ChannelSlot {
                local_open: false,
                remote_open: false,
                accept_on_remote: false,
                handshake: Bytes::new(),
                events: tx,
            },
        );
        Some(rx)
    }

    /// Open the local side of the channel, announcing `handshake`.
    ///
    /// Re-opening an already-open side is a no-op.
    pub async fn open(&self, key: &ChannelKey, handshake: Bytes) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .channels
                .get_mut(key)
                .ok_or_else(|| PlexError::Protocol("open on unknown channel".into()))?;
            if slot.local_open {
                return Ok(());
            }
            slot.local_open = true;
            slot.handshake = handshake.clone();
        }
        self.send_frame(MuxFrame::Open {
            key: key.clone(),
            handshake,
        })
        .await
    }

    /// Register the channel for pairing: when the remote OPEN arrives, the
    /// substrate sends the local OPEN (with `handshake`) before surfacing
    /// the open event.
    pub fn pair(&self, key: &ChannelKey, handshake: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.channels.get_mut(key) {
            slot.accept_on_remote = true;
            slot.handshake = handshake;
        }
    }

    /// Cancel an outstanding pair registration.
    pub fn unpair(&self, key: &ChannelKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.channels.get_mut(key) {
            slot.accept_on_remote = false;
        }
    }

    /// Send one message on an open channel.
    pub async fn send(&self, key: &ChannelKey, payload: Bytes) -> Result<()> {
        self.send_frame(MuxFrame::Data {
            key: key.clone(),
            payload,
        })
        .await
    }

    /// Best-effort message send for non-async paths (drop handlers).
    pub fn try_send(&self, key: &ChannelKey, payload: Bytes) {
        let frame = MuxFrame::Data {
            key: key.clone(),
            payload,
        };
        let _ = self.out_tx.try_send(frame.encode());
    }

    /// Close the channel: notify the remote, emit `Close` then `Destroy`
    /// locally, and drop the slot.
    pub async fn close(&self, key: &ChannelKey) {
        if self.remove_and_notify(key) {
            let _ = self
                .send_frame(MuxFrame::Close { key: key.clone() })
                .await;
        }
    }

    /// Best-effort close for non-async paths.
    pub fn try_close(&self, key: &ChannelKey) {
        if self.remove_and_notify(key) {
            let frame = MuxFrame::Close { key: key.clone() };
            let _ = self.out_tx.try_send(frame.encode());
        }
    }

    fn remove_and_notify(&self, key: &ChannelKey) -> bool {
        let slot = self.inner.lock().unwrap().channels.remove(key);
        match slot {
            Some(slot) => {
                let _ = slot.events.send(ChannelEvent::Close);
                let _ = slot.events.send(ChannelEvent::Destroy);
                true
            }
            None => false,
        }
    }

    async fn send_frame(&self, frame: MuxFrame) -> Result<()> {
        self.out_tx
            .send(frame.encode())
            .await
            .map_err(|_| PlexError::ConnectionClosed)
    }

    async fn read_loop(self: &Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
        while let Some(msg) = rx.recv().await {
            match MuxFrame::decode(msg) {
                Ok(frame) => self.handle_frame(frame).await,
                Err(e) => tracing::warn!("dropping malformed substrate frame: {}", e),
            }
        }
        self.transport_closed();
    }

    async fn handle_frame(&self, frame: MuxFrame) {
        match frame {
            MuxFrame::Open { key, handshake } => {
                let (events, answer, reject) = {
                    let mut inner = self.inner.lock().unwrap();
                    match inner.channels.get_mut(&key) {
                        Some(slot) if !slot.remote_open => {
                            slot.remote_open = true;
                            let answer = if slot.accept_on_remote && !slot.local_open {
                                slot.local_open = true;
                                Some(slot.handshake.clone())
                            } else {
                                None
                            };
                            (Some(slot.events.clone()), answer, false)
                        }
                        Some(_) => {
                            tracing::trace!(protocol = %key.protocol, "duplicate open ignored");
                            (None, None, false)
                        }
                        None => {
                            tracing::debug!(protocol = %key.protocol, "rejecting unpaired open");
                            (None, None, true)
                        }
                    }
                };

                // No listener for this key: tell the opener, so its side
                // observes close then destroy instead of waiting forever.
                if reject {
                    let _ = self.send_frame(MuxFrame::Close { key }).await;
                    return;
                }

                // The answering OPEN goes out before the open event is
                // surfaced, so replies triggered by the event trail it.
                if let Some(hs) = answer {
                    let _ = self
                        .send_frame(MuxFrame::Open {
                            key: key.clone(),
                            handshake: hs,
                        })
                        .await;
                }
                if let Some(events) = events {
                    let _ = events.send(ChannelEvent::Open(handshake));
                }
            }
            MuxFrame::Data { key, payload } => {
                let events = {
                    let inner = self.inner.lock().unwrap();
                    inner.channels.get(&key).map(|slot| slot.events.clone())
                };
                match events {
                    Some(events) => {
                        let _ = events.send(ChannelEvent::Message(payload));
                    }
                    None => tracing::trace!(protocol = %key.protocol, "data for unknown channel"),
                }
            }
            MuxFrame::Close { key } => {
                self.remove_and_notify(&key);
            }
        }
    }

    fn transport_closed(&self) {
        let slots: Vec<ChannelSlot> = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.channels.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let _ = slot.events.send(ChannelEvent::Close);
            let _ = slot.events.send(ChannelEvent::Destroy);
        }
    }
}
