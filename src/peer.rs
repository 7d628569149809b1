//! A peer: one transport plus the multiplex substrate over it.
//!
//! Lanes partition the transport by purpose: `rpc`, `events`, or any
//! caller-chosen suffix appended to the peer's protocol base. Each lane
//! call returns a fresh [`PlexStream`] bound to `(id, "{base}/{lane}")`.

use std::sync::Arc;

use bytes::Bytes;

use crate::channel::{ChannelConfig, PROTOCOL_BASE};
use crate::duplex::PlexStream;
use crate::error::Result;
use crate::mux::Mux;
use crate::transport::FramedDuplex;

/// Lane suffix for RPC traffic.
pub const LANE_RPC: &str = "rpc";
/// Lane suffix for event streams.
pub const LANE_EVENTS: &str = "events";

/// One transport and its substrate, with lane-opening helpers.
pub struct Peer {
    mux: Arc<Mux>,
    protocol_base: String,
}

impl Peer {
    /// Wrap a transport with the default protocol base.
    pub fn new(transport: FramedDuplex) -> Arc<Peer> {
        Self::with_protocol_base(transport, PROTOCOL_BASE)
    }

    /// Wrap a transport with a custom protocol base.
    pub fn with_protocol_base(transport: FramedDuplex, base: impl Into<String>) -> Arc<Peer> {
        Arc::new(Peer {
            mux: Mux::attach(transport),
            protocol_base: base.into(),
        })
    }

    /// The substrate for this peer's transport. Always the same instance:
    /// attaching consumed the transport, so nothing else can wrap it.
    pub fn mux(&self) -> &Arc<Mux> {
        &self.mux
    }

    /// The protocol base lanes are derived from.
    pub fn protocol_base(&self) -> &str {
        &self.protocol_base
    }

    /// Open the RPC lane, connect side.
    pub async fn connect_rpc(&self, id: impl Into<Bytes>) -> Result<PlexStream> {
        self.connect_lane(id, LANE_RPC).await
    }

    /// Open the RPC lane, listen side.
    pub fn listen_rpc(&self, id: impl Into<Bytes>) -> Result<PlexStream> {
        self.listen_lane(id, LANE_RPC)
    }

    /// Open the events lane, connect side.
    pub async fn connect_stream(&self, id: impl Into<Bytes>) -> Result<PlexStream> {
        self.connect_lane(id, LANE_EVENTS).await
    }

    /// Open the events lane, listen side.
    pub fn listen_stream(&self, id: impl Into<Bytes>) -> Result<PlexStream> {
        self.listen_lane(id, LANE_EVENTS)
    }

    /// Open a custom lane, connect side.
    pub async fn connect_lane(&self, id: impl Into<Bytes>, lane: &str) -> Result<PlexStream> {
        PlexStream::connect(self.mux.clone(), self.lane_config(id, lane), true).await
    }

    /// Open a custom lane, connect side, deferring OPEN to first use.
    pub async fn connect_lane_lazy(&self, id: impl Into<Bytes>, lane: &str) -> Result<PlexStream> {
        PlexStream::connect(self.mux.clone(), self.lane_config(id, lane), false).await
    }

    /// Open a custom lane, listen side.
    pub fn listen_lane(&self, id: impl Into<Bytes>, lane: &str) -> Result<PlexStream> {
        PlexStream::listen(self.mux.clone(), self.lane_config(id, lane))
    }

    fn lane_config(&self, id: impl Into<Bytes>, lane: &str) -> ChannelConfig {
        ChannelConfig::new(id).with_protocol(format!("{}/{}", self.protocol_base, lane))
    }
}
