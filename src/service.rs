//! Service composition: bind a handler to a peer's listen side, or a
//! client proxy to its connect side, with optional capability injection.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::peer::{Peer, LANE_RPC};
use crate::rpc::client::{CallOptions, ScanIter, ScanQuery, StoreClient};
use crate::rpc::server::{RpcServer, StoreHandler};
use crate::rpc::settings::RpcSettings;
use crate::rpc::wire::Envelope;

/// Options for exposing or connecting a store port.
pub struct PortOptions {
    /// Channel id for the lane.
    pub id: Bytes,
    /// Lane suffix; `None` uses the rpc lane.
    pub lane: Option<String>,
    /// Connect side only: send OPEN at construction instead of first use.
    pub eager_open: bool,
    /// RPC settings for the port.
    pub settings: RpcSettings,
}

impl PortOptions {
    /// Defaults: rpc lane, eager open, env settings.
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            lane: None,
            eager_open: true,
            settings: RpcSettings::from_env(),
        }
    }

    /// Use a custom lane suffix.
    pub fn lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    /// Defer the connect-side OPEN until the first call.
    pub fn lazy_open(mut self) -> Self {
        self.eager_open = false;
        self
    }

    /// Override the RPC settings.
    pub fn settings(mut self, settings: RpcSettings) -> Self {
        self.settings = settings;
        self
    }

    fn lane_name(&self) -> &str {
        self.lane.as_deref().unwrap_or(LANE_RPC)
    }
}

/// A served store port. [`shutdown`] tears the lane down and cancels
/// inflight requests; otherwise the port serves until the transport dies.
///
/// [`shutdown`]: ServerPort::shutdown
pub struct ServerPort {
    server: RpcServer,
}

impl ServerPort {
    /// Destroy the duplex and stop serving.
    pub fn shutdown(&self) {
        self.server.shutdown()
    }

    /// The underlying server.
    pub fn server(&self) -> &RpcServer {
        &self.server
    }
}

/// Serve `handler` on the peer's listen side of the configured lane.
pub fn expose_store_port(
    peer: &Peer,
    opts: PortOptions,
    handler: Arc<dyn StoreHandler>,
) -> Result<ServerPort> {
    let stream = peer.listen_lane(opts.id.clone(), opts.lane_name())?;
    let server = RpcServer::serve(stream, handler, opts.settings);
    Ok(ServerPort { server })
}

/// Open the peer's connect side of the configured lane and return a
/// client proxy for it.
pub async fn connect_store_port(peer: &Peer, opts: PortOptions) -> Result<StoreClient> {
    let stream = if opts.eager_open {
        peer.connect_lane(opts.id.clone(), opts.lane_name()).await?
    } else {
        peer.connect_lane_lazy(opts.id.clone(), opts.lane_name())
            .await?
    };
    Ok(StoreClient::with_settings(stream, opts.settings))
}

/// Wrap a client so every call carries `token` as its capability,
/// overriding any caller-supplied caps.
pub fn with_caps(client: StoreClient, token: impl Into<Bytes>) -> CapsClient {
    CapsClient {
        inner: client,
        token: token.into(),
    }
}

/// A client proxy that injects a fixed capability token into every call.
pub struct CapsClient {
    inner: StoreClient,
    token: Bytes,
}

impl CapsClient {
    fn stamp(&self, mut opts: CallOptions) -> CallOptions {
        opts.caps = Some(self.token.clone());
        opts
    }

    /// `get` with the capability token attached.
    pub async fn get(&self, key: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        self.inner.get(key, self.stamp(opts)).await
    }

    /// `put` with the capability token attached.
    pub async fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        opts: CallOptions,
    ) -> Result<Envelope> {
        self.inner.put(key, value, self.stamp(opts)).await
    }

    /// `del` with the capability token attached.
    pub async fn del(&self, key: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        self.inner.del(key, self.stamp(opts)).await
    }

    /// `append` with the capability token attached.
    pub async fn append(&self, value: impl Into<Bytes>, opts: CallOptions) -> Result<Envelope> {
        self.inner.append(value, self.stamp(opts)).await
    }

    /// `scan` with the capability token attached.
    pub async fn scan(&self, query: ScanQuery, opts: CallOptions) -> Result<ScanIter> {
        self.inner.scan(query, self.stamp(opts)).await
    }

    /// The wrapped client.
    pub fn inner(&self) -> &StoreClient {
        &self.inner
    }
}
