//! # plex
//!
//! Transport-agnostic multiplexing, RPC, and peer pooling over a single
//! framed byte stream.
//!
//! Hand plex any ordered reliable message duplex (an in-memory pair, a
//! length-prefixed TCP socket, a WebSocket, another plex channel) and it
//! presents a family of independent lane-labeled duplex channels over that
//! one transport, plus a request/reply RPC layer with unary and
//! server-streaming calls, and a peer pool balancing calls across several
//! transports.
//!
//! ## Layers
//!
//! - [`transport`]: the framed duplex contract and adapters
//! - [`mux`]: the multiplex substrate mapping one transport to many
//!   `(id, protocol)` channels
//! - [`channel`] / [`duplex`]: channel configuration and the
//!   stream-style wrapper
//! - [`peer`]: one transport, one substrate, lane helpers
//! - [`rpc`]: wire format, server, client proxy
//! - [`pool`]: weighted / round-robin / sticky peer selection with
//!   health tracking
//! - [`service`]: store-port composition and capability injection
//!
//! ## Example
//!
//! ```ignore
//! use plex::{FramedDuplex, Peer, PortOptions, StoreClient};
//!
//! let (a, b) = FramedDuplex::pair();
//! let server_peer = Peer::new(a);
//! let client_peer = Peer::new(b);
//!
//! let _port = plex::expose_store_port(
//!     &server_peer,
//!     PortOptions::new(&b"store"[..]),
//!     my_handler,
//! )?;
//! let client = plex::connect_store_port(&client_peer, PortOptions::new(&b"store"[..])).await?;
//! let value = client.get("k1", Default::default()).await?;
//! ```

pub mod channel;
pub mod duplex;
pub mod error;
pub mod mux;
pub mod peer;
pub mod pool;
pub mod rpc;
pub mod service;
pub mod transport;

mod trace;

pub use channel::{ChannelConfig, PROTOCOL_BASE};
pub use duplex::{PlexStream, StreamEvent, StreamHandle};
pub use error::{ErrorCode, PlexError, Result};
pub use peer::Peer;
pub use pool::{PeerMeta, PeerPool, Policy, PoolConfig, PoolEvent, PoolScan};
pub use rpc::client::{
    AbortHandle, AbortReason, AbortSignal, CallOptions, ScanIter, ScanQuery, StoreClient,
};
pub use rpc::server::{HandlerError, RpcServer, ScanStream, StoreHandler};
pub use rpc::settings::RpcSettings;
pub use rpc::wire::{Envelope, Method, ScanRange};
pub use service::{connect_store_port, expose_store_port, with_caps, CapsClient, PortOptions, ServerPort};
pub use transport::FramedDuplex;
