//! RPC layer: framing, settings, server, and client proxy.
//!
//! Frames ride as channel messages on a [`PlexStream`]; the server
//! dispatches to a [`StoreHandler`], the client tracks routes by request
//! id. See the submodules for the moving parts.
//!
//! [`PlexStream`]: crate::duplex::PlexStream
//! [`StoreHandler`]: server::StoreHandler

pub mod client;
pub mod server;
pub mod settings;
pub mod wire;
