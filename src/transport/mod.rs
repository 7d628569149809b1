//! Framed transport contract.
//!
//! A [`FramedDuplex`] is the object plex consumes: an ordered, reliable,
//! bidirectional message channel where each received [`Bytes`] is one
//! complete message written by the peer. Length-prefixing of raw byte
//! streams is the caller's concern; this module only adapts already-framed
//! sources into the duplex shape:
//!
//! - [`FramedDuplex::pair`]: two connected in-memory duplexes.
//! - [`FramedDuplex::from_channel`]: adopt caller-owned mpsc halves.
//! - [`FramedDuplex::from_sink_stream`]: bridge any `futures` sink/stream
//!   pair (the shape WebSocket crates expose) into the duplex contract.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::{PlexError, Result};

/// Default message capacity for in-memory duplexes.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// An ordered reliable framed byte-message duplex.
///
/// Dropping one side (or its adapters) terminates the other side's read
/// loop, which plex observes as transport close.
pub struct FramedDuplex {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl FramedDuplex {
    /// Create a pair of connected in-memory duplexes.
    pub fn pair() -> (FramedDuplex, FramedDuplex) {
        Self::pair_with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a connected pair with a custom per-direction capacity.
    pub fn pair_with_capacity(capacity: usize) -> (FramedDuplex, FramedDuplex) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            FramedDuplex { tx: a_tx, rx: a_rx },
            FramedDuplex { tx: b_tx, rx: b_rx },
        )
    }

    /// Adopt caller-owned channel halves as a duplex.
    ///
    /// `tx` carries outbound messages toward the peer, `rx` yields inbound
    /// messages from it. An external framer (length-prefixed TCP, etc.)
    /// owns the other ends.
    pub fn from_channel(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> FramedDuplex {
        FramedDuplex { tx, rx }
    }

    /// Bridge a `futures` sink/stream pair into the duplex contract.
    ///
    /// This is how a WebSocket becomes a plex transport: the socket's
    /// binary-message sink and stream halves are pumped by two background
    /// tasks. A stream error or end terminates the duplex.
    pub fn from_sink_stream<Si, St, E>(mut sink: Si, mut stream: St) -> FramedDuplex
    where
        Si: Sink<Bytes, Error = E> + Send + Unpin + 'static,
        St: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(DEFAULT_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(DEFAULT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!("transport sink error: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(msg)) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("transport stream error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        });

        FramedDuplex {
            tx: out_tx,
            rx: in_rx,
        }
    }

    /// Send one complete message to the peer.
    pub async fn send(&self, msg: Bytes) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| PlexError::ConnectionClosed)
    }

    /// Receive the next complete message, or `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Split into raw halves. The substrate consumes the duplex this way,
    /// which is what makes the substrate unique per transport.
    pub(crate) fn split(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (a, mut b) = FramedDuplex::pair();

        a.send(Bytes::from_static(b"hello")).await.unwrap();
        a.send(Bytes::from_static(b"world")).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"world"));
    }

    #[tokio::test]
    async fn test_drop_terminates_peer() {
        let (a, mut b) = FramedDuplex::pair();
        drop(a);
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_messages_stay_framed() {
        let (a, mut b) = FramedDuplex::pair();

        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::new()).await.unwrap();
        a.send(Bytes::from_static(b"three")).await.unwrap();

        assert_eq!(b.recv().await.unwrap().as_ref(), b"one");
        assert!(b.recv().await.unwrap().is_empty());
        assert_eq!(b.recv().await.unwrap().as_ref(), b"three");
    }

    #[tokio::test]
    async fn test_sink_stream_bridge() {
        let (remote_in_tx, remote_in_rx) = mpsc::channel::<Bytes>(8);
        let (remote_out_tx, mut remote_out_rx) = mpsc::channel::<Bytes>(8);

        // A fake socket: sink writes land in remote_out, stream yields remote_in.
        let sink = futures::sink::unfold(remote_out_tx, |tx, msg: Bytes| async move {
            tx.send(msg).await.map_err(|_| "closed")?;
            Ok::<_, &str>(tx)
        });
        let stream = tokio_stream_from(remote_in_rx);

        let mut duplex = FramedDuplex::from_sink_stream(Box::pin(sink), Box::pin(stream));

        duplex.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(remote_out_rx.recv().await.unwrap().as_ref(), b"ping");

        remote_in_tx.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(duplex.recv().await.unwrap().as_ref(), b"pong");
    }

    fn tokio_stream_from(
        rx: mpsc::Receiver<Bytes>,
    ) -> impl Stream<Item = std::result::Result<Bytes, &'static str>> {
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (Ok(msg), rx))
        })
    }
}
