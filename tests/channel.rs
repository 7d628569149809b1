//! Channel lifecycle laws: buffering, event ordering, substrate
//! uniqueness, and transport nesting.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use plex::{
    connect_store_port, expose_store_port, CallOptions, FramedDuplex, Peer, PlexStream,
    PortOptions, StreamEvent,
};

#[tokio::test]
async fn test_buffered_writes_flush_once_in_order() {
    let (a, b) = FramedDuplex::pair();
    let left = Peer::new(a);
    let right = Peer::new(b);

    // Listen side queues writes before any remote shows up.
    let server = right.listen_stream(Bytes::from_static(&[1])).unwrap();
    for i in 0..5u8 {
        server.write(Bytes::from(vec![i])).await.unwrap();
    }

    let mut client = left.connect_stream(Bytes::from_static(&[1])).await.unwrap();
    for i in 0..5u8 {
        assert_eq!(client.recv().await.unwrap().as_ref(), &[i]);
    }

    // Nothing is replayed afterwards.
    server.write(Bytes::from_static(b"tail")).await.unwrap();
    assert_eq!(client.recv().await.unwrap().as_ref(), b"tail");
}

#[tokio::test]
async fn test_close_precedes_destroy_on_both_sides() {
    let (a, b) = FramedDuplex::pair();
    let left = Peer::new(a);
    let right = Peer::new(b);

    let mut server = right.listen_stream(Bytes::from_static(&[2])).unwrap();
    let mut client = left.connect_stream(Bytes::from_static(&[2])).await.unwrap();
    client.wait_connected().await.unwrap();
    server.wait_connected().await.unwrap();

    server.close().await;

    let mut seen_client = Vec::new();
    while let Some(event) = client.next_event().await {
        let done = event == StreamEvent::Destroy;
        seen_client.push(event);
        if done {
            break;
        }
    }
    let close_at = seen_client
        .iter()
        .position(|e| *e == StreamEvent::Close)
        .unwrap();
    let destroy_at = seen_client
        .iter()
        .position(|e| *e == StreamEvent::Destroy)
        .unwrap();
    assert!(close_at < destroy_at);
}

#[tokio::test]
async fn test_is_connected_tracks_open_and_destroy() {
    let (a, b) = FramedDuplex::pair();
    let left = Peer::new(a);
    let right = Peer::new(b);

    let server = right.listen_stream(Bytes::from_static(&[3])).unwrap();
    assert!(!server.is_connected());

    let client = left.connect_stream(Bytes::from_static(&[3])).await.unwrap();
    client.wait_connected().await.unwrap();
    server.wait_connected().await.unwrap();
    assert!(client.is_connected());
    assert!(server.is_connected());

    client.destroy();
    assert!(!client.is_connected());

    // The remote side observes the teardown too.
    let mut server = server;
    loop {
        match server.next_event().await {
            Some(StreamEvent::Destroy) | None => break,
            Some(_) => {}
        }
    }
    assert!(!server.is_connected());
}

#[tokio::test]
async fn test_substrate_shared_across_lanes() {
    let (a, _b) = FramedDuplex::pair();
    let peer = Peer::new(a);

    let rpc = peer.listen_rpc(Bytes::from_static(&[4])).unwrap();
    let events = peer.listen_stream(Bytes::from_static(&[4])).unwrap();

    // Different protocols, same substrate instance.
    assert_ne!(rpc.handle().key().protocol, events.handle().key().protocol);
    assert!(Arc::ptr_eq(peer.mux(), peer.mux()));
}

/// Bridge a plex duplex into the framed-transport shape, so one plex
/// channel can carry another plex instance.
fn nested_transport(stream: PlexStream) -> FramedDuplex {
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(64);
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(64);

    let handle = stream.handle();
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if handle.write(msg).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut stream = stream;
        while let Some(msg) = stream.recv().await {
            if in_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    FramedDuplex::from_channel(out_tx, in_rx)
}

#[tokio::test]
async fn test_plex_channel_carries_nested_plex() {
    let (a, b) = FramedDuplex::pair();
    let outer_left = Peer::new(a);
    let outer_right = Peer::new(b);

    let carrier_server = outer_right.listen_stream(Bytes::from_static(&[9])).unwrap();
    let carrier_client = outer_left
        .connect_stream(Bytes::from_static(&[9]))
        .await
        .unwrap();
    carrier_client.wait_connected().await.unwrap();
    carrier_server.wait_connected().await.unwrap();

    // An entire plex stack rides inside the outer channel.
    let inner_left = Peer::new(nested_transport(carrier_client));
    let inner_right = Peer::new(nested_transport(carrier_server));

    let store = common::MemStore::new();
    let _port = expose_store_port(
        &inner_right,
        PortOptions::new(common::STORE_ID),
        Arc::new(store.clone()),
    )
    .unwrap();
    let client = connect_store_port(&inner_left, PortOptions::new(common::STORE_ID))
        .await
        .unwrap();

    let env = client
        .put("nested", "works", CallOptions::default())
        .await
        .unwrap();
    assert!(env.is_ok());
    let env = client.get("nested", CallOptions::default()).await.unwrap();
    assert_eq!(env.value().unwrap().as_ref(), b"works");
}
