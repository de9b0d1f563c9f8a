//! Hive Protocol tests over real loopback sockets.
//!
//! A raw framed client stands in for a node so each handshake and
//! violation path can be driven by hand.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use hive::core::NodeId;
use hive::protocol::{HiveCodec, HiveMessage, ProtocolError, PROTOCOL_VERSION};
use hive::vcpu::ISA_VERSION;
use hive::{Coordinator, CoordinatorHandle};

use crate::fixtures::*;

const WAIT: Duration = Duration::from_secs(5);

async fn start_coordinator() -> CoordinatorHandle {
    let mut config = cluster_config();
    config.coordinator.cluster_epoch = 7;
    config.protocol.max_frame_bytes = 4 * 1024;
    Coordinator::new(config).start().await.unwrap()
}

async fn client(addr: SocketAddr) -> Framed<TcpStream, HiveCodec> {
    Framed::new(TcpStream::connect(addr).await.unwrap(), HiveCodec::new(4 * 1024))
}

async fn next(framed: &mut Framed<TcpStream, HiveCodec>) -> Option<HiveMessage> {
    tokio::time::timeout(WAIT, framed.next())
        .await
        .expect("no reply in time")
        .and_then(|r| r.ok())
}

#[tokio::test]
async fn test_frames_survive_split_writes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, HiveCodec::default());
        let first = framed.next().await.unwrap().unwrap();
        let second = framed.next().await.unwrap().unwrap();
        (first, second)
    });

    let payload = serde_json::to_vec(&hello("split", 2)).unwrap();
    let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&payload);
    let mut bytes = frame.clone();
    bytes.extend_from_slice(&frame);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    // a header split in two, then the rest with the next frame glued on
    stream.write_all(&bytes[..2]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&bytes[2..7]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&bytes[7..]).await.unwrap();

    let (first, second) = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(first, hello("split", 2));
    assert_eq!(second, hello("split", 2));
}

/// Test: Handshake
/// Given a coordinator on epoch 7
/// When a node says Hello with matching versions
/// Then it receives HelloAck with a session and appears as a member
#[tokio::test]
async fn test_handshake_accepted() {
    let coordinator = start_coordinator().await;
    let mut node = client(coordinator.local_addr()).await;
    node.send(hello("raw", 3)).await.unwrap();

    match next(&mut node).await {
        Some(HiveMessage::HelloAck {
            cluster_epoch,
            session,
            heartbeat_interval_ms,
        }) => {
            assert_eq!(cluster_epoch, 7);
            assert!(session > 0);
            assert_eq!(heartbeat_interval_ms, 50);
        }
        other => panic!("expected HelloAck, got {:?}", other),
    }
    let nodes = coordinator.nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, NodeId::from("raw"));
    assert_eq!(nodes[0].capacity, 3);
    coordinator.shutdown().await.unwrap();
}

/// Test: Incompatible Hello
/// Given a node on the wrong cluster epoch
/// When it says Hello
/// Then it gets HelloReject naming the epoch and the socket closes
#[tokio::test]
async fn test_wrong_epoch_rejected_and_closed() {
    let coordinator = start_coordinator().await;
    let mut node = client(coordinator.local_addr()).await;
    node.send(HiveMessage::Hello {
        node_id: NodeId::from("old"),
        capacity: 1,
        protocol_version: PROTOCOL_VERSION,
        isa_version: ISA_VERSION,
        cluster_epoch: 6,
    })
    .await
    .unwrap();

    match next(&mut node).await {
        Some(HiveMessage::HelloReject { reason }) => {
            assert!(reason.contains("epoch"), "reason: {}", reason)
        }
        other => panic!("expected HelloReject, got {:?}", other),
    }
    assert!(next(&mut node).await.is_none(), "connection closed");
    assert!(coordinator.nodes().await.unwrap().is_empty());
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_message_before_hello_rejected() {
    let coordinator = start_coordinator().await;
    let mut node = client(coordinator.local_addr()).await;
    node.send(heartbeat("eager", 1, vec![])).await.unwrap();
    assert!(matches!(
        next(&mut node).await,
        Some(HiveMessage::HelloReject { .. })
    ));
    coordinator.shutdown().await.unwrap();
}

/// Test: Identity binding
/// Given an admitted connection
/// When it sends a heartbeat claiming another node's identity
/// Then the coordinator closes the connection
#[tokio::test]
async fn test_spoofed_sender_closes_connection() {
    let coordinator = start_coordinator().await;
    let mut node = client(coordinator.local_addr()).await;
    node.send(hello("honest", 1)).await.unwrap();
    let session = match next(&mut node).await {
        Some(HiveMessage::HelloAck { session, .. }) => session,
        other => panic!("expected HelloAck, got {:?}", other),
    };

    node.send(heartbeat("someone-else", session, vec![]))
        .await
        .unwrap();
    assert!(next(&mut node).await.is_none());
    coordinator.shutdown().await.unwrap();
}

/// Test: Lost node is disconnected
/// Given an admitted node that stops sending heartbeats but keeps its socket
/// When the coordinator declares it lost
/// Then the socket is closed and the same node id can rejoin with a new
/// session
#[tokio::test]
async fn test_silent_node_closed_and_rejoins() {
    let coordinator = start_coordinator().await;
    let mut node = client(coordinator.local_addr()).await;
    node.send(hello("quiet", 1)).await.unwrap();
    let first = match next(&mut node).await {
        Some(HiveMessage::HelloAck { session, .. }) => session,
        other => panic!("expected HelloAck, got {:?}", other),
    };

    // heartbeat timeout is 50ms x 3 + 20ms skew
    assert!(next(&mut node).await.is_none(), "lost node's socket closed");
    assert!(coordinator.nodes().await.unwrap().is_empty());

    let mut again = client(coordinator.local_addr()).await;
    again.send(hello("quiet", 1)).await.unwrap();
    match next(&mut again).await {
        Some(HiveMessage::HelloAck { session, .. }) => assert!(session > first),
        other => panic!("expected HelloAck, got {:?}", other),
    }
    let nodes = coordinator.nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, NodeId::from("quiet"));
    coordinator.shutdown().await.unwrap();
}

/// Test: Frame limit
/// Given a coordinator with a 4 KiB frame limit
/// When a peer announces a larger frame
/// Then the connection is dropped without reading the body
#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let coordinator = start_coordinator().await;
    let mut stream = TcpStream::connect(coordinator.local_addr()).await.unwrap();
    stream
        .write_all(&(1_000_000u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&[b'{'; 64]).await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("socket closed in time");
    assert!(matches!(read, Ok(0) | Err(_)));
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_codec_rejects_oversized_encode() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _accept = tokio::spawn(async move { listener.accept().await });

    let mut framed = Framed::new(TcpStream::connect(addr).await.unwrap(), HiveCodec::new(32));
    let err = framed.send(hello("a-rather-long-node-name", 1)).await;
    assert!(matches!(err, Err(ProtocolError::FrameTooLarge { max: 32 })));
}
