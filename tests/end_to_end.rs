#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Full client/server sessions over real TCP: handshake, trust decisions,
//! application frame exchange, keep-alive transparency.

use framewire::service::{Server, ServerEvent};
use framewire::{
    ClientSession, FrameBuilder, FrameReader, PrivateKey, ProtocolError, TrustCheck,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("loopback address")
}

const OPCODE_NOTE: u8 = framewire::Opcode::APPLICATION_BASE;

fn note_frame(body: &[u8]) -> bytes::Bytes {
    let mut pb = FrameBuilder::new();
    pb.append_uint(body.len() as u64, 2).unwrap();
    pb.append_bytes(body);
    pb.prepend_opcode(OPCODE_NOTE);
    pb.build()
}

fn read_note(frame: bytes::Bytes) -> Vec<u8> {
    let mut pr = FrameReader::new(frame);
    assert_eq!(pr.read_u8().unwrap(), OPCODE_NOTE);
    let len = pr.read_u16().unwrap() as usize;
    pr.read_bytes(len).unwrap().to_vec()
}

#[tokio::test]
async fn session_exchanges_frames_both_ways() {
    framewire::utils::logging::init(&Default::default());

    let server_key = PrivateKey::random().unwrap();
    let guid = Uuid::new_v4();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut server = Server::start(
        guid,
        server_key,
        loopback(),
        4,
        Arc::new(|_, _| true),
        events_tx,
    )
    .await
    .unwrap();

    let client_key = PrivateKey::random().unwrap();
    let first_contact = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&first_contact);
    let mut session = ClientSession::connect(server.local_addr(), &client_key, None, move |check| {
        observed.store(matches!(check, TrustCheck::FirstContact), Ordering::SeqCst);
        true
    })
    .await
    .unwrap();

    // the unpinned server was escalated as a first contact
    assert!(first_contact.load(Ordering::SeqCst));
    assert_eq!(session.identity().guid, guid);

    let (connection, mut inbound) = match events.recv().await.unwrap() {
        ServerEvent::ClientConnected { connection, frames } => (connection, frames),
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    // client → server
    session.send(&note_frame(b"hello server")).await.unwrap();
    let frame = inbound.recv().await.unwrap();
    assert_eq!(read_note(frame), b"hello server");

    // server → client, with a keep-alive in front that recv() must skip
    connection.send_keep_alive().await.unwrap();
    connection.send_frame(&note_frame(b"hello client")).await.unwrap();
    let frame = session.recv().await.unwrap().unwrap();
    assert_eq!(read_note(frame), b"hello client");

    // the handle carries the client's verified key once active
    assert_eq!(
        connection.peer_key().as_ref(),
        Some(&client_key.to_public_key())
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn frames_arrive_in_reassembly_order() {
    let server_key = PrivateKey::random().unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut server = Server::start(
        Uuid::new_v4(),
        server_key,
        loopback(),
        1,
        Arc::new(|_, _| true),
        events_tx,
    )
    .await
    .unwrap();

    let client_key = PrivateKey::random().unwrap();
    let mut session = ClientSession::connect(server.local_addr(), &client_key, None, |_| true)
        .await
        .unwrap();

    let (_connection, mut inbound) = match events.recv().await.unwrap() {
        ServerEvent::ClientConnected { connection, frames } => (connection, frames),
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    for i in 0..10u8 {
        session.send(&note_frame(&[i])).await.unwrap();
    }
    for i in 0..10u8 {
        let frame = inbound.recv().await.unwrap();
        assert_eq!(read_note(frame), [i]);
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn pinned_identity_skips_escalation() {
    let server_key = PrivateKey::random().unwrap();
    let guid = Uuid::new_v4();
    let (events_tx, _events) = mpsc::unbounded_channel();
    let mut server = Server::start(
        guid,
        server_key,
        loopback(),
        4,
        Arc::new(|_, _| true),
        events_tx,
    )
    .await
    .unwrap();
    let addr = server.local_addr();

    // first session: accept the first contact and pin what was presented
    let client_key = PrivateKey::random().unwrap();
    let session = ClientSession::connect(addr, &client_key, None, |_| true)
        .await
        .unwrap();
    let pinned = session.identity().clone();
    session.disconnect().await.unwrap();

    // second session: a known identity must never reach the decision hook
    let _session = ClientSession::connect(addr, &client_key, Some(pinned), |_: &TrustCheck| {
        panic!("decision hook must not run for a known identity")
    })
    .await
    .unwrap();

    server.stop().await.unwrap();
}

#[tokio::test]
async fn changed_identity_is_escalated_and_rejectable() {
    let old_key = PrivateKey::random().unwrap();
    let new_key = PrivateKey::random().unwrap();
    let guid = Uuid::new_v4();

    // pin the old identity, then bring the server up with a new key
    let pinned = framewire::ServerIdentity {
        guid,
        public_key: old_key.to_public_key(),
    };

    let (events_tx, _events) = mpsc::unbounded_channel();
    let mut server = Server::start(
        guid,
        new_key,
        loopback(),
        4,
        Arc::new(|_, _| true),
        events_tx,
    )
    .await
    .unwrap();

    let client_key = PrivateKey::random().unwrap();
    let saw_change = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&saw_change);
    let result = ClientSession::connect(
        server.local_addr(),
        &client_key,
        Some(pinned),
        move |check| {
            observed.store(matches!(check, TrustCheck::Changed { .. }), Ordering::SeqCst);
            false
        },
    )
    .await;

    assert!(saw_change.load(Ordering::SeqCst));
    assert!(matches!(result, Err(ProtocolError::TrustRejected)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_side_trust_rejection_drops_the_connection() {
    let server_key = PrivateKey::random().unwrap();
    let (events_tx, _events) = mpsc::unbounded_channel();
    let mut server = Server::start(
        Uuid::new_v4(),
        server_key,
        loopback(),
        4,
        Arc::new(|_, _| false), // the external collaborator refuses everyone
        events_tx,
    )
    .await
    .unwrap();

    let client_key = PrivateKey::random().unwrap();
    let result = ClientSession::connect(server.local_addr(), &client_key, None, |_| true).await;
    // the client never gets its challenge; the attempt fails
    assert!(result.is_err());

    // the rejected connection does not linger in the pool
    for _ in 0..50 {
        if server.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert_eq!(server.connection_count(), 0);

    server.stop().await.unwrap();
}
