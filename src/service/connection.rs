//! Server-side handle for one live transport session.

use crate::core::frame::FrameBuilder;
use crate::error::Result;
use crate::protocol::handshake::ConnectionState;
use crate::protocol::Opcode;
use crate::utils::crypto::PublicKey;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One pooled connection. The read half lives inside the connection's
/// worker; this handle owns the write half and the lifecycle state.
///
/// All per-connection processing is driven by that single worker — the
/// handle only needs to synchronize writes (any task may send) and state
/// reads (observers may poll).
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    state: Mutex<ConnectionState>,
    identity: Mutex<Option<PublicKey>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
    lost: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        peer_addr: SocketAddr,
        writer: OwnedWriteHalf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            state: Mutex::new(ConnectionState::Accepted),
            identity: Mutex::new(None),
            writer: tokio::sync::Mutex::new(writer),
            cancel,
            lost: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        // a poisoned lock means the owning worker died; report terminal
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// The peer's verified public key, once its identity was accepted.
    pub fn peer_key(&self) -> Option<PublicKey> {
        self.identity.lock().ok().and_then(|identity| identity.clone())
    }

    pub(crate) fn set_peer_key(&self, key: PublicKey) {
        if let Ok(mut identity) = self.identity.lock() {
            *identity = Some(key);
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Write one already-built frame to the peer.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Signal liveness without payload.
    pub async fn send_keep_alive(&self) -> Result<()> {
        self.send_frame(&FrameBuilder::keep_alive()).await
    }

    /// Tell a capacity-rejected peer it has no slot. The connection was
    /// never pooled; the peer is expected to go away.
    pub(crate) async fn send_no_slots(&self) -> Result<()> {
        let mut pb = FrameBuilder::new();
        pb.prepend_opcode(Opcode::NoSlots.as_u8());
        self.send_frame(&pb.build()).await
    }

    /// Orderly shutdown: best-effort goodbye frame, then cancel the worker.
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        let mut pb = FrameBuilder::new();
        pb.prepend_opcode(Opcode::Disconnect.as_u8());
        if let Err(e) = self.send_frame(&pb.build()).await {
            debug!(id = self.id, error = %e, "goodbye frame not delivered");
        }
        self.cancel.cancel();
        self.set_state(ConnectionState::Disconnected);
    }

    /// First caller wins; the loss path runs at most once per connection.
    pub(crate) fn mark_lost(&self) -> bool {
        !self.lost.swap(true, Ordering::SeqCst)
    }
}
