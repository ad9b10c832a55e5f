//! Connection acceptor and capacity-bounded pool.
//!
//! One long-running worker drives the accept loop; every accepted connection
//! gets its own worker for handshake and inbound processing, so a slow or
//! malicious peer cannot stall acceptance or other peers. The pool is the
//! only contended shared resource: every mutation happens under its one
//! mutex, and it is never exposed raw.
//!
//! Lifecycle notifications are typed [`ServerEvent`] values on an mpsc
//! channel. `ClientConnected` is emitted only after the connection is
//! durably registered in the pool, so an observer never sees a connection
//! that could still be capacity-rejected.

use crate::config::ServerConfig;
use crate::core::frame::FrameReader;
use crate::core::reassembly::FrameReceiveBuffer;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{ConnectionState, ServerHandshake};
use crate::protocol::Opcode;
use crate::service::connection::Connection;
use crate::transport::tcp::TcpReceiver;
use crate::utils::crypto::{PrivateKey, PublicKey};
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};
use bytes::Bytes;
use futures::future::join_all;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

/// External collaborator hook: decide whether to accept the public key a
/// client presented. The server escalates here instead of trusting blindly;
/// the implementation typically compares against persisted account records
/// and may prompt a user.
pub type TrustDecider = Arc<dyn Fn(SocketAddr, &PublicKey) -> bool + Send + Sync>;

/// Lifecycle notifications consumed by the external presentation/storage
/// layers.
#[derive(Debug)]
pub enum ServerEvent {
    /// A connection was accepted, registered in the pool, and its handshake
    /// started. `frames` yields the connection's inbound application frames
    /// (opcode byte first, payload opaque) once it is active.
    ClientConnected {
        connection: Arc<Connection>,
        frames: mpsc::UnboundedReceiver<Bytes>,
    },
    /// The accept loop terminated: cleanly, or with the transport error
    /// message that killed it.
    Stopped {
        result: std::result::Result<(), String>,
    },
}

/// Capacity-bounded set of live connections. Capacity is enforced
/// atomically with insertion: a connection accepted while the pool is full
/// is never added.
#[derive(Debug)]
struct ConnectionPool {
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    capacity: usize,
}

impl ConnectionPool {
    fn new(capacity: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Insert under the pool lock iff a slot is free.
    fn try_insert(&self, connection: Arc<Connection>) -> Result<bool> {
        let mut connections = self
            .connections
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_POOL_LOCK.into()))?;
        if connections.len() >= self.capacity {
            return Ok(false);
        }
        connections.insert(connection.id(), connection);
        Ok(true)
    }

    /// Remove by id. Idempotent: missing entries are not an error.
    fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.lock().ok()?.remove(&id)
    }

    /// Take every connection out, leaving the pool empty.
    fn drain(&self) -> Vec<Arc<Connection>> {
        match self.connections.lock() {
            Ok(mut connections) => connections.drain().map(|(_, c)| c).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// The server: owns the listener, the pool, and its own long-term identity.
pub struct Server {
    guid: Uuid,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    pool: Arc<ConnectionPool>,
    runner: Option<JoinHandle<Result<()>>>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Server {
    /// Bind and begin listening; spawns the acceptance loop.
    ///
    /// Fails with [`ProtocolError::Bind`] when the address cannot be bound.
    #[instrument(skip(private_key, trust, events))]
    pub async fn start(
        guid: Uuid,
        private_key: PrivateKey,
        addr: SocketAddr,
        capacity: usize,
        trust: TrustDecider,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ProtocolError::Bind)?;
        let local_addr = listener.local_addr().map_err(ProtocolError::Bind)?;

        let cancel = CancellationToken::new();
        let pool = Arc::new(ConnectionPool::new(capacity));
        let tracker = TaskTracker::new();

        let runner = tokio::spawn(accept_loop(
            listener,
            guid,
            private_key,
            Arc::clone(&pool),
            tracker,
            cancel.clone(),
            trust,
            events.clone(),
        ));

        info!(%local_addr, capacity, "server listening");
        Ok(Self {
            guid,
            local_addr,
            cancel,
            pool,
            runner: Some(runner),
            events,
        })
    }

    /// Convenience: bind from a validated [`ServerConfig`].
    pub async fn start_with_config(
        guid: Uuid,
        private_key: PrivateKey,
        config: &ServerConfig,
        trust: TrustDecider,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Self> {
        let addr: SocketAddr = config.address.parse().map_err(|_| {
            ProtocolError::ConfigError(format!("invalid server address '{}'", config.address))
        })?;
        Self::start(guid, private_key, addr, config.capacity, trust, events).await
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Actual bound address (useful when started on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_some()
    }

    /// Connections currently registered in the pool.
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    /// Asynchronously signal the accept loop to exit. Returns immediately;
    /// the loop disconnects pooled connections on its way out.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Synchronous variant: signal stop, wait for the loop's terminal
    /// result (which includes every connection's disconnect), then emit the
    /// `Stopped` notification carrying that result.
    ///
    /// Fails with [`ProtocolError::NotRunning`] when invoked on a server
    /// that was already stopped.
    pub async fn stop(&mut self) -> Result<()> {
        let runner = self.runner.take().ok_or(ProtocolError::NotRunning)?;
        self.cancel.cancel();

        let outcome = match runner.await {
            Ok(result) => result,
            Err(e) => Err(ProtocolError::Custom(format!("accept loop panicked: {e}"))),
        };

        let _ = self.events.send(ServerEvent::Stopped {
            result: outcome
                .as_ref()
                .map(|_| ())
                .map_err(|e| e.to_string()),
        });
        info!("server stopped");
        outcome
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // a dropped server must not leave its accept loop running
        self.cancel.cancel();
    }
}

/// The long-running acceptance loop. Exits on stop request or listener
/// failure; either way every pooled connection is disconnected and every
/// worker joined before the terminal result is reported.
#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    guid: Uuid,
    private_key: PrivateKey,
    pool: Arc<ConnectionPool>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    trust: TrustDecider,
    events: mpsc::UnboundedSender<ServerEvent>,
) -> Result<()> {
    let mut next_id: u64 = 0;
    let result = loop {
        let (stream, peer_addr) = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "listener failed");
                    break Err(ProtocolError::Io(e));
                }
            },
        };

        next_id += 1;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let connection = Arc::new(Connection::new(
            next_id,
            peer_addr,
            write_half,
            cancel.child_token(),
        ));

        match pool.try_insert(Arc::clone(&connection)) {
            Ok(true) => {
                debug!(id = next_id, peer = %peer_addr, "connection registered");
                let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                // registration is durable; observers may now see the peer
                let _ = events.send(ServerEvent::ClientConnected {
                    connection: Arc::clone(&connection),
                    frames: frames_rx,
                });
                tracker.spawn(run_connection(
                    connection,
                    TcpReceiver::new(read_half),
                    guid,
                    private_key.clone(),
                    Arc::clone(&pool),
                    Arc::clone(&trust),
                    frames_tx,
                ));
            }
            Ok(false) => {
                warn!(peer = %peer_addr, "pool full, rejecting connection");
                tracker.spawn(async move {
                    if let Err(e) = connection.send_no_slots().await {
                        debug!(error = %e, "no-slots notice not delivered");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "pool unusable");
                break Err(e);
            }
        }
    };

    // fire every disconnect, then await them all, then join every worker
    let remaining = pool.drain();
    if !remaining.is_empty() {
        debug!(count = remaining.len(), "disconnecting pooled connections");
        join_all(remaining.iter().map(|c| c.disconnect())).await;
    }
    tracker.close();
    tracker.wait().await;

    result
}

/// Per-connection worker: drives the handshake, then the inbound frame
/// loop. On any exit the connection is removed from the pool exactly once.
async fn run_connection(
    connection: Arc<Connection>,
    mut receiver: TcpReceiver,
    guid: Uuid,
    private_key: PrivateKey,
    pool: Arc<ConnectionPool>,
    trust: TrustDecider,
    frames: mpsc::UnboundedSender<Bytes>,
) {
    let cancel = connection.cancel_token().clone();
    let mut receive_buffer = FrameReceiveBuffer::new();

    match drive_handshake(
        &connection,
        &mut receiver,
        &mut receive_buffer,
        guid,
        &private_key,
        &trust,
        &cancel,
    )
    .await
    {
        Ok(()) => {
            debug!(id = connection.id(), peer = %connection.peer_addr(), "connection active");
            if let Err(e) = read_loop(&mut receiver, &mut receive_buffer, &frames, &cancel).await {
                warn!(id = connection.id(), error = %e, "inbound processing failed");
                connection.disconnect().await;
            }
        }
        Err(e) => {
            warn!(id = connection.id(), peer = %connection.peer_addr(), error = %e, "handshake failed");
            connection.disconnect().await;
        }
    }

    connection.set_state(ConnectionState::Disconnected);
    if connection.mark_lost() {
        pool.remove(connection.id());
        debug!(id = connection.id(), "connection removed from pool");
    }
}

/// Server half of the handshake protocol; see `protocol::handshake`.
async fn drive_handshake(
    connection: &Connection,
    receiver: &mut TcpReceiver,
    receive_buffer: &mut FrameReceiveBuffer,
    guid: Uuid,
    private_key: &PrivateKey,
    trust: &TrustDecider,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut handshake = ServerHandshake::new(guid);

    let introduction = handshake.introduce(private_key)?;
    connection.set_state(ConnectionState::Introducing);
    connection.send_frame(&introduction).await?;

    let mut reader = recv_step(receiver, receive_buffer, cancel).await?;
    expect_opcode(&mut reader, Opcode::Acknowledge)?;
    let client_key = handshake.read_acknowledgement(&mut reader)?.clone();
    connection.set_state(ConnectionState::AwaitingTrustDecision);

    if !trust(connection.peer_addr(), &client_key) {
        handshake.reject_identity();
        return Err(ProtocolError::TrustRejected);
    }
    connection.set_peer_key(client_key);

    let challenge = handshake.accept_identity()?;
    connection.set_state(ConnectionState::Handshaking);
    connection.send_frame(&challenge).await?;

    let mut reader = recv_step(receiver, receive_buffer, cancel).await?;
    expect_opcode(&mut reader, Opcode::ChallengeResponse)?;
    let done = handshake.verify_response(&mut reader, private_key)?;
    connection.send_frame(&done).await?;
    connection.set_state(ConnectionState::Active);
    Ok(())
}

/// Await the next non-keep-alive frame during the handshake, bounded by the
/// step timeout.
async fn recv_step(
    receiver: &mut TcpReceiver,
    receive_buffer: &mut FrameReceiveBuffer,
    cancel: &CancellationToken,
) -> Result<FrameReader> {
    loop {
        let frame = with_timeout_error(
            receive_buffer.receive_until_complete_or_interrupted(receiver, cancel),
            DEFAULT_TIMEOUT,
        )
        .await?;
        match frame {
            Some(frame) if frame.is_empty() => continue,
            Some(frame) => return Ok(FrameReader::new(frame)),
            None => {
                return Err(ProtocolError::HandshakeError(
                    constants::ERR_PEER_CLOSED_DURING_HANDSHAKE.into(),
                ))
            }
        }
    }
}

fn expect_opcode(reader: &mut FrameReader, expected: Opcode) -> Result<()> {
    let opcode = reader.read_u8()?;
    if opcode == Opcode::Disconnect.as_u8() {
        return Err(ProtocolError::ConnectionClosed);
    }
    if opcode != expected.as_u8() {
        return Err(ProtocolError::UnexpectedOpcode(opcode));
    }
    Ok(())
}

/// Inbound loop for an active connection. Frames are forwarded in the order
/// they complete reassembly; keep-alives are liveness only. A `None` from
/// the reassembler is loss or cancellation — a normal exit, not an error.
async fn read_loop(
    receiver: &mut TcpReceiver,
    receive_buffer: &mut FrameReceiveBuffer,
    frames: &mpsc::UnboundedSender<Bytes>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let frame = receive_buffer
            .receive_until_complete_or_interrupted(receiver, cancel)
            .await?;
        match frame {
            None => {
                debug!("connection lost or cancelled");
                return Ok(());
            }
            Some(frame) if frame.is_empty() => {
                trace!("keep-alive received");
            }
            Some(frame) => {
                if frame[0] == Opcode::Disconnect.as_u8() {
                    debug!("peer requested disconnect");
                    return Ok(());
                }
                if frames.send(frame).is_err() {
                    debug!("application dropped the frame receiver");
                    return Ok(());
                }
            }
        }
    }
}
