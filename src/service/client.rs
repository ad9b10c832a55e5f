//! Client endpoint: connects, drives the client half of the handshake, then
//! exchanges frames over the reassembler.

use crate::config::ClientConfig;
use crate::core::frame::{FrameBuilder, FrameReader};
use crate::core::reassembly::FrameReceiveBuffer;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::ClientHandshake;
use crate::protocol::{Opcode, ServerIdentity, TrustCheck};
use crate::transport::tcp::{self, TcpReceiver};
use crate::utils::crypto::PrivateKey;
use crate::utils::timeout::with_timeout_error;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// An established, handshaken session with a server.
///
/// Obtain one through [`ClientSession::connect`]; the trust decision closure
/// is consulted whenever the server's identity is a first contact or differs
/// from the pinned record — never for a known identity. After connecting,
/// read the (possibly new) identity via [`identity`](Self::identity) and
/// hand it to the persistence layer for pinning.
#[derive(Debug)]
pub struct ClientSession {
    receiver: TcpReceiver,
    writer: SharedWriter,
    receive_buffer: FrameReceiveBuffer,
    cancel: CancellationToken,
    identity: ServerIdentity,
}

impl ClientSession {
    /// Connect with default client configuration.
    pub async fn connect<F>(
        addr: SocketAddr,
        client_key: &PrivateKey,
        pinned: Option<ServerIdentity>,
        decide: F,
    ) -> Result<Self>
    where
        F: FnOnce(&TrustCheck) -> bool,
    {
        Self::connect_with_config(addr, client_key, pinned, decide, &ClientConfig::default()).await
    }

    /// Connect, handshake, and start the keep-alive timer.
    ///
    /// A server that answers with `NoSlots` surfaces as a handshake error
    /// naming the rejection, not as a transport failure.
    #[instrument(skip(client_key, pinned, decide, config))]
    pub async fn connect_with_config<F>(
        addr: SocketAddr,
        client_key: &PrivateKey,
        pinned: Option<ServerIdentity>,
        decide: F,
        config: &ClientConfig,
    ) -> Result<Self>
    where
        F: FnOnce(&TrustCheck) -> bool,
    {
        let (mut receiver, mut writer) =
            with_timeout_error(tcp::connect(addr), config.connect_timeout).await?;
        let cancel = CancellationToken::new();
        let mut receive_buffer = FrameReceiveBuffer::new();
        let mut handshake = ClientHandshake::new(pinned);

        // first frame: the server's introduction, or a capacity rejection
        let mut reader = await_frame(
            &mut receiver,
            &mut receive_buffer,
            &cancel,
            config.response_timeout,
        )
        .await?;
        match Opcode::try_from(reader.read_u8()?)? {
            Opcode::Introduction => {}
            Opcode::NoSlots => {
                debug!("server rejected the connection: no free slots");
                return Err(ProtocolError::HandshakeError(constants::ERR_NO_SLOTS.into()));
            }
            other => return Err(ProtocolError::UnexpectedOpcode(other.as_u8())),
        }

        let verdict = handshake.read_introduction(&mut reader)?;
        if verdict != TrustCheck::Known && !decide(&verdict) {
            handshake.reject();
            let mut pb = FrameBuilder::new();
            pb.prepend_opcode(Opcode::Disconnect.as_u8());
            let _ = writer.write_all(&pb.build()).await;
            return Err(ProtocolError::TrustRejected);
        }

        let acknowledgement = handshake.acknowledge(client_key)?;
        writer.write_all(&acknowledgement).await?;
        writer.flush().await?;

        let mut reader = await_frame(
            &mut receiver,
            &mut receive_buffer,
            &cancel,
            config.response_timeout,
        )
        .await?;
        expect_opcode(&mut reader, Opcode::Challenge)?;
        let response = handshake.answer_challenge(&mut reader, client_key)?;
        writer.write_all(&response).await?;
        writer.flush().await?;

        let mut reader = await_frame(
            &mut receiver,
            &mut receive_buffer,
            &cancel,
            config.response_timeout,
        )
        .await?;
        expect_opcode(&mut reader, Opcode::HandshakeDone)?;
        handshake.complete(&mut reader)?;

        let identity = handshake
            .server_identity()
            .cloned()
            .ok_or_else(|| ProtocolError::HandshakeError("server identity missing".into()))?;
        info!(guid = %identity.guid, "session established");

        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        spawn_keep_alive(
            Arc::clone(&writer),
            cancel.clone(),
            config.keep_alive_interval,
        );

        Ok(Self {
            receiver,
            writer,
            receive_buffer,
            cancel,
            identity,
        })
    }

    /// Identity the server presented; pin it after a confirmed first
    /// contact or change.
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Send one already-built frame.
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Receive the next application frame (opcode byte first, payload
    /// opaque). `Ok(None)` means the server closed the session — not an
    /// error. Keep-alives are consumed silently.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            let frame = self
                .receive_buffer
                .receive_until_complete_or_interrupted(&mut self.receiver, &self.cancel)
                .await?;
            match frame {
                None => return Ok(None),
                Some(frame) if frame.is_empty() => {
                    trace!("keep-alive received");
                }
                Some(frame) => {
                    if frame[0] == Opcode::Disconnect.as_u8() {
                        debug!("server requested disconnect");
                        return Ok(None);
                    }
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Orderly shutdown: goodbye frame, stop the keep-alive timer, close
    /// the transport.
    pub async fn disconnect(self) -> Result<()> {
        self.cancel.cancel();
        let mut pb = FrameBuilder::new();
        pb.prepend_opcode(Opcode::Disconnect.as_u8());
        let mut writer = self.writer.lock().await;
        let _ = writer.write_all(&pb.build()).await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

/// Periodic liveness signal on an otherwise idle session.
fn spawn_keep_alive(writer: SharedWriter, cancel: CancellationToken, interval: Duration) {
    tokio::spawn(async move {
        let frame = FrameBuilder::keep_alive();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    let mut writer = writer.lock().await;
                    if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                        break;
                    }
                    trace!("keep-alive sent");
                }
            }
        }
    });
}

/// Await the next non-keep-alive frame, bounded by the response timeout.
async fn await_frame(
    receiver: &mut TcpReceiver,
    receive_buffer: &mut FrameReceiveBuffer,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<FrameReader> {
    loop {
        let frame = with_timeout_error(
            receive_buffer.receive_until_complete_or_interrupted(receiver, cancel),
            deadline,
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
    if opcode != expected.as_u8() {
        return Err(ProtocolError::UnexpectedOpcode(opcode));
    }
    Ok(())
}
