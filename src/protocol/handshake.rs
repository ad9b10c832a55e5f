//! Per-connection handshake state machine.
//!
//! Both endpoints walk the same state ladder:
//!
//! ```text
//! Accepted → Introducing → AwaitingTrustDecision → Handshaking → Active
//!      (any state) → Disconnected   [terminal]
//! ```
//!
//! Wire exchange, server on the left:
//!
//! ```text
//! Introduction  →   GUID + public key, signed
//!               ←   Acknowledge: client public key, signed
//! Challenge     →   fresh u64 token, encrypted to the client key
//!               ←   ChallengeResponse: token echoed, signed by the client
//! HandshakeDone →   empty payload, signed
//! ```
//!
//! The introduction and acknowledgement are self-certifying (signature
//! checked against the embedded key); cross-session trust comes from
//! pinning, with first contacts and identity changes escalated to the
//! external collaborator on each side. The challenge token is generated
//! fresh per attempt and consumed on verification — it is never reused
//! across connections or retries.
//!
//! State is per-session and owned by the connection's worker, never shared
//! (concurrent handshakes cannot trample each other).

use crate::core::frame::{FrameBuilder, FrameReader};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::{check_trust, Opcode, ServerIdentity, TrustCheck};
use crate::utils::crypto::{PrivateKey, PublicKey};
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroize;

/// Width of the challenge token on the wire.
pub const TOKEN_SIZE: usize = 8;

/// Lifecycle of one connection. `Disconnected` is terminal and
/// irreversible: a new connection must be established to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Introducing,
    AwaitingTrustDecision,
    Handshaking,
    Active,
    Disconnected,
}

fn expect_state(actual: ConnectionState, expected: ConnectionState) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(ProtocolError::HandshakeError(format!(
            "expected state {expected:?}, connection is {actual:?}"
        )))
    }
}

/// Server-side handshake state for one accepted connection.
pub struct ServerHandshake {
    guid: Uuid,
    state: ConnectionState,
    client_key: Option<PublicKey>,
    token: Option<u64>,
}

impl ServerHandshake {
    pub fn new(guid: Uuid) -> Self {
        Self {
            guid,
            state: ConnectionState::Accepted,
            client_key: None,
            token: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Public key the client presented, once the acknowledgement was read.
    pub fn client_key(&self) -> Option<&PublicKey> {
        self.client_key.as_ref()
    }

    /// Build the introduction frame: GUID + public key, signed.
    pub fn introduce(&mut self, server_key: &PrivateKey) -> Result<Bytes> {
        expect_state(self.state, ConnectionState::Accepted)?;

        let der = server_key.to_public_key().to_der()?;
        let mut pb = FrameBuilder::new();
        pb.append_bytes(self.guid.as_bytes());
        pb.append_uint(der.len() as u64, 2)?;
        pb.append_bytes(&der);
        pb.sign(server_key)?;
        pb.prepend_opcode(Opcode::Introduction.as_u8());

        self.state = ConnectionState::Introducing;
        debug!(guid = %self.guid, "introduction sent");
        Ok(pb.build())
    }

    /// Consume the client's acknowledgement: its public key, self-signed.
    ///
    /// `reader` must be positioned just past the opcode. On success the
    /// connection holds the offered key and awaits the trust decision.
    pub fn read_acknowledgement(&mut self, reader: &mut FrameReader) -> Result<&PublicKey> {
        expect_state(self.state, ConnectionState::Introducing)?;

        let sig_len = reader.read_u16()? as usize;
        let signature = reader.read_bytes(sig_len)?;
        let payload = reader.remaining_bytes();
        let der_len = reader.read_u16()? as usize;
        let der = reader.read_bytes(der_len)?;

        let offered = PublicKey::from_der(&der)?;
        if !offered.verify(&payload, &signature) {
            self.state = ConnectionState::Disconnected;
            return Err(ProtocolError::HandshakeError(
                constants::ERR_ACKNOWLEDGEMENT_SIGNATURE.into(),
            ));
        }

        self.state = ConnectionState::AwaitingTrustDecision;
        debug!("acknowledgement verified, awaiting trust decision");
        Ok(self.client_key.insert(offered))
    }

    /// The external collaborator accepted the offered identity: issue a
    /// fresh single-use token, encrypted to the client key.
    pub fn accept_identity(&mut self) -> Result<Bytes> {
        expect_state(self.state, ConnectionState::AwaitingTrustDecision)?;
        let client_key = self
            .client_key
            .as_ref()
            .ok_or_else(|| ProtocolError::HandshakeError("client key missing".into()))?;

        let token = OsRng.next_u64();
        let mut pb = FrameBuilder::new();
        pb.append_uint(token, TOKEN_SIZE)?;
        pb.encrypt(client_key)?;
        pb.prepend_opcode(Opcode::Challenge.as_u8());

        self.token = Some(token);
        self.state = ConnectionState::Handshaking;
        debug!("challenge issued");
        Ok(pb.build())
    }

    /// The external collaborator rejected the offered identity.
    pub fn reject_identity(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Verify the token-bound response and, on success, build the signed
    /// completion frame. The token is consumed either way.
    pub fn verify_response(
        &mut self,
        reader: &mut FrameReader,
        server_key: &PrivateKey,
    ) -> Result<Bytes> {
        expect_state(self.state, ConnectionState::Handshaking)?;
        let expected = self
            .token
            .take()
            .ok_or_else(|| ProtocolError::HandshakeError("challenge token missing".into()))?;
        let client_key = self
            .client_key
            .as_ref()
            .ok_or_else(|| ProtocolError::HandshakeError("client key missing".into()))?;

        if !reader.verify_signature(client_key)? {
            self.state = ConnectionState::Disconnected;
            return Err(ProtocolError::HandshakeError(
                constants::ERR_RESPONSE_SIGNATURE.into(),
            ));
        }
        let echoed = reader.read_u64()?;
        if echoed != expected {
            self.state = ConnectionState::Disconnected;
            return Err(ProtocolError::HandshakeError(
                constants::ERR_TOKEN_MISMATCH.into(),
            ));
        }

        let mut pb = FrameBuilder::new();
        pb.sign(server_key)?;
        pb.prepend_opcode(Opcode::HandshakeDone.as_u8());

        self.state = ConnectionState::Active;
        debug!("challenge response verified, connection active");
        Ok(pb.build())
    }

    /// Terminal transition, from any state.
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for ServerHandshake {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

/// Client-side handshake state for one connection attempt.
pub struct ClientHandshake {
    state: ConnectionState,
    pinned: Option<ServerIdentity>,
    server_identity: Option<ServerIdentity>,
}

impl ClientHandshake {
    /// `pinned` is the identity recorded from a previous session, if any.
    pub fn new(pinned: Option<ServerIdentity>) -> Self {
        Self {
            state: ConnectionState::Accepted,
            pinned,
            server_identity: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identity the server presented, to be pinned once trusted.
    pub fn server_identity(&self) -> Option<&ServerIdentity> {
        self.server_identity.as_ref()
    }

    /// Consume the server introduction and compare it against the pinned
    /// record. A result other than [`TrustCheck::Known`] must be escalated
    /// to the user before calling [`acknowledge`](Self::acknowledge).
    pub fn read_introduction(&mut self, reader: &mut FrameReader) -> Result<TrustCheck> {
        expect_state(self.state, ConnectionState::Accepted)?;
        self.state = ConnectionState::Introducing;

        let sig_len = reader.read_u16()? as usize;
        let signature = reader.read_bytes(sig_len)?;
        let payload = reader.remaining_bytes();
        let guid_bytes = reader.read_bytes(16)?;
        let der_len = reader.read_u16()? as usize;
        let der = reader.read_bytes(der_len)?;

        let public_key = PublicKey::from_der(&der)?;
        if !public_key.verify(&payload, &signature) {
            self.state = ConnectionState::Disconnected;
            return Err(ProtocolError::HandshakeError(
                constants::ERR_INTRODUCTION_SIGNATURE.into(),
            ));
        }
        let guid = Uuid::from_slice(&guid_bytes)
            .map_err(|_| ProtocolError::HandshakeError("introduction carries malformed GUID".into()))?;

        let offered = ServerIdentity { guid, public_key };
        let verdict = check_trust(&offered, self.pinned.as_ref());
        self.server_identity = Some(offered);
        self.state = ConnectionState::AwaitingTrustDecision;
        debug!(?verdict, "introduction read");
        Ok(verdict)
    }

    /// Accept the offered identity and answer with our own public key,
    /// self-signed.
    pub fn acknowledge(&mut self, client_key: &PrivateKey) -> Result<Bytes> {
        expect_state(self.state, ConnectionState::AwaitingTrustDecision)?;

        let der = client_key.to_public_key().to_der()?;
        let mut pb = FrameBuilder::new();
        pb.append_uint(der.len() as u64, 2)?;
        pb.append_bytes(&der);
        pb.sign(client_key)?;
        pb.prepend_opcode(Opcode::Acknowledge.as_u8());

        self.state = ConnectionState::Handshaking;
        debug!("identity accepted, acknowledgement sent");
        Ok(pb.build())
    }

    /// Reject the offered identity. Terminal.
    pub fn reject(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Decrypt the challenge token and build the signed echo.
    pub fn answer_challenge(
        &mut self,
        reader: &mut FrameReader,
        client_key: &PrivateKey,
    ) -> Result<Bytes> {
        expect_state(self.state, ConnectionState::Handshaking)?;

        reader.decrypt(client_key)?;
        let token = reader.read_u64()?;

        let mut pb = FrameBuilder::new();
        pb.append_uint(token, TOKEN_SIZE)?;
        pb.sign(client_key)?;
        pb.prepend_opcode(Opcode::ChallengeResponse.as_u8());
        debug!("challenge answered");
        Ok(pb.build())
    }

    /// Verify the signed completion frame; the session is then active.
    pub fn complete(&mut self, reader: &mut FrameReader) -> Result<()> {
        expect_state(self.state, ConnectionState::Handshaking)?;
        let server_key = self
            .server_identity
            .as_ref()
            .map(|identity| &identity.public_key)
            .ok_or_else(|| ProtocolError::HandshakeError("server identity missing".into()))?;

        if !reader.verify_signature(server_key)? {
            self.state = ConnectionState::Disconnected;
            return Err(ProtocolError::HandshakeError(
                constants::ERR_COMPLETION_SIGNATURE.into(),
            ));
        }
        self.state = ConnectionState::Active;
        debug!("handshake complete");
        Ok(())
    }

    /// Terminal transition, from any state.
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}
