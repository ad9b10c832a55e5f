//! # Protocol Layer
//!
//! Control opcodes, peer identities, and the per-connection handshake state
//! machine.
//!
//! Application packet types live above this crate; the core only defines the
//! opcodes it needs to route its own control traffic. Payloads of every other
//! opcode are opaque byte sequences.

pub mod handshake;


use crate::error::{ProtocolError, Result};
use crate::utils::crypto::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Control opcodes used by the connection lifecycle.
///
/// Values at or above [`Opcode::APPLICATION_BASE`] are reserved for the
/// application layer and pass through the core untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Server presents its GUID and public key to a new connection.
    Introduction = 0x01,
    /// Client accepts the server identity and presents its own public key.
    Acknowledge = 0x02,
    /// Server issues a single-use token, encrypted to the client key.
    Challenge = 0x03,
    /// Client echoes the token, signed.
    ChallengeResponse = 0x04,
    /// Server confirms the handshake; the connection is active.
    HandshakeDone = 0x05,
    /// Server rejects a connection accepted while the pool is full.
    NoSlots = 0x06,
    /// Either side requests an orderly disconnect.
    Disconnect = 0x07,
}

impl Opcode {
    /// First opcode value owned by the application layer.
    pub const APPLICATION_BASE: u8 = 0x10;

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Introduction),
            0x02 => Ok(Self::Acknowledge),
            0x03 => Ok(Self::Challenge),
            0x04 => Ok(Self::ChallengeResponse),
            0x05 => Ok(Self::HandshakeDone),
            0x06 => Ok(Self::NoSlots),
            0x07 => Ok(Self::Disconnect),
            other => Err(ProtocolError::UnexpectedOpcode(other)),
        }
    }
}

/// A server's long-term identity as observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub guid: Uuid,
    pub public_key: PublicKey,
}

impl ServerIdentity {
    /// Storable form for the external persistence layer.
    pub fn to_pinned(&self) -> Result<PinnedIdentity> {
        Ok(PinnedIdentity {
            guid: self.guid,
            public_key_der: self.public_key.to_der()?,
        })
    }

    pub fn from_pinned(pinned: &PinnedIdentity) -> Result<Self> {
        Ok(Self {
            guid: pinned.guid,
            public_key: PublicKey::from_der(&pinned.public_key_der)?,
        })
    }
}

/// Serializable pinned identity record, persisted by the external storage
/// layer after the user confirms a first contact or an identity change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedIdentity {
    pub guid: Uuid,
    pub public_key_der: Vec<u8>,
}

/// Outcome of comparing an offered identity against the pinned record.
///
/// `FirstContact` and `Changed` must be escalated to the user — trust on
/// first use with change detection, never silent acceptance of a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustCheck {
    /// Offered identity matches the pinned record.
    Known,
    /// No record pinned yet for this peer.
    FirstContact,
    /// Offered identity differs from the pinned record.
    Changed { pinned: Box<ServerIdentity> },
}

/// Compare an offered identity with the pinned record, if any.
pub fn check_trust(offered: &ServerIdentity, pinned: Option<&ServerIdentity>) -> TrustCheck {
    match pinned {
        None => TrustCheck::FirstContact,
        Some(known) if known == offered => TrustCheck::Known,
        Some(known) => TrustCheck::Changed {
            pinned: Box::new(known.clone()),
        },
    }
}
