//! # Error Types
//!
//! Comprehensive error handling for the framing protocol.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level I/O errors to frame-level violations.
//!
//! ## Error Categories
//! - **I/O Errors**: transport and bind failures
//! - **Frame Errors**: invalid field widths, truncated or oversized frames
//! - **Cryptographic Errors**: encryption/decryption failures
//! - **Lifecycle Errors**: handshake failures, misuse of a stopped server
//!
//! Two conditions are deliberately *not* errors: connection loss (a normal
//! terminal transition reported through the pool) and capacity rejection
//! (a protocol message, not a failure). A signature mismatch is reported as
//! `Ok(false)` from verification so the caller decides whether it is fatal.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Pool and server lifecycle errors
    pub const ERR_POOL_LOCK: &str = "Failed to acquire lock on connection pool";
    pub const ERR_NO_SLOTS: &str = "Server has no free slots";

    /// Handshake errors
    pub const ERR_INTRODUCTION_SIGNATURE: &str = "Introduction signature invalid";
    pub const ERR_ACKNOWLEDGEMENT_SIGNATURE: &str = "Acknowledgement signature invalid";
    pub const ERR_RESPONSE_SIGNATURE: &str = "Challenge response signature invalid";
    pub const ERR_COMPLETION_SIGNATURE: &str = "Completion signature invalid";
    pub const ERR_TOKEN_MISMATCH: &str = "Challenge response carries a different token";
    pub const ERR_PEER_CLOSED_DURING_HANDSHAKE: &str = "Peer closed during handshake";

    /// Frame errors
    pub const ERR_MALFORMED_SIGNATURE_BLOCK: &str = "Signature block extends past frame end";
}

/// Primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error("Value {value:#x} does not fit in {width} byte(s)")]
    InvalidWidth { value: u64, width: usize },

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Frame ended before the requested field")]
    TruncatedFrame,

    #[error("Unexpected opcode: {0:#04x}")]
    UnexpectedOpcode(u8),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Peer identity was rejected")]
    TrustRejected,

    #[error("Server is not running")]
    NotRunning,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
