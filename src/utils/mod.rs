//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, and timing.
//!
//! ## Components
//! - **Crypto**: RSA sign/verify and whole-buffer encrypt/decrypt
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Async timeout wrappers and shared duration constants
//!
//! ## Security
//! - Cryptographically secure RNG (`OsRng`) for keys and tokens
//! - Memory zeroing for decrypted token material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod timeout;

// Re-export the envelope types for advanced users
pub use crypto::{PrivateKey, PublicKey};
