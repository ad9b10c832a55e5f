//! # Core Protocol Components
//!
//! Low-level frame handling: building, parsing, and reassembling
//! length-prefixed frames.
//!
//! ## Components
//! - **Frame**: builder/reader for signed, encrypted, length-prefixed frames
//! - **Reassembly**: frame recovery from arbitrarily chunked byte streams
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [Opcode(1)] {SigLen(2) Sig(N)} {Payload}
//! ```
//!
//! ## Security
//! - Length validated against [`MAX_FRAME_SIZE`](crate::config::MAX_FRAME_SIZE)
//!   before allocation
//! - Sign-then-encrypt layering is fixed; readers decrypt before verifying

pub mod frame;
pub mod reassembly;
