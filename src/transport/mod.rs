//! # Transport Capabilities
//!
//! The core consumes transports through one narrow capability:
//! [`ReceiveStream`], "attempt to receive up to N bytes, honoring a
//! cancellation signal". Nothing above this module depends on a concrete
//! transport.
//!
//! ## Components
//! - **ReceiveStream**: the abstract byte-receiving capability
//! - **tcp**: tokio TCP implementation and client connect helper

pub mod tcp;

use std::io;
use tokio_util::sync::CancellationToken;

/// Abstract byte-receiving capability consumed by the stream reassembler.
///
/// Contract:
/// - a return of `Ok(0)` means the peer closed the connection;
/// - cancellation surfaces as `io::ErrorKind::Interrupted`, promptly — an
///   implementation must never block past a requested cancellation;
/// - any other error is a transport failure.
#[allow(async_fn_in_trait)]
pub trait ReceiveStream {
    /// Receive up to `buf.len()` bytes into `buf`, returning the count
    /// actually transferred.
    async fn receive(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> io::Result<usize>;
}
