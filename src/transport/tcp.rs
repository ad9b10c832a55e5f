//! TCP implementation of the receive capability, plus the client-side
//! connect helper.

use crate::error::{ProtocolError, Result};
use crate::transport::ReceiveStream;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Read half of a TCP connection exposed as a [`ReceiveStream`].
#[derive(Debug)]
pub struct TcpReceiver {
    inner: OwnedReadHalf,
}

impl TcpReceiver {
    pub fn new(inner: OwnedReadHalf) -> Self {
        Self { inner }
    }
}

impl ReceiveStream for TcpReceiver {
    async fn receive(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> io::Result<usize> {
        tokio::select! {
            () = cancel.cancelled() => Err(io::Error::from(io::ErrorKind::Interrupted)),
            result = self.inner.read(buf) => result,
        }
    }
}

/// Connect to a remote endpoint and split the stream into the receive
/// capability and a write half.
#[instrument]
pub async fn connect(addr: SocketAddr) -> Result<(TcpReceiver, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr).await.map_err(ProtocolError::Io)?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    Ok((TcpReceiver::new(read_half), write_half))
}
