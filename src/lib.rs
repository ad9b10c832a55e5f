//! # framewire
//!
//! Signed and encrypted length-prefixed framing protocol core for
//! client/server applications.
//!
//! The crate is the protocol substrate only: it frames, secures, reassembles
//! and routes opaque payloads, and manages server-side connection lifecycle.
//! Presentation, persistence and application packet semantics live above it.
//!
//! ## Components
//! - **core::frame** — wire frame codec (build/parse, sign/encrypt)
//! - **utils::crypto** — asymmetric envelope over byte sequences
//! - **core::reassembly** — frame recovery from chunked byte streams
//! - **service::server** — capacity-bounded acceptor and connection pool
//! - **protocol::handshake** — introduction, trust-on-first-use, token
//!   challenge-response
//!
//! ## Wire Format
//! ```text
//! [length:4][opcode:1]{sigLen:2 sig}{payload}     length == 0 ⇒ keep-alive
//! ```
//!
//! ## Example
//! ```no_run
//! use framewire::service::{Server, ServerEvent};
//! use framewire::utils::crypto::PrivateKey;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> framewire::error::Result<()> {
//!     let key = PrivateKey::random()?;
//!     let (events_tx, mut events_rx) = mpsc::unbounded_channel();
//!     let mut server = Server::start(
//!         Uuid::new_v4(),
//!         key,
//!         "127.0.0.1:9000".parse().expect("address"),
//!         64,
//!         Arc::new(|_, _| true),
//!         events_tx,
//!     )
//!     .await?;
//!
//!     if let Some(ServerEvent::ClientConnected { connection, .. }) = events_rx.recv().await {
//!         println!("client connected from {}", connection.peer_addr());
//!     }
//!     server.stop().await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::frame::{FrameBuilder, FrameReader};
pub use crate::core::reassembly::FrameReceiveBuffer;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::handshake::ConnectionState;
pub use crate::protocol::{Opcode, PinnedIdentity, ServerIdentity, TrustCheck};
pub use crate::service::{ClientSession, Connection, Server, ServerEvent};
pub use crate::utils::crypto::{PrivateKey, PublicKey};
