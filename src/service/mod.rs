//! # Service Layer
//!
//! Connection endpoints built on the core: the server (acceptor + pool),
//! the per-connection handle, and the client session.
//!
//! ## Components
//! - **Server**: capacity-bounded accept loop with graceful shutdown
//! - **Connection**: server-side handle for one live session
//! - **ClientSession**: client endpoint with trust escalation

pub mod client;
pub mod connection;
pub mod server;

pub use client::ClientSession;
pub use connection::Connection;
pub use server::{Server, ServerEvent, TrustDecider};
