//! The relay-session transport, a minimal stand-in for the real relay
//! protocol's client library (see [`proto`]/[`client`] for why) rather
//! than imported from an external crate.

pub mod client;
pub mod proto;

use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

pub use client::{FirstMessage, RelaySession};

/// Marker trait erasing a transport's concrete type so the Prober can be
/// driven identically against a real [`tokio::net::TcpStream`] and an
/// in-memory `tokio::io::duplex` pair in tests.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

pub type DynStream = Pin<Box<dyn AsyncDuplex>>;
