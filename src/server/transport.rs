//! Byte-stream abstraction over plain TCP and optional TLS.
//!
//! The engine never implements TLS itself. A [`TlsWrapper`] supplied by the
//! embedder turns an accepted [`TcpStream`] into an encrypted stream, and
//! from then on the engine only sees a boxed [`Transport`].

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;

use crate::BoxFuture;

/// A bidirectional byte stream the engine can serve HTTP over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// The buffered stream owned by a connection between exchanges.
///
/// The read buffer travels with the stream, so bytes a client pipelined
/// behind one request are seen by the next exchange.
pub type ConnStream = BufReader<Box<dyn Transport>>;

/// Initial capacity of a connection's read buffer.
pub(crate) const READ_BUFFER_SIZE: usize = 8 * 1024;

pub(crate) fn buffered(stream: Box<dyn Transport>) -> ConnStream {
    BufReader::with_capacity(READ_BUFFER_SIZE, stream)
}

/// Wraps accepted sockets in TLS.
///
/// # Examples
///
/// A wrapper that performs no handshake, useful in tests:
///
/// ```
/// use std::io;
///
/// use http_engine::BoxFuture;
/// use http_engine::server::transport::{TlsWrapper, Transport};
/// use tokio::net::TcpStream;
///
/// struct Passthrough;
///
/// impl TlsWrapper for Passthrough {
///     fn wrap(&self, stream: TcpStream) -> BoxFuture<'static, io::Result<Box<dyn Transport>>> {
///         Box::pin(async move { Ok(Box::new(stream) as Box<dyn Transport>) })
///     }
/// }
/// ```
pub trait TlsWrapper: Send + Sync + 'static {
    /// Performs the server-side handshake on `stream`.
    ///
    /// # Errors
    ///
    /// Any handshake failure. The connection is closed without a response.
    fn wrap(&self, stream: TcpStream) -> BoxFuture<'static, io::Result<Box<dyn Transport>>>;
}
