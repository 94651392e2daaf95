//! Transport layer abstraction for the data-plane link.
//!
//! Production links are TLS; the plain TCP variant exists for tests and
//! local development against a server without certificates.

pub mod tls;

use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

#[derive(Debug, Clone, Default)]
pub enum TransportConfig {
    #[default]
    Tcp,
    Tls(tls::TlsTransportConfig),
}

/// Dial the server. `timeout` bounds the TCP dial plus the TLS handshake.
pub async fn connect(
    config: &TransportConfig,
    addr: &str,
    timeout: Duration,
) -> io::Result<BoxedStream> {
    let connect_fut = async {
        match config {
            TransportConfig::Tcp => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::pin(stream) as BoxedStream)
            }
            TransportConfig::Tls(tls_config) => tls::connect(addr, tls_config).await,
        }
    };

    tokio::time::timeout(timeout, connect_fut)
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection to {addr} timed out"),
            )
        })?
}
