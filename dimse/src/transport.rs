//! Transport streams.
//!
//! The client opens its connections through a [`Connector`],
//! so that plain TCP, TLS or an in-memory transport can be swapped in.
use std::time::Duration;

use async_trait::async_trait;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not connect to {}:{}", host, port))]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("connection to {}:{} timed out", host, port))]
    ConnectTimeout {
        host: String,
        port: u16,
        backtrace: Backtrace,
    },

    /// could not configure socket
    SocketOptions {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[cfg(feature = "tls")]
    #[snafu(display("invalid TLS server name {}", name))]
    InvalidServerName {
        name: String,
        source: rustls::pki_types::InvalidDnsNameError,
        backtrace: Backtrace,
    },

    #[cfg(feature = "tls")]
    /// TLS handshake failed
    TlsHandshake {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A bidirectional byte stream a pump can run on.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens connections to remote nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream>;
}

/// Plain TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
    connect_timeout: Option<Duration>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector {
            nodelay: true,
            connect_timeout: None,
        }
    }
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        debug!("Connecting to {}:{}", host, port);
        let connect = TcpStream::connect((host, port));
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| ConnectTimeoutSnafu { host, port }.build())?,
            None => connect.await,
        }
        .context(ConnectSnafu { host, port })?;
        stream.set_nodelay(self.nodelay).context(SocketOptionsSnafu)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        Ok(Box::new(self.connect_tcp(host, port).await?))
    }
}

/// TLS connections over TCP.
#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
pub struct TlsConnector {
    tcp: TcpConnector,
    config: std::sync::Arc<rustls::ClientConfig>,
    server_name: Option<String>,
}

#[cfg(feature = "tls")]
impl TlsConnector {
    pub fn new(config: impl Into<std::sync::Arc<rustls::ClientConfig>>) -> Self {
        TlsConnector {
            tcp: TcpConnector::default(),
            config: config.into(),
            server_name: None,
        }
    }

    pub fn tcp(mut self, tcp: TcpConnector) -> Self {
        self.tcp = tcp;
        self
    }

    /// Verify the server against this name instead of the host name.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

#[cfg(feature = "tls")]
#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = rustls::pki_types::ServerName::try_from(name.clone())
            .context(InvalidServerNameSnafu { name })?;
        let socket = self.tcp.connect_tcp(host, port).await?;
        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        let stream = connector
            .connect(server_name, socket)
            .await
            .context(TlsHandshakeSnafu)?;
        Ok(Box::new(stream))
    }
}

/// Perform the server side of a TLS handshake.
#[cfg(feature = "tls")]
pub async fn accept_tls(
    config: std::sync::Arc<rustls::ServerConfig>,
    socket: TcpStream,
) -> Result<BoxedStream> {
    let acceptor = tokio_rustls::TlsAcceptor::from(config);
    let stream = acceptor.accept(socket).await.context(TlsHandshakeSnafu)?;
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;

    #[tokio::test]
    async fn refused_connections_are_reported() {
        // bind and drop a listener to obtain a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpConnector::new().connect("127.0.0.1", port).await;
        assert!(matches!(result, Err(Error::Connect { .. })));
    }
}
