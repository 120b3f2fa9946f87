//! Socket setup shared by both transports.

use crate::connection::ConnectionConfig;
use crate::error::DriverError;
use crate::host::HostDescription;
use crate::tls::create_tls_connector;
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;

pin_project! {
    /// A connected socket, plain TCP or TLS.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl ClientStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

/// Opens a socket to `host`: resolves the name, connects within the connect
/// timeout with keep-alive and no-delay set, then upgrades to TLS when
/// configured.
pub async fn connect(
    host: &HostDescription,
    config: &ConnectionConfig,
) -> Result<ClientStream, DriverError> {
    let addr = resolve(host).await?;
    tracing::debug!("Connecting to {} ({})", host, addr);

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;

    let tcp_stream = tokio::time::timeout(config.connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| {
            tracing::debug!("Connect to {} timed out", host);
            DriverError::ConnectTimeout(host.clone())
        })??;
    tcp_stream.set_nodelay(true)?;

    let Some(tls) = config.tls_enabled() else {
        return Ok(ClientStream::Plain { stream: tcp_stream });
    };

    let (connector, server_name) = create_tls_connector(tls, host.host())?;
    tracing::debug!("Performing TLS handshake with {}", host);
    let stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| DriverError::TlsHandshake(e.to_string()))?;
    Ok(ClientStream::Tls { stream })
}

async fn resolve(host: &HostDescription) -> Result<SocketAddr, DriverError> {
    tokio::net::lookup_host((host.host(), host.port()))
        .await?
        .next()
        .ok_or_else(|| {
            DriverError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}", host),
            ))
        })
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let host = HostDescription::new("127.0.0.1", port);
        let stream = connect(&host, &ConnectionConfig::new()).await.unwrap();
        assert!(!stream.is_tls());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let host = HostDescription::new("127.0.0.1", port);
        let config = ConnectionConfig::new().with_connect_timeout(Duration::from_secs(2));
        let Err(err) = connect(&host, &config).await else {
            panic!("connect succeeded");
        };
        assert!(err.is_transport(), "{}", err);
    }
}
