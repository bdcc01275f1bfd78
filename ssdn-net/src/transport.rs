//! Byte-stream transports for peer links (plain TCP or TLS over TCP).

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::address::Address;

/// Idle time before the first keepalive packet.
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Interval between keepalive packets.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Upper bound for a single connection attempt.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Any bidirectional byte stream a peer link can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn Transport>;

/// Enable TCP keepalive and disable Nagle on a freshly connected socket.
///
/// Failures are logged; the connection is still usable without them.
pub fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "Failed to enable TCP keepalive");
    }
}

/// Connect to `address`, wrapping the socket in TLS when the address asks
/// for it.
pub async fn dial(address: &Address, tls: Option<&TlsConnector>) -> io::Result<BoxedStream> {
    let stream = tokio::time::timeout(CONNECTION_TIMEOUT, TcpStream::connect(address.socket_addr()))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))??;
    configure_socket(&stream);

    if !address.tls() {
        return Ok(Box::new(stream));
    }
    let connector = tls.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "TLS requested without configuration")
    })?;
    let server_name = rustls::pki_types::ServerName::from(address.host());
    let stream = connector.connect(server_name, stream).await?;
    Ok(Box::new(stream))
}

/// Listening socket that yields plain or TLS streams.
pub struct TransportListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl TransportListener {
    pub async fn bind(address: &Address, tls: Option<TlsAcceptor>) -> io::Result<Self> {
        if address.tls() && tls.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS listener requires a certificate and key",
            ));
        }
        let listener = TcpListener::bind(address.socket_addr()).await?;
        let tls = if address.tls() { tls } else { None };
        Ok(Self { listener, tls })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept the next raw connection. The TLS handshake, if any, is left
    /// to [`TransportListener::upgrade`] so it runs off the accept loop.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        configure_socket(&stream);
        Ok((stream, addr))
    }

    pub async fn upgrade(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        match &self.tls {
            Some(acceptor) => Ok(Box::new(acceptor.accept(stream).await?)),
            None => Ok(Box::new(stream)),
        }
    }

    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_plain_dial_and_accept() {
        let bind = Address::parse("tcp://127.0.0.1:0").unwrap();
        let listener = TransportListener::bind(&bind, None).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = listener.upgrade(stream).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let target = Address::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        let mut client = dial(&target, None).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_tls_listener_requires_acceptor() {
        let bind = Address::parse("tcps://127.0.0.1:0").unwrap();
        assert!(TransportListener::bind(&bind, None).await.is_err());
    }

    #[tokio::test]
    async fn test_tls_dial_requires_connector() {
        let bind = Address::parse("tcp://127.0.0.1:0").unwrap();
        let listener = TransportListener::bind(&bind, None).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = Address::parse(&format!("tcps://127.0.0.1:{port}")).unwrap();
        let err = dial(&target, None).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
