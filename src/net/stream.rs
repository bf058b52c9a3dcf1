//! Transport streams
//!
//! [`BusStream`] is the sealed plain-TCP / TLS variant behind every link.
//! The TLS handshake runs to completion inside [`connect_stream`] /
//! [`accept_stream`]; a connection only ever observes an established stream.
//! A protocol downgrade is not an in-place operation here: it is a close
//! followed by a fresh connection of the other variant.

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::config::TlsConfig;
use crate::error::BusError;

/// Server socket listen backlog.
const SOCKET_LISTEN_BACKLOG: i32 = 2048;

/// Send the first keepalive probe after this idle time.
const SOCKET_KEEPIDLE: Duration = Duration::from_secs(600);

/// Interval between keepalive probes.
const SOCKET_KEEPINTERVAL: Duration = Duration::from_secs(5);

/// Probes without a reply before the socket is considered dead.
const SOCKET_KEEPCOUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StreamKind {
    Tcp,
    Tls,
}

/// Handshake material derived once from [`TlsConfig`].
#[derive(Clone)]
pub(crate) struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    pub(crate) fn new(config: &TlsConfig) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config.server.clone()),
            connector: TlsConnector::from(config.client.clone()),
        }
    }
}

/// An established stream to a peer.
pub(crate) enum BusStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl BusStream {
    pub(crate) fn kind(&self) -> StreamKind {
        match self {
            Self::Tcp(_) => StreamKind::Tcp,
            Self::Tls(_) => StreamKind::Tls,
        }
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.peer_addr(),
            Self::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Plaintext bytes decrypted but not yet consumed by the reader. Only
    /// the TLS variant buffers data inside the object; the plain-TCP
    /// variant has no count to report.
    pub(crate) fn pending(&mut self) -> Option<usize> {
        match self {
            Self::Tcp(_) => None,
            Self::Tls(stream) => {
                let state = match stream.as_mut() {
                    TlsStream::Client(stream) => stream.get_mut().1.process_new_packets(),
                    TlsStream::Server(stream) => stream.get_mut().1.process_new_packets(),
                };
                Some(
                    state
                        .map(|state| state.plaintext_bytes_to_read())
                        .unwrap_or(0),
                )
            }
        }
    }
}

impl AsyncRead for BusStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BusStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Splits `[proto://]host:port` into host and port. Bracketed IPv6 hosts
/// lose their brackets.
pub(crate) fn split_url(url: &str) -> Result<(String, u16), BusError> {
    let rest = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    };
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| BusError::InvalidAddress(url.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| BusError::InvalidAddress(url.to_string()))?;
    if host.is_empty() {
        return Err(BusError::InvalidAddress(url.to_string()));
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Resolves a url to a socket address: IP literals parse directly, names go
/// through the resolver.
pub(crate) async fn resolve_url(url: &str) -> Result<SocketAddr, BusError> {
    let (host, port) = split_url(url)?;
    if let Ok(ip) = host.parse() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = lookup_host((host.as_str(), port)).await?;
    addrs
        .next()
        .ok_or_else(|| BusError::InvalidAddress(url.to_string()))
}

/// TCP_NODELAY plus the bus keepalive policy.
pub(crate) fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(SOCKET_KEEPIDLE)
        .with_interval(SOCKET_KEEPINTERVAL)
        .with_retries(SOCKET_KEEPCOUNT);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Binds the server socket with SO_REUSEADDR and the bus backlog.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(SOCKET_LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Connects to `addr`, then runs the client handshake when TLS is on. The
/// `host` names the peer for certificate verification.
pub(crate) async fn connect_stream(
    addr: SocketAddr,
    host: &str,
    tls: Option<&TlsContext>,
) -> io::Result<BusStream> {
    let stream = TcpStream::connect(addr).await?;
    configure_socket(&stream)?;
    match tls {
        None => Ok(BusStream::Tcp(stream)),
        Some(context) => {
            let server_name = rustls::ServerName::try_from(host)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad server name"))?;
            let stream = context.connector.connect(server_name, stream).await?;
            Ok(BusStream::Tls(Box::new(TlsStream::Client(stream))))
        }
    }
}

/// Wraps an accepted socket, running the server handshake when TLS is on.
pub(crate) async fn accept_stream(
    stream: TcpStream,
    tls: Option<&TlsContext>,
) -> io::Result<BusStream> {
    match tls {
        None => Ok(BusStream::Tcp(stream)),
        Some(context) => {
            let stream = context.acceptor.accept(stream).await?;
            Ok(BusStream::Tls(Box::new(TlsStream::Server(stream))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_url_variants() {
        assert_eq!(
            split_url("tcp://127.0.0.1:2223").unwrap(),
            ("127.0.0.1".to_string(), 2223)
        );
        assert_eq!(
            split_url("127.0.0.1:2223").unwrap(),
            ("127.0.0.1".to_string(), 2223)
        );
        assert_eq!(split_url("[::1]:9000").unwrap(), ("::1".to_string(), 9000));
        assert_eq!(
            split_url("127.0.0.1:0").unwrap(),
            ("127.0.0.1".to_string(), 0)
        );
        assert!(split_url("127.0.0.1").is_err());
        assert!(split_url("127.0.0.1:notaport").is_err());
        assert!(split_url(":80").is_err());
    }

    #[tokio::test]
    async fn resolve_ip_literal() {
        let addr = resolve_url("127.0.0.1:2223").await.unwrap();
        assert_eq!(addr, "127.0.0.1:2223".parse().unwrap());
        let addr = resolve_url("[::1]:80").await.unwrap();
        assert_eq!(addr, "[::1]:80".parse().unwrap());
    }

    #[tokio::test]
    async fn plain_stream_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = accept_stream(stream, None).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut stream = connect_stream(addr, "127.0.0.1", None).await.unwrap();
        assert_eq!(stream.kind(), StreamKind::Tcp);
        assert_eq!(stream.pending(), None);
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    fn test_tls_context() -> TlsContext {
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let cert_der = cert.serialize_der().unwrap();
        let key_der = cert.serialize_private_key_der();

        let server = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(cert_der.clone())],
                rustls::PrivateKey(key_der),
            )
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(&rustls::Certificate(cert_der)).unwrap();
        let client = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        TlsContext::new(&TlsConfig {
            server: std::sync::Arc::new(server),
            client: std::sync::Arc::new(client),
        })
    }

    #[tokio::test]
    async fn tls_pending_reports_buffered_plaintext() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let context = test_tls_context();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let server_context = context.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = accept_stream(stream, Some(&server_context)).await.unwrap();
            stream.write_all(b"12345678").await.unwrap();
            // hold the session open until the client signals it is done
            let mut done = [0u8; 1];
            stream.read_exact(&mut done).await.unwrap();
        });

        let mut stream = connect_stream(addr, "127.0.0.1", Some(&context))
            .await
            .unwrap();
        assert_eq!(stream.kind(), StreamKind::Tls);

        // a partial read leaves the rest of the record buffered in the object
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1234");
        assert_eq!(stream.pending(), Some(4));

        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"5678");
        assert_eq!(stream.pending(), Some(0));

        stream.write_all(b"x").await.unwrap();
        server.await.unwrap();
    }
}
