//! # Connection
//!
//! Purpose: Own one socket to one server and move whole frames across it.
//!
//! ## Design Principles
//! 1. **Enum Stream**: Plaintext and TLS share one `ClientStream` type, so
//!    the upgrade swaps the variant in place and nothing else changes.
//! 2. **Framer Owned Here**: Bytes are read straight into the framer's
//!    buffer; frames that arrive together are handed out one per `recv`.
//! 3. **Closed Is Final**: The first IO or framing failure marks the
//!    connection `Closed`; the pool never hands it out again.
//! 4. **Buffer Reuse**: Requests are encoded into a per-connection buffer.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

use rkv_common::messages::{encode_message, RpbAuthReq, RpbErrorResp};
use rkv_common::{describe_code, Frame, FrameError, Framer, MessageCode};

use crate::config::{NodeConfig, ServerAddress};
use crate::error::{ClientError, ClientResult};
use crate::tls::{Credentials, TlsSettings};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Plain TCP or upgraded TLS stream.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Placeholder while the TCP stream is moved into the TLS handshake, and
    /// after a failed upgrade.
    Closed,
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            ClientStream::Closed => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            ClientStream::Closed => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            ClientStream::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            ClientStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle and usable.
    Open,
    /// A command is in flight.
    Busy,
    /// Failed or shut down; never reused.
    Closed,
}

/// One socket to one server.
pub struct Connection {
    id: u64,
    addr: ServerAddress,
    stream: ClientStream,
    framer: Framer,
    write_buf: BytesMut,
    state: ConnectionState,
    encrypted: bool,
    last_used: Instant,
}

impl Connection {
    /// Opens a connection, upgrading to TLS when the node is configured for
    /// it. The whole sequence is bounded by the connect timeout.
    pub async fn connect(addr: &ServerAddress, config: &NodeConfig) -> ClientResult<Self> {
        let limit = config.connect_timeout();
        let tcp = match tokio::time::timeout(limit, TcpStream::connect((addr.host.as_str(), addr.port))).await {
            Err(_) => return Err(ClientError::Timeout(limit)),
            Ok(Err(err)) => {
                return Err(ClientError::Connect {
                    addr: addr.to_string(),
                    reason: err.to_string(),
                })
            }
            Ok(Ok(stream)) => stream,
        };
        // Frames are small and latency-bound.
        tcp.set_nodelay(true)?;

        let mut conn = Connection::from_stream(addr.clone(), ClientStream::Tcp(tcp), config.max_frame_len);
        if let Some(tls) = &config.tls {
            tokio::time::timeout(limit, conn.start_tls(tls))
                .await
                .map_err(|_| ClientError::Timeout(limit))??;
        }

        debug!(conn = conn.id, addr = %addr, tls = conn.encrypted, "connection established");
        Ok(conn)
    }

    fn from_stream(addr: ServerAddress, stream: ClientStream, max_frame_len: usize) -> Self {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            stream,
            framer: Framer::with_max_frame_len(max_frame_len),
            write_buf: BytesMut::with_capacity(256),
            state: ConnectionState::Open,
            encrypted: false,
            last_used: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &ServerAddress {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Time since the connection last finished a command.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub(crate) fn mark_busy(&mut self) {
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Busy;
        }
    }

    pub(crate) fn mark_idle(&mut self) {
        if self.state == ConnectionState::Busy {
            self.state = ConnectionState::Open;
        }
        self.last_used = Instant::now();
    }

    fn fail(&mut self) {
        if self.state != ConnectionState::Closed {
            trace!(conn = self.id, "connection marked closed");
        }
        self.state = ConnectionState::Closed;
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.state == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Writes one frame and flushes it.
    pub async fn send(&mut self, frame: &Frame) -> ClientResult<()> {
        self.ensure_open()?;
        self.write_buf.clear();
        frame.encode_to(&mut self.write_buf)?;
        trace!(conn = self.id, frame = %frame.describe(), "send");

        if let Err(err) = write_flush(&mut self.stream, &self.write_buf).await {
            self.fail();
            return Err(err.into());
        }
        Ok(())
    }

    /// Reads the next frame, pulling more bytes from the socket only when no
    /// complete frame is buffered.
    pub async fn recv(&mut self) -> ClientResult<Frame> {
        loop {
            match self.framer.next_frame() {
                Ok(Some(frame)) => {
                    trace!(conn = self.id, frame = %frame.describe(), "recv");
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(err) => {
                    self.fail();
                    return Err(err.into());
                }
            }

            self.ensure_open()?;
            match self.stream.read_buf(self.framer.buffer_mut()).await {
                Ok(0) => {
                    self.fail();
                    return Err(ClientError::Closed);
                }
                Ok(_) => {}
                Err(err) => {
                    self.fail();
                    return Err(err.into());
                }
            }
        }
    }

    /// Sends `frame` and waits for exactly one reply.
    pub async fn round_trip(&mut self, frame: &Frame) -> ClientResult<Frame> {
        self.send(frame).await?;
        self.recv().await
    }

    /// Sends a ping and requires an empty `PING_RESP`.
    pub async fn ping(&mut self) -> ClientResult<()> {
        let reply = self.round_trip(&Frame::empty(MessageCode::PingReq)).await?;
        self.expect_empty(&reply, MessageCode::PingResp)
    }

    /// Upgrades the plaintext stream: `START_TLS` exchange, handshake, then
    /// optional authentication.
    async fn start_tls(&mut self, tls: &TlsSettings) -> ClientResult<()> {
        let reply = self.round_trip(&Frame::empty(MessageCode::StartTls)).await?;
        self.expect_empty(&reply, MessageCode::StartTls)?;

        // Anything after the upgrade marker would be plaintext the TLS
        // layer cannot account for.
        if !self.framer.is_empty() {
            let trailing = self.framer.buffered();
            self.fail();
            return Err(FrameError::TrailingBytes(trailing).into());
        }

        let tcp = match std::mem::replace(&mut self.stream, ClientStream::Closed) {
            ClientStream::Tcp(tcp) => tcp,
            other => {
                self.stream = other;
                return Err(ClientError::Tls("stream is not plaintext TCP".into()));
            }
        };

        let stream = match tls.connector.connect(tls.server_name.clone(), tcp).await {
            Ok(stream) => stream,
            Err(err) => {
                self.fail();
                return Err(ClientError::Tls(err.to_string()));
            }
        };
        self.stream = ClientStream::Tls(Box::new(stream));
        self.framer.clear();
        self.encrypted = true;
        debug!(conn = self.id, "tls upgrade complete");

        if let Some(credentials) = &tls.credentials {
            self.authenticate(credentials).await?;
        }
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> ClientResult<()> {
        let request = RpbAuthReq {
            user: credentials.user.as_bytes().to_vec(),
            password: credentials.password.as_bytes().to_vec(),
        };
        let reply = self
            .round_trip(&Frame::new(MessageCode::AuthReq, encode_message(&request)))
            .await?;
        self.expect_empty(&reply, MessageCode::AuthResp)?;
        debug!(conn = self.id, user = %credentials.user, "authenticated");
        Ok(())
    }

    /// Handshake replies must carry exactly `expected` and no payload.
    fn expect_empty(&mut self, reply: &Frame, expected: MessageCode) -> ClientResult<()> {
        if reply.is(MessageCode::ErrorResp) {
            return Err(server_error(reply));
        }
        if !reply.is(expected) {
            self.fail();
            return Err(FrameError::UnexpectedCode {
                expected: expected.as_u8(),
                actual: reply.code,
            }
            .into());
        }
        if !reply.is_empty() {
            self.fail();
            return Err(FrameError::TrailingBytes(reply.payload.len()).into());
        }
        Ok(())
    }

    /// Shuts the socket down; the connection cannot be used afterwards.
    pub async fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            let _ = self.stream.shutdown().await;
        }
        self.state = ConnectionState::Closed;
        self.stream = ClientStream::Closed;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

async fn write_flush(stream: &mut ClientStream, buf: &[u8]) -> io::Result<()> {
    stream.write_all(buf).await?;
    stream.flush().await
}

/// Decodes an `ERROR_RESP` frame into `ClientError::Server`.
pub(crate) fn server_error(frame: &Frame) -> ClientError {
    match RpbErrorResp::decode(frame.payload.clone()) {
        Ok(resp) => ClientError::Server {
            code: resp.errcode,
            message: resp.message(),
        },
        Err(err) => ClientError::Decode(err),
    }
}

/// Error for a reply whose code does not match the request.
pub(crate) fn unexpected_response(expected: MessageCode, frame: &Frame) -> ClientError {
    ClientError::UnexpectedResponse {
        expected: expected.to_string(),
        actual: describe_code(frame.code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_rustls::rustls::crypto::ring;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
    use tokio_rustls::TlsAcceptor;

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for frame in frames {
            frame.encode_to(&mut out).unwrap();
        }
        out.to_vec()
    }

    /// Accepts one connection, reads `expect` bytes, then writes `reply` and
    /// keeps the socket open until the client goes away.
    async fn one_shot_server(expect: usize, reply: Vec<u8>) -> ServerAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; expect];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&reply).await.unwrap();
            let mut sink = [0u8; 64];
            while let Ok(n) = socket.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        });
        ServerAddress::new("127.0.0.1", addr.port())
    }

    fn test_tls_settings() -> TlsSettings {
        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        TlsSettings::new(Arc::new(config), "localhost").unwrap()
    }

    async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, framer: &mut Framer) -> Option<Frame> {
        loop {
            if let Some(frame) = framer.next_frame().unwrap() {
                return Some(frame);
            }
            if stream.read_buf(framer.buffer_mut()).await.ok()? == 0 {
                return None;
            }
        }
    }

    fn self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
        (certified.cert.der().clone(), key)
    }

    fn trusting_tls_settings(cert: CertificateDer<'static>) -> TlsSettings {
        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsSettings::new(Arc::new(config), "localhost").unwrap()
    }

    /// Answers `START_TLS`, runs the server side of the handshake, then
    /// serves AUTH, PING and a two-frame LIST_KEYS reply over TLS.
    async fn tls_server(
        cert: CertificateDer<'static>,
        key: PrivateKeyDer<'static>,
        accept_auth: bool,
    ) -> ServerAddress {
        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut framer = Framer::new();
            let upgrade = read_frame(&mut tcp, &mut framer).await.unwrap();
            assert!(upgrade.is(MessageCode::StartTls));
            tcp.write_all(&wire(&[Frame::empty(MessageCode::StartTls)])).await.unwrap();

            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut framer = Framer::new();
            while let Some(frame) = read_frame(&mut tls, &mut framer).await {
                let replies = if frame.is(MessageCode::AuthReq) {
                    let auth = RpbAuthReq::decode(frame.payload).unwrap();
                    if accept_auth && auth.user == b"riakuser" && auth.password == b"riakpass" {
                        vec![Frame::empty(MessageCode::AuthResp)]
                    } else {
                        let refusal = RpbErrorResp {
                            errmsg: b"Authentication failed".to_vec(),
                            errcode: 0,
                        };
                        vec![Frame::new(MessageCode::ErrorResp, encode_message(&refusal))]
                    }
                } else if frame.is(MessageCode::PingReq) {
                    vec![Frame::empty(MessageCode::PingResp)]
                } else if frame.is(MessageCode::ListKeysReq) {
                    vec![
                        Frame::new(MessageCode::ListKeysResp, vec![1u8]),
                        Frame::new(MessageCode::ListKeysResp, vec![2u8]),
                    ]
                } else {
                    return;
                };
                tls.write_all(&wire(&replies)).await.unwrap();
                tls.flush().await.unwrap();
            }
        });
        ServerAddress::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn start_tls_upgrades_and_authenticates() {
        let (cert, key) = self_signed();
        let addr = tls_server(cert.clone(), key, true).await;
        let tls = trusting_tls_settings(cert).with_credentials(Credentials::new("riakuser", "riakpass"));
        let config = NodeConfig::default().with_tls(tls);

        let mut conn = Connection::connect(&addr, &config).await.unwrap();
        assert!(conn.is_encrypted());
        conn.ping().await.unwrap();

        conn.send(&Frame::empty(MessageCode::ListKeysReq)).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Frame::new(MessageCode::ListKeysResp, vec![1u8]));
        assert_eq!(conn.recv().await.unwrap(), Frame::new(MessageCode::ListKeysResp, vec![2u8]));
        conn.ping().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_connect() {
        let (cert, key) = self_signed();
        let addr = tls_server(cert.clone(), key, false).await;
        let tls = trusting_tls_settings(cert).with_credentials(Credentials::new("riakuser", "wrong"));
        let config = NodeConfig::default().with_tls(tls);

        match Connection::connect(&addr, &config).await.unwrap_err() {
            ClientError::Server { message, .. } => assert_eq!(message, "Authentication failed"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let addr = one_shot_server(5, wire(&[Frame::empty(MessageCode::PingResp)])).await;
        let mut conn = Connection::connect(&addr, &NodeConfig::default()).await.unwrap();
        conn.ping().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(!conn.is_encrypted());
    }

    #[tokio::test]
    async fn pipelined_replies_come_out_one_per_recv() {
        let frames = vec![
            Frame::new(MessageCode::ListKeysResp, vec![1u8, 2, 3]),
            Frame::new(MessageCode::ListKeysResp, vec![4u8]),
            Frame::empty(MessageCode::PingResp),
        ];
        let addr = one_shot_server(5, wire(&frames)).await;
        let mut conn = Connection::connect(&addr, &NodeConfig::default()).await.unwrap();
        conn.send(&Frame::empty(MessageCode::PingReq)).await.unwrap();
        for expected in &frames {
            assert_eq!(&conn.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn peer_close_marks_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });
        let addr = ServerAddress::new("127.0.0.1", port);
        let mut conn = Connection::connect(&addr, &NodeConfig::default()).await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(err.is_transport());
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(&Frame::empty(MessageCode::PingReq)).await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_a_framing_error() {
        let addr = one_shot_server(5, vec![0, 0, 1, 0, 10]).await;
        let config = NodeConfig {
            max_frame_len: 128,
            ..NodeConfig::default()
        };
        let mut conn = Connection::connect(&addr, &config).await.unwrap();
        let err = conn.round_trip(&Frame::empty(MessageCode::PingReq)).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Framing(FrameError::Oversized { len: 256, max: 128 })
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn refused_connect_reports_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let addr = ServerAddress::new("127.0.0.1", port);
        let err = Connection::connect(&addr, &NodeConfig::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[tokio::test]
    async fn start_tls_rejects_wrong_reply_code() {
        let addr = one_shot_server(5, wire(&[Frame::empty(MessageCode::PingResp)])).await;
        let config = NodeConfig::default().with_tls(test_tls_settings());
        let err = Connection::connect(&addr, &config).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Framing(FrameError::UnexpectedCode {
                expected: 255,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn start_tls_rejects_reply_with_payload() {
        let reply = Frame::new(MessageCode::StartTls, vec![0u8; 3]);
        let addr = one_shot_server(5, wire(&[reply])).await;
        let config = NodeConfig::default().with_tls(test_tls_settings());
        let err = Connection::connect(&addr, &config).await.unwrap_err();
        assert!(matches!(err, ClientError::Framing(FrameError::TrailingBytes(3))));
    }

    #[tokio::test]
    async fn start_tls_surfaces_server_refusal() {
        let refusal = RpbErrorResp {
            errmsg: b"security not enabled".to_vec(),
            errcode: 0,
        };
        let reply = Frame::new(MessageCode::ErrorResp, encode_message(&refusal));
        let addr = one_shot_server(5, wire(&[reply])).await;
        let config = NodeConfig::default().with_tls(test_tls_settings());
        let err = Connection::connect(&addr, &config).await.unwrap_err();
        match err {
            ClientError::Server { message, .. } => assert_eq!(message, "security not enabled"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
