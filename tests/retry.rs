use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::{OwnedFd, RawFd},
    sync::{Arc, LazyLock},
    thread,
    time::Duration,
};

use netstream_tls::{
    AuthMode, Error, PendingOp, PermittedPeers, State, Status, TcpTransport, TlsSession,
    Transport, TrustContext, rustls::pki_types::ServerName,
};

mod common;
use common::*;

static SETUP: LazyLock<()> = LazyLock::new(|| {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .init();
});

/// A blocking transport that claims to have nothing to read a fixed number of times first.
#[derive(Debug)]
struct Reluctant {
    inner: TcpTransport,
    refusals: usize,
}

impl Read for Reluctant {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.refusals > 0 {
            self.refusals -= 1;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.inner.read(buf)
    }
}

impl Write for Reluctant {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Transport for Reluctant {
    fn descriptor(&self) -> RawFd {
        self.inner.descriptor()
    }

    fn set_descriptor(&mut self, fd: OwnedFd) -> io::Result<()> {
        self.inner.set_descriptor(fd)
    }

    fn abort(&mut self) -> io::Result<()> {
        self.inner.abort()
    }

    fn remote_name(&self) -> io::Result<String> {
        self.inner.remote_name()
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.inner.remote_addr()
    }
}

fn blocking_server(ctx: Arc<TrustContext>, listener: TcpListener) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let config = ctx
            .prepare_for_listening()
            .unwrap()
            .server_config(AuthMode::Anonymous);
        let mut session = TlsSession::server(
            config,
            TcpTransport::from(stream),
            AuthMode::Anonymous,
            PermittedPeers::default(),
        )
        .unwrap();

        assert_eq!(session.handshake().unwrap(), Status::Ready);
        assert_eq!(session.handshake_attempts(), 1);

        let mut buf = [0u8; 64];
        let n = session.receive(&mut buf).unwrap();
        buf[..n].to_vec()
    })
}

#[test]
fn handshake_converges_after_would_block() {
    *SETUP;

    let pki = Pki::new();
    let server_ctx = pki.issue("localhost").context();
    let client_ctx = pki.issue("client.test").context();

    for refusals in [0, 1, 2, 5] {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = blocking_server(server_ctx.clone(), listener);

        let transport = Reluctant {
            inner: TcpTransport::from(TcpStream::connect(addr).unwrap()),
            refusals,
        };
        let mut session = TlsSession::client(
            client_ctx.client_config(AuthMode::Anonymous),
            ServerName::try_from("localhost").unwrap(),
            transport,
            AuthMode::Anonymous,
            PermittedPeers::default(),
        )
        .unwrap();
        assert_eq!(session.state(), State::HandshakePending);
        assert_eq!(session.handshake_attempts(), 0);

        let mut calls = 0;
        loop {
            calls += 1;
            match session.handshake().unwrap() {
                Status::Ready => break,
                Status::Retry(op) => {
                    assert_eq!(op, PendingOp::Handshake);
                    assert_eq!(session.pending_retry(), Some(PendingOp::Handshake));
                    assert_eq!(session.state(), State::HandshakePending);
                }
            }
        }

        assert_eq!(calls, refusals + 1, "with {refusals} refusals");
        assert_eq!(session.handshake_attempts() as usize, refusals + 1);
        assert_eq!(session.state(), State::Established);
        assert_eq!(session.pending_retry(), None);
        assert!(session.is_authenticated());

        // further calls don't restart anything
        assert_eq!(session.handshake().unwrap(), Status::Ready);
        assert_eq!(session.handshake_attempts() as usize, refusals + 1);

        assert_eq!(session.send(b"intact").unwrap(), 6);
        assert_eq!(server.join().unwrap(), b"intact");
    }
}

#[test]
fn close_is_idempotent() {
    *SETUP;

    let pki = Pki::new();
    let server_ctx = pki.issue("localhost").context();
    let client_ctx = pki.issue("client.test").context();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = blocking_server(server_ctx, listener);

    let mut session = TlsSession::client(
        client_ctx.client_config(AuthMode::Anonymous),
        ServerName::try_from("localhost").unwrap(),
        TcpTransport::from(TcpStream::connect(addr).unwrap()),
        AuthMode::Anonymous,
        PermittedPeers::default(),
    )
    .unwrap();
    assert_eq!(session.handshake().unwrap(), Status::Ready);

    session.close();
    assert_eq!(session.state(), State::Closed);
    session.close();
    assert_eq!(session.state(), State::Closed);
    assert!(session.handshake().is_err());

    // the close notification reads as a clean end of stream
    assert_eq!(server.join().unwrap(), b"");
}

#[test]
fn server_drop_sends_no_close_notify() {
    *SETUP;

    let pki = Pki::new();
    let server_ctx = pki.issue("localhost").context();
    let client_ctx = pki.issue("client.test").context();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let config = server_ctx
            .prepare_for_listening()
            .unwrap()
            .server_config(AuthMode::Anonymous);
        let mut session = TlsSession::server(
            config,
            TcpTransport::from(stream),
            AuthMode::Anonymous,
            PermittedPeers::default(),
        )
        .unwrap();
        assert_eq!(session.handshake().unwrap(), Status::Ready);
    });

    let mut session = TlsSession::client(
        client_ctx.client_config(AuthMode::Anonymous),
        ServerName::try_from("localhost").unwrap(),
        TcpTransport::from(TcpStream::connect(addr).unwrap()),
        AuthMode::Anonymous,
        PermittedPeers::default(),
    )
    .unwrap();
    assert_eq!(session.handshake().unwrap(), Status::Ready);
    server.join().unwrap();

    let mut buf = [0u8; 64];
    match session.receive(&mut buf) {
        Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof, "{err}"),
        other => panic!("expected an unclean end of stream, got {other:?}"),
    }
}

#[test]
fn failed_handshake_sends_nothing_on_drop() {
    *SETUP;

    let pki = Pki::new();
    let client_ctx = pki.issue("client.test").context();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (mut peer, _) = listener.accept().unwrap();
    peer.write_all(b"not a tls server\r\n").unwrap();

    let mut session = TlsSession::client(
        client_ctx.client_config(AuthMode::Anonymous),
        ServerName::try_from("localhost").unwrap(),
        TcpTransport::from(client),
        AuthMode::Anonymous,
        PermittedPeers::default(),
    )
    .unwrap();
    assert!(matches!(session.handshake(), Err(Error::HandshakeFailed(_))));
    assert_eq!(session.state(), State::Closed);
    assert_eq!(session.pending_retry(), None);

    // the client hello and the alert
    peer.set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut seen = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match peer.read(&mut buf) {
            Ok(0) => panic!("connection closed before the session was dropped"),
            Ok(n) => seen.extend_from_slice(&buf[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                break;
            }
            Err(err) => panic!("read: {err}"),
        }
    }
    assert!(!seen.is_empty());

    drop(session);
    peer.set_read_timeout(None).unwrap();
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "{} bytes after the failed handshake", rest.len());
}
