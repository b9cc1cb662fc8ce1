use std::{
    io::{self, Read, Write},
    os::fd::RawFd,
    sync::Arc,
};

use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls::pki_types::ServerName;
use tracing::{debug, trace, warn};

use crate::{
    AuthMode, Error, PermittedPeers, Transport, auth::PeerAuthenticator, error::is_retryable,
};

/// How many times queued records are pushed through a busy transport on close before giving up.
const CLOSE_ATTEMPTS: usize = 64;

/// Which side of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We initiated the connection, and send the close notification when shutting down.
    Client,
    /// We accepted the connection.
    Server,
}

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No TLS at all: data goes straight to the transport.
    Plain,
    /// The handshake has started but not finished.
    HandshakePending,
    /// The handshake finished. Data may flow once the peer is also authenticated.
    Established,
    /// Torn down, or failed for good.
    Closed,
}

/// An operation that could not make progress and must be called again once the descriptor is
/// ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PendingOp {
    /// The TLS handshake.
    Handshake,
    /// A send whose records are not all written out yet. Call send again with the same data.
    Send,
}

/// Outcome of a non-blocking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Done; the stream is usable.
    Ready,
    /// No progress for now: wait for readiness and retry.
    Retry(PendingOp),
}

/// Which readiness a pending stream is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Readable.
    Read,
    /// Writable.
    Write,
    /// Either.
    ReadWrite,
}

/// One TLS connection layered over a [`Transport`].
///
/// The session owns its TLS engine from construction until it is dropped. The handshake is
/// driven by [`handshake()`](Self::handshake), which never blocks: on a non-blocking transport
/// it returns [`Status::Retry`] until the peer has answered, and [`send()`](Self::send) and
/// [`receive()`](Self::receive) resume it themselves. When the handshake completes the peer is
/// authenticated before any application data is exchanged.
///
/// Dropping a session pushes out records still queued, and a client session follows them with a
/// TLS close notification.
#[derive(Debug)]
pub struct TlsSession<T: Transport> {
    transport: T,
    conn: Connection,
    role: Role,
    state: State,
    pending: Option<PendingOp>,
    unflushed: usize,
    auth: PeerAuthenticator,
    authenticated: bool,
    abort_requested: bool,
    handshake_attempts: u32,
}

impl<T: Transport> TlsSession<T> {
    /// Start a client session to `server_name`.
    ///
    /// The handshake is not attempted until [`handshake()`](Self::handshake) is called.
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        transport: T,
        auth: AuthMode,
        peers: PermittedPeers,
    ) -> Result<Self, Error> {
        let conn = ClientConnection::new(config, server_name).map_err(engine_error)?;
        Ok(Self::new(conn.into(), Role::Client, transport, auth, peers))
    }

    /// Start a server session on an accepted transport.
    ///
    /// The handshake is not attempted until [`handshake()`](Self::handshake) is called.
    pub fn server(
        config: Arc<ServerConfig>,
        transport: T,
        auth: AuthMode,
        peers: PermittedPeers,
    ) -> Result<Self, Error> {
        let conn = ServerConnection::new(config).map_err(engine_error)?;
        Ok(Self::new(conn.into(), Role::Server, transport, auth, peers))
    }

    fn new(
        conn: Connection,
        role: Role,
        transport: T,
        auth: AuthMode,
        peers: PermittedPeers,
    ) -> Self {
        trace!(?role, %auth, "tls engine allocated");
        Self {
            transport,
            conn,
            role,
            state: State::HandshakePending,
            pending: None,
            unflushed: 0,
            auth: PeerAuthenticator::new(auth, peers),
            authenticated: false,
            abort_requested: false,
            handshake_attempts: 0,
        }
    }

    /// Drive the handshake as far as it can go without blocking.
    ///
    /// Once it completes, the peer is authenticated; an authentication failure is returned as an
    /// error even though the TLS layer itself is established. On an established session this
    /// only repeats the authentication check.
    pub fn handshake(&mut self) -> Result<Status, Error> {
        match self.state {
            State::HandshakePending => {}
            State::Established => {
                self.authenticate()?;
                return Ok(Status::Ready);
            }
            State::Plain | State::Closed => return Err(Error::NotConnected),
        }

        self.handshake_attempts += 1;
        match self.conn.complete_io(&mut self.transport) {
            Ok(_) if !self.conn.is_handshaking() => {}
            Ok(_) => return Ok(self.arm_retry()),
            Err(err) if is_retryable(&err) => return Ok(self.arm_retry()),
            Err(err) => {
                debug!(role = ?self.role, %err, "tls handshake failed");
                self.state = State::Closed;
                self.pending = None;
                return Err(Error::HandshakeFailed(err));
            }
        }

        self.pending = None;
        self.state = State::Established;
        debug!(
            role = ?self.role,
            attempts = self.handshake_attempts,
            version = ?self.conn.protocol_version(),
            suite = ?self.conn.negotiated_cipher_suite().map(|s| s.suite()),
            "tls handshake succeeded"
        );

        // our last flight may still be queued
        self.flush_tls()?;
        self.authenticate()?;
        Ok(Status::Ready)
    }

    fn arm_retry(&mut self) -> Status {
        if self.pending.is_none() {
            debug!(role = ?self.role, "tls handshake does not complete immediately, will retry");
        }
        self.pending = Some(PendingOp::Handshake);
        Status::Retry(PendingOp::Handshake)
    }

    /// Check the peer against the authentication policy.
    ///
    /// Runs automatically when the handshake completes; calling it again repeats the check
    /// without logging the failure a second time.
    pub fn authenticate(&mut self) -> Result<(), Error> {
        if self.state != State::Established {
            return Err(Error::NotConnected);
        }

        if self.authenticated {
            return Ok(());
        }

        self.auth
            .authenticate(self.conn.peer_certificates().unwrap_or_default())?;
        self.authenticated = true;
        Ok(())
    }

    /// Write application data, returning how much was accepted.
    ///
    /// Bytes only count as accepted once their records are written to the transport. When the
    /// transport can't take them all, this fails with a would-block [`Error::Io`] and
    /// [`pending_retry()`](Self::pending_retry) is [`PendingOp::Send`]: wait for writability and
    /// call again with the same data. A short count means the rest should be resubmitted.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.ensure_ready()?;

        if self.unflushed == 0 {
            self.unflushed = loop {
                match self.conn.writer().write(buf) {
                    Ok(n) => break n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            };
        }

        if !self.flush_tls()? {
            if self.pending.is_none() {
                trace!(queued = self.unflushed, "transport full, send must be retried");
            }
            self.pending = Some(PendingOp::Send);
            return Err(io::Error::from(io::ErrorKind::WouldBlock).into());
        }

        self.pending = None;
        Ok(std::mem::take(&mut self.unflushed))
    }

    /// Read application data into `buf`.
    ///
    /// Fails with a would-block [`Error::Io`] when nothing is available yet. `Ok(0)` means the
    /// peer closed the connection cleanly.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.ensure_ready()?;

        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }

            match self.conn.read_tls(&mut self.transport) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            if let Err(err) = self.conn.process_new_packets() {
                // push out the alert rustls queued for the peer
                let _ = self.flush_tls();
                return Err(io::Error::new(io::ErrorKind::InvalidData, err).into());
            }

            self.flush_tls()?;
        }
    }

    fn ensure_ready(&mut self) -> Result<(), Error> {
        if self.abort_requested {
            return Err(Error::ConnectionAborted);
        }

        match self.handshake()? {
            Status::Ready => Ok(()),
            Status::Retry(_) => Err(io::Error::from(io::ErrorKind::WouldBlock).into()),
        }
    }

    // Whatever the transport can't take now stays queued for the next call. Returns whether
    // everything went out.
    fn flush_tls(&mut self) -> Result<bool, Error> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.transport) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    /// Mark the session as aborted: every later send and receive fails immediately.
    pub fn abort(&mut self) {
        debug!(role = ?self.role, "connection abort requested");
        self.abort_requested = true;
    }

    /// Shut the session down.
    ///
    /// Records still queued are pushed out first, retrying a bounded number of times while the
    /// transport is busy. If we initiated the connection, a close notification follows them.
    /// A session whose handshake failed sends nothing. Idempotent; also run on drop.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }

        if self.role == Role::Client {
            self.conn.send_close_notify();
        }

        for _ in 0..CLOSE_ATTEMPTS {
            if !self.conn.wants_write() {
                break;
            }

            match self.conn.write_tls(&mut self.transport) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if is_retryable(&err) => {}
                Err(err) => {
                    debug!(role = ?self.role, %err, "could not flush tls records on close");
                    break;
                }
            }
        }

        if self.conn.wants_write() {
            warn!(role = ?self.role, "gave up flushing tls records on close");
        }

        trace!(role = ?self.role, "tls engine released");
        self.state = State::Closed;
        self.pending = None;
        self.unflushed = 0;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Our side of the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The authentication mode this session checks its peer with.
    pub fn auth_mode(&self) -> AuthMode {
        self.auth.mode()
    }

    /// Whether the peer passed authentication.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The operation waiting to be retried, if any.
    pub fn pending_retry(&self) -> Option<PendingOp> {
        self.pending
    }

    /// Which readiness to wait for before retrying the pending operation.
    pub fn interest(&self) -> Interest {
        if self.pending == Some(PendingOp::Send) {
            return Interest::Write;
        }

        match (self.conn.wants_read(), self.conn.wants_write()) {
            (true, true) => Interest::ReadWrite,
            (false, true) => Interest::Write,
            _ => Interest::Read,
        }
    }

    /// How many times the handshake step has been attempted.
    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts
    }

    /// The underlying descriptor.
    pub fn descriptor(&self) -> RawFd {
        self.transport.descriptor()
    }

    /// The transport underneath.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport underneath, mutably.
    ///
    /// Reading or writing through this corrupts the TLS stream.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The peer's certificate chain, leaf first, once the handshake has completed.
    pub fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        self.conn.peer_certificates()
    }
}

impl<T: Transport> Drop for TlsSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn engine_error(err: rustls::Error) -> Error {
    Error::HandshakeFailed(io::Error::other(err))
}
