use std::{
    fmt, io,
    net::SocketAddr,
    os::fd::{OwnedFd, RawFd},
    str::FromStr,
    sync::Arc,
};

use rustls::pki_types::ServerName;
use tracing::{debug, error, info};

use crate::{
    AuthMode, Connect, Error, Family, Interest, Listen, ListenerConfig, PendingOp, PermittedPeers,
    State, Status, TcpTransport, TlsSession, Transport, TrustContext,
};

/// Whether a stream carries plain bytes or TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Bytes go straight to the transport.
    #[default]
    Plain,
    /// Bytes are encrypted with TLS, after a handshake and peer authentication.
    Tls,
}

impl TryFrom<u8> for Mode {
    type Error = Error;

    /// `0` is plain, `1` is TLS.
    fn try_from(mode: u8) -> Result<Self, Self::Error> {
        match mode {
            0 => Ok(Mode::Plain),
            1 => Ok(Mode::Tls),
            n => Err(Error::UnsupportedMode(n.to_string())),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("plain") || s == "0" {
            Ok(Mode::Plain)
        } else if s.eq_ignore_ascii_case("tls") || s == "1" {
            Ok(Mode::Tls)
        } else {
            Err(Error::UnsupportedMode(s.to_string()))
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Plain => "plain",
            Mode::Tls => "tls",
        })
    }
}

enum Link<T: Transport> {
    Detached,
    Plain(T),
    Tls(TlsSession<T>),
}

impl<T: Transport> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Detached => f.write_str("Detached"),
            Link::Plain(t) => f.debug_tuple("Plain").field(t).finish(),
            Link::Tls(s) => f.debug_tuple("Tls").field(s).finish(),
        }
    }
}

/// A network stream that is either plain or TLS, chosen per connection.
///
/// Configure the [`Mode`], the authentication mode and the permitted peers first, then either
/// [`connect()`](Self::connect) or set up a listener with [`listen_init()`](Self::listen_init).
/// Every operation goes to the transport directly in plain mode, and through the TLS session
/// in TLS mode.
///
/// Nothing here blocks. When the TLS handshake can't finish right away, the stream reports
/// [`Status::Retry`]; wait until [`descriptor()`](Self::descriptor) is ready for
/// [`interest()`](Self::interest) and call [`retry()`](Self::retry), or just go ahead with
/// [`send()`](Self::send)/[`receive()`](Self::receive), which resume the handshake first.
#[derive(Debug)]
pub struct NetStream<T: Transport = TcpTransport> {
    ctx: Arc<TrustContext>,
    mode: Mode,
    auth: AuthMode,
    peers: PermittedPeers,
    link: Link<T>,
}

impl<T: Transport> NetStream<T> {
    /// A detached stream in plain mode, with the default authentication mode.
    pub fn new(ctx: Arc<TrustContext>) -> Self {
        Self {
            ctx,
            mode: Mode::Plain,
            auth: AuthMode::default(),
            peers: PermittedPeers::default(),
            link: Link::Detached,
        }
    }

    /// Select plain or TLS operation for the next connect or accept.
    ///
    /// A stream that already runs TLS can't go back to plain.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), Error> {
        if mode == Mode::Plain && matches!(self.link, Link::Tls(_)) {
            error!("tls stream cannot be downgraded to plain");
            return Err(Error::UnsupportedMode(mode.to_string()));
        }

        self.mode = mode;
        Ok(())
    }

    /// The configured mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Select the authentication mode by name: `anon`, `x509/fingerprint`, or `x509/name`
    /// (also chosen by `None`). Case-insensitive.
    ///
    /// An unknown name leaves the current mode in place.
    pub fn set_auth_mode(&mut self, mode: Option<&str>) -> Result<(), Error> {
        match AuthMode::parse(mode) {
            Ok(auth) => {
                self.auth = auth;
                debug!(%auth, "auth mode set");
                Ok(())
            }
            Err(err) => {
                error!(%err, "authentication mode not supported");
                Err(err)
            }
        }
    }

    /// The configured authentication mode.
    pub fn auth_mode(&self) -> AuthMode {
        self.auth
    }

    /// Set who may talk to us: fingerprints or names, depending on the authentication mode.
    ///
    /// Rejected in anonymous mode, keeping any list configured before.
    pub fn set_permitted_peers(&mut self, peers: PermittedPeers) -> Result<(), Error> {
        if !self.auth.uses_permitted_peers() {
            error!(auth = %self.auth, "permitted peers are ignored in this authentication mode");
            return Err(Error::PolicyMismatch(self.auth));
        }

        self.peers = peers;
        Ok(())
    }

    /// The configured permitted peers.
    pub fn permitted_peers(&self) -> &PermittedPeers {
        &self.peers
    }

    /// Write data, returning how much was accepted. Resubmit whatever wasn't.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match &mut self.link {
            Link::Detached => Err(Error::NotConnected),
            Link::Plain(t) => Ok(t.write(buf)?),
            Link::Tls(s) => s.send(buf),
        }
    }

    /// Read data into `buf`, returning how much arrived. `Ok(0)` is end of stream.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match &mut self.link {
            Link::Detached => Err(Error::NotConnected),
            Link::Plain(t) => Ok(t.read(buf)?),
            Link::Tls(s) => s.receive(buf),
        }
    }

    /// Resume a pending handshake.
    pub fn retry(&mut self) -> Result<Status, Error> {
        match &mut self.link {
            Link::Detached => Err(Error::NotConnected),
            Link::Plain(_) => Ok(Status::Ready),
            Link::Tls(s) => s.handshake(),
        }
    }

    /// Re-run peer authentication on an established TLS stream.
    ///
    /// Failures are only logged the first time.
    pub fn authenticate(&mut self) -> Result<(), Error> {
        match &mut self.link {
            Link::Detached => Err(Error::NotConnected),
            Link::Plain(_) => Ok(()),
            Link::Tls(s) => s.authenticate(),
        }
    }

    /// Abort the connection.
    ///
    /// A plain stream is reset when dropped. A TLS stream refuses all further sends and
    /// receives.
    pub fn abort(&mut self) -> Result<(), Error> {
        match &mut self.link {
            Link::Detached => Ok(()),
            Link::Plain(t) => Ok(t.abort()?),
            Link::Tls(s) => {
                s.abort();
                Ok(())
            }
        }
    }

    /// Name of the remote host.
    pub fn remote_name(&self) -> Result<String, Error> {
        Ok(self.transport()?.remote_name()?)
    }

    /// Address of the remote host.
    pub fn remote_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.transport()?.remote_addr()?)
    }

    fn transport(&self) -> Result<&T, Error> {
        match &self.link {
            Link::Detached => Err(Error::NotConnected),
            Link::Plain(t) => Ok(t),
            Link::Tls(s) => Ok(s.transport()),
        }
    }

    /// The underlying descriptor, for readiness polling.
    pub fn descriptor(&self) -> Option<RawFd> {
        self.transport().ok().map(Transport::descriptor)
    }

    /// Lifecycle state; always [`State::Plain`] unless a TLS session exists.
    pub fn state(&self) -> State {
        match &self.link {
            Link::Tls(s) => s.state(),
            _ => State::Plain,
        }
    }

    /// The operation a selector should wait to retry, if any.
    pub fn pending_retry(&self) -> Option<PendingOp> {
        match &self.link {
            Link::Tls(s) => s.pending_retry(),
            _ => None,
        }
    }

    /// Which readiness to wait for before retrying.
    pub fn interest(&self) -> Interest {
        match &self.link {
            Link::Tls(s) => s.interest(),
            _ => Interest::Read,
        }
    }

    /// The TLS session, if this stream runs one.
    pub fn tls(&self) -> Option<&TlsSession<T>> {
        match &self.link {
            Link::Tls(s) => Some(s),
            _ => None,
        }
    }

    /// Attach a transport, starting TLS on it if that's the configured mode.
    fn attach(
        &mut self,
        transport: T,
        start: impl FnOnce(T) -> Result<TlsSession<T>, Error>,
    ) -> Result<Status, Error> {
        match self.mode {
            Mode::Plain => {
                self.link = Link::Plain(transport);
                Ok(Status::Ready)
            }
            Mode::Tls => {
                self.link = Link::Tls(start(transport)?);
                self.retry()
            }
        }
    }
}

impl<T: Connect> NetStream<T> {
    /// Connect to `host:port`. In TLS mode, also start the handshake as the client.
    ///
    /// [`Status::Retry`] means the handshake is under way; it is not an error.
    pub fn connect(&mut self, family: Family, port: u16, host: &str) -> Result<Status, Error> {
        if !matches!(self.link, Link::Detached) {
            return Err(io::Error::other("stream is already connected").into());
        }

        let transport = T::connect(family, port, host)?;
        let config = self.ctx.client_config(self.auth);
        let (auth, peers) = (self.auth, self.peers.clone());

        self.attach(transport, |t| {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            TlsSession::client(config, server_name, t, auth, peers)
        })
    }

    /// Replace the underlying socket.
    ///
    /// On a detached stream this attaches it as a plain connection.
    pub fn set_socket(&mut self, fd: OwnedFd) -> Result<(), Error> {
        match &mut self.link {
            Link::Detached => self.link = Link::Plain(T::from_descriptor(fd)?),
            Link::Plain(t) => t.set_descriptor(fd)?,
            Link::Tls(s) => s.transport_mut().set_descriptor(fd)?,
        }
        Ok(())
    }

    /// Start listening on `port`, on `addr` if given or every local address of `family`.
    ///
    /// In TLS mode this first prepares the trust context for serving. Streams accepted from the
    /// returned listener inherit this stream's mode, authentication mode and permitted peers.
    pub fn listen_init(
        &self,
        family: Family,
        port: u16,
        addr: Option<&str>,
        max_sessions: usize,
    ) -> Result<NetListener<T::Listener>, Error> {
        let config = self.ctx.prepare_for_listening()?;
        let listener = T::Listener::bind(family, port, addr, max_sessions)?;
        info!(
            local = ?listener.local_addr().ok(),
            mode = %self.mode,
            auth = %self.auth,
            "listener ready"
        );

        Ok(NetListener {
            ctx: self.ctx.clone(),
            config,
            mode: self.mode,
            auth: self.auth,
            peers: self.peers.clone(),
            listener,
        })
    }
}

/// A listening socket that hands out [`NetStream`]s.
#[derive(Debug)]
pub struct NetListener<L: Listen> {
    ctx: Arc<TrustContext>,
    config: Arc<ListenerConfig>,
    mode: Mode,
    auth: AuthMode,
    peers: PermittedPeers,
    listener: L,
}

impl<L: Listen> NetListener<L> {
    /// Accept one pending connection. In TLS mode, also start the handshake as the server.
    ///
    /// Fails with a would-block error when no connection is waiting. The new stream may still
    /// be handshaking: check [`NetStream::pending_retry()`].
    pub fn accept(&self) -> Result<NetStream<L::Transport>, Error> {
        let transport = self.listener.accept()?;
        let mut stream = NetStream {
            ctx: self.ctx.clone(),
            mode: self.mode,
            auth: self.auth,
            peers: self.peers.clone(),
            link: Link::Detached,
        };

        let config = self.config.server_config(self.auth);
        let (auth, peers) = (self.auth, self.peers.clone());
        stream.attach(transport, |t| TlsSession::server(config, t, auth, peers))?;
        Ok(stream)
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// The listening descriptor, for readiness polling.
    pub fn descriptor(&self) -> RawFd {
        self.listener.descriptor()
    }

    /// The mode accepted streams start in.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The authentication mode accepted streams check their peers with.
    pub fn auth_mode(&self) -> AuthMode {
        self.auth
    }
}
