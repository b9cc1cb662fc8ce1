use std::{
    fmt,
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    time::Duration,
};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, trace};

/// Address family restriction for connecting and listening.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Family {
    /// Any family the name resolves to.
    #[default]
    Unspecified,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

impl Family {
    /// Whether `addr` belongs to this family.
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Unspecified => true,
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// A connected, non-blocking byte stream.
///
/// This is the plain layer that TLS sessions run over. Reads and writes follow the usual
/// non-blocking conventions: [`WouldBlock`](io::ErrorKind::WouldBlock) means "no progress now",
/// short counts are normal, and a zero-length read is end of stream.
pub trait Transport: Read + Write + fmt::Debug {
    /// The OS descriptor, for readiness polling.
    fn descriptor(&self) -> RawFd;

    /// Replace the underlying socket.
    fn set_descriptor(&mut self, fd: OwnedFd) -> io::Result<()>;

    /// Make the next close a hard reset rather than an orderly shutdown.
    fn abort(&mut self) -> io::Result<()>;

    /// Name of the remote host: the name we connected to, or the textual address otherwise.
    fn remote_name(&self) -> io::Result<String>;

    /// Address of the remote host.
    fn remote_addr(&self) -> io::Result<SocketAddr>;
}

/// A [`Transport`] that can dial out and listen.
pub trait Connect: Transport + Sized {
    /// The listener type producing this transport.
    type Listener: Listen<Transport = Self>;

    /// Open a connection to `host:port`, trying each resolved address of `family` in turn.
    fn connect(family: Family, port: u16, host: &str) -> io::Result<Self>;

    /// Wrap an existing connected socket.
    fn from_descriptor(fd: OwnedFd) -> io::Result<Self>;
}

/// A listening socket.
pub trait Listen: fmt::Debug {
    /// The connections it hands out.
    type Transport: Transport;

    /// Bind and listen on `port`, on `addr` if given or on every local address of `family`.
    fn bind(family: Family, port: u16, addr: Option<&str>, backlog: usize) -> io::Result<Self>
    where
        Self: Sized;

    /// Accept one pending connection, or fail with `WouldBlock` if there is none.
    fn accept(&self) -> io::Result<Self::Transport>;

    /// The address actually bound.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// The OS descriptor, for readiness polling.
    fn descriptor(&self) -> RawFd;
}

/// Plain TCP [`Transport`].
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    host: Option<String>,
}

impl TcpTransport {
    /// The inner socket.
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

impl From<TcpStream> for TcpTransport {
    /// Wrap a stream as-is; its blocking mode is left untouched.
    fn from(stream: TcpStream) -> Self {
        Self { stream, host: None }
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn descriptor(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn set_descriptor(&mut self, fd: OwnedFd) -> io::Result<()> {
        let stream = TcpStream::from(fd);
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        self.stream = stream;
        self.host = None;
        Ok(())
    }

    fn abort(&mut self) -> io::Result<()> {
        SockRef::from(&self.stream).set_linger(Some(Duration::ZERO))
    }

    fn remote_name(&self) -> io::Result<String> {
        match &self.host {
            Some(host) => Ok(host.clone()),
            None => self.remote_addr().map(|addr| addr.ip().to_string()),
        }
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Connect for TcpTransport {
    type Listener = TcpListener;

    fn connect(family: Family, port: u16, host: &str) -> io::Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            if !family.matches(&addr) {
                continue;
            }

            match connect_one(addr) {
                Ok(stream) => {
                    debug!(%host, %addr, "tcp connected");
                    return Ok(Self {
                        stream,
                        host: Some(host.to_string()),
                    });
                }
                Err(err) => {
                    trace!(%addr, %err, "tcp connect failed, trying next address");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {family:?} address found for {host}"),
            )
        }))
    }

    fn from_descriptor(fd: OwnedFd) -> io::Result<Self> {
        let stream = TcpStream::from(fd);
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(stream.into())
    }
}

fn connect_one(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect(&addr.into())?;
    socket.set_nonblocking(true)?;
    let stream = TcpStream::from(socket);
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Non-blocking TCP listener.
#[derive(Debug)]
pub struct TcpListener {
    socket: Socket,
}

impl Listen for TcpListener {
    type Transport = TcpTransport;

    fn bind(family: Family, port: u16, addr: Option<&str>, backlog: usize) -> io::Result<Self> {
        let ip = match addr {
            Some(addr) => (addr, port)
                .to_socket_addrs()?
                .map(|sa| sa.ip())
                .find(|ip| family.matches(&SocketAddr::new(*ip, port)))
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no {family:?} address found for {addr}"),
                    )
                })?,
            None if family == Family::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let local = SocketAddr::new(ip, port);

        let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
        socket.set_nonblocking(true)?;

        debug!(%local, backlog, "tcp listening");
        Ok(Self { socket })
    }

    fn accept(&self) -> io::Result<TcpTransport> {
        let (socket, peer) = self.socket.accept()?;
        socket.set_nonblocking(true)?;
        let stream = TcpStream::from(socket);
        stream.set_nodelay(true)?;
        trace!(peer = ?peer.as_socket(), "tcp accepted");
        Ok(stream.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "listener is not an inet socket")
        })
    }

    fn descriptor(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
