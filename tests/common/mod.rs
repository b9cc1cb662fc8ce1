#![allow(dead_code)]

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use netstream_tls::{
    Error, Family, Mode, NetListener, NetStream, PermittedPeers, Status, TcpListener,
    TrustContext, TrustOptions,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use tempfile::TempDir;

pub const TICK: Duration = Duration::from_millis(5);
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A throwaway CA and the files it signed, removed on drop.
pub struct Pki {
    pub dir: TempDir,
    ca: Certificate,
    ca_key: KeyPair,
}

/// PEM paths of one identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
    pub der: Vec<u8>,
}

impl Pki {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "netstream test CA");
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = params.self_signed(&ca_key).unwrap();
        fs::write(dir.path().join("ca.pem"), ca.pem()).unwrap();

        Self { dir, ca, ca_key }
    }

    /// Issue a certificate for `name`, valid for both client and server use.
    pub fn issue(&self, name: &str) -> Identity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();

        let cert_path = self.dir.path().join(format!("{name}.pem"));
        let key_path = self.dir.path().join(format!("{name}.key"));
        fs::write(&cert_path, cert.pem()).unwrap();
        fs::write(&key_path, key.serialize_pem()).unwrap();

        Identity {
            cert: cert_path,
            key: key_path,
            ca: self.dir.path().join("ca.pem"),
            der: cert.der().to_vec(),
        }
    }
}

impl Identity {
    pub fn context(&self) -> Arc<TrustContext> {
        TrustContext::initialize(TrustOptions::new(&self.cert, &self.key, &self.ca)).unwrap()
    }
}

/// A TLS listener on an ephemeral loopback port.
pub fn tls_listener(
    ctx: &Arc<TrustContext>,
    auth: &str,
    peers: Option<PermittedPeers>,
) -> NetListener<TcpListener> {
    let mut stream: NetStream = NetStream::new(ctx.clone());
    stream.set_mode(Mode::Tls).unwrap();
    stream.set_auth_mode(Some(auth)).unwrap();
    if let Some(peers) = peers {
        stream.set_permitted_peers(peers).unwrap();
    }
    stream
        .listen_init(Family::Ipv4, 0, Some("127.0.0.1"), 8)
        .unwrap()
}

/// A TLS client stream, not yet connected.
pub fn tls_client(
    ctx: &Arc<TrustContext>,
    auth: &str,
    peers: Option<PermittedPeers>,
) -> NetStream {
    let mut stream: NetStream = NetStream::new(ctx.clone());
    stream.set_mode(Mode::Tls).unwrap();
    stream.set_auth_mode(Some(auth)).unwrap();
    if let Some(peers) = peers {
        stream.set_permitted_peers(peers).unwrap();
    }
    stream
}

/// Accept one connection, waiting for it to arrive.
pub fn accept(listener: &NetListener<TcpListener>) -> Result<NetStream, Error> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match listener.accept() {
            Err(err) if err.is_would_block() => {
                assert!(Instant::now() < deadline, "nothing to accept");
                thread::sleep(TICK);
            }
            res => return res,
        }
    }
}

/// Keep retrying the handshake until it settles.
pub fn settle(stream: &mut NetStream, first: Result<Status, Error>) -> Result<(), Error> {
    let deadline = Instant::now() + TIMEOUT;
    let mut status = first?;
    while let Status::Retry(_) = status {
        assert!(Instant::now() < deadline, "handshake never settled");
        thread::sleep(TICK);
        status = stream.retry()?;
    }
    Ok(())
}

/// Finish a handshake already started by connect or accept.
pub fn handshake(stream: &mut NetStream) -> Result<(), Error> {
    let first = stream.retry();
    settle(stream, first)
}

/// Connect to the listener's port on `host` and finish the handshake.
pub fn connect(stream: &mut NetStream, host: &str, port: u16) -> Result<(), Error> {
    let first = stream.connect(Family::Ipv4, port, host);
    settle(stream, first)
}

pub fn send_all(stream: &mut NetStream, mut data: &[u8]) -> Result<(), Error> {
    let deadline = Instant::now() + TIMEOUT;
    while !data.is_empty() {
        match stream.send(data) {
            Ok(n) => data = &data[n..],
            Err(err) if err.is_would_block() => {
                assert!(Instant::now() < deadline, "send stalled");
                thread::sleep(TICK);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub fn receive_exact(stream: &mut NetStream, len: usize) -> Result<Vec<u8>, Error> {
    let deadline = Instant::now() + TIMEOUT;
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 1024];
    while out.len() < len {
        match stream.receive(&mut buf[..(len - out.len()).min(1024)]) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.is_would_block() => {
                assert!(Instant::now() < deadline, "receive stalled");
                thread::sleep(TICK);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}
