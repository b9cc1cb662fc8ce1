//! Netstream-tls is a pluggable network stream that runs either plain TCP or TLS, chosen per
//! connection, with mutual X.509 authentication of the peer.
//!
//! A process builds one [`TrustContext`] at startup from three PEM files: its own certificate,
//! its private key, and the CA bundle it trusts. Each [`NetStream`] shares that context, is set
//! to a [`Mode`], and then either connects out or starts a [`NetListener`] that accepts streams
//! inheriting its settings.
//!
//! Peers can be authenticated in three ways, picked by [`AuthMode`]:
//!
//! - `anon`: no peer check at all. Traffic is encrypted but anyone may connect.
//! - `x509/fingerprint`: the SHA-1 fingerprint of the peer's certificate, formatted as
//!   colon-separated upper-case hex pairs, must be in the [`PermittedPeers`] list.
//! - `x509/name`: the peer's chain must verify against the trusted CAs, and if a list of
//!   permitted names is given, the certificate must be valid for one of them.
//!
//! Authentication happens once the handshake completes and before any data is exchanged.
//! A peer that fails it is logged once per session, however many times the check is repeated.
//!
//! Everything is non-blocking. A handshake that can't complete straight away reports
//! [`Status::Retry`], and the stream tells you which descriptor and [`Interest`] to poll for
//! before calling [`NetStream::retry()`] again.
//!
//! # Example
//!
//! ```no_run
//! use netstream_tls::{Family, Mode, NetStream, PermittedPeers, Status, TrustContext, TrustOptions};
//!
//! # fn main() -> Result<(), netstream_tls::Error> {
//! let ctx = TrustContext::initialize(TrustOptions::new("cert.pem", "key.pem", "ca.pem"))?;
//!
//! let mut stream: NetStream = NetStream::new(ctx.clone());
//! stream.set_mode(Mode::Tls)?;
//! stream.set_auth_mode(Some("x509/fingerprint"))?;
//! stream.set_permitted_peers(PermittedPeers::new([
//!     "DA:39:A3:EE:5E:6B:4B:0D:32:55:BF:EF:95:60:18:90:AF:D8:07:09",
//! ]))?;
//!
//! let mut status = stream.connect(Family::Unspecified, 6514, "logs.example.com")?;
//! while let Status::Retry(_) = status {
//!     // wait for stream.descriptor() to be ready for stream.interest()
//!     status = stream.retry()?;
//! }
//!
//! stream.send(b"hello")?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

pub use crate::{
    auth::*,
    context::*,
    credentials::*,
    error::{AuthError, Error, ErrorKind},
    fingerprint::*,
    session::*,
    stream::*,
    transport::*,
};
pub use rustls;

mod auth;
mod context;
mod credentials;
mod error;
mod fingerprint;
mod provider;
mod session;
mod stream;
mod transport;
mod verify;
