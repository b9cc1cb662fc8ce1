use std::{io, path::PathBuf};

/// A netstream error.
///
/// Would-block and interrupted conditions during a handshake are not errors: they are reported
/// as [`Status::Retry`](crate::Status::Retry). Everything else leaves the stream unusable, and it
/// should be dropped.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("configuration error in {}: {reason}", path.display())]
    Configuration { path: PathBuf, reason: String },

    #[error("crypto initialisation failed: {0}")]
    CryptoInit(#[source] rustls::Error),

    #[error("tls handshake failed: {0}")]
    HandshakeFailed(#[source] io::Error),

    #[error("peer authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("connection abort requested")]
    ConnectionAborted,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("driver mode {0} not supported")]
    UnsupportedMode(String),

    #[error("authentication mode '{0}' not supported")]
    UnsupportedAuthMode(String),

    #[error("permitted peers are not used in authentication mode {0}")]
    PolicyMismatch(crate::AuthMode),

    #[error("stream is not connected")]
    NotConnected,
}

/// Why a peer was rejected after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The peer did not present any certificate.
    #[error("peer did not present a certificate")]
    NoCertificatePresented,

    /// The leaf certificate could not be read as X.509.
    #[error("peer certificate is not an X.509 certificate")]
    UnsupportedCertificateType,

    /// The certificate digest did not come out at the expected length.
    #[error("could not compute peer certificate fingerprint")]
    HashComputationFailed,

    /// Nothing in the permitted peer list matched the peer's identity.
    #[error("peer '{0}' is not permitted")]
    UntrustedPeer(String),
}

/// Flat classification of [`Error`], for callers that only need to branch on the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    ConfigurationError,
    CryptoInitError,
    HandshakeFailed,
    NoCertificatePresented,
    UnsupportedCertificateType,
    HashComputationFailed,
    UntrustedPeer,
    ConnectionAborted,
    IOFailure,
    UnsupportedMode,
    UnsupportedAuthMode,
    PolicyMismatch,
}

impl Error {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } => ErrorKind::ConfigurationError,
            Error::CryptoInit(_) => ErrorKind::CryptoInitError,
            Error::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            Error::Auth(AuthError::NoCertificatePresented) => ErrorKind::NoCertificatePresented,
            Error::Auth(AuthError::UnsupportedCertificateType) => {
                ErrorKind::UnsupportedCertificateType
            }
            Error::Auth(AuthError::HashComputationFailed) => ErrorKind::HashComputationFailed,
            Error::Auth(AuthError::UntrustedPeer(_)) => ErrorKind::UntrustedPeer,
            Error::ConnectionAborted => ErrorKind::ConnectionAborted,
            Error::Io(_) | Error::NotConnected => ErrorKind::IOFailure,
            Error::UnsupportedMode(_) => ErrorKind::UnsupportedMode,
            Error::UnsupportedAuthMode(_) => ErrorKind::UnsupportedAuthMode,
            Error::PolicyMismatch(_) => ErrorKind::PolicyMismatch,
        }
    }

    /// Whether this is a non-blocking "no progress now" condition.
    ///
    /// Only [`Error::Io`] carries these; callers should wait for readiness on the stream's
    /// descriptor and call again.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if is_retryable(e))
    }

    pub(crate) fn config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Configuration {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub(crate) fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
