use std::fmt::{self, Write};

use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, digest};
use rustls::pki_types::CertificateDer;

use crate::AuthError;

/// Length in bytes of a certificate [`Fingerprint`].
pub const FINGERPRINT_LEN: usize = 20;

/// The SHA-1 digest of a DER-encoded certificate.
///
/// Displays as colon-separated upper-case hex pairs (`AA:BB:...`), which is also the form
/// permitted peer lists are written in.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Compute the fingerprint of a certificate.
    pub fn of(cert: &CertificateDer<'_>) -> Result<Self, AuthError> {
        let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, cert.as_ref());
        hash.as_ref()
            .try_into()
            .map(Self)
            .map_err(|_| AuthError::HashComputationFailed)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_fingerprint(&self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Render digest bytes as upper-case hex pairs joined by `:`.
///
/// The output is `3n - 1` characters long for `n` input bytes, and empty for empty input.
pub fn format_fingerprint(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 3).saturating_sub(1));
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}
