use std::{path::Path, sync::Arc};

use rustls::{
    RootCertStore, SignatureScheme,
    client::ResolvesClientCert,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::debug;

use crate::{Error, Fingerprint};

/// The local certificate chain and private key that identify this side of every connection.
///
/// The same credentials are presented as a server and as a client: peers are always offered
/// mutual authentication, whether or not they end up checking it.
#[derive(Debug, Clone)]
pub struct Credentials {
    certified: Arc<CertifiedKey>,
}

impl Credentials {
    /// Load a PEM certificate chain and PEM private key from disk.
    pub fn load(
        cert_file: &Path,
        key_file: &Path,
        provider: &CryptoProvider,
    ) -> Result<Self, Error> {
        debug!(cert = %cert_file.display(), key = %key_file.display(), "loading credentials");

        let chain = CertificateDer::pem_file_iter(cert_file)
            .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
            .map_err(|e| Error::config(cert_file, e))?;
        if chain.is_empty() {
            return Err(Error::config(cert_file, "no certificate found"));
        }

        let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| Error::config(key_file, e))?;

        Self::from_der(chain, key, provider).map_err(|e| match e {
            Error::CryptoInit(e) => Error::config(key_file, e),
            e => e,
        })
    }

    /// Build credentials from already-decoded DER material.
    ///
    /// Fails if the key doesn't belong to the first certificate of the chain.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        provider: &CryptoProvider,
    ) -> Result<Self, Error> {
        Ok(Self {
            certified: Arc::new(
                CertifiedKey::from_der(chain, key, provider).map_err(Error::CryptoInit)?,
            ),
        })
    }

    /// Our own leaf certificate.
    pub fn certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certified.cert.first()
    }

    /// Fingerprint of our own leaf certificate, as peers will see it.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.certificate().and_then(|cert| Fingerprint::of(cert).ok())
    }
}

impl ResolvesClientCert for Credentials {
    fn resolve(&self, _hints: &[&[u8]], schemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        self.certified
            .key
            .choose_scheme(schemes)
            .is_some()
            .then(|| self.certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for Credentials {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certified.clone())
    }
}

/// Load the trusted CA bundle.
pub(crate) fn load_trust_anchors(ca_file: &Path) -> Result<RootCertStore, Error> {
    debug!(ca = %ca_file.display(), "loading trusted CAs");

    let certs = CertificateDer::pem_file_iter(ca_file)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| Error::config(ca_file, e))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!(added, ignored, "trusted CAs loaded");

    if added == 0 {
        return Err(Error::config(ca_file, "no usable CA certificate found"));
    }

    Ok(roots)
}
