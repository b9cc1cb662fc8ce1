use std::{fmt, str::FromStr, sync::Arc};

use rustls::pki_types::{CertificateDer, ServerName};
use tracing::{debug, error, trace};
use webpki::EndEntityCert;

use crate::{AuthError, Error, Fingerprint};

/// How the remote peer's identity is checked once the handshake completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AuthMode {
    /// No identity check at all.
    Anonymous,

    /// Certificate chain validation against the trusted CAs, plus an optional check of the leaf
    /// certificate's names against the permitted peer list.
    #[default]
    X509Name,

    /// SHA-1 fingerprint of the leaf certificate matched against the permitted peer list.
    X509Fingerprint,
}

impl AuthMode {
    /// Parse an authentication mode name, case-insensitively.
    ///
    /// `None` selects the default, [`AuthMode::X509Name`].
    pub fn parse(mode: Option<&str>) -> Result<Self, Error> {
        match mode {
            None => Ok(Self::X509Name),
            Some(s) if s.eq_ignore_ascii_case("x509/name") => Ok(Self::X509Name),
            Some(s) if s.eq_ignore_ascii_case("x509/fingerprint") => Ok(Self::X509Fingerprint),
            Some(s) if s.eq_ignore_ascii_case("anon") => Ok(Self::Anonymous),
            Some(s) => Err(Error::UnsupportedAuthMode(s.to_string())),
        }
    }

    /// Whether a permitted peer list means anything in this mode.
    pub fn uses_permitted_peers(self) -> bool {
        matches!(self, Self::X509Name | Self::X509Fingerprint)
    }
}

impl FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(Some(s))
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Anonymous => "anon",
            Self::X509Name => "x509/name",
            Self::X509Fingerprint => "x509/fingerprint",
        })
    }
}

/// An ordered list of peer identities that are allowed to talk to us.
///
/// Depending on the [`AuthMode`] these are either DNS names or fingerprints in the
/// [`Fingerprint`] display form. The list is shared between a listener and every stream it
/// accepts; cloning is cheap and never copies the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermittedPeers(Arc<[String]>);

impl PermittedPeers {
    /// Build a list from identifiers, keeping their order.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }

    /// The identifiers, in match order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<S: Into<String>> FromIterator<S> for PermittedPeers {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Per-stream peer identity check.
///
/// Failures are logged the first time only, so that a stream which keeps getting re-checked
/// does not flood the log.
#[derive(Debug, Clone)]
pub(crate) struct PeerAuthenticator {
    mode: AuthMode,
    peers: PermittedPeers,
    report_failure: bool,
}

impl PeerAuthenticator {
    pub fn new(mode: AuthMode, peers: PermittedPeers) -> Self {
        Self {
            mode,
            peers,
            report_failure: true,
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Check the peer's presented chain. Only the leaf (first) certificate is ever looked at.
    pub fn authenticate(&mut self, chain: &[CertificateDer<'_>]) -> Result<(), AuthError> {
        let res = match self.mode {
            AuthMode::Anonymous => return Ok(()),
            AuthMode::X509Fingerprint => self.check_fingerprint(chain),
            AuthMode::X509Name => self.check_name(chain),
        };

        if let Err(AuthError::UntrustedPeer(id)) = &res {
            if self.report_failure {
                error!(peer = %id, mode = %self.mode, "peer unknown, not permitted to talk to it");
                self.report_failure = false;
            } else {
                trace!(peer = %id, "repeated authentication failure");
            }
        }

        res
    }

    fn check_fingerprint(&self, chain: &[CertificateDer<'_>]) -> Result<(), AuthError> {
        let leaf = chain.first().ok_or(AuthError::NoCertificatePresented)?;
        if EndEntityCert::try_from(leaf).is_err() {
            return Err(AuthError::UnsupportedCertificateType);
        }

        let fingerprint = Fingerprint::of(leaf)?.to_string();
        debug!(%fingerprint, "peer certificate SHA-1 fingerprint");

        if self.peers.iter().any(|id| id == fingerprint) {
            Ok(())
        } else {
            Err(AuthError::UntrustedPeer(fingerprint))
        }
    }

    // The chain itself was validated against the trusted CAs during the handshake.
    fn check_name(&self, chain: &[CertificateDer<'_>]) -> Result<(), AuthError> {
        if self.peers.is_empty() {
            return Ok(());
        }

        let leaf = chain.first().ok_or(AuthError::NoCertificatePresented)?;
        let cert =
            EndEntityCert::try_from(leaf).map_err(|_| AuthError::UnsupportedCertificateType)?;

        let matched = self.peers.iter().any(|id| {
            ServerName::try_from(id)
                .is_ok_and(|name| cert.verify_is_valid_for_subject_name(&name).is_ok())
        });

        if matched {
            Ok(())
        } else {
            Err(AuthError::UntrustedPeer(Fingerprint::of(leaf)?.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use tracing_test::traced_test;

    fn cert_for(names: &[&str]) -> CertificateDer<'static> {
        let key = KeyPair::generate().unwrap();
        let params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.self_signed(&key).unwrap().der().clone()
    }

    #[test]
    fn parse_modes() {
        for (input, mode) in [
            (None, AuthMode::X509Name),
            (Some("x509/name"), AuthMode::X509Name),
            (Some("X509/NAME"), AuthMode::X509Name),
            (Some("x509/Fingerprint"), AuthMode::X509Fingerprint),
            (Some("ANON"), AuthMode::Anonymous),
            (Some("anon"), AuthMode::Anonymous),
        ] {
            assert_eq!(AuthMode::parse(input).unwrap(), mode, "{input:?}");
        }

        for bad in ["", "x509", "anonymous", "x509/fingerprint ", "psk"] {
            let err = AuthMode::parse(Some(bad)).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::UnsupportedAuthMode, "{bad:?}");
        }
    }

    #[test]
    fn display_round_trips() {
        for mode in [
            AuthMode::Anonymous,
            AuthMode::X509Name,
            AuthMode::X509Fingerprint,
        ] {
            assert_eq!(mode.to_string().parse::<AuthMode>().unwrap(), mode);
        }
    }

    #[test]
    fn anonymous_accepts_anything() {
        let mut auth = PeerAuthenticator::new(AuthMode::Anonymous, PermittedPeers::default());
        assert_eq!(auth.authenticate(&[]), Ok(()));
    }

    #[test]
    fn fingerprint_needs_a_certificate() {
        let mut auth = PeerAuthenticator::new(
            AuthMode::X509Fingerprint,
            PermittedPeers::new(["AA:BB"]),
        );
        assert_eq!(auth.authenticate(&[]), Err(AuthError::NoCertificatePresented));
    }

    #[test]
    fn fingerprint_rejects_garbage() {
        let mut auth = PeerAuthenticator::new(
            AuthMode::X509Fingerprint,
            PermittedPeers::new(["AA:BB"]),
        );
        let junk = CertificateDer::from(vec![1, 2, 3, 4]);
        assert_eq!(
            auth.authenticate(&[junk]),
            Err(AuthError::UnsupportedCertificateType)
        );
    }

    #[test]
    fn fingerprint_matches_leaf_only() {
        let leaf = cert_for(&["leaf.test"]);
        let issuer = cert_for(&["issuer.test"]);
        let leaf_fp = Fingerprint::of(&leaf).unwrap().to_string();
        let issuer_fp = Fingerprint::of(&issuer).unwrap().to_string();

        let mut auth = PeerAuthenticator::new(
            AuthMode::X509Fingerprint,
            PermittedPeers::new(["00:11".to_string(), leaf_fp.clone()]),
        );
        assert_eq!(auth.authenticate(&[leaf.clone(), issuer.clone()]), Ok(()));

        let mut auth = PeerAuthenticator::new(
            AuthMode::X509Fingerprint,
            PermittedPeers::new([issuer_fp]),
        );
        assert_eq!(
            auth.authenticate(&[leaf, issuer]),
            Err(AuthError::UntrustedPeer(leaf_fp))
        );
    }

    #[test]
    fn fingerprint_is_case_sensitive() {
        let leaf = cert_for(&["leaf.test"]);
        let lower = Fingerprint::of(&leaf).unwrap().to_string().to_lowercase();
        let mut auth =
            PeerAuthenticator::new(AuthMode::X509Fingerprint, PermittedPeers::new([lower]));
        assert!(matches!(
            auth.authenticate(&[leaf]),
            Err(AuthError::UntrustedPeer(_))
        ));
    }

    #[test]
    #[traced_test]
    fn mismatch_reported_once() {
        let leaf = cert_for(&["leaf.test"]);
        let fp = Fingerprint::of(&leaf).unwrap().to_string();
        let mut auth = PeerAuthenticator::new(
            AuthMode::X509Fingerprint,
            PermittedPeers::new([["AA"; 20].join(":")]),
        );

        for _ in 0..3 {
            assert_eq!(
                auth.authenticate(std::slice::from_ref(&leaf)),
                Err(AuthError::UntrustedPeer(fp.clone()))
            );
        }

        logs_assert(|lines: &[&str]| {
            let reported = lines
                .iter()
                .filter(|line| line.contains("not permitted") && line.contains(&fp))
                .count();
            if reported == 1 {
                Ok(())
            } else {
                Err(format!("expected one report, got {reported}"))
            }
        });
    }

    #[test]
    fn name_without_peers_relies_on_chain() {
        let mut auth = PeerAuthenticator::new(AuthMode::X509Name, PermittedPeers::default());
        assert_eq!(auth.authenticate(&[]), Ok(()));
    }

    #[test]
    fn name_matches_san() {
        let leaf = cert_for(&["relay.example.net"]);

        let mut auth = PeerAuthenticator::new(
            AuthMode::X509Name,
            PermittedPeers::new(["other.example.net", "relay.example.net"]),
        );
        assert_eq!(auth.authenticate(std::slice::from_ref(&leaf)), Ok(()));

        let mut auth =
            PeerAuthenticator::new(AuthMode::X509Name, PermittedPeers::new(["other.example.net"]));
        assert!(matches!(
            auth.authenticate(std::slice::from_ref(&leaf)),
            Err(AuthError::UntrustedPeer(_))
        ));
        assert_eq!(auth.authenticate(&[]), Err(AuthError::NoCertificatePresented));
    }
}
