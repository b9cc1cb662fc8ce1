use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use ring::rand::{SecureRandom, SystemRandom};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    client::{Resumption, WebPkiServerVerifier},
    crypto::CryptoProvider,
    server::{NoServerSessionStorage, WebPkiClientVerifier},
};
use tracing::{debug, info};

use crate::{AuthMode, Credentials, Error, credentials::load_trust_anchors, provider, verify};

/// Default strength, in finite-field Diffie-Hellman bits, of ephemeral key exchange.
pub const DEFAULT_DH_BITS: u32 = 1024;

/// Where the trust material lives and how strong key exchange must be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustOptions {
    /// PEM file with our certificate chain, leaf first.
    pub cert_file: PathBuf,

    /// PEM file with our private key.
    pub key_file: PathBuf,

    /// PEM bundle of trusted CA certificates.
    pub ca_file: PathBuf,

    /// Minimum ephemeral key exchange strength, in equivalent finite-field DH bits.
    ///
    /// Defaults to [`DEFAULT_DH_BITS`], which admits every group the provider supports.
    pub dh_bits: u32,
}

impl TrustOptions {
    /// Options with the given files and default key exchange strength.
    pub fn new(
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
        ca_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_file: ca_file.into(),
            dh_bits: DEFAULT_DH_BITS,
        }
    }
}

/// Process-wide trust material shared by every stream.
///
/// Create one with [`TrustContext::initialize()`] at startup and hand clones of the `Arc` to each
/// stream. It is read-only once built, apart from the one-time listener preparation.
pub struct TrustContext {
    options: TrustOptions,
    provider: Arc<CryptoProvider>,
    credentials: Arc<Credentials>,
    roots: Arc<RootCertStore>,
    client_name: Arc<ClientConfig>,
    client_deferred: Arc<ClientConfig>,
    listener: Mutex<Option<Arc<ListenerConfig>>>,
}

impl fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustContext")
            .field("options", &self.options)
            .field("credentials", &self.credentials)
            .field("roots", &self.roots.len())
            .field("listening", &self.is_listening_prepared())
            .finish_non_exhaustive()
    }
}

impl TrustContext {
    /// Load credentials and trusted CAs, and prepare client-side configuration.
    pub fn initialize(options: TrustOptions) -> Result<Arc<Self>, Error> {
        SystemRandom::new()
            .fill(&mut [0u8; 16])
            .map_err(|_| Error::CryptoInit(rustls::Error::FailedToGetRandomBytes))?;

        let provider = Arc::new(provider::crypto_provider(options.dh_bits)?);
        let credentials = Arc::new(Credentials::load(
            &options.cert_file,
            &options.key_file,
            &provider,
        )?);
        let roots = Arc::new(load_trust_anchors(&options.ca_file)?);

        let name_verifier =
            WebPkiServerVerifier::builder_with_provider(roots.clone(), provider.clone())
                .build()
                .map_err(|e| Error::config(&options.ca_file, e))?;

        let mut client_name = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(Error::CryptoInit)?
            .with_webpki_verifier(name_verifier)
            .with_client_cert_resolver(credentials.clone());
        client_name.resumption = Resumption::disabled();

        let mut client_deferred = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(Error::CryptoInit)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verify::DeferredVerifier::new(
                provider.signature_verification_algorithms,
                true,
            )))
            .with_client_cert_resolver(credentials.clone());
        client_deferred.resumption = Resumption::disabled();

        info!(
            cert = %options.cert_file.display(),
            ca = %options.ca_file.display(),
            fingerprint = ?credentials.fingerprint(),
            "trust context initialised"
        );

        Ok(Arc::new(Self {
            options,
            provider,
            credentials,
            roots,
            client_name: Arc::new(client_name),
            client_deferred: Arc::new(client_deferred),
            listener: Mutex::new(None),
        }))
    }

    /// The options this context was built from.
    pub fn options(&self) -> &TrustOptions {
        &self.options
    }

    /// Our own credentials.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Client configuration for the given authentication mode.
    pub fn client_config(&self, mode: AuthMode) -> Arc<ClientConfig> {
        match mode {
            AuthMode::X509Name => self.client_name.clone(),
            AuthMode::X509Fingerprint | AuthMode::Anonymous => self.client_deferred.clone(),
        }
    }

    /// Set up the server side: choose key exchange parameters and bind them to our credentials.
    ///
    /// This happens at most once per context; later calls return the same configuration. Call
    /// it when setting up a listener, before anything is accepted.
    pub fn prepare_for_listening(&self) -> Result<Arc<ListenerConfig>, Error> {
        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(config) = &*slot {
            return Ok(config.clone());
        }

        let config = Arc::new(ListenerConfig::build(self)?);
        info!(
            dh_bits = self.options.dh_bits,
            kx_groups = ?self.provider.kx_groups.iter().map(|g| g.name()).collect::<Vec<_>>(),
            "server key exchange prepared"
        );
        *slot = Some(config.clone());
        Ok(config)
    }

    /// Whether [`prepare_for_listening()`](Self::prepare_for_listening) has completed.
    pub fn is_listening_prepared(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Release the trust material.
    ///
    /// This only succeeds once every stream and listener using the context is gone; otherwise
    /// the context is handed back unchanged.
    pub fn teardown(self: Arc<Self>) -> Result<(), Arc<Self>> {
        let ctx = Arc::try_unwrap(self)?;
        debug!(cert = %ctx.options.cert_file.display(), "trust context released");
        drop(ctx);
        Ok(())
    }
}

/// Server configurations, one per authentication mode, sharing one set of key exchange
/// parameters and credentials.
#[derive(Debug)]
pub struct ListenerConfig {
    anonymous: Arc<ServerConfig>,
    name: Arc<ServerConfig>,
    fingerprint: Arc<ServerConfig>,
}

impl ListenerConfig {
    fn build(ctx: &TrustContext) -> Result<Self, Error> {
        let algorithms = ctx.provider.signature_verification_algorithms;

        let name_verifier =
            WebPkiClientVerifier::builder_with_provider(ctx.roots.clone(), ctx.provider.clone())
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::config(&ctx.options.ca_file, e))?;

        let anonymous = server_config(ctx, |b| b.with_no_client_auth())?;
        let name = server_config(ctx, |b| b.with_client_cert_verifier(name_verifier))?;
        let fingerprint = server_config(ctx, |b| {
            b.with_client_cert_verifier(Arc::new(verify::DeferredVerifier::new(algorithms, true)))
        })?;

        Ok(Self {
            anonymous,
            name,
            fingerprint,
        })
    }

    /// Server configuration for the given authentication mode.
    pub fn server_config(&self, mode: AuthMode) -> Arc<ServerConfig> {
        match mode {
            AuthMode::Anonymous => self.anonymous.clone(),
            AuthMode::X509Name => self.name.clone(),
            AuthMode::X509Fingerprint => self.fingerprint.clone(),
        }
    }
}

type WantsVerifier = rustls::ConfigBuilder<ServerConfig, rustls::WantsVerifier>;
type WantsCert = rustls::ConfigBuilder<ServerConfig, rustls::server::WantsServerCert>;

fn server_config(
    ctx: &TrustContext,
    verifier: impl FnOnce(WantsVerifier) -> WantsCert,
) -> Result<Arc<ServerConfig>, Error> {
    let builder = ServerConfig::builder_with_provider(ctx.provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(Error::CryptoInit)?;

    let mut config = verifier(builder).with_cert_resolver(ctx.credentials.clone());
    config.session_storage = Arc::new(NoServerSessionStorage {});
    config.send_tls13_tickets = 0;
    Ok(Arc::new(config))
}
