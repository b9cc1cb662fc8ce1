use rustls::{NamedGroup, crypto::CryptoProvider};
use tracing::trace;

use crate::Error;

/// Build the _ring_ [`CryptoProvider`] used by every stream of a trust context.
///
/// Ephemeral key exchange groups weaker than `kx_bits` (expressed as the equivalent finite-field
/// Diffie-Hellman modulus size) are removed. Fails if that leaves nothing to negotiate with.
pub(crate) fn crypto_provider(kx_bits: u32) -> Result<CryptoProvider, Error> {
    let mut provider = rustls::crypto::ring::default_provider();
    provider
        .kx_groups
        .retain(|group| equivalent_bits(group.name()) >= kx_bits);

    if provider.kx_groups.is_empty() {
        return Err(Error::CryptoInit(rustls::Error::General(format!(
            "no key exchange group offers {kx_bits} bits of strength"
        ))));
    }

    trace!(?provider, "netstream crypto provider");
    Ok(provider)
}

/// Finite-field DH modulus size with comparable strength, per NIST SP 800-57.
fn equivalent_bits(group: NamedGroup) -> u32 {
    match group {
        NamedGroup::FFDHE2048 => 2048,
        NamedGroup::FFDHE3072 | NamedGroup::X25519 | NamedGroup::secp256r1 => 3072,
        NamedGroup::FFDHE4096 | NamedGroup::X448 => 4096,
        NamedGroup::FFDHE6144 => 6144,
        NamedGroup::FFDHE8192 | NamedGroup::secp384r1 => 7680,
        NamedGroup::secp521r1 => 15360,
        _ => 0,
    }
}
