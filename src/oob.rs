//! Secure Connections out-of-band data generation
// ([Vol 3] Part H, Section 2.3.5.6.4).
//!
//! A device that wants to pair over OOB generates a P-256 key pair, a random
//! `r` and the commitment `C = f4(PKx, PKx, r, 0)`, and ships the triplet to
//! the peer over whatever channel the product has (NFC tag, QR code). The
//! key pair is kept and reused for the pairing that follows so the received
//! commitment stays valid.

use rand_core::{CryptoRng, RngCore};

use crate::crypto::{Nonce, PublicKey, SecretKey};
use crate::Address;

/// Out-of-band data shared with a peer before Secure Connections pairing.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScOobData {
    /// Device address the data was generated for.
    pub addr: Address,
    /// 128-bit random value `r`.
    pub rand: u128,
    /// Commitment `C = f4(PKx, PKx, r, 0)` binding the public key.
    pub confirm: u128,
}

/// Locally generated OOB key material, consumed by the next OOB pairing.
#[derive(Clone)]
pub(crate) struct LocalOobData {
    pub(crate) secret: SecretKey,
    pub(crate) public: PublicKey,
    pub(crate) rand: u128,
}

impl LocalOobData {
    /// Generate a fresh key pair and random for out-of-band pairing.
    pub(crate) fn generate<RNG: RngCore + CryptoRng>(rng: &mut RNG) -> Self {
        let secret = SecretKey::new(rng);
        let public = secret.public_key();
        let rand = Nonce::new(rng).0;
        Self { secret, public, rand }
    }

    /// The triplet shared with the peer over the out-of-band channel.
    pub(crate) fn shared_data(&self, addr: Address) -> ScOobData {
        let confirm = Nonce(self.rand).f4(self.public.x(), self.public.x(), 0);
        ScOobData {
            addr,
            rand: self.rand,
            confirm: confirm.0,
        }
    }
}

/// Out-of-band inputs for one pairing: our generated key material and the
/// peer's received data, either of which may be absent.
#[derive(Clone, Default)]
pub(crate) struct OobContext {
    pub(crate) local: Option<LocalOobData>,
    pub(crate) peer: Option<ScOobData>,
}

impl OobContext {
    pub(crate) fn none() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaCha12Rng;
    use rand_core::SeedableRng;

    use super::*;

    #[test]
    fn shared_data_commitment_verifies() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let local = LocalOobData::generate(&mut rng);
        let shared = local.shared_data(Address::random([1, 2, 3, 4, 5, 6]));

        let expected = Nonce(shared.rand).f4(local.public.x(), local.public.x(), 0);
        assert_eq!(expected.0, shared.confirm);

        // A different key pair does not match the commitment
        let other = LocalOobData::generate(&mut rng);
        let forged = Nonce(shared.rand).f4(other.public.x(), other.public.x(), 0);
        assert_ne!(forged.0, shared.confirm);
    }
}
