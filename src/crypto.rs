use std::fs;
use std::path::Path;

use hkdf::Hkdf;
use k256::ecdh::diffie_hellman;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Sha3_256};

use crate::errors::{ChainError, ChainResult};
use crate::types::{u64_to_bytes, Address, Hash, ADDRESS_LEN};

pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 33;
pub const SHARED_KEY_LEN: usize = 32;

/// The 256-bit domain digest used everywhere: block and transaction hashes,
/// proof seals, peer identifiers, and message signatures.
pub fn digest256(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    Hash::from_slice(&hasher.finalize())
}

/// secp256k1 keypair backing both block signing and the P2P identity.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> ChainResult<Self> {
        let signing = SigningKey::from_slice(bytes)
            .map_err(|err| ChainError::Crypto(format!("invalid secret key bytes: {err}")))?;
        Ok(Self { signing })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes().into()
    }

    pub fn public_key(&self) -> VerifyingKey {
        *self.signing.verifying_key()
    }

    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key())
    }

    /// Signs a precomputed digest, returning the 64-byte `r ‖ s` form.
    pub fn sign_digest(&self, digest: &Hash) -> ChainResult<[u8; SIGNATURE_LEN]> {
        let signature: Signature = self
            .signing
            .sign_prehash(digest.as_bytes())
            .map_err(|err| ChainError::Crypto(format!("signing failed: {err}")))?;
        Ok(signature.to_bytes().into())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

pub fn verify_digest(
    public_key: &VerifyingKey,
    digest: &Hash,
    signature: &[u8],
) -> ChainResult<()> {
    let signature = Signature::from_slice(signature)
        .map_err(|err| ChainError::Crypto(format!("malformed signature: {err}")))?;
    public_key
        .verify_prehash(digest.as_bytes(), &signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

pub fn public_key_bytes(public_key: &VerifyingKey) -> Vec<u8> {
    public_key.to_encoded_point(true).as_bytes().to_vec()
}

pub fn public_key_from_bytes(bytes: &[u8]) -> ChainResult<VerifyingKey> {
    VerifyingKey::from_sec1_bytes(bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

/// Derives an address from a public key: the trailing 15 bytes of its digest.
pub fn address_from_public_key(public_key: &VerifyingKey) -> Address {
    let digest = digest256(&public_key_bytes(public_key));
    Address::from_slice(&digest.as_bytes()[digest.as_bytes().len() - ADDRESS_LEN..])
}

/// Deterministic derived address:
/// `last15( digest256( 0xff ‖ u64_be(nonce) ‖ address ‖ salt ) )`.
pub fn create_address(address: &Address, nonce: u64, salt: &Hash) -> Address {
    let mut data = Vec::with_capacity(1 + 8 + ADDRESS_LEN + 32);
    data.push(0xff);
    data.extend_from_slice(&u64_to_bytes(nonce));
    data.extend_from_slice(address.as_bytes());
    data.extend_from_slice(salt.as_bytes());
    let digest = digest256(&data);
    Address::from_slice(&digest.as_bytes()[digest.as_bytes().len() - ADDRESS_LEN..])
}

/// Per-peer symmetric key: HKDF-SHA256 over the ECDH shared secret.
pub fn derive_shared_key(
    keypair: &Keypair,
    peer: &VerifyingKey,
) -> ChainResult<[u8; SHARED_KEY_LEN]> {
    let secret = diffie_hellman(keypair.signing_key().as_nonzero_scalar(), peer.as_affine());
    let hkdf = Hkdf::<Sha256>::new(None, secret.raw_secret_bytes());
    let mut key = [0u8; SHARED_KEY_LEN];
    hkdf.expand(&[], &mut key)
        .map_err(|err| ChainError::Crypto(format!("key derivation failed: {err}")))?;
    Ok(key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = Keypair::generate();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(public_key_bytes(&keypair.public_key())),
        secret_key: hex::encode(keypair.secret_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    Keypair::from_secret_bytes(&secret_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn deterministic_keypair(seed: u8) -> Keypair {
        let mut secret = [seed; 32];
        secret[0] = 1;
        Keypair::from_secret_bytes(&secret).expect("secret")
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keypair = deterministic_keypair(7);
        let digest = digest256(b"payload");
        let signature = keypair.sign_digest(&digest).unwrap();
        assert_eq!(signature.len(), SIGNATURE_LEN);
        verify_digest(&keypair.public_key(), &digest, &signature).unwrap();

        let other = digest256(b"other payload");
        assert!(verify_digest(&keypair.public_key(), &other, &signature).is_err());
    }

    #[test]
    fn shared_key_is_symmetric() {
        let alice = deterministic_keypair(3);
        let bob = deterministic_keypair(9);
        let k1 = derive_shared_key(&alice, &bob.public_key()).unwrap();
        let k2 = derive_shared_key(&bob, &alice.public_key()).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn derived_addresses_are_stable() {
        let keypair = deterministic_keypair(5);
        let addr = keypair.address();
        assert_eq!(addr, address_from_public_key(&keypair.public_key()));

        let salt = digest256(addr.as_bytes());
        let derived = create_address(&addr, 0, &salt);
        assert_eq!(derived, create_address(&addr, 0, &salt));
        assert_ne!(derived, create_address(&addr, 1, &salt));
    }

    #[test]
    fn keypair_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/node.toml");
        let generated = load_or_generate_keypair(&path).unwrap();
        let loaded = load_or_generate_keypair(&path).unwrap();
        assert_eq!(generated.secret_bytes(), loaded.secret_bytes());
    }
}
