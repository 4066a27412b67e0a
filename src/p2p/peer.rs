use std::net::SocketAddr;

use k256::ecdsa::VerifyingKey;

use crate::crypto::{digest256, public_key_bytes, SHARED_KEY_LEN};
use crate::types::Hash;

/// A known remote node. The identifier is the digest of its public key;
/// `shared_key` is this node's ECDH-derived AES key for it.
#[derive(Clone)]
pub struct Peer {
    id: Hash,
    addr: SocketAddr,
    version: u32,
    public_key: VerifyingKey,
    shared_key: [u8; SHARED_KEY_LEN],
    last_seen: u64,
}

impl Peer {
    pub fn new(
        addr: SocketAddr,
        version: u32,
        public_key: VerifyingKey,
        shared_key: [u8; SHARED_KEY_LEN],
        last_seen: u64,
    ) -> Self {
        let id = digest256(&public_key_bytes(&public_key));
        Self {
            id,
            addr,
            version,
            public_key,
            shared_key,
            last_seen,
        }
    }

    pub fn id(&self) -> Hash {
        self.id
    }

    pub fn cxid(&self) -> String {
        self.id.to_cxid()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    pub fn shared_key(&self) -> &[u8; SHARED_KEY_LEN] {
        &self.shared_key
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn set_last_seen(&mut self, last_seen: u64) {
        self.last_seen = last_seen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_shared_key, Keypair};

    #[test]
    fn peer_id_is_the_public_key_digest() {
        let keypair = Keypair::from_secret_bytes(&[0x44; 32]).unwrap();
        let other = Keypair::from_secret_bytes(&[0x55; 32]).unwrap();
        let shared = derive_shared_key(&other, &keypair.public_key()).unwrap();
        let peer = Peer::new(
            "127.0.0.1:5865".parse().unwrap(),
            1,
            keypair.public_key(),
            shared,
            0,
        );
        assert_eq!(
            peer.id(),
            digest256(&public_key_bytes(&keypair.public_key()))
        );
        assert!(peer.cxid().starts_with("1cx"));
    }
}
