use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::crypto::{digest256, verify_digest, Keypair};
use crate::errors::ChainResult;
use crate::gas::calc_gas_cost;
use crate::types::{unix_time, Address, Hash};

use k256::ecdsa::VerifyingKey;

/// Transaction format tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u8);

impl Version {
    pub const LEGACY: Version = Version(0);
}

/// The signable transaction payload. Everything except `signature` feeds the
/// content hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub nonce: u64,
    pub signature: Vec<u8>,
    pub gas_tip: u64,
    pub gas_price: u64,
    pub gas: u64,
    pub version: Version,
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

/// Canonical signing view: `TxData` minus the signature, in declaration
/// order, so the hash never depends on the signature bytes.
#[derive(Serialize)]
struct SigningView<'a> {
    from: &'a Address,
    to: &'a Address,
    value: &'a U256,
    data: &'a [u8],
    nonce: u64,
    gas_tip: u64,
    gas_price: u64,
    gas: u64,
    version: Version,
    payload: &'a [u8],
    timestamp: u64,
}

impl TxData {
    fn signing_view(&self) -> SigningView<'_> {
        SigningView {
            from: &self.from,
            to: &self.to,
            value: &self.value,
            data: &self.data,
            nonce: self.nonce,
            gas_tip: self.gas_tip,
            gas_price: self.gas_price,
            gas: self.gas,
            version: self.version,
            payload: &self.payload,
            timestamp: self.timestamp,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.signing_view()).expect("serializing transaction data")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "tx_data")]
    pub data: TxData,
    pub hash: Hash,
    pub seal_hash: Hash,
}

impl Transaction {
    /// Builds a transaction and prices it against the given gas target.
    /// The declared `gas_price` acts as the cost floor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from: Address,
        to: Address,
        value: U256,
        data: Vec<u8>,
        nonce: u64,
        gas_price: u64,
        version: Version,
        payload: Vec<u8>,
        gas_target: u64,
    ) -> ChainResult<Self> {
        let mut tx = Self {
            data: TxData {
                from,
                to,
                value,
                data,
                nonce,
                signature: Vec::new(),
                gas_tip: 0,
                gas_price,
                gas: 0,
                version,
                payload,
                timestamp: unix_time(),
            },
            hash: Hash::default(),
            seal_hash: Hash::default(),
        };
        tx.recalc_gas(gas_target)?;
        tx.refresh_hash();
        Ok(tx)
    }

    pub fn recalc_gas(&mut self, gas_target: u64) -> ChainResult<()> {
        let (gas, gas_tip) = calc_gas_cost(
            gas_target,
            self.data.gas_price,
            self.data.data.len(),
            self.data.payload.len(),
            self.data.value.bits(),
            0,
        )?;
        self.data.gas = gas;
        self.data.gas_tip = gas_tip;
        Ok(())
    }

    /// Content hash over the signing view; never covers `signature`,
    /// `seal_hash`, or the hash itself.
    pub fn compute_hash(&self) -> Hash {
        digest256(&self.data.canonical_bytes())
    }

    pub fn refresh_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    pub fn sign(&mut self, keypair: &Keypair) -> ChainResult<()> {
        let digest = self.compute_hash();
        self.data.signature = keypair.sign_digest(&digest)?.to_vec();
        Ok(())
    }

    pub fn verify(&self, public_key: &VerifyingKey) -> ChainResult<()> {
        verify_digest(public_key, &self.compute_hash(), &self.data.signature)
    }

    /// Serialized size used against the configured transaction size cap.
    pub fn size(&self) -> u64 {
        self.data.canonical_bytes().len() as u64 + self.data.signature.len() as u64
    }

    pub fn seal(&mut self, seal: Hash) {
        self.seal_hash = seal;
    }

    pub fn gas(&self) -> u64 {
        self.data.gas
    }

    pub fn gas_tip(&self) -> u64 {
        self.data.gas_tip
    }

    pub fn gas_price(&self) -> u64 {
        self.data.gas_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::DEFAULT_GAS_TARGET;

    fn keypair() -> Keypair {
        Keypair::from_secret_bytes(&[0x42; 32]).expect("secret")
    }

    fn sample_tx() -> Transaction {
        Transaction::new(
            Address::from_slice(&[1; 15]),
            Address::from_slice(&[2; 15]),
            U256::from(1_000u64),
            vec![1, 2, 3],
            0,
            0,
            Version::LEGACY,
            Vec::new(),
            DEFAULT_GAS_TARGET,
        )
        .unwrap()
    }

    #[test]
    fn hash_ignores_signature_and_seal() {
        let mut tx = sample_tx();
        let unsigned = tx.hash;
        tx.sign(&keypair()).unwrap();
        tx.seal(digest256(b"seal"));
        assert_eq!(tx.compute_hash(), unsigned);
    }

    #[test]
    fn hash_covers_logical_fields() {
        let mut tx = sample_tx();
        let before = tx.compute_hash();
        tx.data.nonce += 1;
        assert_ne!(tx.compute_hash(), before);
    }

    #[test]
    fn gas_fields_respect_invariants() {
        let tx = sample_tx();
        assert!(tx.gas_tip() <= tx.gas());
        assert!(tx.gas() <= DEFAULT_GAS_TARGET);
    }

    #[test]
    fn signature_verifies_and_binds_content() {
        let keypair = keypair();
        let mut tx = sample_tx();
        tx.sign(&keypair).unwrap();
        tx.verify(&keypair.public_key()).unwrap();

        tx.data.nonce += 1;
        assert!(tx.verify(&keypair.public_key()).is_err());
    }
}
