use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use k256::ecdsa::VerifyingKey;

use crate::crypto::{
    digest256, public_key_bytes, public_key_from_bytes, verify_digest, Keypair, PUBLIC_KEY_LEN,
    SHARED_KEY_LEN,
};
use crate::errors::{ChainError, ChainResult};
use crate::types::{bytes_to_u64, u64_to_bytes, unix_time, Hash};

/// Upper bound on a framed message; anything larger is rejected outright.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const GCM_NONCE_LEN: usize = 12;
const SESSION_NONCE_LEN: usize = 16;
/// Trailer appended to every plaintext: sender key, session nonce, timestamp.
const TRAILER_LEN: usize = PUBLIC_KEY_LEN + SESSION_NONCE_LEN + 8;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping = 0,
    Pong = 1,
    Block = 2,
    Hash = 3,
    Transaction = 4,
    Ask = 5,
    Diff = 6,
    PeerInfo = 7,
}

impl TryFrom<u8> for MessageKind {
    type Error = ChainError;

    fn try_from(value: u8) -> ChainResult<Self> {
        Ok(match value {
            0 => Self::Ping,
            1 => Self::Pong,
            2 => Self::Block,
            3 => Self::Hash,
            4 => Self::Transaction,
            5 => Self::Ask,
            6 => Self::Diff,
            7 => Self::PeerInfo,
            other => return Err(ChainError::Decode(format!("unknown message type {other}"))),
        })
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        MessageKind::try_from(raw).map_err(|err| D::Error::custom(err.to_string()))
    }
}

/// Wire envelope. `sender` travels in clear so the receiver can derive the
/// per-peer key before decrypting; the plaintext embeds a copy that must
/// match after decryption.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender: Vec<u8>,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Signature input: the envelope without its signature.
#[derive(Serialize)]
struct UnsignedView<'a> {
    #[serde(rename = "type")]
    kind: MessageKind,
    sender: &'a [u8],
    data: &'a [u8],
}

/// Decrypted payload of a message.
pub struct DecryptedPayload {
    pub body: Vec<u8>,
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub timestamp: u64,
}

impl Message {
    /// Builds an envelope whose payload is
    /// `body ‖ sender_key ‖ nonce(16) ‖ timestamp(8)`, AES-256-GCM
    /// encrypted under the per-peer key. Unsigned until [`Message::sign`].
    pub fn new(
        kind: MessageKind,
        body: &[u8],
        sender: &VerifyingKey,
        aes_key: &[u8; SHARED_KEY_LEN],
    ) -> ChainResult<Self> {
        let sender_bytes = public_key_bytes(sender);

        let mut plaintext = Vec::with_capacity(body.len() + TRAILER_LEN);
        plaintext.extend_from_slice(body);
        plaintext.extend_from_slice(&sender_bytes);
        let mut nonce = [0u8; SESSION_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        plaintext.extend_from_slice(&nonce);
        plaintext.extend_from_slice(&u64_to_bytes(unix_time()));

        Ok(Self {
            kind,
            sender: sender_bytes,
            data: encrypt_payload(aes_key, &plaintext)?,
            signature: Vec::new(),
        })
    }

    fn signing_digest(&self) -> Hash {
        let view = UnsignedView {
            kind: self.kind,
            sender: &self.sender,
            data: &self.data,
        };
        digest256(&serde_json::to_vec(&view).expect("serializing message"))
    }

    pub fn sign(&mut self, keypair: &Keypair) -> ChainResult<()> {
        self.signature = keypair.sign_digest(&self.signing_digest())?.to_vec();
        Ok(())
    }

    /// Checks the envelope signature against the embedded sender key and
    /// returns that key on success.
    pub fn verify(&self) -> ChainResult<VerifyingKey> {
        let public_key = public_key_from_bytes(&self.sender)?;
        verify_digest(&public_key, &self.signing_digest(), &self.signature)?;
        Ok(public_key)
    }

    pub fn decrypt(&self, aes_key: &[u8; SHARED_KEY_LEN]) -> ChainResult<DecryptedPayload> {
        let plaintext = decrypt_payload(aes_key, &self.data)?;
        if plaintext.len() < TRAILER_LEN {
            return Err(ChainError::Decode("message payload too short".into()));
        }

        let body_len = plaintext.len() - TRAILER_LEN;
        let body = plaintext[..body_len].to_vec();
        let public_key = plaintext[body_len..body_len + PUBLIC_KEY_LEN].to_vec();
        let nonce =
            plaintext[body_len + PUBLIC_KEY_LEN..body_len + PUBLIC_KEY_LEN + SESSION_NONCE_LEN]
                .to_vec();
        let timestamp = bytes_to_u64(&plaintext[plaintext.len() - 8..]);

        Ok(DecryptedPayload {
            body,
            public_key,
            nonce,
            timestamp,
        })
    }

    /// Length-prefixed frame: `u32_be(len) ‖ bytes(len)`.
    pub fn to_frame(&self) -> ChainResult<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ChainError::Transport(format!(
                "message of {} bytes exceeds frame limit",
                payload.len()
            )));
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn encrypt_payload(aes_key: &[u8; SHARED_KEY_LEN], plaintext: &[u8]) -> ChainResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(aes_key));
    let mut nonce = [0u8; GCM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ChainError::Crypto("payload encryption failed".into()))?;
    let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_payload(aes_key: &[u8; SHARED_KEY_LEN], data: &[u8]) -> ChainResult<Vec<u8>> {
    if data.len() < GCM_NONCE_LEN {
        return Err(ChainError::Decode("encrypted payload too short".into()));
    }
    let (nonce, ciphertext) = data.split_at(GCM_NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(aes_key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ChainError::Crypto("payload decryption failed".into()))
}
