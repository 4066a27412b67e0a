use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

pub const ADDRESS_LEN: usize = 15;
pub const HASH_LEN: usize = 32;
pub const KEY_LEN: usize = 16;

pub const HEX_PREFIX: &str = "0x";
pub const CXID_PREFIX: &str = "1cx";

/// 15-byte account / validator identifier.
///
/// Construction from a byte slice keeps the last 15 bytes of longer input
/// and right-aligns shorter input, so numeric material stays big-endian.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address([u8; ADDRESS_LEN]);

/// 32-byte content digest produced by [`crate::crypto::digest256`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hash([u8; HASH_LEN]);

/// 16-byte opaque identifier.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Key([u8; KEY_LEN]);

macro_rules! fixed_bytes_impl {
    ($name:ident, $len:expr) => {
        impl $name {
            pub fn from_slice(bytes: &[u8]) -> Self {
                let mut out = [0u8; $len];
                if bytes.len() > $len {
                    out.copy_from_slice(&bytes[bytes.len() - $len..]);
                } else {
                    out[$len - bytes.len()..].copy_from_slice(bytes);
                }
                Self(out)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn to_hex(&self) -> String {
                format!("{HEX_PREFIX}{}", hex::encode(self.0))
            }

            pub fn to_cxid(&self) -> String {
                format!("{CXID_PREFIX}{}", hex::encode(self.0))
            }

            /// Parses either textual form, with or without its prefix.
            pub fn parse(text: &str) -> ChainResult<Self> {
                Ok(Self::from_slice(&decode_prefixed_hex(text)?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_cxid())
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }
    };
}

fixed_bytes_impl!(Address, ADDRESS_LEN);
fixed_bytes_impl!(Hash, HASH_LEN);
fixed_bytes_impl!(Key, KEY_LEN);

impl Hash {
    /// A hash is usable once any byte is set; the zero digest marks absence.
    pub fn is_valid(&self) -> bool {
        !self.is_zero()
    }
}

impl From<Hash> for Address {
    fn from(hash: Hash) -> Self {
        Address::from_slice(hash.as_bytes())
    }
}

pub fn encode_hex(data: &[u8]) -> String {
    format!("{HEX_PREFIX}{}", hex::encode(data))
}

pub fn encode_cxid(data: &[u8]) -> String {
    format!("{CXID_PREFIX}{}", hex::encode(data))
}

/// Strips an optional `0x` / `1cx` prefix and decodes the remaining hex.
///
/// Odd-length input is a hard error; invalid nibbles decode as zero, which
/// keeps identifier parsing total for well-formed lengths.
pub fn decode_prefixed_hex(text: &str) -> ChainResult<Vec<u8>> {
    let stripped = text
        .strip_prefix(CXID_PREFIX)
        .or_else(|| text.strip_prefix(HEX_PREFIX))
        .unwrap_or(text);
    if stripped.len() % 2 != 0 {
        return Err(ChainError::Decode(format!(
            "odd-length hex string ({} chars)",
            stripped.len()
        )));
    }
    let nibble = |c: u8| -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => 0,
        }
    };
    Ok(stripped
        .as_bytes()
        .chunks(2)
        .map(|pair| (nibble(pair[0]) << 4) | nibble(pair[1]))
        .collect())
}

pub fn u64_to_bytes(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Big-endian decode; anything but exactly eight bytes yields zero.
pub fn bytes_to_u64(bytes: &[u8]) -> u64 {
    match <[u8; 8]>::try_from(bytes) {
        Ok(raw) => u64::from_be_bytes(raw),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_right_aligns_short_input() {
        let addr = Address::from_slice(&[0xab, 0xcd]);
        let mut expected = [0u8; ADDRESS_LEN];
        expected[ADDRESS_LEN - 2] = 0xab;
        expected[ADDRESS_LEN - 1] = 0xcd;
        assert_eq!(addr.as_bytes(), &expected);
    }

    #[test]
    fn address_truncates_to_last_bytes() {
        let long: Vec<u8> = (0u8..20).collect();
        let addr = Address::from_slice(&long);
        assert_eq!(addr.as_bytes(), &long[5..]);
    }

    #[test]
    fn textual_round_trips() {
        let addr = Address::from_slice(&[7u8; ADDRESS_LEN]);
        assert_eq!(Address::parse(&addr.to_cxid()).unwrap(), addr);
        assert_eq!(Address::parse(&addr.to_hex()).unwrap(), addr);

        let hash = Hash::from_slice(&[0x5a; HASH_LEN]);
        assert_eq!(Hash::parse(&hash.to_cxid()).unwrap(), hash);

        let key = Key::from_slice(&[0x11; KEY_LEN]);
        assert_eq!(Key::parse(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn cxid_prefix_shape() {
        let hash = Hash::from_slice(&[1u8; HASH_LEN]);
        let text = hash.to_cxid();
        assert!(text.starts_with("1cx"));
        assert_eq!(text.len(), 3 + HASH_LEN * 2);
    }

    #[test]
    fn odd_length_hex_is_rejected() {
        assert!(matches!(
            decode_prefixed_hex("0xabc"),
            Err(ChainError::Decode(_))
        ));
    }

    #[test]
    fn invalid_nibbles_decode_as_zero() {
        let decoded = decode_prefixed_hex("zz1f").unwrap();
        assert_eq!(decoded, vec![0x00, 0x1f]);
    }

    #[test]
    fn u64_big_endian_round_trip() {
        let packed = u64_to_bytes(0x0102_0304_0506_0708);
        assert_eq!(packed, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes_to_u64(&packed), 0x0102_0304_0506_0708);
        assert_eq!(bytes_to_u64(&packed[..4]), 0);
    }

    #[test]
    fn zero_hash_is_invalid() {
        assert!(!Hash::default().is_valid());
        assert!(Hash::from_slice(&[0, 0, 1]).is_valid());
    }
}
