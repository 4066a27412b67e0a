use std::time::{SystemTime, UNIX_EPOCH};

pub mod block;
pub mod primitives;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use primitives::{
    bytes_to_u64, decode_prefixed_hex, encode_cxid, encode_hex, u64_to_bytes, Address, Hash, Key,
    ADDRESS_LEN, CXID_PREFIX, HASH_LEN, HEX_PREFIX, KEY_LEN,
};
pub use transaction::{Transaction, TxData, Version};

/// Seconds since the Unix epoch.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Nanoseconds since the Unix epoch, truncated to 64 bits.
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
