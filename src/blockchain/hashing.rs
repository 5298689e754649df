// Canonical encoding and digests for blocks and transactions.
//
// The byte layout is fixed so that any implementation can reproduce a hash:
// - strings are a u32 big-endian byte length followed by UTF-8 bytes
// - an optional sender is a 0 byte (reward) or a 1 byte followed by the string
// - amounts are the IEEE-754 bits of an f64, big-endian
// - timestamps are i64 milliseconds since the Unix epoch, big-endian
// - index, nonce and counts are u64 big-endian
// Signatures, stored hashes and the block difficulty never enter a digest.

use chrono::{DateTime, SubsecRound, Utc};
use sha2::{Digest, Sha256};

use super::crypto::Address;

const TRANSACTION_TAG: &[u8] = b"tx\x01";
const BLOCK_TAG: &[u8] = b"blk\x01";

/// Previous hash recorded by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Largest meaningful difficulty: every hex digit of a SHA-256 digest is zero
pub const MAX_DIFFICULTY: u8 = 64;

/// Current time at the precision the canonical encoding keeps
pub fn canonical_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// The fields of a transaction that are covered by its hash
#[derive(Debug, Clone, Copy)]
pub struct TransactionFields<'a> {
    pub sender: Option<&'a Address>,
    pub recipient: &'a Address,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

/// The block payload covered by the block hash
#[derive(Debug, Clone, Copy)]
pub struct PayloadFields<'a> {
    pub transactions: &'a [TransactionFields<'a>],
    pub reward: f64,
    pub miner: &'a Address,
}

/// Byte sink implementing the canonical field encodings
#[derive(Debug, Default)]
struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    fn tag(&mut self, tag: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(tag);
        self
    }

    fn str(&mut self, value: &str) -> &mut Self {
        // A single field never approaches 4 GiB.
        self.buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    fn optional_str(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(value) => {
                self.buf.push(1);
                self.str(value)
            }
            None => {
                self.buf.push(0);
                self
            }
        }
    }

    fn amount(&mut self, value: f64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_bits().to_be_bytes());
        self
    }

    fn timestamp(&mut self, value: DateTime<Utc>) -> &mut Self {
        self.buf.extend_from_slice(&value.timestamp_millis().to_be_bytes());
        self
    }

    fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn transaction(&mut self, fields: &TransactionFields<'_>) -> &mut Self {
        self.optional_str(fields.sender.map(Address::as_str))
            .str(fields.recipient.as_str())
            .amount(fields.amount)
            .timestamp(fields.timestamp)
    }

    fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.buf))
    }
}

/// SHA-256 over the canonical transaction encoding, as lowercase hex
pub fn transaction_hash(fields: &TransactionFields<'_>) -> String {
    let mut encoder = CanonicalEncoder::default();
    encoder.tag(TRANSACTION_TAG).transaction(fields);
    encoder.digest()
}

/// SHA-256 over the canonical block encoding, as lowercase hex
pub fn block_hash(
    index: u64,
    timestamp: DateTime<Utc>,
    payload: &PayloadFields<'_>,
    previous_hash: &str,
    nonce: u64,
) -> String {
    let mut encoder = CanonicalEncoder::default();
    encoder
        .tag(BLOCK_TAG)
        .u64(index)
        .timestamp(timestamp)
        .u64(payload.transactions.len() as u64);

    for tx in payload.transactions {
        encoder.transaction(tx);
    }

    encoder
        .amount(payload.reward)
        .str(payload.miner.as_str())
        .str(previous_hash)
        .u64(nonce);

    encoder.digest()
}

/// Checks that a hex hash starts with `difficulty` zero digits
pub fn meets_difficulty(hash: &str, difficulty: u8) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
