use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::crypto::Address;
use super::hashing::{block_hash, meets_difficulty, PayloadFields, TransactionFields};
use super::transaction::Transaction;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Timestamp when the block was created
    #[schema(value_type = String, example = "2024-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// List of transactions included in this block
    pub transactions: Vec<Transaction>,

    /// Reward credited to `miner` for this block
    pub reward: f64,

    /// Address of the miner that produced this block
    pub miner: Address,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Proof of work nonce
    pub nonce: u64,

    /// Number of leading zero hex digits the hash must carry
    pub difficulty: u8,

    /// Hash of the current block
    pub hash: String,
}

impl Block {
    /// Creates a block with nonce 0 and its hash computed
    ///
    /// The result is a mining candidate: it only becomes a valid block once
    /// a nonce satisfying `difficulty` has been found.
    pub fn new(
        index: u64,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
        reward: f64,
        miner: Address,
        previous_hash: String,
        difficulty: u8,
    ) -> Self {
        let mut block = Block {
            index,
            timestamp,
            transactions,
            reward,
            miner,
            previous_hash,
            nonce: 0,
            difficulty,
            hash: String::new(),
        };

        block.hash = block.calculate_hash();
        block
    }

    /// Calculates the hash of the block with its current nonce
    pub fn calculate_hash(&self) -> String {
        self.hash_with_nonce(self.nonce)
    }

    /// Calculates the hash the block would have with `nonce`
    pub fn hash_with_nonce(&self, nonce: u64) -> String {
        let fields: Vec<TransactionFields<'_>> =
            self.transactions.iter().map(Transaction::fields).collect();
        let payload = PayloadFields {
            transactions: &fields,
            reward: self.reward,
            miner: &self.miner,
        };

        block_hash(self.index, self.timestamp, &payload, &self.previous_hash, nonce)
    }

    /// Whether the stored hash satisfies the block's own difficulty
    pub fn meets_difficulty(&self) -> bool {
        meets_difficulty(&self.hash, self.difficulty)
    }

    /// The reward transaction recorded in this block, if any
    pub fn reward_transaction(&self) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.is_reward())
    }

    /// Transactions that came from the pool (everything but the reward)
    pub fn transfers(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| !tx.is_reward())
    }
}
