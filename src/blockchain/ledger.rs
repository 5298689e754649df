// Balance and history queries, answered by replaying the chain.
//
// Transfers debit their sender and credit their recipient. Each block credits
// its `reward` to its `miner` exactly once, from the block fields; the in-block
// reward transaction records that same credit and is not counted again.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::block::Block;
use super::chain::Chain;
use super::crypto::Address;
use super::transaction::Transaction;

/// Float noise tolerated before a balance counts as negative
const BALANCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// A replayed balance went negative: a block was appended whose transfers
    /// were never checked against the sender's funds
    #[error("Ledger inconsistency: balance of {address} is {balance} after block {block_index}")]
    Inconsistency {
        address: Address,
        block_index: u64,
        balance: f64,
    },
}

/// How a history entry touches the queried address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
    Reward,
}

/// One ledger movement affecting an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HistoryEntry {
    pub direction: Direction,

    /// The other side of a transfer; `None` for rewards
    pub counterparty: Option<Address>,

    pub amount: f64,

    #[schema(value_type = String, example = "2024-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// The transaction hash, or `None` for the genesis reward which has no transaction
    pub transaction_hash: Option<String>,

    pub block_index: u64,

    pub block_hash: String,
}

/// Replays the chain and returns the balance of `address`
pub fn balance_of(address: &Address, chain: &Chain) -> Result<f64, LedgerError> {
    let mut balance = 0.0;

    for block in chain.blocks() {
        for tx in block.transfers() {
            if tx.sender() == Some(address) {
                balance -= tx.amount();
            }
            if tx.recipient() == address {
                balance += tx.amount();
            }
        }
        if &block.miner == address {
            balance += block.reward;
        }

        check_non_negative(address, block, balance)?;
    }

    Ok(balance.max(0.0))
}

/// Replays the chain once and returns every address balance
pub fn balances(chain: &Chain) -> Result<BTreeMap<Address, f64>, LedgerError> {
    let mut sheet: BTreeMap<Address, f64> = BTreeMap::new();

    for block in chain.blocks() {
        for tx in block.transfers() {
            if let Some(sender) = tx.sender() {
                *sheet.entry(sender.clone()).or_default() -= tx.amount();
            }
            *sheet.entry(tx.recipient().clone()).or_default() += tx.amount();
        }
        *sheet.entry(block.miner.clone()).or_default() += block.reward;

        for (address, balance) in &sheet {
            check_non_negative(address, block, *balance)?;
        }
    }

    Ok(sheet.into_iter().map(|(address, balance)| (address, balance.max(0.0))).collect())
}

/// Every movement touching `address`, newest first
pub fn history_of(address: &Address, chain: &Chain) -> Vec<HistoryEntry> {
    let mut entries = Vec::new();

    for block in chain.blocks() {
        for tx in block.transfers() {
            if tx.sender() == Some(address) {
                entries.push(entry(Direction::Sent, Some(tx.recipient().clone()), tx, block));
            }
            if tx.recipient() == address {
                entries.push(entry(Direction::Received, tx.sender().cloned(), tx, block));
            }
        }

        if &block.miner == address {
            entries.push(HistoryEntry {
                direction: Direction::Reward,
                counterparty: None,
                amount: block.reward,
                timestamp: block.timestamp,
                transaction_hash: block.reward_transaction().map(|tx| tx.hash().to_string()),
                block_index: block.index,
                block_hash: block.hash.clone(),
            });
        }
    }

    entries.reverse();
    entries
}

fn entry(direction: Direction, counterparty: Option<Address>, tx: &Transaction, block: &Block) -> HistoryEntry {
    HistoryEntry {
        direction,
        counterparty,
        amount: tx.amount(),
        timestamp: tx.timestamp(),
        transaction_hash: Some(tx.hash().to_string()),
        block_index: block.index,
        block_hash: block.hash.clone(),
    }
}

fn check_non_negative(address: &Address, block: &Block, balance: f64) -> Result<(), LedgerError> {
    if balance < -BALANCE_EPSILON {
        error!(
            "Balance of {} went negative ({}) at block {}",
            address, balance, block.index
        );
        return Err(LedgerError::Inconsistency {
            address: address.clone(),
            block_index: block.index,
            balance,
        });
    }
    Ok(())
}
