use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature, PublicKey, Wallet};
use super::hashing::{canonical_now, transaction_hash, TransactionFields};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Transaction hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A value transfer signed by its sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transfer {
    /// Sender's address
    pub sender: Address,

    /// Sender's public key, which must hash to `sender`
    pub sender_key: PublicKey,

    /// Recipient's address
    pub recipient: Address,

    /// Amount being transferred
    pub amount: f64,

    /// Timestamp when the transaction was created
    #[schema(value_type = String, example = "2024-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// Canonical hash of (sender, recipient, amount, timestamp)
    pub hash: String,

    /// Sender's signature over `hash`
    pub signature: DigitalSignature,
}

/// A mining reward issued by the system; it has no sender and no signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Reward {
    /// The miner credited by this reward
    pub recipient: Address,

    /// Reward amount
    pub amount: f64,

    #[schema(value_type = String, example = "2024-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    pub hash: String,
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Transaction {
    Transfer(Transfer),
    Reward(Reward),
}

impl Transfer {
    /// Builds and signs a transfer stamped with the current time
    pub fn new(wallet: &Wallet, recipient: Address, amount: f64) -> Self {
        Self::new_at(wallet, recipient, amount, canonical_now())
    }

    /// Builds and signs a transfer with an explicit timestamp
    pub fn new_at(wallet: &Wallet, recipient: Address, amount: f64, timestamp: DateTime<Utc>) -> Self {
        let sender = wallet.address().clone();
        let hash = transaction_hash(&TransactionFields {
            sender: Some(&sender),
            recipient: &recipient,
            amount,
            timestamp,
        });
        let signature = wallet.sign(hash.as_bytes());

        Transfer {
            sender,
            sender_key: wallet.public_key().clone(),
            recipient,
            amount,
            timestamp,
            hash,
            signature,
        }
    }

    /// Checks that the sender key owns the sender address and signed the hash
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        if self.sender_key.address()? != self.sender {
            return Err(TransactionError::Signature(format!(
                "public key does not belong to sender {}",
                self.sender
            )));
        }

        if !verify_signature(self.hash.as_bytes(), &self.signature, &self.sender_key)? {
            return Err(TransactionError::Signature(format!(
                "signature does not match transaction {}",
                self.hash
            )));
        }

        Ok(())
    }
}

impl Reward {
    /// Creates the reward transaction for a freshly mined block
    pub fn new(recipient: Address, amount: f64, timestamp: DateTime<Utc>) -> Self {
        let hash = transaction_hash(&TransactionFields {
            sender: None,
            recipient: &recipient,
            amount,
            timestamp,
        });

        Reward {
            recipient,
            amount,
            timestamp,
            hash,
        }
    }
}

impl Transaction {
    /// Convenience constructor for a signed transfer
    pub fn transfer(wallet: &Wallet, recipient: Address, amount: f64) -> Self {
        Transaction::Transfer(Transfer::new(wallet, recipient, amount))
    }

    pub fn reward(recipient: Address, amount: f64, timestamp: DateTime<Utc>) -> Self {
        Transaction::Reward(Reward::new(recipient, amount, timestamp))
    }

    /// The sender, or `None` for system-issued rewards
    pub fn sender(&self) -> Option<&Address> {
        match self {
            Transaction::Transfer(tx) => Some(&tx.sender),
            Transaction::Reward(_) => None,
        }
    }

    pub fn recipient(&self) -> &Address {
        match self {
            Transaction::Transfer(tx) => &tx.recipient,
            Transaction::Reward(tx) => &tx.recipient,
        }
    }

    pub fn amount(&self) -> f64 {
        match self {
            Transaction::Transfer(tx) => tx.amount,
            Transaction::Reward(tx) => tx.amount,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Transaction::Transfer(tx) => tx.timestamp,
            Transaction::Reward(tx) => tx.timestamp,
        }
    }

    /// The stored transaction hash (its identity)
    pub fn hash(&self) -> &str {
        match self {
            Transaction::Transfer(tx) => &tx.hash,
            Transaction::Reward(tx) => &tx.hash,
        }
    }

    pub fn is_reward(&self) -> bool {
        matches!(self, Transaction::Reward(_))
    }

    /// The hashed fields, borrowed from this transaction
    pub fn fields(&self) -> TransactionFields<'_> {
        TransactionFields {
            sender: self.sender(),
            recipient: self.recipient(),
            amount: self.amount(),
            timestamp: self.timestamp(),
        }
    }

    /// Recomputes the hash from the transaction fields
    pub fn calculate_hash(&self) -> String {
        transaction_hash(&self.fields())
    }

    /// Checks recipient and amount
    pub fn validate_structure(&self) -> Result<(), TransactionError> {
        if self.recipient().is_empty() {
            return Err(TransactionError::InvalidRecipient(
                "recipient must not be empty".to_string(),
            ));
        }

        let amount = self.amount();
        if !amount.is_finite() {
            return Err(TransactionError::InvalidAmount(format!(
                "amount must be a finite number: {}",
                amount
            )));
        }
        if amount <= 0.0 {
            return Err(TransactionError::InvalidAmount(format!(
                "amount must be positive: {}",
                amount
            )));
        }

        Ok(())
    }

    /// Checks the signature; rewards carry none and always fail
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        match self {
            Transaction::Transfer(tx) => tx.verify_signature(),
            Transaction::Reward(tx) => Err(TransactionError::Signature(format!(
                "reward transaction {} carries no signature",
                tx.hash
            ))),
        }
    }

    /// Full check: structure, hash integrity and, for transfers, the signature
    pub fn verify(&self) -> Result<(), TransactionError> {
        self.validate_structure()?;

        let expected = self.calculate_hash();
        if expected != self.hash() {
            return Err(TransactionError::HashMismatch {
                expected,
                actual: self.hash().to_string(),
            });
        }

        match self {
            Transaction::Transfer(tx) => tx.verify_signature(),
            Transaction::Reward(_) => Ok(()),
        }
    }
}
