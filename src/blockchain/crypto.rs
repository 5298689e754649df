use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::str::FromStr;

/// Prefix carried by every wallet address
pub const ADDRESS_PREFIX: &str = "pl";

/// Number of public key digest bytes kept in an address
const ADDRESS_DIGEST_LEN: usize = 20;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Represents a wallet address (prefixed base58 digest of a public key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct Address(pub String);

impl Address {
    /// Derives the address owned by a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        let encoded = bs58::encode(&digest[..ADDRESS_DIGEST_LEN]).into_string();
        Address(format!("{}{}", ADDRESS_PREFIX, encoded))
    }

    /// Returns the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or_else(|| CryptoError::InvalidAddress(format!("missing '{}' prefix", ADDRESS_PREFIX)))?;

        let bytes = bs58::decode(body)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        if bytes.len() != ADDRESS_DIGEST_LEN {
            return Err(CryptoError::InvalidAddress(format!(
                "expected {} digest bytes, got {}",
                ADDRESS_DIGEST_LEN,
                bytes.len()
            )));
        }

        Ok(Address(s.to_string()))
    }
}

/// A public key in base58 format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PublicKey(pub String);

impl PublicKey {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        PublicKey(bs58::encode(key.as_bytes()).into_string())
    }

    /// Converts back to an Ed25519 verifying key
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        let bytes = decode_fixed::<32>(&self.0).map_err(CryptoError::InvalidPublicKey)?;

        VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// The address this key controls
    pub fn address(&self) -> Result<Address, CryptoError> {
        Ok(Address::from_public_key(&self.to_verifying_key()?))
    }
}

/// An Ed25519 signature in base58 format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DigitalSignature(pub String);

impl From<&Signature> for DigitalSignature {
    fn from(signature: &Signature) -> Self {
        DigitalSignature(bs58::encode(signature.to_bytes()).into_string())
    }
}

impl TryFrom<&DigitalSignature> for Signature {
    type Error = CryptoError;

    fn try_from(signature: &DigitalSignature) -> Result<Self, Self::Error> {
        let bytes = decode_fixed::<64>(&signature.0).map_err(CryptoError::InvalidSignature)?;

        Ok(Signature::from_bytes(&bytes))
    }
}

/// Decodes base58 into exactly `N` bytes
fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N], String> {
    let bytes = bs58::decode(encoded).into_vec().map_err(|e| e.to_string())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| format!("expected {} bytes, got {}", N, len))
}

/// Represents a wallet with a keypair
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    public_key: PublicKey,
    address: Address,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes_array)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();

        Wallet {
            public_key: PublicKey::from_verifying_key(&verifying_key),
            address: Address::from_public_key(&verifying_key),
            signing_key,
        }
    }

    /// Gets the wallet's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Gets the wallet's public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Signs a message with the wallet's private key
    pub fn sign(&self, message: &[u8]) -> DigitalSignature {
        DigitalSignature::from(&self.signing_key.sign(message))
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies a signature against a message and public key
///
/// Malformed keys or signatures are errors; a well-formed signature that
/// does not match yields `Ok(false)`.
pub fn verify_signature(
    message: &[u8],
    signature: &DigitalSignature,
    public_key: &PublicKey,
) -> Result<bool, CryptoError> {
    let signature = Signature::try_from(signature)?;
    let key = public_key.to_verifying_key()?;

    Ok(key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::new();
        assert!(wallet.address().0.starts_with(ADDRESS_PREFIX));
        assert!(!wallet.address().is_empty());
    }

    #[test]
    fn test_signing_and_verification() {
        let wallet = Wallet::new();
        let message = b"Hello, world!";

        let signature = wallet.sign(message);
        assert!(verify_signature(message, &signature, wallet.public_key()).unwrap());

        // Verify with wrong message
        let wrong_message = b"Wrong message";
        assert!(!verify_signature(wrong_message, &signature, wallet.public_key()).unwrap());

        // Verify with someone else's key
        let other = Wallet::new();
        assert!(!verify_signature(message, &signature, other.public_key()).unwrap());
    }

    #[test]
    fn test_address_is_derived_from_public_key() {
        let wallet = Wallet::new();
        let derived = wallet.public_key().address().unwrap();
        assert_eq!(&derived, wallet.address());

        let parsed: Address = wallet.address().0.parse().unwrap();
        assert_eq!(&parsed, wallet.address());
    }

    #[test]
    fn test_wallet_round_trips_secret_key() {
        let wallet = Wallet::new();
        let restored = Wallet::from_secret_key(&wallet.export_secret_key()).unwrap();
        assert_eq!(restored.address(), wallet.address());

        assert!(Wallet::from_secret_key(&[1u8; 5]).is_err());
    }

    #[test]
    fn test_address_parsing_rejects_garbage() {
        assert!("nope".parse::<Address>().is_err());
        assert!("pl0OIl".parse::<Address>().is_err());
    }
}
