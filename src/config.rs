// Engine configuration
//
// Every tunable of the ledger engine lives in `LedgerConfig`. The node binary
// fills it from command line flags (see `main.rs`); tests usually start from
// `LedgerConfig::default()` and lower the difficulty.

use chrono::{DateTime, TimeZone, Utc};

use crate::blockchain::crypto::{Address, ADDRESS_PREFIX};

/// Default reward paid to the miner of each block (genesis included)
pub const DEFAULT_BLOCK_REWARD: f64 = 50.0;

/// Default number of pending transactions the pool holds
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

/// How far ahead of local time a transaction timestamp may be
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 60;

/// Default number of leading zero hex digits a mined block needs
pub const DEFAULT_DIFFICULTY: u8 = 4;

/// How the difficulty of the next candidate block is chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DifficultyPolicy {
    /// Every block uses the same difficulty
    Fixed(u8),

    /// Nudge the tip's difficulty up or down by one so the average spacing of
    /// the last `window` blocks tracks `target_block_secs`
    Retarget {
        target_block_secs: i64,
        window: usize,
        min: u8,
        max: u8,
    },
}

/// Parameters of the fixed first block
#[derive(Debug, Clone, PartialEq)]
pub struct GenesisConfig {
    /// Address credited with the genesis reward
    pub miner: Address,

    pub timestamp: DateTime<Utc>,

    /// Difficulty recorded on genesis; genesis is never mined so 0 keeps it valid
    pub difficulty: u8,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        GenesisConfig {
            // 20 zero bytes in base58.
            miner: Address(format!("{}{}", ADDRESS_PREFIX, "1".repeat(20))),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            difficulty: 0,
        }
    }
}

/// Tunables for chain, pool and miner
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub difficulty: DifficultyPolicy,

    pub block_reward: f64,

    pub pool_capacity: usize,

    pub clock_skew_secs: i64,

    /// Upper bound on pool transactions packed into one block
    pub max_block_transactions: usize,

    /// When false, mining with an empty pool is refused
    pub allow_empty_blocks: bool,

    pub genesis: GenesisConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            difficulty: DifficultyPolicy::Fixed(DEFAULT_DIFFICULTY),
            block_reward: DEFAULT_BLOCK_REWARD,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
            max_block_transactions: 100,
            allow_empty_blocks: true,
            genesis: GenesisConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Default configuration with a fixed difficulty
    pub fn with_difficulty(difficulty: u8) -> Self {
        LedgerConfig {
            difficulty: DifficultyPolicy::Fixed(difficulty),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.block_reward, 50.0);
        assert_eq!(config.pool_capacity, 1000);
        assert_eq!(config.clock_skew_secs, 60);
        assert!(config.allow_empty_blocks);
        assert_eq!(config.genesis.timestamp.timestamp(), 1_704_067_200);
    }

    #[test]
    fn test_genesis_miner_is_a_well_formed_address() {
        let miner = GenesisConfig::default().miner;
        assert!(miner.0.parse::<Address>().is_ok());
    }
}
