// =============================================================================
// HELIOCOIN v1.6 - Swap Second Side
// =============================================================================
//
// Capability interface the swap state machine invokes for everything that
// happens on the second chain: building and broadcasting the hash/time
// locked transactions, counting confirmations and observing the revealed
// secret. One implementation exists per supported coin; a registry keyed by
// the offer's coin field selects it when the swap is created.
//
// =============================================================================

use std::collections::HashMap;

use serde::{Serialize, Deserialize};

use crate::params::ParamCodec;
use crate::transaction::{PreImage, SecretHash};

// =============================================================================
// Coins
// =============================================================================

/// Supported second-chain coins
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SwapCoin {
    Bitcoin = 0,
    Litecoin = 1,
}

impl SwapCoin {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SwapCoin::Bitcoin),
            1 => Some(SwapCoin::Litecoin),
            _ => None,
        }
    }

    /// Target seconds per block on this chain
    pub fn block_seconds(&self) -> u64 {
        match self {
            SwapCoin::Bitcoin => 600,
            SwapCoin::Litecoin => 150,
        }
    }
}

impl std::fmt::Display for SwapCoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwapCoin::Bitcoin => write!(f, "BTC"),
            SwapCoin::Litecoin => write!(f, "LTC"),
        }
    }
}

impl ParamCodec for SwapCoin {
    fn encode(&self) -> Vec<u8> {
        (*self as u32).encode()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        SwapCoin::from_u32(u32::decode(bytes)?)
    }
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainType {
    Mainnet,
    Testnet,
}

/// Connection and policy settings for the second-chain client
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainBSettings {
    pub user: String,
    pub pass: String,
    pub address: String,
    /// Fee rate in the chain's smallest unit per kilobyte
    pub fee_rate: u64,
    pub min_confirmations: u16,
    pub lock_time_in_blocks: u64,
    pub chain: ChainType,
}

impl ChainBSettings {
    /// Serializes for the wallet's settings file
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("Failed to serialize settings")
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Failed to parse settings: {}", e))
    }
}

impl Default for ChainBSettings {
    fn default() -> Self {
        ChainBSettings {
            user: String::new(),
            pass: String::new(),
            address: String::new(),
            fee_rate: 0,
            min_confirmations: 6,
            lock_time_in_blocks: 2 * 24 * 6,
            chain: ChainType::Mainnet,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecondSideError {
    ConnectionRefused,
    InsufficientFunds,
    RejectedByNode(String),
    ConfirmationTimeout,
    InvalidScript(String),
    Internal(String),
}

impl SecondSideError {
    /// Transient errors are retried with backoff; the rest fail the action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SecondSideError::ConnectionRefused | SecondSideError::ConfirmationTimeout
        )
    }
}

impl std::fmt::Display for SecondSideError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecondSideError::ConnectionRefused => write!(f, "connection refused"),
            SecondSideError::InsufficientFunds => write!(f, "insufficient funds on second chain"),
            SecondSideError::RejectedByNode(s) => write!(f, "rejected by node: {}", s),
            SecondSideError::ConfirmationTimeout => write!(f, "confirmation timeout"),
            SecondSideError::InvalidScript(s) => write!(f, "invalid script: {}", s),
            SecondSideError::Internal(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for SecondSideError {}

// =============================================================================
// Lock Reference
// =============================================================================

/// Everything needed to later spend or watch a second-chain lock output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTxRef {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
    pub redeem_script: Vec<u8>,
}

impl ParamCodec for LockTxRef {
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

// =============================================================================
// Second Side Capability
// =============================================================================

/// Operations the state machine may invoke on the second chain. All calls
/// are synchronous from the caller's view; implementations surface
/// transient transport problems as errors and are retried by the driver.
pub trait SecondSide {
    /// Our signing key on the second chain, compressed
    fn public_key(&self) -> [u8; 33];

    fn tip_height(&mut self) -> Result<u64, SecondSideError>;

    /// Constructs the two-branch hash/time locked transaction
    fn build_lock_tx(
        &mut self,
        amount: u64,
        secret_hash: &SecretHash,
        receiver_pubkey: &[u8; 33],
        sender_pubkey: &[u8; 33],
        lock_time: u64,
    ) -> Result<(Vec<u8>, LockTxRef), SecondSideError>;

    /// Spends the lock back to the sender after the time lock
    fn build_refund_tx(
        &mut self,
        lock: &LockTxRef,
        lock_time: u64,
    ) -> Result<Vec<u8>, SecondSideError>;

    /// Spends the lock to the receiver; broadcasting reveals the pre-image
    fn build_redeem_tx(
        &mut self,
        lock: &LockTxRef,
        pre_image: &PreImage,
    ) -> Result<Vec<u8>, SecondSideError>;

    fn broadcast(&mut self, raw_tx: &[u8]) -> Result<String, SecondSideError>;

    /// Blocks burying the transaction; 0 while unconfirmed
    fn confirmations(&mut self, txid: &str) -> Result<u16, SecondSideError>;

    /// Locates the lock output inside a transaction the counter-peer
    /// broadcast, reconstructing the contract script from the agreed terms
    fn find_lock_output(
        &mut self,
        txid: &str,
        secret_hash: &SecretHash,
        receiver_pubkey: &[u8; 33],
        sender_pubkey: &[u8; 33],
        lock_time: u64,
    ) -> Result<Option<LockTxRef>, SecondSideError>;

    /// Observes the chain for a spend of the lock output and extracts the
    /// pre-image from its witness
    fn watch_for_secret(&mut self, lock: &LockTxRef) -> Result<Option<PreImage>, SecondSideError>;
}

// =============================================================================
// Registry
// =============================================================================

pub type SecondSideFactory = Box<dyn Fn(&ChainBSettings) -> Box<dyn SecondSide>>;

/// Per-coin factory registry; the offer's coin field selects the
/// implementation at swap creation time
pub struct SecondSideRegistry {
    factories: HashMap<SwapCoin, SecondSideFactory>,
}

impl SecondSideRegistry {
    pub fn new() -> Self {
        SecondSideRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, coin: SwapCoin, factory: SecondSideFactory) {
        self.factories.insert(coin, factory);
    }

    pub fn create(&self, coin: SwapCoin, settings: &ChainBSettings) -> Option<Box<dyn SecondSide>> {
        self.factories.get(&coin).map(|f| f(settings))
    }

    pub fn supports(&self, coin: SwapCoin) -> bool {
        self.factories.contains_key(&coin)
    }
}

impl Default for SecondSideRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_coin_codec() {
        let coin = SwapCoin::Litecoin;
        let bytes = coin.encode();
        assert_eq!(SwapCoin::decode(&bytes), Some(SwapCoin::Litecoin));
        assert_eq!(SwapCoin::decode(&[0, 0, 0, 9]), None);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ChainBSettings::default();
        assert_eq!(settings.min_confirmations, 6);
        assert_eq!(settings.lock_time_in_blocks, 288);
        assert_eq!(settings.chain, ChainType::Mainnet);
    }

    #[test]
    fn test_settings_json_roundtrip() {
        let mut settings = ChainBSettings::default();
        settings.user = "swapd".to_string();
        settings.address = "127.0.0.1:8332".to_string();
        settings.fee_rate = 256;
        settings.chain = ChainType::Testnet;

        let loaded = ChainBSettings::from_json(&settings.to_json()).unwrap();
        assert_eq!(loaded.user, "swapd");
        assert_eq!(loaded.fee_rate, 256);
        assert_eq!(loaded.chain, ChainType::Testnet);
        assert!(ChainBSettings::from_json("{broken").is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SecondSideError::ConnectionRefused.is_transient());
        assert!(SecondSideError::ConfirmationTimeout.is_transient());
        assert!(!SecondSideError::InsufficientFunds.is_transient());
        assert!(!SecondSideError::RejectedByNode("dup".into()).is_transient());
    }
}
