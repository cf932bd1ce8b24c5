// =============================================================================
// HELIOCOIN v1.6 - Transaction Parameters
// =============================================================================
//
// Every negotiated transaction persists its state as a bag of typed
// parameters keyed by (transaction id, sub-transaction id, parameter id).
// The same framing doubles as the peer message format: a message is a bundle
// of parameter tuples, and applying a message is a whitelisted sequence of
// parameter writes.
//
// Write rules:
//   - a parameter is written at most once; rewriting the identical value is
//     a no-op, rewriting a different value is a protocol violation unless
//     the parameter is explicitly re-openable (state cursors, confirmations)
//   - peer-attributed writes must pass the whitelist and the per-type wire
//     validation before they are accepted
//
// Wire encoding of a bundle (also the offer "transaction token"):
//   tx_id (16 bytes) || protocol_version (u32 BE)
//   then per entry: param_id (u32 BE) || sub_tx_id (u8) || length (u32 BE)
//   || value bytes. Integers are big-endian, scalars and points are 32-byte
//   canonical compressed encodings.
//
// =============================================================================

use std::rc::Rc;

use serde::{Serialize, Deserialize};

use crate::crypto::{CompressedPoint, PedersenCommitment, Scalar};
use crate::storage::Storage;
use crate::transaction::{KernelId, PreImage, SecretHash, Transaction};

// =============================================================================
// Identifiers
// =============================================================================

pub const TX_ID_SIZE: usize = 16;
pub const WALLET_ID_SIZE: usize = 32;

/// Opaque transaction identifier agreed by both peers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub [u8; TX_ID_SIZE]);

impl TxId {
    pub fn generate() -> Self {
        TxId(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Wallet address identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletId(pub [u8; WALLET_ID_SIZE]);

impl WalletId {
    pub fn generate() -> Self {
        WalletId(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for WalletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// =============================================================================
// Sub-Transaction Ids
// =============================================================================

/// Logical sub-transactions of a swap. The numeric values are part of the
/// protocol and appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubTxId {
    /// Whole-transaction scope
    Default = 0,
    /// Funds the joint output on HELIO
    ChainALock = 1,
    /// Spends the joint output back to the sender after the lock time
    ChainARefund = 2,
    /// Spends the joint output to the receiver, revealing the secret
    ChainARedeem = 3,
    ChainBLock = 4,
    ChainBRefund = 5,
    ChainBRedeem = 6,
}

impl SubTxId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SubTxId::Default),
            1 => Some(SubTxId::ChainALock),
            2 => Some(SubTxId::ChainARefund),
            3 => Some(SubTxId::ChainARedeem),
            4 => Some(SubTxId::ChainBLock),
            5 => Some(SubTxId::ChainBRefund),
            6 => Some(SubTxId::ChainBRedeem),
            _ => None,
        }
    }
}

// =============================================================================
// Transaction Status / Failure
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Why a swap ended without completing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum FailureReason {
    Unknown = 0,
    Cancelled = 1,
    NoInputs = 2,
    TransactionExpired = 3,
    InvalidParameter = 4,
    MissingParameter = 5,
    SignatureInvalid = 6,
    InvalidTransaction = 7,
    FailedToRegister = 8,
    SecondSideFailure = 9,
    /// Not an error: the refund path was taken
    Refunded = 10,
    InvalidState = 11,
}

impl FailureReason {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(FailureReason::Unknown),
            1 => Some(FailureReason::Cancelled),
            2 => Some(FailureReason::NoInputs),
            3 => Some(FailureReason::TransactionExpired),
            4 => Some(FailureReason::InvalidParameter),
            5 => Some(FailureReason::MissingParameter),
            6 => Some(FailureReason::SignatureInvalid),
            7 => Some(FailureReason::InvalidTransaction),
            8 => Some(FailureReason::FailedToRegister),
            9 => Some(FailureReason::SecondSideFailure),
            10 => Some(FailureReason::Refunded),
            11 => Some(FailureReason::InvalidState),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::Unknown => "unknown failure",
            FailureReason::Cancelled => "cancelled by user",
            FailureReason::NoInputs => "not enough inputs",
            FailureReason::TransactionExpired => "transaction expired",
            FailureReason::InvalidParameter => "peer sent an invalid parameter",
            FailureReason::MissingParameter => "mandatory parameter missing",
            FailureReason::SignatureInvalid => "signature verification failed",
            FailureReason::InvalidTransaction => "assembled transaction invalid",
            FailureReason::FailedToRegister => "node rejected the transaction",
            FailureReason::SecondSideFailure => "second chain operation failed",
            FailureReason::Refunded => "refunded",
            FailureReason::InvalidState => "invalid state transition",
        };
        write!(f, "{}", text)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwapError {
    /// Input selection fell short
    NoInputs,
    /// Chain tip passed the lock max height before confirmation
    Expired,
    /// A peer write violated the whitelist or changed a sealed value
    InvalidParameter(String),
    /// A mandatory getter had no value
    MissingParameter(ParamId),
    /// Combined or partial signature verification failed
    SignatureInvalid,
    /// An assembled transaction failed validation
    InvalidTransaction(String),
    /// A sealed local parameter was rewritten, or a transition was illegal
    InvalidState(String),
    /// The second-side adapter reported an error
    SecondSide(String),
    /// The node refused to register a transaction
    FailedToRegister,
    Storage(String),
    Cancelled,
}

impl SwapError {
    pub fn reason(&self) -> FailureReason {
        match self {
            SwapError::NoInputs => FailureReason::NoInputs,
            SwapError::Expired => FailureReason::TransactionExpired,
            SwapError::InvalidParameter(_) => FailureReason::InvalidParameter,
            SwapError::MissingParameter(_) => FailureReason::MissingParameter,
            SwapError::SignatureInvalid => FailureReason::SignatureInvalid,
            SwapError::InvalidTransaction(_) => FailureReason::InvalidTransaction,
            SwapError::InvalidState(_) => FailureReason::InvalidState,
            SwapError::SecondSide(_) => FailureReason::SecondSideFailure,
            SwapError::FailedToRegister => FailureReason::FailedToRegister,
            SwapError::Storage(_) => FailureReason::Unknown,
            SwapError::Cancelled => FailureReason::Cancelled,
        }
    }
}

impl std::fmt::Display for SwapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwapError::NoInputs => write!(f, "not enough inputs"),
            SwapError::Expired => write!(f, "transaction expired"),
            SwapError::InvalidParameter(s) => write!(f, "invalid parameter: {}", s),
            SwapError::MissingParameter(p) => write!(f, "missing parameter: {:?}", p),
            SwapError::SignatureInvalid => write!(f, "signature invalid"),
            SwapError::InvalidTransaction(s) => write!(f, "invalid transaction: {}", s),
            SwapError::InvalidState(s) => write!(f, "invalid state: {}", s),
            SwapError::SecondSide(s) => write!(f, "second side: {}", s),
            SwapError::FailedToRegister => write!(f, "failed to register transaction"),
            SwapError::Storage(s) => write!(f, "storage: {}", s),
            SwapError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for SwapError {}

// =============================================================================
// Parameter Ids
// =============================================================================

/// Stable parameter identifiers. The numeric values are part of the wire
/// protocol and of the storage schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ParamId {
    // offer / whole-transaction
    TransactionType = 0,
    IsInitiator = 1,
    Amount = 2,
    Fee = 3,
    MinHeight = 4,
    MaxHeight = 5,
    LifetimeInBlocks = 6,
    PeerId = 7,
    MyId = 8,
    CreateTime = 9,
    PeerProtoVersion = 10,
    FailureReason = 11,
    Change = 12,

    // builder state (per sub-transaction)
    State = 20,
    Inputs = 21,
    Outputs = 22,
    InputCoins = 23,
    OutputCoins = 24,
    Offset = 25,
    NonceSeed = 26,
    KernelId = 27,
    KernelProofHeight = 28,
    TransactionRegistered = 29,
    AssembledTransaction = 30,

    // peer shares (per sub-transaction)
    PeerPublicExcess = 40,
    PeerPublicNonce = 41,
    PeerSignature = 42,
    PeerOffset = 43,
    PeerPublicSharedBlindingFactor = 44,
    /// Our own signature share, persisted after signing
    PartialSignature = 45,

    // joint output
    SharedBlindingFactor = 50,
    SharedCoinId = 51,

    // hashlock
    PreImage = 60,
    SecretHash = 61,

    // second side
    AtomicSwapCoin = 70,
    AtomicSwapAmount = 71,
    AtomicSwapIsHelioSide = 72,
    AtomicSwapPublicKey = 73,
    AtomicSwapPeerPublicKey = 74,
    AtomicSwapExternalLockTime = 75,
    AtomicSwapExternalTxId = 76,
    SecondSideRetries = 77,
    /// Local record of the second-chain lock transaction we built
    AtomicSwapExternalTx = 78,
}

impl ParamId {
    pub fn from_u32(value: u32) -> Option<Self> {
        use ParamId::*;
        let id = match value {
            0 => TransactionType,
            1 => IsInitiator,
            2 => Amount,
            3 => Fee,
            4 => MinHeight,
            5 => MaxHeight,
            6 => LifetimeInBlocks,
            7 => PeerId,
            8 => MyId,
            9 => CreateTime,
            10 => PeerProtoVersion,
            11 => FailureReason,
            12 => Change,
            20 => State,
            21 => Inputs,
            22 => Outputs,
            23 => InputCoins,
            24 => OutputCoins,
            25 => Offset,
            26 => NonceSeed,
            27 => KernelId,
            28 => KernelProofHeight,
            29 => TransactionRegistered,
            30 => AssembledTransaction,
            40 => PeerPublicExcess,
            41 => PeerPublicNonce,
            42 => PeerSignature,
            43 => PeerOffset,
            44 => PeerPublicSharedBlindingFactor,
            45 => PartialSignature,
            50 => SharedBlindingFactor,
            51 => SharedCoinId,
            60 => PreImage,
            61 => SecretHash,
            70 => AtomicSwapCoin,
            71 => AtomicSwapAmount,
            72 => AtomicSwapIsHelioSide,
            73 => AtomicSwapPublicKey,
            74 => AtomicSwapPeerPublicKey,
            75 => AtomicSwapExternalLockTime,
            76 => AtomicSwapExternalTxId,
            77 => SecondSideRetries,
            78 => AtomicSwapExternalTx,
            _ => return None,
        };
        Some(id)
    }

    /// Parameters a peer message may write at any time
    pub fn is_peer_writable(&self) -> bool {
        matches!(
            self,
            ParamId::PeerPublicExcess
                | ParamId::PeerPublicNonce
                | ParamId::PeerSignature
                | ParamId::PeerOffset
                | ParamId::PeerPublicSharedBlindingFactor
                | ParamId::AtomicSwapPeerPublicKey
                | ParamId::AtomicSwapExternalTxId
                | ParamId::PeerProtoVersion
        )
    }

    /// Additional parameters an offer token may write during the initial
    /// phase (applied exactly once, at import)
    pub fn is_offer_field(&self) -> bool {
        matches!(
            self,
            ParamId::TransactionType
                | ParamId::IsInitiator
                | ParamId::Amount
                | ParamId::Fee
                | ParamId::MinHeight
                | ParamId::LifetimeInBlocks
                | ParamId::PeerId
                | ParamId::MyId
                | ParamId::AtomicSwapCoin
                | ParamId::AtomicSwapAmount
                | ParamId::AtomicSwapIsHelioSide
                | ParamId::AtomicSwapExternalLockTime
                | ParamId::SecretHash
        )
    }

    /// Parameters that may legitimately change after being written
    pub fn is_reopenable(&self) -> bool {
        matches!(
            self,
            ParamId::State
                | ParamId::KernelProofHeight
                | ParamId::TransactionRegistered
                | ParamId::FailureReason
                | ParamId::SecondSideRetries
        )
    }

    /// Expected wire shape of the value, used to validate peer writes
    pub fn wire_kind(&self) -> WireKind {
        use ParamId::*;
        match self {
            TransactionType | PeerProtoVersion | FailureReason | State
            | AtomicSwapCoin | SecondSideRetries => WireKind::U32,
            IsInitiator | TransactionRegistered | AtomicSwapIsHelioSide => WireKind::Bool,
            Amount | Fee | MinHeight | MaxHeight | LifetimeInBlocks | Change
            | CreateTime | KernelProofHeight | SharedCoinId | AtomicSwapAmount
            | AtomicSwapExternalLockTime => WireKind::U64,
            Offset | PeerOffset | PeerSignature | SharedBlindingFactor
            | PartialSignature => WireKind::Scalar,
            PeerPublicExcess | PeerPublicNonce | PeerPublicSharedBlindingFactor => {
                WireKind::Point
            }
            NonceSeed | KernelId | PreImage => WireKind::Hash32,
            SecretHash => WireKind::Hash20,
            PeerId | MyId => WireKind::Id32,
            AtomicSwapPublicKey | AtomicSwapPeerPublicKey => WireKind::PubKey33,
            Inputs | Outputs | InputCoins | OutputCoins | AssembledTransaction
            | AtomicSwapExternalTxId | AtomicSwapExternalTx => WireKind::Bytes,
        }
    }
}

/// Canonical value shapes on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireKind {
    Bool,
    U32,
    U64,
    Scalar,
    Point,
    Hash20,
    Hash32,
    Id32,
    PubKey33,
    Bytes,
}

impl WireKind {
    pub fn validate(&self, bytes: &[u8]) -> bool {
        match self {
            WireKind::Bool => bytes.len() == 1 && bytes[0] <= 1,
            WireKind::U32 => bytes.len() == 4,
            WireKind::U64 => bytes.len() == 8,
            WireKind::Scalar => {
                bytes.len() == 32 && {
                    let mut arr = [0u8; 32];
                    arr.copy_from_slice(bytes);
                    Scalar::from_canonical_bytes(&arr).is_some()
                }
            }
            WireKind::Point => {
                bytes.len() == 32 && {
                    let mut arr = [0u8; 32];
                    arr.copy_from_slice(bytes);
                    CompressedPoint::from_bytes(&arr).is_some()
                }
            }
            WireKind::Hash20 => bytes.len() == 20,
            WireKind::Hash32 => bytes.len() == 32,
            WireKind::Id32 => bytes.len() == 32,
            WireKind::PubKey33 => bytes.len() == 33,
            WireKind::Bytes => true,
        }
    }
}

// =============================================================================
// Canonical Value Codec
// =============================================================================

/// Canonical (wire and storage) encoding of parameter values
pub trait ParamCodec: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Option<Self>;
}

impl ParamCodec for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [0] => Some(false),
            [1] => Some(true),
            _ => None,
        }
    }
}

impl ParamCodec for u32 {
    fn encode(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }
}

impl ParamCodec for u64 {
    fn encode(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }
}

impl ParamCodec for Scalar {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Scalar::from_canonical_bytes(&arr)
    }
}

impl ParamCodec for CompressedPoint {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        CompressedPoint::from_bytes(&arr)
    }
}

impl ParamCodec for PreImage {
    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(PreImage(bytes.try_into().ok()?))
    }
}

impl ParamCodec for SecretHash {
    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(SecretHash(bytes.try_into().ok()?))
    }
}

impl ParamCodec for KernelId {
    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(KernelId(bytes.try_into().ok()?))
    }
}

impl ParamCodec for TxId {
    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(TxId(bytes.try_into().ok()?))
    }
}

impl ParamCodec for WalletId {
    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(WalletId(bytes.try_into().ok()?))
    }
}

impl ParamCodec for [u8; 32] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok()
    }
}

impl ParamCodec for [u8; 33] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok()
    }
}

impl ParamCodec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

impl ParamCodec for Vec<u64> {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * 8);
        for v in self {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 8 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(8)
                .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
                .collect(),
        )
    }
}

impl ParamCodec for FailureReason {
    fn encode(&self) -> Vec<u8> {
        (*self as u32).encode()
    }
    fn decode(bytes: &[u8]) -> Option<Self> {
        FailureReason::from_u32(u32::decode(bytes)?)
    }
}

// structured local-only values go through bincode
macro_rules! bincode_param_codec {
    ($ty:ty) => {
        impl ParamCodec for $ty {
            fn encode(&self) -> Vec<u8> {
                bincode::serialize(self).unwrap_or_default()
            }
            fn decode(bytes: &[u8]) -> Option<Self> {
                bincode::deserialize(bytes).ok()
            }
        }
    };
}

bincode_param_codec!(Vec<crate::transaction::Input>);
bincode_param_codec!(Vec<crate::transaction::Output>);
bincode_param_codec!(Transaction);

// =============================================================================
// Parameter Bundle (peer message / token body)
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleEntry {
    pub param: u32,
    pub sub_tx: u8,
    pub value: Vec<u8>,
}

/// A set of parameter tuples addressed to one transaction. Used both as the
/// offer token body and as the peer-to-peer message format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamBundle {
    pub tx_id: TxId,
    pub version: u32,
    pub entries: Vec<BundleEntry>,
}

impl ParamBundle {
    pub fn new(tx_id: TxId) -> Self {
        ParamBundle {
            tx_id,
            version: crate::PROTOCOL_VERSION,
            entries: Vec::new(),
        }
    }

    pub fn add<T: ParamCodec>(&mut self, param: ParamId, sub_tx: SubTxId, value: &T) -> &mut Self {
        self.entries.push(BundleEntry {
            param: param as u32,
            sub_tx: sub_tx as u8,
            value: value.encode(),
        });
        self
    }

    pub fn get<T: ParamCodec>(&self, param: ParamId, sub_tx: SubTxId) -> Option<T> {
        self.entries
            .iter()
            .find(|e| e.param == param as u32 && e.sub_tx == sub_tx as u8)
            .and_then(|e| T::decode(&e.value))
    }

    pub fn has(&self, param: ParamId, sub_tx: SubTxId) -> bool {
        self.entries
            .iter()
            .any(|e| e.param == param as u32 && e.sub_tx == sub_tx as u8)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.tx_id.0);
        out.extend_from_slice(&self.version.to_be_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.param.to_be_bytes());
            out.push(entry.sub_tx);
            out.extend_from_slice(&(entry.value.len() as u32).to_be_bytes());
            out.extend_from_slice(&entry.value);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TX_ID_SIZE + 4 {
            return None;
        }
        let mut tx_id = [0u8; TX_ID_SIZE];
        tx_id.copy_from_slice(&bytes[..TX_ID_SIZE]);
        let version = u32::from_be_bytes(bytes[TX_ID_SIZE..TX_ID_SIZE + 4].try_into().ok()?);

        let mut entries = Vec::new();
        let mut pos = TX_ID_SIZE + 4;
        while pos < bytes.len() {
            if pos + 9 > bytes.len() {
                return None;
            }
            let param = u32::from_be_bytes(bytes[pos..pos + 4].try_into().ok()?);
            let sub_tx = bytes[pos + 4];
            let len = u32::from_be_bytes(bytes[pos + 5..pos + 9].try_into().ok()?) as usize;
            pos += 9;
            if pos + len > bytes.len() {
                return None;
            }
            entries.push(BundleEntry {
                param,
                sub_tx,
                value: bytes[pos..pos + len].to_vec(),
            });
            pos += len;
        }

        Some(ParamBundle {
            tx_id: TxId(tx_id),
            version,
            entries,
        })
    }
}

// =============================================================================
// Typed Store Adapter
// =============================================================================

/// Typed view over one transaction's parameter bag. Builders hold this
/// handle instead of the transaction object itself, so no reference cycles
/// arise between a transaction and its transient builders.
#[derive(Clone)]
pub struct TxParams {
    storage: Rc<Storage>,
    tx_id: TxId,
}

impl TxParams {
    pub fn new(storage: Rc<Storage>, tx_id: TxId) -> Self {
        TxParams { storage, tx_id }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn storage(&self) -> &Rc<Storage> {
        &self.storage
    }

    /// Key-derivation context separating sub-transactions of this tx
    pub fn context(&self, sub_tx: SubTxId) -> Vec<u8> {
        let mut ctx = self.tx_id.0.to_vec();
        ctx.push(sub_tx as u8);
        ctx
    }

    pub fn get<T: ParamCodec>(&self, param: ParamId, sub_tx: SubTxId) -> Option<T> {
        self.storage
            .get_param(&self.tx_id, sub_tx as u8, param as u32)
            .and_then(|bytes| T::decode(&bytes))
    }

    pub fn get_mandatory<T: ParamCodec>(
        &self,
        param: ParamId,
        sub_tx: SubTxId,
    ) -> Result<T, SwapError> {
        self.get(param, sub_tx)
            .ok_or(SwapError::MissingParameter(param))
    }

    /// Local write. Sealed parameters reject a differing rewrite; writing
    /// the identical value again is a no-op.
    pub fn set<T: ParamCodec>(
        &self,
        param: ParamId,
        sub_tx: SubTxId,
        value: &T,
    ) -> Result<(), SwapError> {
        let encoded = value.encode();
        if let Some(existing) = self.storage.get_param(&self.tx_id, sub_tx as u8, param as u32) {
            if existing == encoded {
                return Ok(());
            }
            if !param.is_reopenable() {
                return Err(SwapError::InvalidState(format!(
                    "parameter {:?}/{:?} already sealed",
                    param, sub_tx
                )));
            }
        }
        self.storage
            .set_param(&self.tx_id, sub_tx as u8, param as u32, &encoded)
            .map_err(SwapError::Storage)
    }

    /// Peer-attributed write: whitelist, wire validation, idempotency.
    pub fn set_peer(
        &self,
        param: ParamId,
        sub_tx: SubTxId,
        value: &[u8],
        initial: bool,
    ) -> Result<(), SwapError> {
        let allowed = param.is_peer_writable() || (initial && param.is_offer_field());
        if !allowed {
            return Err(SwapError::InvalidParameter(format!(
                "peer may not write {:?}",
                param
            )));
        }
        if !param.wire_kind().validate(value) {
            return Err(SwapError::InvalidParameter(format!(
                "malformed value for {:?}",
                param
            )));
        }
        if let Some(existing) = self.storage.get_param(&self.tx_id, sub_tx as u8, param as u32) {
            if existing == value {
                return Ok(()); // duplicate delivery
            }
            return Err(SwapError::InvalidParameter(format!(
                "peer rewrote sealed {:?}/{:?}",
                param, sub_tx
            )));
        }
        self.storage
            .set_param(&self.tx_id, sub_tx as u8, param as u32, value)
            .map_err(SwapError::Storage)
    }

    /// Applies a whole peer bundle; stops at the first violation.
    pub fn apply_peer_bundle(&self, bundle: &ParamBundle, initial: bool) -> Result<(), SwapError> {
        for entry in &bundle.entries {
            let param = ParamId::from_u32(entry.param).ok_or_else(|| {
                SwapError::InvalidParameter(format!("unknown parameter id {}", entry.param))
            })?;
            let sub_tx = SubTxId::from_u8(entry.sub_tx).ok_or_else(|| {
                SwapError::InvalidParameter(format!("unknown sub-tx id {}", entry.sub_tx))
            })?;
            self.set_peer(param, sub_tx, &entry.value, initial)?;
        }
        Ok(())
    }

    /// Compacted sub-state cursor
    pub fn set_state(&self, sub_tx: SubTxId, state: u32) -> Result<(), SwapError> {
        self.set(ParamId::State, sub_tx, &state)
    }

    pub fn state(&self, sub_tx: SubTxId) -> u32 {
        self.get::<u32>(ParamId::State, sub_tx).unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================
