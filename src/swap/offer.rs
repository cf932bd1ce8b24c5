// =============================================================================
// HELIOCOIN v1.6 - Swap Offers
// =============================================================================
//
// The offer travels between peers as an opaque "transaction token": the
// parameter bundle wire format carrying the swap terms plus the initiator's
// public lock shares, base64-armored for display and transport over any
// secure channel.
//
// Direction of the boolean fields: the token is written from the
// *receiver's* perspective wherever possible (peer shares arrive under the
// Peer* ids). Only IsInitiator and the side flag describe the sender and
// are flipped at import.
//
// =============================================================================

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::crypto::CompressedPoint;
use crate::params::{
    ParamBundle, ParamCodec, ParamId, SubTxId, SwapError, TxId, TxParams, WalletId,
};
use crate::storage::{AddressBookEntry, TxType};
use crate::swap::second_side::SwapCoin;
use crate::transaction::SecretHash;

/// Offer expiry selector exposed to the UI: 0 = 12 hours, 1 = 6 hours
pub const OFFER_EXPIRES_12H: u32 = 0;
pub const OFFER_EXPIRES_6H: u32 = 1;

pub fn offer_expiry_hours(selector: u32) -> u64 {
    match selector {
        OFFER_EXPIRES_6H => 6,
        _ => 12,
    }
}

/// Maximum UI comment length
pub const MAX_COMMENT_LENGTH: usize = 1024;

// =============================================================================
// Swap Offer
// =============================================================================

/// The agreed swap terms, as seen by the local peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapOffer {
    pub tx_id: TxId,
    /// HELIO amount moved by the lock transaction
    pub amount: u64,
    /// HELIO kernel fee of the lock transaction
    pub fee: u64,
    pub min_height: u64,
    pub lifetime_blocks: u64,
    pub swap_coin: SwapCoin,
    /// Second-chain amount
    pub swap_amount: u64,
    /// True when the local peer sends HELIO and receives the second coin
    pub is_helio_side: bool,
    pub is_initiator: bool,
    pub my_id: WalletId,
    pub peer_id: WalletId,
    pub secret_hash: SecretHash,
    /// Second-chain lock duration in second-chain blocks
    pub chain_b_lock_time: u64,
}

impl SwapOffer {
    /// Seeds a freshly created transaction's parameter bag (initiator side)
    pub fn write_to(&self, tx: &TxParams) -> Result<(), SwapError> {
        tx.set(ParamId::TransactionType, SubTxId::Default, &(TxType::AtomicSwap as u32))?;
        tx.set(ParamId::IsInitiator, SubTxId::Default, &self.is_initiator)?;
        tx.set(ParamId::Amount, SubTxId::Default, &self.amount)?;
        tx.set(ParamId::Fee, SubTxId::Default, &self.fee)?;
        tx.set(ParamId::MinHeight, SubTxId::Default, &self.min_height)?;
        tx.set(ParamId::LifetimeInBlocks, SubTxId::Default, &self.lifetime_blocks)?;
        tx.set(ParamId::MyId, SubTxId::Default, &self.my_id)?;
        tx.set(ParamId::PeerId, SubTxId::Default, &self.peer_id)?;
        tx.set(ParamId::AtomicSwapCoin, SubTxId::Default, &self.swap_coin)?;
        tx.set(ParamId::AtomicSwapAmount, SubTxId::Default, &self.swap_amount)?;
        tx.set(ParamId::AtomicSwapIsHelioSide, SubTxId::Default, &self.is_helio_side)?;
        tx.set(ParamId::SecretHash, SubTxId::Default, &self.secret_hash)?;
        tx.set(
            ParamId::AtomicSwapExternalLockTime,
            SubTxId::Default,
            &self.chain_b_lock_time,
        )?;
        // the lock must confirm inside the offered lifetime
        tx.set(
            ParamId::MaxHeight,
            SubTxId::ChainALock,
            &(self.min_height + self.lifetime_blocks),
        )?;
        Ok(())
    }

    /// Reads the local peer's view of the terms back out of the store
    pub fn read_from(tx: &TxParams) -> Result<Self, SwapError> {
        Ok(SwapOffer {
            tx_id: tx.tx_id(),
            amount: tx.get_mandatory(ParamId::Amount, SubTxId::Default)?,
            fee: tx.get_mandatory(ParamId::Fee, SubTxId::Default)?,
            min_height: tx.get_mandatory(ParamId::MinHeight, SubTxId::Default)?,
            lifetime_blocks: tx.get_mandatory(ParamId::LifetimeInBlocks, SubTxId::Default)?,
            swap_coin: tx.get_mandatory(ParamId::AtomicSwapCoin, SubTxId::Default)?,
            swap_amount: tx.get_mandatory(ParamId::AtomicSwapAmount, SubTxId::Default)?,
            is_helio_side: tx.get_mandatory(ParamId::AtomicSwapIsHelioSide, SubTxId::Default)?,
            is_initiator: tx.get_mandatory(ParamId::IsInitiator, SubTxId::Default)?,
            my_id: tx.get_mandatory(ParamId::MyId, SubTxId::Default)?,
            peer_id: tx.get_mandatory(ParamId::PeerId, SubTxId::Default)?,
            secret_hash: tx.get_mandatory(ParamId::SecretHash, SubTxId::Default)?,
            chain_b_lock_time: tx
                .get_mandatory(ParamId::AtomicSwapExternalLockTime, SubTxId::Default)?,
        })
    }
}

// =============================================================================
// Token Construction
// =============================================================================

/// Builds the offer token from the initiator's stored terms and its public
/// lock shares. Identity fields are already receiver-oriented: the peer id
/// the receiver needs is the initiator's own id.
pub fn build_offer_token(
    tx: &TxParams,
    lock_public_excess: &CompressedPoint,
    lock_public_nonce: &CompressedPoint,
    lock_public_shared: &CompressedPoint,
    chain_b_public_key: &[u8; 33],
) -> Result<ParamBundle, SwapError> {
    let offer = SwapOffer::read_from(tx)?;

    let mut bundle = ParamBundle::new(tx.tx_id());
    bundle
        .add(ParamId::TransactionType, SubTxId::Default, &(TxType::AtomicSwap as u32))
        .add(ParamId::IsInitiator, SubTxId::Default, &true)
        .add(ParamId::PeerId, SubTxId::Default, &offer.my_id)
        .add(ParamId::MyId, SubTxId::Default, &offer.peer_id)
        .add(ParamId::Amount, SubTxId::Default, &offer.amount)
        .add(ParamId::Fee, SubTxId::Default, &offer.fee)
        .add(ParamId::MinHeight, SubTxId::Default, &offer.min_height)
        .add(ParamId::LifetimeInBlocks, SubTxId::Default, &offer.lifetime_blocks)
        .add(ParamId::AtomicSwapIsHelioSide, SubTxId::Default, &offer.is_helio_side)
        .add(ParamId::AtomicSwapCoin, SubTxId::Default, &offer.swap_coin)
        .add(ParamId::AtomicSwapAmount, SubTxId::Default, &offer.swap_amount)
        .add(
            ParamId::AtomicSwapExternalLockTime,
            SubTxId::Default,
            &offer.chain_b_lock_time,
        )
        .add(ParamId::SecretHash, SubTxId::Default, &offer.secret_hash)
        .add(ParamId::AtomicSwapPublicKey, SubTxId::Default, chain_b_public_key)
        .add(ParamId::PeerPublicExcess, SubTxId::ChainALock, lock_public_excess)
        .add(ParamId::PeerPublicNonce, SubTxId::ChainALock, lock_public_nonce)
        .add(
            ParamId::PeerPublicSharedBlindingFactor,
            SubTxId::ChainALock,
            lock_public_shared,
        );
    Ok(bundle)
}

/// Base64 armor for display and transport
pub fn encode_token_string(bundle: &ParamBundle) -> String {
    BASE64.encode(bundle.encode())
}

pub fn decode_token_string(token: &str) -> Result<ParamBundle, SwapError> {
    let bytes = BASE64
        .decode(token.trim())
        .map_err(|e| SwapError::InvalidParameter(format!("token encoding: {}", e)))?;
    ParamBundle::decode(&bytes)
        .ok_or_else(|| SwapError::InvalidParameter("malformed token".to_string()))
}

// =============================================================================
// Token Import
// =============================================================================

const REQUIRED_DEFAULT_FIELDS: &[ParamId] = &[
    ParamId::TransactionType,
    ParamId::IsInitiator,
    ParamId::PeerId,
    ParamId::MyId,
    ParamId::Amount,
    ParamId::Fee,
    ParamId::MinHeight,
    ParamId::LifetimeInBlocks,
    ParamId::AtomicSwapIsHelioSide,
    ParamId::AtomicSwapCoin,
    ParamId::AtomicSwapAmount,
    ParamId::AtomicSwapExternalLockTime,
    ParamId::SecretHash,
    ParamId::AtomicSwapPublicKey,
];

const REQUIRED_LOCK_FIELDS: &[ParamId] = &[
    ParamId::PeerPublicExcess,
    ParamId::PeerPublicNonce,
    ParamId::PeerPublicSharedBlindingFactor,
];

/// Imports an offer token into the responder's store: validates the
/// required entries, flips the direction fields and applies the rest
/// through the peer-write whitelist.
pub fn import_offer_token(tx: &TxParams, bundle: &ParamBundle) -> Result<SwapOffer, SwapError> {
    for param in REQUIRED_DEFAULT_FIELDS {
        if !bundle.has(*param, SubTxId::Default) {
            return Err(SwapError::InvalidParameter(format!(
                "offer misses {:?}",
                param
            )));
        }
    }
    for param in REQUIRED_LOCK_FIELDS {
        if !bundle.has(*param, SubTxId::ChainALock) {
            return Err(SwapError::InvalidParameter(format!(
                "offer misses {:?}",
                param
            )));
        }
    }
    if bundle.get::<bool>(ParamId::IsInitiator, SubTxId::Default) != Some(true) {
        return Err(SwapError::InvalidParameter(
            "offer must come from the initiator".to_string(),
        ));
    }

    for entry in &bundle.entries {
        let param = ParamId::from_u32(entry.param).ok_or_else(|| {
            SwapError::InvalidParameter(format!("unknown parameter id {}", entry.param))
        })?;
        let sub_tx = crate::params::SubTxId::from_u8(entry.sub_tx).ok_or_else(|| {
            SwapError::InvalidParameter(format!("unknown sub-tx id {}", entry.sub_tx))
        })?;

        match param {
            // direction fields describe the sender; flip for the local view
            ParamId::IsInitiator => {
                tx.set(ParamId::IsInitiator, SubTxId::Default, &false)?;
            }
            ParamId::AtomicSwapIsHelioSide => {
                let sender_side = bool::decode(&entry.value).ok_or_else(|| {
                    SwapError::InvalidParameter("malformed side flag".to_string())
                })?;
                tx.set(ParamId::AtomicSwapIsHelioSide, SubTxId::Default, &!sender_side)?;
            }
            // the sender's second-chain key is our peer key
            ParamId::AtomicSwapPublicKey => {
                tx.set_peer(ParamId::AtomicSwapPeerPublicKey, sub_tx, &entry.value, false)?;
            }
            _ => {
                tx.set_peer(param, sub_tx, &entry.value, true)?;
            }
        }
    }

    let offer = SwapOffer::read_from(tx)?;
    // the responder derives the same lock window as the initiator
    tx.set(
        ParamId::MaxHeight,
        SubTxId::ChainALock,
        &(offer.min_height + offer.lifetime_blocks),
    )?;
    Ok(offer)
}

// =============================================================================
// Offer View (UI surface)
// =============================================================================

/// Read-only offer surface consumed by the UI layer
pub struct OfferView {
    tx: TxParams,
    token: String,
    /// Flat second-chain withdraw fee from the connection settings
    chain_b_fee: u64,
    expiry_selector: u32,
    comment: String,
}

impl OfferView {
    pub fn new(tx: TxParams, token: String, chain_b_fee: u64) -> Self {
        OfferView {
            tx,
            token,
            chain_b_fee,
            expiry_selector: OFFER_EXPIRES_12H,
            comment: String::new(),
        }
    }

    pub fn receiver_address(&self) -> String {
        self.tx
            .get::<WalletId>(ParamId::PeerId, SubTxId::Default)
            .map(|id| id.to_hex())
            .unwrap_or_default()
    }

    pub fn amount_sent(&self) -> u64 {
        let offer = SwapOffer::read_from(&self.tx);
        match offer {
            Ok(o) if o.is_helio_side => o.amount,
            Ok(o) => o.swap_amount,
            Err(_) => 0,
        }
    }

    pub fn amount_to_receive(&self) -> u64 {
        let offer = SwapOffer::read_from(&self.tx);
        match offer {
            Ok(o) if o.is_helio_side => o.swap_amount,
            Ok(o) => o.amount,
            Err(_) => 0,
        }
    }

    pub fn sent_fee(&self) -> u64 {
        self.tx
            .get::<u64>(ParamId::Fee, SubTxId::Default)
            .unwrap_or(0)
    }

    pub fn receive_fee(&self) -> u64 {
        self.chain_b_fee
    }

    pub fn offer_expires(&self) -> u32 {
        self.expiry_selector
    }

    pub fn set_offer_expires(&mut self, selector: u32) {
        self.expiry_selector = selector;
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.comment = comment.to_string();
    }

    pub fn comment_valid(&self) -> bool {
        self.comment.len() <= MAX_COMMENT_LENGTH && !self.comment.contains('\n')
    }

    /// Base64 offer token handed to the counter-peer
    pub fn transaction_token(&self) -> &str {
        &self.token
    }

    /// Stores the counter-peer in the address book with the selected expiry
    pub fn save_address(&self, now: u64) -> Result<(), SwapError> {
        let peer_id = self
            .tx
            .get_mandatory::<WalletId>(ParamId::PeerId, SubTxId::Default)?;
        let hours = offer_expiry_hours(self.expiry_selector);
        self.tx
            .storage()
            .save_address(&AddressBookEntry {
                wallet_id: peer_id,
                comment: self.comment.clone(),
                created_at: now,
                expires_at: now + hours * 3600,
                is_own: false,
            })
            .map_err(SwapError::Storage)
    }

    /// Begin waiting for the counter-peer's acceptance
    pub fn start_listen(&self) {
        log::info!("{} waiting for swap acceptance", self.tx.tx_id());
    }

    /// Signal from the address allocator that no fresh address could be
    /// produced; the offer stays unusable
    pub fn new_address_failed(&self) {
        log::error!("{} could not allocate a receiver address", self.tx.tx_id());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Scalar;
    use crate::storage::Storage;
    use std::rc::Rc;

    fn initiator_offer(tx: &TxParams) -> SwapOffer {
        SwapOffer {
            tx_id: tx.tx_id(),
            amount: 300,
            fee: 100,
            min_height: 50,
            lifetime_blocks: crate::DEFAULT_LIFETIME_BLOCKS,
            swap_coin: SwapCoin::Bitcoin,
            swap_amount: 2000,
            is_helio_side: true,
            is_initiator: true,
            my_id: WalletId::generate(),
            peer_id: WalletId::generate(),
            secret_hash: crate::swap::derive_secret_hash(&crate::swap::generate_pre_image()),
            chain_b_lock_time: 144,
        }
    }

    fn make_token(tx: &TxParams) -> (SwapOffer, ParamBundle) {
        let offer = initiator_offer(tx);
        offer.write_to(tx).unwrap();
        let bundle = build_offer_token(
            tx,
            &Scalar::random().mul_g(),
            &Scalar::random().mul_g(),
            &Scalar::random().mul_g(),
            &[0x02; 33],
        )
        .unwrap();
        (offer, bundle)
    }

    #[test]
    fn test_token_roundtrip_is_bit_stable() {
        let tx = TxParams::new(Rc::new(Storage::open_temporary().unwrap()), TxId::generate());
        let (_, bundle) = make_token(&tx);

        let token = encode_token_string(&bundle);
        let decoded = decode_token_string(&token).unwrap();
        assert_eq!(decoded, bundle);
        assert_eq!(encode_token_string(&decoded), token);
    }

    #[test]
    fn test_import_flips_direction() {
        let tx = TxParams::new(Rc::new(Storage::open_temporary().unwrap()), TxId::generate());
        let (offer, bundle) = make_token(&tx);

        let responder =
            TxParams::new(Rc::new(Storage::open_temporary().unwrap()), bundle.tx_id);
        let imported = import_offer_token(&responder, &bundle).unwrap();

        assert_eq!(imported.is_initiator, false);
        assert_eq!(imported.is_helio_side, !offer.is_helio_side);
        // identity fields are receiver-oriented already
        assert_eq!(imported.peer_id, offer.my_id);
        assert_eq!(imported.my_id, offer.peer_id);
        // terms agree
        assert_eq!(imported.amount, offer.amount);
        assert_eq!(imported.swap_amount, offer.swap_amount);
        assert_eq!(imported.secret_hash, offer.secret_hash);

        // the initiator's lock shares landed under the peer ids
        assert!(responder
            .get::<CompressedPoint>(ParamId::PeerPublicExcess, SubTxId::ChainALock)
            .is_some());
        assert!(responder
            .get::<[u8; 33]>(ParamId::AtomicSwapPeerPublicKey, SubTxId::Default)
            .is_some());
    }

    #[test]
    fn test_import_rejects_incomplete_offer() {
        let tx = TxParams::new(Rc::new(Storage::open_temporary().unwrap()), TxId::generate());
        let (_, bundle) = make_token(&tx);

        let mut broken = bundle.clone();
        broken
            .entries
            .retain(|e| e.param != ParamId::SecretHash as u32);

        let responder =
            TxParams::new(Rc::new(Storage::open_temporary().unwrap()), bundle.tx_id);
        assert!(import_offer_token(&responder, &broken).is_err());
    }

    #[test]
    fn test_import_rejects_non_initiator_token() {
        let tx = TxParams::new(Rc::new(Storage::open_temporary().unwrap()), TxId::generate());
        let (_, mut bundle) = make_token(&tx);
        for entry in &mut bundle.entries {
            if entry.param == ParamId::IsInitiator as u32 {
                entry.value = false.encode();
            }
        }
        let responder =
            TxParams::new(Rc::new(Storage::open_temporary().unwrap()), bundle.tx_id);
        assert!(import_offer_token(&responder, &bundle).is_err());
    }

    #[test]
    fn test_offer_view() {
        let storage = Rc::new(Storage::open_temporary().unwrap());
        let tx = TxParams::new(storage.clone(), TxId::generate());
        let (offer, bundle) = make_token(&tx);

        let token = encode_token_string(&bundle);
        let mut view = OfferView::new(tx, token.clone(), 256);

        assert_eq!(view.amount_sent(), offer.amount);
        assert_eq!(view.amount_to_receive(), offer.swap_amount);
        assert_eq!(view.sent_fee(), offer.fee);
        assert_eq!(view.receive_fee(), 256);
        assert_eq!(view.transaction_token(), token);
        assert_eq!(view.receiver_address(), offer.peer_id.to_hex());

        view.set_comment("counterparty");
        assert!(view.comment_valid());
        view.set_comment(&"x".repeat(MAX_COMMENT_LENGTH + 1));
        assert!(!view.comment_valid());

        view.set_offer_expires(OFFER_EXPIRES_6H);
        view.set_comment("ok");
        view.save_address(1_000).unwrap();
        let entry = storage.get_address(&offer.peer_id).unwrap();
        assert_eq!(entry.expires_at, 1_000 + 6 * 3600);
        assert!(!entry.is_own);
    }
}
