// =============================================================================
// HELIOCOIN v1.6 - Swap Wallet Driver
// =============================================================================
//
// Per-wallet event router. Owns the storage and the gateway handle, creates
// and accepts offers, and feeds every wake-up (peer message, tip change,
// timer, user command) into the state machines of the in-flight swaps.
//
// The driver keeps no per-swap objects alive between events: a swap is
// rehydrated from its parameter bag on every event, which is also exactly
// what happens after a process restart.
//
// =============================================================================

use std::rc::Rc;

use crate::gateway::NegotiatorGateway;
use crate::params::{
    ParamBundle, ParamId, SubTxId, SwapError, TxId, TxParams, TxStatus, WalletId,
};
use crate::storage::{Storage, TxRecord, TxType};
use crate::swap::offer::{
    build_offer_token, decode_token_string, encode_token_string, import_offer_token, OfferView,
    SwapOffer,
};
use crate::swap::second_side::{ChainBSettings, SecondSideRegistry, SwapCoin};
use crate::swap::swap_transaction::AtomicSwapTransaction;
use crate::swap::{derive_secret_hash, generate_pre_image, lock_times_ordered};

// =============================================================================
// Offer Terms
// =============================================================================

/// What the user fills in to start a swap
#[derive(Clone, Debug)]
pub struct OfferTerms {
    /// HELIO amount moved by the lock
    pub amount: u64,
    /// HELIO kernel fee
    pub fee: u64,
    pub swap_coin: SwapCoin,
    pub swap_amount: u64,
    /// True when this wallet sends HELIO
    pub is_helio_side: bool,
    /// Counter-peer wallet id
    pub peer_id: WalletId,
    pub lifetime_blocks: u64,
}

// =============================================================================
// Wallet Driver
// =============================================================================

pub struct SwapWallet {
    storage: Rc<Storage>,
    gateway: Rc<dyn NegotiatorGateway>,
    registry: SecondSideRegistry,
    settings: ChainBSettings,
    my_id: WalletId,
}

impl SwapWallet {
    pub fn new(
        storage: Rc<Storage>,
        gateway: Rc<dyn NegotiatorGateway>,
        registry: SecondSideRegistry,
        settings: ChainBSettings,
        my_id: WalletId,
    ) -> Self {
        SwapWallet {
            storage,
            gateway,
            registry,
            settings,
            my_id,
        }
    }

    pub fn storage(&self) -> &Rc<Storage> {
        &self.storage
    }

    pub fn my_id(&self) -> WalletId {
        self.my_id
    }

    fn params(&self, tx_id: TxId) -> TxParams {
        TxParams::new(self.storage.clone(), tx_id)
    }

    /// Rebuilds the state machine of one swap from its parameter bag
    fn swap(&self, tx_id: TxId) -> Result<AtomicSwapTransaction, SwapError> {
        let tx = self.params(tx_id);
        let coin = tx.get_mandatory::<SwapCoin>(ParamId::AtomicSwapCoin, SubTxId::Default)?;
        let second_side = self
            .registry
            .create(coin, &self.settings)
            .ok_or_else(|| SwapError::SecondSide(format!("no client for {}", coin)))?;
        Ok(AtomicSwapTransaction::new(
            tx,
            self.gateway.clone(),
            second_side,
            self.settings.min_confirmations,
        ))
    }

    fn new_record(&self, tx_id: TxId, now: u64) -> Result<(), SwapError> {
        self.storage
            .put_tx_record(&TxRecord {
                tx_id,
                tx_type: TxType::AtomicSwap,
                status: TxStatus::Pending,
                failure_reason: None,
                created_at: now,
            })
            .map_err(SwapError::Storage)
    }

    // =========================================================================
    // Offer Creation (initiator)
    // =========================================================================

    /// Creates the swap, draws the secret and produces the transaction
    /// token for the counter-peer
    pub fn create_swap_offer(
        &mut self,
        terms: &OfferTerms,
        now: u64,
    ) -> Result<(TxId, String), SwapError> {
        if !self.registry.supports(terms.swap_coin) {
            return Err(SwapError::SecondSide(format!(
                "no client for {}",
                terms.swap_coin
            )));
        }

        let tx_id = TxId::generate();
        self.new_record(tx_id, now)?;
        let tx = self.params(tx_id);

        // the hashlock secret stays with the initiator until redeem time
        let pre_image = generate_pre_image();
        let secret_hash = derive_secret_hash(&pre_image);
        tx.set(ParamId::PreImage, SubTxId::Default, &pre_image)?;
        tx.set(ParamId::CreateTime, SubTxId::Default, &now)?;

        let mut swap = self.swap_for_offer(tx_id, terms, secret_hash)?;

        // our half of the lock negotiation goes into the token
        let builder = swap.init_lock_builder()?;
        let token = build_offer_token(
            swap.params(),
            &builder.base.public_excess()?,
            &builder.base.public_nonce()?,
            &builder.public_shared_blinding()?,
            &self.chain_b_public_key(terms.swap_coin)?,
        )?;
        Ok((tx_id, encode_token_string(&token)))
    }

    fn swap_for_offer(
        &self,
        tx_id: TxId,
        terms: &OfferTerms,
        secret_hash: crate::transaction::SecretHash,
    ) -> Result<AtomicSwapTransaction, SwapError> {
        let tx = self.params(tx_id);
        let min_height = self.gateway.tip_height() + 1;

        // absolute second-chain height after which the peer's or our own
        // second-chain lock opens its refund path
        let mut probe = self
            .registry
            .create(terms.swap_coin, &self.settings)
            .ok_or_else(|| SwapError::SecondSide("no second side client".to_string()))?;
        let chain_b_tip = probe
            .tip_height()
            .map_err(|e| SwapError::SecondSide(e.to_string()))?;
        let chain_b_lock_time = chain_b_tip + self.settings.lock_time_in_blocks;

        let offer = SwapOffer {
            tx_id,
            amount: terms.amount,
            fee: terms.fee,
            min_height,
            lifetime_blocks: terms.lifetime_blocks,
            swap_coin: terms.swap_coin,
            swap_amount: terms.swap_amount,
            is_helio_side: terms.is_helio_side,
            is_initiator: true,
            my_id: self.my_id,
            peer_id: terms.peer_id,
            secret_hash,
            chain_b_lock_time,
        };
        offer.write_to(&tx)?;
        self.swap(tx_id)
    }

    fn chain_b_public_key(&self, coin: SwapCoin) -> Result<[u8; 33], SwapError> {
        let side = self
            .registry
            .create(coin, &self.settings)
            .ok_or_else(|| SwapError::SecondSide("no second side client".to_string()))?;
        Ok(side.public_key())
    }

    /// UI surface for a created offer
    pub fn offer_view(&self, tx_id: TxId, token: String) -> OfferView {
        OfferView::new(self.params(tx_id), token, self.settings.fee_rate)
    }

    // =========================================================================
    // Offer Acceptance (responder)
    // =========================================================================

    /// Imports a transaction token, validates the agreed time locks and
    /// replies with this wallet's lock shares
    pub fn accept_offer(&mut self, token: &str, now: u64) -> Result<TxId, SwapError> {
        let bundle = decode_token_string(token)?;
        let tx_id = bundle.tx_id;
        if self.storage.get_tx_record(&tx_id).is_some() {
            return Err(SwapError::InvalidState("offer already imported".to_string()));
        }

        self.new_record(tx_id, now)?;
        let tx = self.params(tx_id);
        let offer = match self.check_offer(&tx, &bundle) {
            Ok(offer) => offer,
            Err(e) => {
                let _ = self.storage.update_tx_status(
                    &tx_id,
                    TxStatus::Failed,
                    Some(e.reason()),
                );
                return Err(e);
            }
        };
        tx.set(ParamId::CreateTime, SubTxId::Default, &now)?;

        // build our half of the lock and answer the invitation
        let mut swap = self.swap(tx_id)?;
        let builder = swap.init_lock_builder()?;

        let offset = builder
            .base
            .offset
            .ok_or_else(|| SwapError::InvalidState("offset not generated".to_string()))?;
        let mut reply = ParamBundle::new(tx_id);
        reply
            .add(
                ParamId::PeerPublicExcess,
                SubTxId::ChainALock,
                &builder.base.public_excess()?,
            )
            .add(
                ParamId::PeerPublicNonce,
                SubTxId::ChainALock,
                &builder.base.public_nonce()?,
            )
            .add(
                ParamId::PeerPublicSharedBlindingFactor,
                SubTxId::ChainALock,
                &builder.public_shared_blinding()?,
            )
            .add(ParamId::PeerOffset, SubTxId::ChainALock, &offset)
            .add(
                ParamId::AtomicSwapPeerPublicKey,
                SubTxId::Default,
                &self.chain_b_public_key(offer.swap_coin)?,
            )
            .add(
                ParamId::PeerProtoVersion,
                SubTxId::Default,
                &crate::PROTOCOL_VERSION,
            );
        self.gateway.send_tx_params(&offer.peer_id, reply);

        self.storage
            .update_tx_status(&tx_id, TxStatus::InProgress, None)
            .map_err(SwapError::Storage)?;
        swap.update();
        Ok(tx_id)
    }

    fn check_offer(&self, tx: &TxParams, bundle: &ParamBundle) -> Result<SwapOffer, SwapError> {
        let offer = import_offer_token(tx, bundle)?;
        if !self.registry.supports(offer.swap_coin) {
            return Err(SwapError::SecondSide(format!(
                "no client for {}",
                offer.swap_coin
            )));
        }
        self.validate_offer_lock_times(&offer)?;
        Ok(offer)
    }

    /// The lock funded by the secret owner must outlive the other side's
    /// refund window; otherwise the offer is rejected before anything is
    /// built.
    fn validate_offer_lock_times(&self, offer: &SwapOffer) -> Result<(), SwapError> {
        let mut probe = self
            .registry
            .create(offer.swap_coin, &self.settings)
            .ok_or_else(|| SwapError::SecondSide("no second side client".to_string()))?;
        let chain_b_tip = probe
            .tip_height()
            .map_err(|e| SwapError::SecondSide(e.to_string()))?;

        let chain_b_lock_secs = offer
            .chain_b_lock_time
            .saturating_sub(chain_b_tip)
            .saturating_mul(offer.swap_coin.block_seconds());
        let helio_refund_secs = crate::LOCK_TIME_BLOCKS * crate::BLOCK_TIME_SECONDS;

        // the secret owner is the initiator; our own side flag is already
        // flipped, so the initiator sits on the opposite side
        let secret_owner_is_helio_side = !offer.is_helio_side;
        if !lock_times_ordered(secret_owner_is_helio_side, helio_refund_secs, chain_b_lock_secs) {
            return Err(SwapError::InvalidParameter(
                "lock time ordering rejected".to_string(),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Event Routing
    // =========================================================================

    /// Incoming peer message
    pub fn handle_message(&mut self, bundle: ParamBundle) {
        let tx_id = bundle.tx_id;
        match self.storage.get_tx_record(&tx_id) {
            Some(record) if record.tx_type == TxType::AtomicSwap => {
                match self.swap(tx_id) {
                    Ok(mut swap) => swap.handle_peer_message(&bundle),
                    Err(e) => log::error!("{} could not rebuild swap: {}", tx_id, e),
                }
            }
            _ => log::debug!("{} message for unknown transaction dropped", tx_id),
        }
    }

    /// HELIO tip advanced
    pub fn on_tip_changed(&mut self) {
        self.update_active();
    }

    /// Periodic timer wake-up (second-chain polling, retries)
    pub fn on_timer(&mut self) {
        self.update_active();
    }

    /// User cancellation
    pub fn cancel(&mut self, tx_id: TxId) -> Result<(), SwapError> {
        self.swap(tx_id)?.cancel()
    }

    /// Explicit user deletion of a finished swap
    pub fn delete_tx(&mut self, tx_id: TxId) -> Result<(), SwapError> {
        match self.storage.get_tx_record(&tx_id) {
            Some(record)
                if matches!(
                    record.status,
                    TxStatus::Completed | TxStatus::Failed | TxStatus::Cancelled
                ) =>
            {
                self.storage.delete_tx(&tx_id).map_err(SwapError::Storage)
            }
            Some(_) => Err(SwapError::InvalidState(
                "cannot delete an active swap".to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Drives every in-flight swap; also the restart rehydration path
    pub fn update_active(&mut self) {
        let records = self.storage.tx_records();
        for record in records {
            if record.tx_type != TxType::AtomicSwap {
                continue;
            }
            if !matches!(record.status, TxStatus::Pending | TxStatus::InProgress) {
                continue;
            }
            match self.swap(record.tx_id) {
                Ok(mut swap) => swap.update(),
                Err(e) => log::error!("{} could not rebuild swap: {}", record.tx_id, e),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::NegotiatorGateway;
    use crate::swap::second_side::{LockTxRef, SecondSide, SecondSideError};
    use crate::transaction::{KernelId, PreImage, SecretHash, Transaction};
    use std::cell::RefCell;

    // gateway that swallows everything
    struct NullGateway {
        tip: u64,
        sent: RefCell<Vec<ParamBundle>>,
    }

    impl NegotiatorGateway for NullGateway {
        fn register_tx(&self, _: &TxId, _: SubTxId, _: &Transaction) {}
        fn confirm_kernel(&self, _: &TxId, _: SubTxId, _: &KernelId) {}
        fn get_kernel(&self, _: &TxId, _: SubTxId, _: &KernelId) {}
        fn send_tx_params(&self, _: &WalletId, bundle: ParamBundle) {
            self.sent.borrow_mut().push(bundle);
        }
        fn tip_height(&self) -> u64 {
            self.tip
        }
    }

    // second side that only reports a tip
    struct StubSecondSide {
        tip: u64,
    }

    impl SecondSide for StubSecondSide {
        fn public_key(&self) -> [u8; 33] {
            [2u8; 33]
        }
        fn tip_height(&mut self) -> Result<u64, SecondSideError> {
            Ok(self.tip)
        }
        fn build_lock_tx(
            &mut self,
            _: u64,
            _: &SecretHash,
            _: &[u8; 33],
            _: &[u8; 33],
            _: u64,
        ) -> Result<(Vec<u8>, LockTxRef), SecondSideError> {
            Err(SecondSideError::Internal("stub".into()))
        }
        fn build_refund_tx(&mut self, _: &LockTxRef, _: u64) -> Result<Vec<u8>, SecondSideError> {
            Err(SecondSideError::Internal("stub".into()))
        }
        fn build_redeem_tx(
            &mut self,
            _: &LockTxRef,
            _: &PreImage,
        ) -> Result<Vec<u8>, SecondSideError> {
            Err(SecondSideError::Internal("stub".into()))
        }
        fn broadcast(&mut self, _: &[u8]) -> Result<String, SecondSideError> {
            Err(SecondSideError::Internal("stub".into()))
        }
        fn confirmations(&mut self, _: &str) -> Result<u16, SecondSideError> {
            Ok(0)
        }
        fn find_lock_output(
            &mut self,
            _: &str,
            _: &SecretHash,
            _: &[u8; 33],
            _: &[u8; 33],
            _: u64,
        ) -> Result<Option<LockTxRef>, SecondSideError> {
            Ok(None)
        }
        fn watch_for_secret(&mut self, _: &LockTxRef) -> Result<Option<PreImage>, SecondSideError> {
            Ok(None)
        }
    }

    fn test_wallet(funds: &[u64]) -> SwapWallet {
        let storage = Rc::new(Storage::open_temporary().unwrap());
        for amount in funds {
            storage.insert_available_coin(*amount).unwrap();
        }
        let gateway = Rc::new(NullGateway {
            tip: 100,
            sent: RefCell::new(Vec::new()),
        });
        let mut registry = SecondSideRegistry::new();
        registry.register(
            SwapCoin::Bitcoin,
            Box::new(|_| -> Box<dyn SecondSide> { Box::new(StubSecondSide { tip: 500 }) }),
        );
        SwapWallet::new(
            storage,
            gateway,
            registry,
            ChainBSettings::default(),
            WalletId::generate(),
        )
    }

    fn sample_terms() -> OfferTerms {
        OfferTerms {
            amount: 3,
            fee: 1,
            swap_coin: SwapCoin::Bitcoin,
            swap_amount: 2000,
            is_helio_side: true,
            peer_id: WalletId::generate(),
            lifetime_blocks: crate::DEFAULT_LIFETIME_BLOCKS,
        }
    }

    #[test]
    fn test_create_offer_produces_token() {
        let mut wallet = test_wallet(&[5, 2, 1, 9]);
        let (tx_id, token) = wallet.create_swap_offer(&sample_terms(), 1000).unwrap();

        assert!(!token.is_empty());
        let record = wallet.storage.get_tx_record(&tx_id).unwrap();
        assert_eq!(record.tx_type, TxType::AtomicSwap);

        // inputs for the lock are reserved already
        assert!(wallet.storage.available_total() < 17);

        // the token decodes back to the same tx
        let bundle = decode_token_string(&token).unwrap();
        assert_eq!(bundle.tx_id, tx_id);
    }

    #[test]
    fn test_create_offer_without_funds_fails() {
        let mut wallet = test_wallet(&[1]);
        let err = wallet.create_swap_offer(&sample_terms(), 1000).unwrap_err();
        assert_eq!(err, SwapError::NoInputs);
    }

    #[test]
    fn test_cancel_restores_coins() {
        let mut wallet = test_wallet(&[5, 2, 1, 9]);
        let (tx_id, _) = wallet.create_swap_offer(&sample_terms(), 1000).unwrap();
        assert!(wallet.storage.available_total() < 17);

        wallet.cancel(tx_id).unwrap();
        assert_eq!(wallet.storage.available_total(), 17);
        let record = wallet.storage.get_tx_record(&tx_id).unwrap();
        assert_eq!(record.status, TxStatus::Cancelled);

        // terminal swaps can be deleted
        wallet.delete_tx(tx_id).unwrap();
        assert!(wallet.storage.get_tx_record(&tx_id).is_none());
    }

    #[test]
    fn test_accept_rejects_bad_lock_times() {
        let mut maker = test_wallet(&[5, 2, 1, 9]);
        let (_, token) = maker.create_swap_offer(&sample_terms(), 1000).unwrap();

        // default settings give both chains a 2-day window; for a
        // HELIO-side initiator the second chain must be strictly shorter
        let mut taker = test_wallet(&[]);
        let err = taker.accept_offer(&token, 1000).unwrap_err();
        assert!(matches!(err, SwapError::InvalidParameter(_)));
    }

    #[test]
    fn test_accept_good_lock_times_replies() {
        // a 100-block second-chain window is strictly shorter than the
        // HELIO refund, so the ordering check passes
        let mut maker = test_wallet(&[5, 2, 1, 9]);
        maker.settings.lock_time_in_blocks = 100;
        let (_, token) = maker.create_swap_offer(&sample_terms(), 1000).unwrap();

        let mut taker = test_wallet(&[]);
        let tx_id = taker.accept_offer(&token, 1000).unwrap();
        let record = taker.storage.get_tx_record(&tx_id).unwrap();
        assert_eq!(record.status, TxStatus::InProgress);

        // importing the same token twice is refused
        assert!(taker.accept_offer(&token, 1000).is_err());
    }
}
