// =============================================================================
// HELIOCOIN v1.6 - Atomic Swap State Machine
// =============================================================================
//
// Drives one swap from its parameter bag. Each peer runs this machine
// independently; peer messages, HELIO tip updates and second-chain
// confirmations synchronize them. update() is safe to call at any time: it
// re-reads everything it needs from the store, advances as far as the
// available inputs allow, and parks on the next missing piece. Restarting
// the wallet therefore resumes any in-flight swap exactly where it stopped.
//
// Global flow:
//
//   Initial -> Invitation -> BuildingLock -> LockBroadcast
//           -> PeerLockConfirmed -> Redeeming -> Completed
//
// with the branches Refunding -> Refunded on timeout and Failed/Cancelled
// on protocol violations or user abort. Inside BuildingLock the three HELIO
// sub-transactions are negotiated: the lock itself, the refund (fully
// pre-signed and assembled before anything is broadcast) and the redeem,
// whose co-signature is withheld until the second chain's lock confirms.
//
// =============================================================================

use std::rc::Rc;

use crate::gateway::NegotiatorGateway;
use crate::params::{
    FailureReason, ParamBundle, ParamCodec, ParamId, SubTxId, SwapError, TxParams, TxStatus,
    WalletId,
};
use crate::swap::second_side::SecondSide;
use crate::swap::shared_builder::SharedTxBuilder;
use crate::swap::{self, MAX_SECOND_SIDE_RETRIES};
use crate::transaction::{PreImage, SecretHash, Transaction};

// =============================================================================
// States
// =============================================================================

/// Global swap state, persisted under State / Default
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum SwapState {
    Initial = 0,
    Invitation = 1,
    BuildingLock = 2,
    LockBroadcast = 3,
    PeerLockConfirmed = 4,
    Redeeming = 5,
    Refunding = 6,
    Completed = 7,
    Refunded = 8,
    Failed = 9,
    Cancelled = 10,
}

impl SwapState {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => SwapState::Invitation,
            2 => SwapState::BuildingLock,
            3 => SwapState::LockBroadcast,
            4 => SwapState::PeerLockConfirmed,
            5 => SwapState::Redeeming,
            6 => SwapState::Refunding,
            7 => SwapState::Completed,
            8 => SwapState::Refunded,
            9 => SwapState::Failed,
            10 => SwapState::Cancelled,
            _ => SwapState::Initial,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapState::Completed | SwapState::Refunded | SwapState::Failed | SwapState::Cancelled
        )
    }
}

/// Per sub-transaction negotiation state. The numeric values are part of
/// the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum SubTxState {
    Initial = 0,
    Invitation = 1,
    SharedUtxoReady = 2,
    Building = 3,
    Signing = 4,
    Registering = 5,
    KernelConfirming = 6,
    Completed = 7,
}

impl SubTxState {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => SubTxState::Invitation,
            2 => SubTxState::SharedUtxoReady,
            3 => SubTxState::Building,
            4 => SubTxState::Signing,
            5 => SubTxState::Registering,
            6 => SubTxState::KernelConfirming,
            7 => SubTxState::Completed,
            _ => SubTxState::Initial,
        }
    }
}

/// Withdraw sub-transactions spend the whole locked amount; their kernels
/// carry no fee of their own
const WITHDRAW_FEE: u64 = 0;

// =============================================================================
// Atomic Swap Transaction
// =============================================================================

pub struct AtomicSwapTransaction {
    tx: TxParams,
    gateway: Rc<dyn NegotiatorGateway>,
    second_side: Box<dyn SecondSide>,
    chain_b_min_confirmations: u16,
}

impl AtomicSwapTransaction {
    pub fn new(
        tx: TxParams,
        gateway: Rc<dyn NegotiatorGateway>,
        second_side: Box<dyn SecondSide>,
        chain_b_min_confirmations: u16,
    ) -> Self {
        AtomicSwapTransaction {
            tx,
            gateway,
            second_side,
            chain_b_min_confirmations,
        }
    }

    pub fn params(&self) -> &TxParams {
        &self.tx
    }

    // =========================================================================
    // Cached Parameters
    // =========================================================================

    fn is_initiator(&self) -> Result<bool, SwapError> {
        self.tx.get_mandatory(ParamId::IsInitiator, SubTxId::Default)
    }

    fn is_helio_side(&self) -> Result<bool, SwapError> {
        self.tx
            .get_mandatory(ParamId::AtomicSwapIsHelioSide, SubTxId::Default)
    }

    fn amount(&self) -> Result<u64, SwapError> {
        self.tx.get_mandatory(ParamId::Amount, SubTxId::Default)
    }

    fn fee(&self) -> Result<u64, SwapError> {
        self.tx.get_mandatory(ParamId::Fee, SubTxId::Default)
    }

    fn peer_id(&self) -> Result<WalletId, SwapError> {
        self.tx.get_mandatory(ParamId::PeerId, SubTxId::Default)
    }

    fn secret_hash(&self) -> Result<SecretHash, SwapError> {
        self.tx.get_mandatory(ParamId::SecretHash, SubTxId::Default)
    }

    pub fn state(&self) -> SwapState {
        SwapState::from_u32(self.tx.state(SubTxId::Default))
    }

    fn set_state(&self, state: SwapState) -> Result<(), SwapError> {
        log::debug!("{} state -> {:?}", self.tx.tx_id(), state);
        self.tx.set_state(SubTxId::Default, state as u32)
    }

    pub fn sub_tx_state(&self, sub_tx: SubTxId) -> SubTxState {
        SubTxState::from_u32(self.tx.state(sub_tx))
    }

    fn set_sub_tx_state(&self, sub_tx: SubTxId, state: SubTxState) -> Result<(), SwapError> {
        log::debug!("{} {:?} -> {:?}", self.tx.tx_id(), sub_tx, state);
        self.tx.set_state(sub_tx, state as u32)
    }

    // =========================================================================
    // Event Entry Points
    // =========================================================================

    /// Applies an incoming peer bundle and advances the machine
    pub fn handle_peer_message(&mut self, bundle: &ParamBundle) {
        if self.state().is_terminal() {
            return;
        }
        if let Err(e) = self.tx.apply_peer_bundle(bundle, false) {
            self.on_failed(e);
            return;
        }
        self.update();
    }

    /// Re-enters the state machine; called on every wake-up
    pub fn update(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        if let Err(e) = self.update_impl() {
            self.on_failed(e);
        }
    }

    /// User cancellation: only possible while nothing is on either chain
    pub fn cancel(&mut self) -> Result<(), SwapError> {
        match self.state() {
            SwapState::Initial | SwapState::Invitation | SwapState::BuildingLock => {
                log::info!("{} cancelled by user", self.tx.tx_id());
                self.rollback_coins();
                self.finish(SwapState::Cancelled, TxStatus::Cancelled, FailureReason::Cancelled)
            }
            _ => Err(SwapError::InvalidState(
                "cannot cancel after a lock was broadcast".to_string(),
            )),
        }
    }

    // =========================================================================
    // Main Loop
    // =========================================================================

    fn update_impl(&mut self) -> Result<(), SwapError> {
        loop {
            let state = self.state();
            let next = match state {
                SwapState::Initial => self.step_initial()?,
                SwapState::Invitation => self.step_invitation()?,
                SwapState::BuildingLock => self.step_building_lock()?,
                SwapState::LockBroadcast => self.step_lock_broadcast()?,
                SwapState::PeerLockConfirmed => self.step_peer_lock_confirmed()?,
                SwapState::Redeeming => self.step_redeeming()?,
                SwapState::Refunding => self.step_refunding()?,
                _ => None,
            };
            match next {
                Some(next_state) => self.set_state(next_state)?,
                None => return Ok(()),
            }
        }
    }

    fn step_initial(&mut self) -> Result<Option<SwapState>, SwapError> {
        // the offer token / acceptance reply already carried our lock
        // shares; the initiator waits for the reply, the responder builds
        if self.is_initiator()? {
            Ok(Some(SwapState::Invitation))
        } else {
            Ok(Some(SwapState::BuildingLock))
        }
    }

    fn step_invitation(&mut self) -> Result<Option<SwapState>, SwapError> {
        self.check_expired()?;
        let accepted = self
            .tx
            .get::<crate::crypto::CompressedPoint>(ParamId::PeerPublicExcess, SubTxId::ChainALock)
            .is_some();
        if accepted {
            Ok(Some(SwapState::BuildingLock))
        } else {
            Ok(None)
        }
    }

    fn step_building_lock(&mut self) -> Result<Option<SwapState>, SwapError> {
        self.check_expired()?;

        let lock_state = self.build_lock_tx()?;
        if lock_state < SubTxState::Registering {
            return Ok(None);
        }

        // the refund must be in both peers' hands before anything goes out
        let refund_state = self.build_shared_tx(SubTxId::ChainARefund, true)?;
        if refund_state < SubTxState::Registering {
            return Ok(None);
        }

        // start the redeem round; the HELIO side withholds its co-signature
        // until the second chain's lock is confirmed
        self.build_shared_tx(SubTxId::ChainARedeem, false)?;

        Ok(Some(SwapState::LockBroadcast))
    }

    fn step_lock_broadcast(&mut self) -> Result<Option<SwapState>, SwapError> {
        if self.is_helio_side()? {
            self.check_expired()?;
            let lock = self
                .tx
                .get_mandatory::<Transaction>(ParamId::AssembledTransaction, SubTxId::ChainALock)?;
            if !self.register_sub_tx(SubTxId::ChainALock, &lock)? {
                return Ok(None);
            }
            if !self.sub_tx_confirmed(SubTxId::ChainALock)? {
                return Ok(None);
            }
        } else {
            // watch the peer's lock land on HELIO, then put ours out
            if !self.sub_tx_confirmed(SubTxId::ChainALock)? {
                self.check_expired()?;
                return Ok(None);
            }
            if !self.send_chain_b_lock()? {
                return Ok(None);
            }
        }

        if self.chain_a_refund_due() {
            return Ok(Some(SwapState::Refunding));
        }
        if !self.chain_b_lock_confirmed()? {
            return Ok(None);
        }
        Ok(Some(SwapState::PeerLockConfirmed))
    }

    fn step_peer_lock_confirmed(&mut self) -> Result<Option<SwapState>, SwapError> {
        if self.is_helio_side()? {
            // release the redeem co-signature now that the second chain
            // holds its lock
            self.build_shared_tx(SubTxId::ChainARedeem, true)?;
        }
        Ok(Some(SwapState::Redeeming))
    }

    fn step_redeeming(&mut self) -> Result<Option<SwapState>, SwapError> {
        if self.chain_a_refund_due() && !self.redeem_finished() {
            return Ok(Some(SwapState::Refunding));
        }

        let helio_side = self.is_helio_side()?;
        if helio_side {
            // make sure our redeem co-signature went out
            self.build_shared_tx(SubTxId::ChainARedeem, true)?;

            // we are owed the second-chain coins
            if self.tx.get::<PreImage>(ParamId::PreImage, SubTxId::Default).is_none() {
                // the secret will surface in the HELIO redeem kernel
                self.request_pre_image_from_kernel()?;
                return Ok(None);
            }
            if !self.redeem_chain_b()? {
                return Ok(None);
            }
        } else {
            // we are owed the HELIO coins
            if self.tx.get::<PreImage>(ParamId::PreImage, SubTxId::Default).is_none() {
                // the secret will surface in the second-chain claim
                if !self.watch_chain_b_secret()? {
                    return Ok(None);
                }
            }
            let redeem_state = self.build_shared_tx(SubTxId::ChainARedeem, true)?;
            if redeem_state < SubTxState::Registering {
                return Ok(None);
            }
            let mut redeem = self
                .tx
                .get_mandatory::<Transaction>(ParamId::AssembledTransaction, SubTxId::ChainARedeem)?;
            redeem.kernel.pre_image =
                Some(self.tx.get_mandatory(ParamId::PreImage, SubTxId::Default)?);
            if !self.register_sub_tx(SubTxId::ChainARedeem, &redeem)? {
                return Ok(None);
            }
            if !self.sub_tx_confirmed(SubTxId::ChainARedeem)? {
                return Ok(None);
            }
            log::info!("{} HELIO redeem confirmed", self.tx.tx_id());
        }

        self.finish(SwapState::Completed, TxStatus::Completed, FailureReason::Unknown)?;
        Ok(None)
    }

    fn step_refunding(&mut self) -> Result<Option<SwapState>, SwapError> {
        if self.is_helio_side()? {
            let refund = self
                .tx
                .get_mandatory::<Transaction>(ParamId::AssembledTransaction, SubTxId::ChainARefund)?;
            if !self.register_sub_tx(SubTxId::ChainARefund, &refund)? {
                return Ok(None);
            }
            if !self.sub_tx_confirmed(SubTxId::ChainARefund)? {
                return Ok(None);
            }
            log::info!("{} HELIO refund confirmed", self.tx.tx_id());
        } else {
            if !self.refund_chain_b()? {
                return Ok(None);
            }
        }
        self.finish(SwapState::Refunded, TxStatus::Failed, FailureReason::Refunded)?;
        Ok(None)
    }

    // =========================================================================
    // Lock Sub-Transaction
    // =========================================================================

    fn lock_builder(&self) -> Result<SharedTxBuilder, SwapError> {
        SharedTxBuilder::new(
            self.tx.clone(),
            SubTxId::ChainALock,
            self.amount()?,
            self.fee()?,
        )
    }

    /// Seeds this peer's half of the lock negotiation and returns the
    /// builder, ready to report its public shares. Used at offer creation
    /// and at acceptance; calling it again is harmless.
    pub fn init_lock_builder(&mut self) -> Result<SharedTxBuilder, SwapError> {
        let mut builder = self.lock_builder()?;
        let initialized = builder.base.get_initial_tx_params();
        builder.load_or_create_shared()?;
        if !initialized {
            if self.is_helio_side()? {
                builder.base.select_inputs()?;
                builder.base.add_change_output()?;
            }
            builder.base.finalize_outputs()?;
            builder.base.generate_offset()?;
        }
        builder.base.generate_nonce()?;
        builder.apply_shared_to_lock()?;
        if self.sub_tx_state(SubTxId::ChainALock) == SubTxState::Initial {
            self.set_sub_tx_state(SubTxId::ChainALock, SubTxState::Invitation)?;
        }
        Ok(builder)
    }

    fn build_lock_tx(&mut self) -> Result<SubTxState, SwapError> {
        let mut state = self.sub_tx_state(SubTxId::ChainALock);
        if state >= SubTxState::Registering {
            return Ok(state);
        }

        let mut builder = self.init_lock_builder()?;

        if !builder.base.load_peer_public_excess_and_nonce()
            || !builder.load_shared_parameters()
        {
            return Ok(state);
        }
        if state == SubTxState::Invitation {
            self.set_sub_tx_state(SubTxId::ChainALock, SubTxState::SharedUtxoReady)?;
            state = SubTxState::SharedUtxoReady;
        }

        builder.base.create_kernel()?;
        if state == SubTxState::SharedUtxoReady {
            self.set_sub_tx_state(SubTxId::ChainALock, SubTxState::Building)?;
            state = SubTxState::Building;
        }

        // ordering rule: the responder signs only over the initiator's
        // already-committed signature share
        if !self.is_initiator()? && !builder.base.load_peer_signature() {
            return Ok(state);
        }

        builder.base.sign_partial()?;
        if state == SubTxState::Building {
            self.send_lock_partial(&builder)?;
            self.set_sub_tx_state(SubTxId::ChainALock, SubTxState::Signing)?;
            state = SubTxState::Signing;
        }

        if !builder.base.load_peer_signature() {
            return Ok(state);
        }
        if !builder.base.is_peer_signature_valid()? {
            log::info!("{} peer lock signature is invalid", self.tx.tx_id());
            return Err(SwapError::SignatureInvalid);
        }
        builder.base.finalize_signature()?;

        if self.is_helio_side()?
            && self
                .tx
                .get::<Transaction>(ParamId::AssembledTransaction, SubTxId::ChainALock)
                .is_none()
        {
            builder.add_shared_output()?;
            let transaction = builder.create_transaction()?;
            self.tx
                .set(ParamId::AssembledTransaction, SubTxId::ChainALock, &transaction)?;
        }

        self.set_sub_tx_state(SubTxId::ChainALock, SubTxState::Registering)?;
        Ok(SubTxState::Registering)
    }

    // =========================================================================
    // Shared Spends (Refund / Redeem)
    // =========================================================================

    fn build_shared_tx(
        &mut self,
        sub_tx: SubTxId,
        allow_cosign: bool,
    ) -> Result<SubTxState, SwapError> {
        let mut state = self.sub_tx_state(sub_tx);
        if state >= SubTxState::Registering {
            return Ok(state);
        }

        let helio_side = self.is_helio_side()?;
        let is_owner = match sub_tx {
            // the refund returns the coins to the HELIO sender, the redeem
            // pays the HELIO receiver
            SubTxId::ChainARefund => helio_side,
            SubTxId::ChainARedeem => !helio_side,
            _ => return Err(SwapError::InvalidState(format!("not a shared spend: {:?}", sub_tx))),
        };
        let withdraw_amount = self.amount()? - WITHDRAW_FEE;

        let mut builder =
            SharedTxBuilder::new(self.tx.clone(), sub_tx, withdraw_amount, WITHDRAW_FEE)?;
        if !builder.load_shared_parameters() {
            return Ok(state);
        }
        builder.base.get_initial_tx_params();
        builder.init_tx(is_owner)?;
        builder.base.generate_nonce()?;
        if sub_tx == SubTxId::ChainARedeem {
            builder.base.set_hash_lock(self.secret_hash()?);
        }

        if !builder.base.load_peer_public_excess_and_nonce() {
            if state == SubTxState::Initial && is_owner {
                self.send_shared_tx_invitation(&builder)?;
                self.set_sub_tx_state(sub_tx, SubTxState::Invitation)?;
                return Ok(SubTxState::Invitation);
            }
            return Ok(state);
        }
        if state <= SubTxState::Invitation {
            self.set_sub_tx_state(sub_tx, SubTxState::SharedUtxoReady)?;
            state = SubTxState::SharedUtxoReady;
        }

        builder.base.create_kernel()?;
        builder.base.sign_partial()?;

        if !builder.base.load_peer_signature() {
            if !is_owner {
                if !allow_cosign {
                    return Ok(state);
                }
                // invited co-signer: everything we need is here, hand over
                // our half and we are done with this sub-transaction
                self.send_shared_tx_confirmation(&builder)?;
                self.set_sub_tx_state(sub_tx, SubTxState::Registering)?;
                return Ok(SubTxState::Registering);
            }
            return Ok(state);
        }

        if !builder.base.is_peer_signature_valid()? {
            log::info!("{} peer {:?} signature is invalid", self.tx.tx_id(), sub_tx);
            return Err(SwapError::SignatureInvalid);
        }
        builder.base.finalize_signature()?;

        if is_owner
            && self
                .tx
                .get::<Transaction>(ParamId::AssembledTransaction, sub_tx)
                .is_none()
        {
            if sub_tx == SubTxId::ChainARedeem {
                // the redeem kernel is only broadcastable with the secret
                let pre_image = self
                    .tx
                    .get_mandatory::<PreImage>(ParamId::PreImage, SubTxId::Default)?;
                if let Some(kernel) = builder.base.kernel.as_mut() {
                    kernel.pre_image = Some(pre_image);
                }
            }
            let transaction = builder.create_transaction()?;
            self.tx.set(ParamId::AssembledTransaction, sub_tx, &transaction)?;
        }

        self.set_sub_tx_state(sub_tx, SubTxState::Registering)?;
        Ok(SubTxState::Registering)
    }

    // =========================================================================
    // HELIO Chain Interaction
    // =========================================================================

    fn register_sub_tx(
        &mut self,
        sub_tx: SubTxId,
        transaction: &Transaction,
    ) -> Result<bool, SwapError> {
        match self.tx.get::<bool>(ParamId::TransactionRegistered, sub_tx) {
            Some(true) => Ok(true),
            Some(false) => Err(SwapError::FailedToRegister),
            None => {
                self.gateway
                    .register_tx(&self.tx.tx_id(), sub_tx, transaction);
                if self.sub_tx_state(sub_tx) < SubTxState::KernelConfirming {
                    self.set_sub_tx_state(sub_tx, SubTxState::KernelConfirming)?;
                }
                Ok(false)
            }
        }
    }

    fn sub_tx_confirmed(&mut self, sub_tx: SubTxId) -> Result<bool, SwapError> {
        if let Some(height) = self.tx.get::<u64>(ParamId::KernelProofHeight, sub_tx) {
            if self.sub_tx_state(sub_tx) < SubTxState::Completed {
                self.set_sub_tx_state(sub_tx, SubTxState::Completed)?;
                // settle exactly the wallet coins this sub-transaction moves
                let input_ids = self
                    .tx
                    .get::<Vec<u64>>(ParamId::InputCoins, sub_tx)
                    .unwrap_or_default();
                let output_ids = self
                    .tx
                    .get::<Vec<u64>>(ParamId::OutputCoins, sub_tx)
                    .unwrap_or_default();
                self.tx
                    .storage()
                    .settle_coins(&input_ids, &output_ids, height)
                    .map_err(SwapError::Storage)?;
            }
            return Ok(true);
        }
        let kernel_id = self.tx.get_mandatory(ParamId::KernelId, sub_tx)?;
        self.gateway.confirm_kernel(&self.tx.tx_id(), sub_tx, &kernel_id);
        Ok(false)
    }

    fn check_expired(&self) -> Result<(), SwapError> {
        if self
            .tx
            .get::<u64>(ParamId::KernelProofHeight, SubTxId::ChainALock)
            .is_some()
        {
            return Ok(());
        }
        let max_height = match self.tx.get::<u64>(ParamId::MaxHeight, SubTxId::ChainALock) {
            Some(h) => h,
            None => return Ok(()),
        };
        if self.gateway.tip_height() > max_height {
            log::info!("{} lock window expired", self.tx.tx_id());
            return Err(SwapError::Expired);
        }
        Ok(())
    }

    fn chain_a_refund_due(&self) -> bool {
        match self.tx.get::<u64>(ParamId::MinHeight, SubTxId::ChainARefund) {
            Some(min_height) => self.gateway.tip_height() >= min_height,
            None => false,
        }
    }

    fn redeem_finished(&self) -> bool {
        if self
            .tx
            .get::<u64>(ParamId::KernelProofHeight, SubTxId::ChainARedeem)
            .is_some()
        {
            return true;
        }
        // a redeem already handed to either chain also blocks the refund
        if self.tx.get::<bool>(ParamId::TransactionRegistered, SubTxId::ChainARedeem)
            == Some(true)
        {
            return true;
        }
        self.tx
            .get::<String>(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBRedeem)
            .is_some()
    }

    /// Asks the node for the redeem kernel body; the gateway writes the
    /// published pre-image back when the kernel is found
    fn request_pre_image_from_kernel(&mut self) -> Result<(), SwapError> {
        if let Some(kernel_id) = self.tx.get(ParamId::KernelId, SubTxId::ChainARedeem) {
            self.gateway
                .get_kernel(&self.tx.tx_id(), SubTxId::ChainARedeem, &kernel_id);
        }
        Ok(())
    }

    // =========================================================================
    // Second Chain Interaction
    // =========================================================================

    /// Runs a second-side action under the retry limit. Ok(None) means a
    /// transient failure was recorded and the action should be retried on
    /// a later wake-up.
    fn with_second_side<T>(
        &mut self,
        sub_tx: SubTxId,
        f: impl FnOnce(&mut dyn SecondSide) -> Result<T, crate::swap::SecondSideError>,
    ) -> Result<Option<T>, SwapError> {
        match f(self.second_side.as_mut()) {
            Ok(value) => {
                self.tx.set(ParamId::SecondSideRetries, sub_tx, &0u32)?;
                Ok(Some(value))
            }
            Err(e) if e.is_transient() => {
                let attempts = self
                    .tx
                    .get::<u32>(ParamId::SecondSideRetries, sub_tx)
                    .unwrap_or(0)
                    + 1;
                if attempts >= MAX_SECOND_SIDE_RETRIES {
                    return Err(SwapError::SecondSide(e.to_string()));
                }
                self.tx.set(ParamId::SecondSideRetries, sub_tx, &attempts)?;
                log::debug!(
                    "{} second side attempt {} failed: {}, retrying in {}s",
                    self.tx.tx_id(),
                    attempts,
                    e,
                    swap::backoff_delay_secs(attempts - 1)
                );
                Ok(None)
            }
            Err(e) => Err(SwapError::SecondSide(e.to_string())),
        }
    }

    fn external_lock_time(&self) -> Result<u64, SwapError> {
        self.tx
            .get_mandatory(ParamId::AtomicSwapExternalLockTime, SubTxId::Default)
    }

    /// Builds and broadcasts our second-chain lock (second-chain sender
    /// only), then tells the peer where to look
    fn send_chain_b_lock(&mut self) -> Result<bool, SwapError> {
        if self
            .tx
            .get::<String>(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBLock)
            .is_some()
        {
            return Ok(true);
        }

        let amount = self
            .tx
            .get_mandatory::<u64>(ParamId::AtomicSwapAmount, SubTxId::Default)?;
        let secret_hash = self.secret_hash()?;
        let receiver = self
            .tx
            .get_mandatory::<[u8; 33]>(ParamId::AtomicSwapPeerPublicKey, SubTxId::Default)?;
        let sender = self.second_side.public_key();
        let lock_time = self.external_lock_time()?;

        let result = self.with_second_side(SubTxId::ChainBLock, move |ss| {
            let (raw, lock_ref) =
                ss.build_lock_tx(amount, &secret_hash, &receiver, &sender, lock_time)?;
            let txid = ss.broadcast(&raw)?;
            Ok((txid, lock_ref))
        })?;
        let (txid, lock_ref) = match result {
            Some(v) => v,
            None => return Ok(false),
        };

        log::info!("{} second-chain lock broadcast: {}", self.tx.tx_id(), txid);
        self.tx
            .set(ParamId::AtomicSwapExternalTx, SubTxId::ChainBLock, &lock_ref)?;
        self.tx
            .set(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBLock, &txid)?;

        // the peer watches the same transaction
        let mut bundle = ParamBundle::new(self.tx.tx_id());
        bundle.add(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBLock, &txid);
        self.send_bundle(bundle)?;
        Ok(true)
    }

    fn chain_b_lock_confirmed(&mut self) -> Result<bool, SwapError> {
        let txid = match self
            .tx
            .get::<String>(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBLock)
        {
            Some(txid) => txid,
            None => return Ok(false),
        };
        let min_confirmations = self.chain_b_min_confirmations;
        let confirmations = self
            .with_second_side(SubTxId::ChainBLock, |ss| ss.confirmations(&txid))?;
        Ok(confirmations.map_or(false, |c| c >= min_confirmations))
    }

    /// Reconstructs the peer's lock output on the second chain
    fn peer_lock_ref(
        &mut self,
    ) -> Result<Option<crate::swap::LockTxRef>, SwapError> {
        if let Some(lock_ref) = self
            .tx
            .get(ParamId::AtomicSwapExternalTx, SubTxId::ChainBLock)
        {
            return Ok(Some(lock_ref));
        }
        let txid = self
            .tx
            .get_mandatory::<String>(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBLock)?;
        let secret_hash = self.secret_hash()?;
        // we receive, the peer funded and refunds
        let receiver = self.second_side.public_key();
        let sender = self
            .tx
            .get_mandatory::<[u8; 33]>(ParamId::AtomicSwapPeerPublicKey, SubTxId::Default)?;
        let lock_time = self.external_lock_time()?;

        let found = self.with_second_side(SubTxId::ChainBLock, move |ss| {
            ss.find_lock_output(&txid, &secret_hash, &receiver, &sender, lock_time)
        })?;
        match found {
            Some(Some(lock_ref)) => {
                self.tx
                    .set(ParamId::AtomicSwapExternalTx, SubTxId::ChainBLock, &lock_ref)?;
                Ok(Some(lock_ref))
            }
            _ => Ok(None),
        }
    }

    /// Claims the second-chain lock with the secret (HELIO side only)
    fn redeem_chain_b(&mut self) -> Result<bool, SwapError> {
        if let Some(txid) = self
            .tx
            .get::<String>(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBRedeem)
        {
            let min_confirmations = self.chain_b_min_confirmations;
            let confirmations = self
                .with_second_side(SubTxId::ChainBRedeem, |ss| ss.confirmations(&txid))?;
            return Ok(confirmations.map_or(false, |c| c >= min_confirmations));
        }

        let lock_ref = match self.peer_lock_ref()? {
            Some(lock_ref) => lock_ref,
            None => return Ok(false),
        };
        let pre_image = self
            .tx
            .get_mandatory::<PreImage>(ParamId::PreImage, SubTxId::Default)?;

        let txid = self.with_second_side(SubTxId::ChainBRedeem, move |ss| {
            let raw = ss.build_redeem_tx(&lock_ref, &pre_image)?;
            ss.broadcast(&raw)
        })?;
        if let Some(txid) = txid {
            log::info!("{} second-chain redeem broadcast: {}", self.tx.tx_id(), txid);
            self.tx
                .set(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBRedeem, &txid)?;
        }
        Ok(false)
    }

    /// Watches our own second-chain lock for the claim that reveals the
    /// secret (second-chain sender only)
    fn watch_chain_b_secret(&mut self) -> Result<bool, SwapError> {
        let lock_ref = match self
            .tx
            .get::<crate::swap::LockTxRef>(ParamId::AtomicSwapExternalTx, SubTxId::ChainBLock)
        {
            Some(lock_ref) => lock_ref,
            None => return Ok(false),
        };
        let observed = self
            .with_second_side(SubTxId::ChainBLock, move |ss| ss.watch_for_secret(&lock_ref))?;
        match observed {
            Some(Some(pre_image)) => {
                log::info!("{} observed the swap secret on the second chain", self.tx.tx_id());
                self.tx.set(ParamId::PreImage, SubTxId::Default, &pre_image)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Refunds our own second-chain lock after its time lock opened
    fn refund_chain_b(&mut self) -> Result<bool, SwapError> {
        if let Some(txid) = self
            .tx
            .get::<String>(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBRefund)
        {
            let min_confirmations = self.chain_b_min_confirmations;
            let confirmations = self
                .with_second_side(SubTxId::ChainBRefund, |ss| ss.confirmations(&txid))?;
            return Ok(confirmations.map_or(false, |c| c >= min_confirmations));
        }

        let lock_ref = self
            .tx
            .get_mandatory::<crate::swap::LockTxRef>(
                ParamId::AtomicSwapExternalTx,
                SubTxId::ChainBLock,
            )?;
        let lock_time = self.external_lock_time()?;

        let tip = self.with_second_side(SubTxId::ChainBRefund, |ss| ss.tip_height())?;
        match tip {
            Some(tip) if tip >= lock_time => {}
            _ => return Ok(false),
        }

        let txid = self.with_second_side(SubTxId::ChainBRefund, move |ss| {
            let raw = ss.build_refund_tx(&lock_ref, lock_time)?;
            ss.broadcast(&raw)
        })?;
        if let Some(txid) = txid {
            log::info!("{} second-chain refund broadcast: {}", self.tx.tx_id(), txid);
            self.tx
                .set(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBRefund, &txid)?;
        }
        Ok(false)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    fn send_bundle(&self, bundle: ParamBundle) -> Result<(), SwapError> {
        let peer = self.peer_id()?;
        self.gateway.send_tx_params(&peer, bundle);
        Ok(())
    }

    /// Our lock signature share; the lock owner also needs our offset for
    /// the final assembly when we do not assemble ourselves
    fn send_lock_partial(&self, builder: &SharedTxBuilder) -> Result<(), SwapError> {
        let mut bundle = ParamBundle::new(self.tx.tx_id());
        bundle.add(
            ParamId::PeerSignature,
            SubTxId::ChainALock,
            &builder.base.partial_signature()?,
        );
        if !self.is_helio_side()? {
            if let Some(offset) = builder.base.offset {
                bundle.add(ParamId::PeerOffset, SubTxId::ChainALock, &offset);
            }
        }
        self.send_bundle(bundle)
    }

    /// Owner's opening round for a shared spend
    fn send_shared_tx_invitation(&self, builder: &SharedTxBuilder) -> Result<(), SwapError> {
        let mut bundle = ParamBundle::new(self.tx.tx_id());
        bundle
            .add(
                ParamId::PeerPublicExcess,
                builder.base.sub_tx_id(),
                &builder.base.public_excess()?,
            )
            .add(
                ParamId::PeerPublicNonce,
                builder.base.sub_tx_id(),
                &builder.base.public_nonce()?,
            );
        self.send_bundle(bundle)
    }

    /// Co-signer's reply: shares, signature half and offset
    fn send_shared_tx_confirmation(&self, builder: &SharedTxBuilder) -> Result<(), SwapError> {
        let offset = builder
            .base
            .offset
            .ok_or_else(|| SwapError::InvalidState("offset not generated".to_string()))?;
        let mut bundle = ParamBundle::new(self.tx.tx_id());
        bundle
            .add(
                ParamId::PeerPublicExcess,
                builder.base.sub_tx_id(),
                &builder.base.public_excess()?,
            )
            .add(
                ParamId::PeerPublicNonce,
                builder.base.sub_tx_id(),
                &builder.base.public_nonce()?,
            )
            .add(
                ParamId::PeerSignature,
                builder.base.sub_tx_id(),
                &builder.base.partial_signature()?,
            )
            .add(ParamId::PeerOffset, builder.base.sub_tx_id(), &offset);
        self.send_bundle(bundle)
    }

    // =========================================================================
    // Termination
    // =========================================================================

    fn finish(
        &mut self,
        state: SwapState,
        status: TxStatus,
        reason: FailureReason,
    ) -> Result<(), SwapError> {
        self.set_state(state)?;
        let failure = match status {
            TxStatus::Failed | TxStatus::Cancelled => Some(reason),
            _ => None,
        };
        if failure.is_some() {
            self.tx
                .set(ParamId::FailureReason, SubTxId::Default, &reason)?;
        }
        self.tx
            .storage()
            .update_tx_status(&self.tx.tx_id(), status, failure)
            .map_err(SwapError::Storage)?;
        log::info!("{} swap finished: {:?}", self.tx.tx_id(), state);
        Ok(())
    }

    fn rollback_coins(&self) {
        if let Err(e) = self.tx.storage().rollback_tx(&self.tx.tx_id()) {
            log::error!("{} coin rollback failed: {}", self.tx.tx_id(), e);
        }
    }

    fn on_failed(&mut self, error: SwapError) {
        let reason = error.reason();
        log::error!("{} swap failed: {}", self.tx.tx_id(), error);

        // nothing reached a chain yet: release every reserved coin
        let lock_out = self
            .tx
            .get::<bool>(ParamId::TransactionRegistered, SubTxId::ChainALock)
            .is_some()
            || self
                .tx
                .get::<String>(ParamId::AtomicSwapExternalTxId, SubTxId::ChainBLock)
                .is_some();
        if !lock_out {
            self.rollback_coins();
        }

        let _ = self.finish(SwapState::Failed, TxStatus::Failed, reason);
    }
}

// =============================================================================
// Tests
// =============================================================================
