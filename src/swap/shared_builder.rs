// =============================================================================
// HELIOCOIN v1.6 - Shared Transaction Builder
// =============================================================================
//
// Builder specialization for the jointly-owned lock output and the two
// transactions spending it (refund and redeem).
//
// The joint output commits to the swap amount under the sum of two
// peer-private blinding shares:
//
//     C = v*H + (s_self + s_peer)*G
//
// Each peer only ever holds its own scalar share; the other side is known
// as a public point. When the joint output is spent, each peer folds its
// share into its secret signing excess. The share is never folded into the
// published offset: that would hand the counter-peer the full joint
// blinding before the spend confirms.
//
// =============================================================================

use crate::crypto::{CompressedPoint, PedersenCommitment, Scalar};
use crate::params::{ParamId, SubTxId, SwapError, TxParams};
use crate::transaction::{Input, Transaction};
use crate::tx_builder::BaseTxBuilder;

pub struct SharedTxBuilder {
    pub base: BaseTxBuilder,
    shared_blinding: Option<Scalar>,
    peer_public_shared: Option<CompressedPoint>,
}

impl SharedTxBuilder {
    pub fn new(tx: TxParams, sub_tx: SubTxId, amount: u64, fee: u64) -> Result<Self, SwapError> {
        Self::init_min_height(&tx, sub_tx)?;
        Ok(SharedTxBuilder {
            base: BaseTxBuilder::new(tx, sub_tx, vec![amount], fee),
            shared_blinding: None,
            peer_public_shared: None,
        })
    }

    /// The refund inherits the main minimum height shifted by the agreed
    /// lock time; every other sub-transaction inherits it directly.
    fn init_min_height(tx: &TxParams, sub_tx: SubTxId) -> Result<(), SwapError> {
        if tx.get::<u64>(ParamId::MinHeight, sub_tx).is_some() {
            return Ok(());
        }
        let mut min_height = tx.get_mandatory::<u64>(ParamId::MinHeight, SubTxId::Default)?;
        if sub_tx == SubTxId::ChainARefund {
            min_height += crate::LOCK_TIME_BLOCKS;
        }
        tx.set(ParamId::MinHeight, sub_tx, &min_height)
    }

    // =========================================================================
    // Shared Blinding
    // =========================================================================

    /// Creates this peer's blinding share for the joint output (once) and
    /// loads the persisted values afterwards
    pub fn load_or_create_shared(&mut self) -> Result<(), SwapError> {
        let share = match self
            .base
            .tx
            .get::<Scalar>(ParamId::SharedBlindingFactor, SubTxId::ChainALock)
        {
            Some(share) => share,
            None => {
                let share = Scalar::random();
                self.base
                    .tx
                    .set(ParamId::SharedBlindingFactor, SubTxId::ChainALock, &share)?;
                share
            }
        };
        self.shared_blinding = Some(share);
        self.peer_public_shared = self
            .base
            .tx
            .get(ParamId::PeerPublicSharedBlindingFactor, SubTxId::ChainALock);
        Ok(())
    }

    /// Loads both sides of the joint blinding; false until the peer's
    /// public share has arrived
    pub fn load_shared_parameters(&mut self) -> bool {
        self.shared_blinding = self
            .base
            .tx
            .get(ParamId::SharedBlindingFactor, SubTxId::ChainALock);
        self.peer_public_shared = self
            .base
            .tx
            .get(ParamId::PeerPublicSharedBlindingFactor, SubTxId::ChainALock);
        self.shared_blinding.is_some() && self.peer_public_shared.is_some()
    }

    fn shared_blinding(&self) -> Result<Scalar, SwapError> {
        self.shared_blinding
            .ok_or(SwapError::MissingParameter(ParamId::SharedBlindingFactor))
    }

    fn peer_public_shared(&self) -> Result<CompressedPoint, SwapError> {
        self.peer_public_shared.ok_or(SwapError::MissingParameter(
            ParamId::PeerPublicSharedBlindingFactor,
        ))
    }

    /// Our public share of the joint blinding, transmitted to the peer
    pub fn public_shared_blinding(&self) -> Result<CompressedPoint, SwapError> {
        Ok(self.shared_blinding()?.mul_g())
    }

    /// Reconstructs the joint commitment from the local share and the
    /// peer's public share
    pub fn shared_commitment(&self) -> Result<PedersenCommitment, SwapError> {
        let amount = self
            .base
            .tx
            .get_mandatory::<u64>(ParamId::Amount, SubTxId::Default)?;
        let blinding_point = self
            .public_shared_blinding()?
            .add(&self.peer_public_shared()?);
        Ok(PedersenCommitment::commit_with_point(amount, &blinding_point))
    }

    // =========================================================================
    // Lock Output (ChainALock)
    // =========================================================================

    /// Accounts this peer's blinding share on the output side of the lock.
    /// Both peers do this; it is what makes the joint output co-owned.
    pub fn apply_shared_to_lock(&mut self) -> Result<(), SwapError> {
        let share = self.shared_blinding()?;
        self.base.output_blind = self.base.output_blind.add(&share);
        Ok(())
    }

    /// Appends the joint output itself; only the assembling peer does this
    pub fn add_shared_output(&mut self) -> Result<(), SwapError> {
        let commitment = self.shared_commitment()?;
        self.base.outputs.push(crate::transaction::Output { commitment });
        Ok(())
    }

    // =========================================================================
    // Spends (ChainARefund / ChainARedeem)
    // =========================================================================

    /// Prepares the builder for spending the joint output. The owner of the
    /// resulting coins references the joint commitment as input and creates
    /// its output; the co-signer only contributes its blinding share and
    /// its half of the signature.
    pub fn init_tx(&mut self, is_owner: bool) -> Result<(), SwapError> {
        // either role: the share sits on the input side of the equation
        let share = self.shared_blinding()?;
        self.base.input_blind = self.base.input_blind.add(&share);

        if is_owner {
            let input_recorded = !self.base.inputs.is_empty()
                || self
                    .base
                    .tx
                    .get::<Vec<Input>>(ParamId::Inputs, self.base.sub_tx)
                    .is_some();
            if !input_recorded {
                let commitment = self.shared_commitment()?;
                self.base.inputs.push(Input { commitment });
                self.base
                    .tx
                    .set(ParamId::Inputs, self.base.sub_tx, &self.base.inputs)?;
            }
            self.base.create_outputs()?;
            self.base.finalize_outputs()?;
        }

        self.base.generate_offset()?;
        Ok(())
    }

    pub fn load_peer_offset(&mut self) -> bool {
        self.base.load_peer_offset()
    }

    /// Final assembly; reads the peer's offset first
    pub fn create_transaction(&mut self) -> Result<Transaction, SwapError> {
        self.base.load_peer_offset();
        self.base.create_transaction()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{TxId, TxParams};
    use crate::storage::Storage;
    use std::rc::Rc;

    const AMOUNT: u64 = 300;

    struct Peer {
        tx: TxParams,
    }

    fn setup_peers() -> (Peer, Peer) {
        let tx_id = TxId::generate();
        let a = Peer {
            tx: TxParams::new(Rc::new(Storage::open_temporary().unwrap()), tx_id),
        };
        let b = Peer {
            tx: TxParams::new(Rc::new(Storage::open_temporary().unwrap()), tx_id),
        };
        for peer in [&a, &b] {
            peer.tx.set(ParamId::Amount, SubTxId::Default, &AMOUNT).unwrap();
            peer.tx.set(ParamId::MinHeight, SubTxId::Default, &100u64).unwrap();
        }
        (a, b)
    }

    fn exchange_shared(a: &Peer, b: &Peer) {
        // each peer creates its share and passes the public part over
        let mut builder_a =
            SharedTxBuilder::new(a.tx.clone(), SubTxId::ChainALock, AMOUNT, 0).unwrap();
        let mut builder_b =
            SharedTxBuilder::new(b.tx.clone(), SubTxId::ChainALock, AMOUNT, 0).unwrap();
        builder_a.load_or_create_shared().unwrap();
        builder_b.load_or_create_shared().unwrap();

        a.tx.set(
            ParamId::PeerPublicSharedBlindingFactor,
            SubTxId::ChainALock,
            &builder_b.public_shared_blinding().unwrap(),
        )
        .unwrap();
        b.tx.set(
            ParamId::PeerPublicSharedBlindingFactor,
            SubTxId::ChainALock,
            &builder_a.public_shared_blinding().unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_refund_min_height_derivation() {
        let (a, _) = setup_peers();
        let refund =
            SharedTxBuilder::new(a.tx.clone(), SubTxId::ChainARefund, AMOUNT, 0).unwrap();
        assert_eq!(refund.base.min_height(), 100 + crate::LOCK_TIME_BLOCKS);

        let redeem =
            SharedTxBuilder::new(a.tx.clone(), SubTxId::ChainARedeem, AMOUNT, 0).unwrap();
        assert_eq!(redeem.base.min_height(), 100);
    }

    #[test]
    fn test_joint_commitment_matches_on_both_sides() {
        let (a, b) = setup_peers();
        exchange_shared(&a, &b);

        let mut builder_a =
            SharedTxBuilder::new(a.tx.clone(), SubTxId::ChainARefund, AMOUNT, 0).unwrap();
        let mut builder_b =
            SharedTxBuilder::new(b.tx.clone(), SubTxId::ChainARefund, AMOUNT, 0).unwrap();
        assert!(builder_a.load_shared_parameters());
        assert!(builder_b.load_shared_parameters());

        assert_eq!(
            builder_a.shared_commitment().unwrap().as_bytes(),
            builder_b.shared_commitment().unwrap().as_bytes()
        );
    }

    #[test]
    fn test_refund_negotiation_end_to_end() {
        let (a, b) = setup_peers();
        exchange_shared(&a, &b);

        // A owns the refund (gets the coins back); B co-signs
        let mut owner =
            SharedTxBuilder::new(a.tx.clone(), SubTxId::ChainARefund, AMOUNT, 0).unwrap();
        let mut cosigner =
            SharedTxBuilder::new(b.tx.clone(), SubTxId::ChainARefund, AMOUNT, 0).unwrap();
        assert!(owner.load_shared_parameters());
        assert!(cosigner.load_shared_parameters());

        owner.init_tx(true).unwrap();
        cosigner.init_tx(false).unwrap();

        // exchange public excess and nonce
        b.tx.set(
            ParamId::PeerPublicExcess,
            SubTxId::ChainARefund,
            &owner.base.public_excess().unwrap(),
        )
        .unwrap();
        b.tx.set(
            ParamId::PeerPublicNonce,
            SubTxId::ChainARefund,
            &owner.base.public_nonce().unwrap(),
        )
        .unwrap();
        a.tx.set(
            ParamId::PeerPublicExcess,
            SubTxId::ChainARefund,
            &cosigner.base.public_excess().unwrap(),
        )
        .unwrap();
        a.tx.set(
            ParamId::PeerPublicNonce,
            SubTxId::ChainARefund,
            &cosigner.base.public_nonce().unwrap(),
        )
        .unwrap();

        assert!(owner.base.load_peer_public_excess_and_nonce());
        assert!(cosigner.base.load_peer_public_excess_and_nonce());

        owner.base.create_kernel().unwrap();
        cosigner.base.create_kernel().unwrap();

        owner.base.sign_partial().unwrap();
        cosigner.base.sign_partial().unwrap();

        // co-signer hands over its share and offset
        a.tx.set(
            ParamId::PeerSignature,
            SubTxId::ChainARefund,
            &cosigner.base.partial_signature().unwrap(),
        )
        .unwrap();
        a.tx.set(
            ParamId::PeerOffset,
            SubTxId::ChainARefund,
            &cosigner.base.offset.unwrap(),
        )
        .unwrap();

        assert!(owner.base.load_peer_signature());
        assert!(owner.base.is_peer_signature_valid().unwrap());
        owner.base.finalize_signature().unwrap();

        let refund = owner.create_transaction().unwrap();
        assert!(refund.is_valid().is_ok());
        assert_eq!(refund.kernel.min_height, 100 + crate::LOCK_TIME_BLOCKS);
        assert_eq!(refund.inputs.len(), 1);
        assert_eq!(refund.outputs.len(), 1);
    }
}
