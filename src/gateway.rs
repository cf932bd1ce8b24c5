// =============================================================================
// HELIOCOIN v1.6 - Negotiator Gateway
// =============================================================================
//
// The asynchronous surface between the wallet core and the outside world:
// the HELIO node connection and the peer message transport. All requests are
// non-blocking; completions are posted back to the event loop as parameter
// writes followed by a transaction update:
//
//   register_tx    -> TransactionRegistered (bool)
//   confirm_kernel -> KernelProofHeight (u64), once the kernel is buried
//   get_kernel     -> PreImage (for hash-locked kernels found on chain)
//
// =============================================================================

use crate::params::{ParamBundle, SubTxId, TxId, WalletId};
use crate::transaction::{KernelId, Transaction};

pub trait NegotiatorGateway {
    /// Submits a finalized transaction to the node
    fn register_tx(&self, tx_id: &TxId, sub_tx: SubTxId, transaction: &Transaction);

    /// Requests a proof that the kernel is on chain
    fn confirm_kernel(&self, tx_id: &TxId, sub_tx: SubTxId, kernel_id: &KernelId);

    /// Requests the kernel body; used to extract the published pre-image of
    /// a hash-locked kernel
    fn get_kernel(&self, tx_id: &TxId, sub_tx: SubTxId, kernel_id: &KernelId);

    /// Sends a parameter bundle to the counter-peer
    fn send_tx_params(&self, peer: &WalletId, bundle: ParamBundle);

    /// Current chain tip height
    fn tip_height(&self) -> u64;
}
