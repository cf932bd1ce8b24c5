// =============================================================================
// HELIOCOIN v1.6 - Atomic Swaps
// =============================================================================
//
// Trustless HELIO <-> Bitcoin-family exchanges through a shared hashlock.
//
// How it works:
// 1. The initiator draws a 32-byte secret R and pins H(R) into the offer
// 2. Both peers jointly fund a 2-of-2 output on HELIO (the lock) and
//    pre-sign its refund before anything is broadcast
// 3. The HELIO sender broadcasts the lock; once it confirms, the other
//    peer locks the second-chain coins behind H(R)
// 4. The initiator redeems the chain it is owed on, revealing R there
// 5. The counter-peer observes R (kernel body on HELIO, spend witness on
//    the second chain) and redeems the other side
// 6. If anything stalls, time locks open the refund paths on both chains
//
// Security:
// - the lock funded by the secret owner times out strictly later than the
//   counter-peer's, so the secret is always revealed while the observer
//   still has time to use it
// - the HELIO receiver's redeem co-signature is withheld until the second
//   chain's lock is confirmed
//
// =============================================================================

pub mod offer;
pub mod second_side;
pub mod bitcoin_side;
pub mod shared_builder;
pub mod swap_transaction;


pub use offer::{OfferView, SwapOffer};
pub use second_side::{
    ChainBSettings, ChainType, LockTxRef, SecondSide, SecondSideError, SecondSideRegistry,
    SwapCoin,
};
pub use shared_builder::SharedTxBuilder;
pub use swap_transaction::{AtomicSwapTransaction, SubTxState, SwapState};

use crate::transaction::{PreImage, SecretHash};

// =============================================================================
// Constants
// =============================================================================

/// Attempts per second-side action before the swap fails
pub const MAX_SECOND_SIDE_RETRIES: u32 = 5;
/// Exponential backoff base for transient failures
pub const BACKOFF_BASE_SECS: u64 = 2;
/// Backoff ceiling
pub const BACKOFF_CAP_SECS: u64 = 60;

// =============================================================================
// Helper Functions
// =============================================================================

/// Generates the swap secret
pub fn generate_pre_image() -> PreImage {
    PreImage::random()
}

/// Public image of the secret, shared by both chains
pub fn derive_secret_hash(pre_image: &PreImage) -> SecretHash {
    SecretHash::from_pre_image(pre_image)
}

/// Retry delay for a transient second-side failure
pub fn backoff_delay_secs(attempt: u32) -> u64 {
    let shifted = BACKOFF_BASE_SECS.saturating_mul(1u64 << attempt.min(16));
    shifted.min(BACKOFF_CAP_SECS)
}

/// Checks the lock-time ordering agreed at offer acceptance. The lock
/// funded by the secret owner must outlive the counter-peer's refund
/// window; equality is rejected.
pub fn lock_times_ordered(
    secret_owner_is_helio_side: bool,
    helio_refund_secs: u64,
    chain_b_lock_secs: u64,
) -> bool {
    if secret_owner_is_helio_side {
        chain_b_lock_secs < helio_refund_secs
    } else {
        helio_refund_secs < chain_b_lock_secs
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_generation() {
        let secret1 = generate_pre_image();
        let secret2 = generate_pre_image();
        assert_ne!(secret1, secret2);

        let image = derive_secret_hash(&secret1);
        assert_eq!(image, derive_secret_hash(&secret1));
        assert_ne!(image, derive_secret_hash(&secret2));
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay_secs(0), 2);
        assert_eq!(backoff_delay_secs(1), 4);
        assert_eq!(backoff_delay_secs(3), 16);
        // capped
        assert_eq!(backoff_delay_secs(5), 60);
        assert_eq!(backoff_delay_secs(40), 60);
    }

    #[test]
    fn test_lock_time_ordering() {
        // secret owner funds HELIO: second chain must time out first
        assert!(lock_times_ordered(true, 48 * 3600, 24 * 3600));
        assert!(!lock_times_ordered(true, 24 * 3600, 48 * 3600));

        // secret owner funds the second chain: mirrored
        assert!(lock_times_ordered(false, 24 * 3600, 48 * 3600));
        assert!(!lock_times_ordered(false, 48 * 3600, 24 * 3600));

        // equal windows are never accepted
        assert!(!lock_times_ordered(true, 3600, 3600));
        assert!(!lock_times_ordered(false, 3600, 3600));
    }
}
