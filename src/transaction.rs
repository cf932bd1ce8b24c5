// =============================================================================
// HELIOCOIN v1.6 - Transactions
// =============================================================================
//
// HELIO transactions carry no addresses and no plaintext amounts. Inputs and
// outputs are Pedersen commitments; the kernel carries the fee, the height
// range in which the kernel may be mined, the combined public excess and the
// aggregate Schnorr signature over it. The whole transaction balances when
//
//     sum(outputs) - sum(inputs) + fee*H == excess + offset*G
//
// A kernel may additionally carry a hash lock: it is only valid on chain
// when broadcast together with the 32-byte pre-image of its 20-byte image.
// Spending such a kernel publishes the pre-image to every observer.
//
// =============================================================================

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use ripemd::Ripemd160;

use crate::crypto::{CompressedPoint, PedersenCommitment, Scalar, SchnorrSignature};

// =============================================================================
// Hash Lock Types
// =============================================================================

pub const PRE_IMAGE_SIZE: usize = 32;
pub const SECRET_HASH_SIZE: usize = 20;

/// 32-byte hashlock secret
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreImage(pub [u8; PRE_IMAGE_SIZE]);

impl PreImage {
    /// Samples a fresh random secret
    pub fn random() -> Self {
        PreImage(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; PRE_IMAGE_SIZE] {
        &self.0
    }
}

/// RIPEMD160(SHA256(pre_image)) - the hash pinned into both chains
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretHash(pub [u8; SECRET_HASH_SIZE]);

impl SecretHash {
    pub fn from_pre_image(pre_image: &PreImage) -> Self {
        let sha = Sha256::digest(pre_image.as_bytes());
        let ripe = Ripemd160::digest(&sha);
        let mut out = [0u8; SECRET_HASH_SIZE];
        out.copy_from_slice(&ripe);
        SecretHash(out)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_HASH_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// =============================================================================
// Kernel Identifier
// =============================================================================

/// Kernel identifier, stable from the moment the kernel message exists
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelId(pub [u8; 32]);

impl KernelId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// =============================================================================
// Inputs / Outputs
// =============================================================================

/// Transaction input: a reference to an unspent commitment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub commitment: PedersenCommitment,
}

/// Transaction output: a freshly created commitment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub commitment: PedersenCommitment,
}

// =============================================================================
// Kernel
// =============================================================================

/// Aggregate signature object of a HELIO transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxKernel {
    pub fee: u64,
    pub min_height: u64,
    pub max_height: u64,
    /// Combined public excess of both signers
    pub excess: CompressedPoint,
    pub signature: SchnorrSignature,
    /// Image the spender must open to make the kernel valid
    pub hash_lock: Option<SecretHash>,
    /// Pre-image, present only in the broadcast form of a locked kernel
    pub pre_image: Option<PreImage>,
}

impl TxKernel {
    pub fn new(fee: u64, min_height: u64, max_height: u64) -> Self {
        TxKernel {
            fee,
            min_height,
            max_height,
            excess: CompressedPoint::identity(),
            signature: SchnorrSignature::default(),
            hash_lock: None,
            pre_image: None,
        }
    }

    /// Message both peers sign. Commits to everything except the signature
    /// and the pre-image: the co-signer of a locked kernel signs without
    /// knowing the secret.
    pub fn message(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"hvk.msg");
        hasher.update(&self.fee.to_be_bytes());
        hasher.update(&self.min_height.to_be_bytes());
        hasher.update(&self.max_height.to_be_bytes());
        hasher.update(&self.excess.as_bytes());
        match &self.hash_lock {
            Some(image) => {
                hasher.update(&[1u8]);
                hasher.update(image.as_bytes());
            }
            None => hasher.update(&[0u8]),
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    pub fn id(&self) -> KernelId {
        let mut hasher = Sha256::new();
        hasher.update(b"hvk.id");
        hasher.update(&self.message());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        KernelId(out)
    }

    pub fn is_valid(&self) -> bool {
        if self.min_height > self.max_height {
            return false;
        }
        if let Some(image) = &self.hash_lock {
            match &self.pre_image {
                Some(secret) => {
                    if SecretHash::from_pre_image(secret) != *image {
                        return false;
                    }
                }
                None => return false,
            }
        }
        self.signature.is_valid(&self.message(), &self.excess)
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernel: TxKernel,
    /// Combined kernel offset of both peers
    pub offset: Scalar,
}

impl Transaction {
    /// Sorts inputs and outputs into canonical order
    pub fn normalize(&mut self) {
        self.inputs.sort_by_key(|i| i.commitment.as_bytes());
        self.outputs.sort_by_key(|o| o.commitment.as_bytes());
    }

    /// Full stand-alone validation: kernel signature, hash lock opening and
    /// the commitment balance equation.
    pub fn is_valid(&self) -> Result<(), String> {
        if !self.kernel.is_valid() {
            return Err("kernel signature invalid".to_string());
        }

        // sum(outputs) - sum(inputs) + fee*H must equal excess + offset*G
        let mut lhs = PedersenCommitment::commit(self.kernel.fee, &Scalar::zero());
        for output in &self.outputs {
            lhs = lhs.add(&output.commitment);
        }
        for input in &self.inputs {
            lhs = lhs.sub(&input.commitment);
        }

        let rhs = PedersenCommitment::commit_with_point(0, &self.kernel.excess)
            .add(&PedersenCommitment::commit_with_point(0, &self.offset.mul_g()));

        if lhs.as_bytes() != rhs.as_bytes() {
            return Err("transaction does not balance".to_string());
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{challenge, sign_partial};

    fn signed_kernel(fee: u64, excess_sk: &Scalar, hash_lock: Option<SecretHash>) -> TxKernel {
        let mut kernel = TxKernel::new(fee, 10, 100);
        kernel.hash_lock = hash_lock;
        kernel.excess = excess_sk.mul_g();

        let nonce = Scalar::random();
        let message = kernel.message();
        let s = sign_partial(&message, excess_sk, &nonce, &nonce.mul_g(), &kernel.excess);
        kernel.signature = SchnorrSignature {
            nonce_pub: nonce.mul_g(),
            k: s,
        };
        kernel
    }

    #[test]
    fn test_secret_hash() {
        let secret = PreImage::random();
        let image = SecretHash::from_pre_image(&secret);

        assert_eq!(image, SecretHash::from_pre_image(&secret));

        let other = PreImage::random();
        assert_ne!(image, SecretHash::from_pre_image(&other));
    }

    #[test]
    fn test_kernel_id_independent_of_signature() {
        let x = Scalar::random();
        let mut kernel = signed_kernel(5, &x, None);
        let id = kernel.id();

        kernel.signature = SchnorrSignature::default();
        assert_eq!(id, kernel.id());
    }

    #[test]
    fn test_locked_kernel_requires_pre_image() {
        let x = Scalar::random();
        let secret = PreImage::random();
        let image = SecretHash::from_pre_image(&secret);

        let mut kernel = signed_kernel(0, &x, Some(image));
        assert!(!kernel.is_valid());

        kernel.pre_image = Some(secret);
        assert!(kernel.is_valid());

        kernel.pre_image = Some(PreImage::random());
        assert!(!kernel.is_valid());
    }

    #[test]
    fn test_transaction_balance() {
        // single input of 10, output of 9, fee 1
        let fee = 1u64;
        let in_blind = Scalar::random();
        let out_blind = Scalar::random();
        let offset = Scalar::random();

        // x = out_blind - in_blind - offset
        let excess_sk = out_blind.sub(&in_blind).sub(&offset);
        let kernel = signed_kernel(fee, &excess_sk, None);

        let mut tx = Transaction {
            inputs: vec![Input {
                commitment: PedersenCommitment::commit(10, &in_blind),
            }],
            outputs: vec![Output {
                commitment: PedersenCommitment::commit(9, &out_blind),
            }],
            kernel,
            offset,
        };
        tx.normalize();

        assert!(tx.is_valid().is_ok());

        // stealing a unit breaks the balance equation
        tx.outputs[0].commitment = PedersenCommitment::commit(10, &out_blind);
        assert!(tx.is_valid().is_err());
    }

    #[test]
    fn test_normalize_sorts() {
        let a = Input {
            commitment: PedersenCommitment::commit(1, &Scalar::random()),
        };
        let b = Input {
            commitment: PedersenCommitment::commit(2, &Scalar::random()),
        };
        let mut tx = Transaction {
            inputs: vec![a, b],
            outputs: vec![],
            kernel: TxKernel::new(0, 0, 10),
            offset: Scalar::zero(),
        };
        tx.normalize();
        assert!(tx.inputs[0].commitment.as_bytes() <= tx.inputs[1].commitment.as_bytes());
    }
}
