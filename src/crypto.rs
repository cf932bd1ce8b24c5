// =============================================================================
// HELIOCOIN v1.6 - Curve Primitives
// =============================================================================
//
// Scalars, curve points and Pedersen commitments over curve25519 (Ristretto),
// plus the two-party Schnorr signing used by negotiated kernels:
//
//   C = v*H + b*G                         (commitment)
//   e = H(R_A + R_B || X_A + X_B || msg)  (challenge)
//   s_i = r_i + e * x_i                   (partial signature)
//   sig = (s_A + s_B, R_A + R_B)          (combined)
//
// Neither peer ever sees the other's secret scalar; only public shares and
// partial signatures cross the wire.
//
// =============================================================================

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar as DalekScalar;
use curve25519_dalek::traits::Identity;
use serde::{Serialize, Deserialize, Serializer, Deserializer};
use sha3::{Sha3_512, Digest};
use rand::RngCore;

// =============================================================================
// Generators
// =============================================================================

/// Generator pair for Pedersen commitments
pub struct Generators {
    /// G: standard basepoint (blinding factors, excess, nonces)
    pub g: RistrettoPoint,
    /// H: second generator (committed values)
    pub h: RistrettoPoint,
}

impl Generators {
    pub fn new() -> Self {
        let g = RISTRETTO_BASEPOINT_POINT;
        // H is derived by hashing a fixed tag to the curve so that nobody
        // knows its discrete log with respect to G
        let h = Self::derive_h();
        Generators { g, h }
    }

    fn derive_h() -> RistrettoPoint {
        let mut hasher = Sha3_512::new();
        hasher.update(b"Heliocoin_Pedersen_H_v1");
        let hash = hasher.finalize();
        RistrettoPoint::hash_from_bytes::<Sha3_512>(&hash)
    }
}

impl Default for Generators {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    pub static ref GENERATORS: Generators = Generators::new();
}

// =============================================================================
// Scalar
// =============================================================================

/// 256-bit scalar of the curve
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scalar(DalekScalar);

impl Scalar {
    pub fn zero() -> Self {
        Scalar(DalekScalar::ZERO)
    }

    pub fn one() -> Self {
        Scalar(DalekScalar::ONE)
    }

    pub fn from_u64(value: u64) -> Self {
        Scalar(DalekScalar::from(value))
    }

    /// Samples a uniformly random scalar
    pub fn random() -> Self {
        let mut bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        Scalar(DalekScalar::from_bytes_mod_order_wide(&bytes))
    }

    pub fn from_bytes_mod_order(bytes: &[u8; 32]) -> Self {
        Scalar(DalekScalar::from_bytes_mod_order(*bytes))
    }

    pub fn from_canonical_bytes(bytes: &[u8; 32]) -> Option<Self> {
        DalekScalar::from_canonical_bytes(*bytes)
            .map(Scalar)
            .into()
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn add(&self, other: &Scalar) -> Self {
        Scalar(self.0 + other.0)
    }

    pub fn sub(&self, other: &Scalar) -> Self {
        Scalar(self.0 - other.0)
    }

    pub fn mul(&self, other: &Scalar) -> Self {
        Scalar(self.0 * other.0)
    }

    pub fn neg(&self) -> Self {
        Scalar(-self.0)
    }

    /// Public image of this scalar: self * G
    pub fn mul_g(&self) -> CompressedPoint {
        CompressedPoint::from_point(&(self.0 * GENERATORS.g))
    }

    pub fn inner(&self) -> &DalekScalar {
        &self.0
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Scalar::from_u64(value)
    }
}

impl Serialize for Scalar {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = self.as_bytes();
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("Invalid scalar length"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Scalar::from_bytes_mod_order(&arr))
    }
}

// =============================================================================
// Compressed Point
// =============================================================================

/// Compressed curve point (32 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressedPoint(CompressedRistretto);

impl CompressedPoint {
    pub fn identity() -> Self {
        CompressedPoint(RistrettoPoint::identity().compress())
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        let compressed = CompressedRistretto::from_slice(bytes).ok()?;
        if compressed.decompress().is_some() {
            Some(CompressedPoint(compressed))
        } else {
            None
        }
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn decompress(&self) -> Option<RistrettoPoint> {
        self.0.decompress()
    }

    pub fn from_point(point: &RistrettoPoint) -> Self {
        CompressedPoint(point.compress())
    }

    /// Point addition over decompressed representations
    pub fn add(&self, other: &CompressedPoint) -> Self {
        let p1 = self.decompress().unwrap_or_else(RistrettoPoint::identity);
        let p2 = other.decompress().unwrap_or_else(RistrettoPoint::identity);
        CompressedPoint::from_point(&(p1 + p2))
    }

    pub fn sub(&self, other: &CompressedPoint) -> Self {
        let p1 = self.decompress().unwrap_or_else(RistrettoPoint::identity);
        let p2 = other.decompress().unwrap_or_else(RistrettoPoint::identity);
        CompressedPoint::from_point(&(p1 - p2))
    }
}

impl Serialize for CompressedPoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = self.as_bytes();
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for CompressedPoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("Invalid point length"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        CompressedPoint::from_bytes(&arr)
            .ok_or_else(|| serde::de::Error::custom("Invalid curve point"))
    }
}

impl Default for CompressedPoint {
    fn default() -> Self {
        Self::identity()
    }
}

// =============================================================================
// Pedersen Commitment
// =============================================================================

/// Pedersen commitment C = v*H + b*G
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PedersenCommitment {
    point: CompressedPoint,
}

impl PedersenCommitment {
    pub fn zero() -> Self {
        PedersenCommitment {
            point: CompressedPoint::identity(),
        }
    }

    /// C = value * H + blinding * G
    pub fn commit(value: u64, blinding: &Scalar) -> Self {
        let v = DalekScalar::from(value);
        let point = v * GENERATORS.h + blinding.0 * GENERATORS.g;
        PedersenCommitment {
            point: CompressedPoint::from_point(&point),
        }
    }

    /// Commitment with an externally supplied blinding point:
    /// C = value * H + blinding_point. Used for the joint output where the
    /// full blinding scalar is split between the peers.
    pub fn commit_with_point(value: u64, blinding_point: &CompressedPoint) -> Self {
        let v = DalekScalar::from(value);
        let bp = blinding_point
            .decompress()
            .unwrap_or_else(RistrettoPoint::identity);
        let point = v * GENERATORS.h + bp;
        PedersenCommitment {
            point: CompressedPoint::from_point(&point),
        }
    }

    pub fn add(&self, other: &PedersenCommitment) -> Self {
        PedersenCommitment {
            point: self.point.add(&other.point),
        }
    }

    pub fn sub(&self, other: &PedersenCommitment) -> Self {
        PedersenCommitment {
            point: self.point.sub(&other.point),
        }
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.point.as_bytes()
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        CompressedPoint::from_bytes(bytes).map(|point| PedersenCommitment { point })
    }

    pub fn compressed(&self) -> &CompressedPoint {
        &self.point
    }

    pub fn verify_opening(&self, value: u64, blinding: &Scalar) -> bool {
        let expected = Self::commit(value, blinding);
        self.point == expected.point
    }
}

impl Serialize for PedersenCommitment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.point.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PedersenCommitment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let point = CompressedPoint::deserialize(deserializer)?;
        Ok(PedersenCommitment { point })
    }
}

impl Default for PedersenCommitment {
    fn default() -> Self {
        Self::zero()
    }
}

// =============================================================================
// Hashing to Scalars
// =============================================================================

/// Hashes domain-separated byte strings to a scalar (wide reduction)
pub fn hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha3_512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(&(part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hash);
    Scalar(DalekScalar::from_bytes_mod_order_wide(&wide))
}

/// Derives the kernel signing nonce for a context from a stored random seed.
/// The seed is persisted raw; the nonce itself is never stored.
pub fn derive_nonce(seed: &[u8; 32], context: &[u8]) -> Scalar {
    hash_to_scalar(b"heliovault.kernel.nonce", &[&seed[..], context])
}

// =============================================================================
// Two-Party Schnorr Signing
// =============================================================================

/// Aggregate Schnorr signature carried by a kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    /// Sum of both peers' public nonces
    pub nonce_pub: CompressedPoint,
    /// Sum of both peers' signature scalars
    pub k: Scalar,
}

impl SchnorrSignature {
    /// Verifies the combined signature against the combined public excess
    pub fn is_valid(&self, message: &[u8; 32], public_excess: &CompressedPoint) -> bool {
        let e = challenge(&self.nonce_pub, public_excess, message);
        // k*G == R + e*X
        let lhs = self.k.0 * GENERATORS.g;
        let r = match self.nonce_pub.decompress() {
            Some(p) => p,
            None => return false,
        };
        let x = match public_excess.decompress() {
            Some(p) => p,
            None => return false,
        };
        lhs == r + e.0 * x
    }
}

impl Default for SchnorrSignature {
    fn default() -> Self {
        SchnorrSignature {
            nonce_pub: CompressedPoint::identity(),
            k: Scalar::zero(),
        }
    }
}

/// Challenge e = H(R_sum || X_sum || message)
pub fn challenge(
    nonce_sum: &CompressedPoint,
    excess_sum: &CompressedPoint,
    message: &[u8; 32],
) -> Scalar {
    let nonce_bytes = nonce_sum.as_bytes();
    let excess_bytes = excess_sum.as_bytes();
    hash_to_scalar(
        b"heliovault.kernel.challenge",
        &[&nonce_bytes[..], &excess_bytes[..], &message[..]],
    )
}

/// Produces this peer's signature share s = r + e*x
pub fn sign_partial(
    message: &[u8; 32],
    excess: &Scalar,
    nonce: &Scalar,
    nonce_sum: &CompressedPoint,
    excess_sum: &CompressedPoint,
) -> Scalar {
    let e = challenge(nonce_sum, excess_sum, message);
    nonce.add(&e.mul(excess))
}

/// Checks a peer's signature share: s*G == R_peer + e*X_peer
pub fn verify_partial(
    partial: &Scalar,
    message: &[u8; 32],
    nonce_sum: &CompressedPoint,
    excess_sum: &CompressedPoint,
    peer_public_nonce: &CompressedPoint,
    peer_public_excess: &CompressedPoint,
) -> bool {
    let e = challenge(nonce_sum, excess_sum, message);
    let lhs = partial.0 * GENERATORS.g;
    let r = match peer_public_nonce.decompress() {
        Some(p) => p,
        None => return false,
    };
    let x = match peer_public_excess.decompress() {
        Some(p) => p,
        None => return false,
    };
    lhs == r + e.0 * x
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_verify() {
        let value = 100u64;
        let blinding = Scalar::random();

        let commitment = PedersenCommitment::commit(value, &blinding);

        assert!(commitment.verify_opening(value, &blinding));
        assert!(!commitment.verify_opening(101, &blinding));

        let wrong_blind = Scalar::random();
        assert!(!commitment.verify_opening(value, &wrong_blind));
    }

    #[test]
    fn test_homomorphic_addition() {
        let a = 100u64;
        let b = 50u64;
        let r1 = Scalar::random();
        let r2 = Scalar::random();
        let r3 = r1.add(&r2);

        let c1 = PedersenCommitment::commit(a, &r1);
        let c2 = PedersenCommitment::commit(b, &r2);
        let c3 = PedersenCommitment::commit(a + b, &r3);

        assert_eq!(c1.add(&c2).as_bytes(), c3.as_bytes());
    }

    #[test]
    fn test_commit_with_split_blinding() {
        // the joint output commitment reconstructs identically from either
        // peer's view: own scalar share plus the other's public share
        let value = 300u64;
        let share_a = Scalar::random();
        let share_b = Scalar::random();

        let full = PedersenCommitment::commit(value, &share_a.add(&share_b));

        let from_a = PedersenCommitment::commit(value, &share_a)
            .add(&PedersenCommitment::commit_with_point(0, &share_b.mul_g()));
        let from_b = PedersenCommitment::commit(value, &share_b)
            .add(&PedersenCommitment::commit_with_point(0, &share_a.mul_g()));

        assert_eq!(full.as_bytes(), from_a.as_bytes());
        assert_eq!(full.as_bytes(), from_b.as_bytes());
    }

    #[test]
    fn test_nonce_derivation_is_stable() {
        let seed = [7u8; 32];
        let n1 = derive_nonce(&seed, b"ctx-1");
        let n2 = derive_nonce(&seed, b"ctx-1");
        let n3 = derive_nonce(&seed, b"ctx-2");

        assert_eq!(n1.as_bytes(), n2.as_bytes());
        assert_ne!(n1.as_bytes(), n3.as_bytes());
    }

    #[test]
    fn test_two_party_schnorr() {
        let message = [0x42u8; 32];

        // each peer holds a secret excess and nonce
        let x_a = Scalar::random();
        let x_b = Scalar::random();
        let r_a = Scalar::random();
        let r_b = Scalar::random();

        let nonce_sum = r_a.mul_g().add(&r_b.mul_g());
        let excess_sum = x_a.mul_g().add(&x_b.mul_g());

        let s_a = sign_partial(&message, &x_a, &r_a, &nonce_sum, &excess_sum);
        let s_b = sign_partial(&message, &x_b, &r_b, &nonce_sum, &excess_sum);

        // partial verification catches the right and wrong shares
        assert!(verify_partial(&s_a, &message, &nonce_sum, &excess_sum, &r_a.mul_g(), &x_a.mul_g()));
        assert!(verify_partial(&s_b, &message, &nonce_sum, &excess_sum, &r_b.mul_g(), &x_b.mul_g()));
        assert!(!verify_partial(&s_a, &message, &nonce_sum, &excess_sum, &r_b.mul_g(), &x_b.mul_g()));

        let sig = SchnorrSignature {
            nonce_pub: nonce_sum,
            k: s_a.add(&s_b),
        };
        assert!(sig.is_valid(&message, &excess_sum));

        // a different message must not verify
        let other = [0x43u8; 32];
        assert!(!sig.is_valid(&other, &excess_sum));
    }

    #[test]
    fn test_tampered_partial_rejected() {
        let message = [9u8; 32];
        let x = Scalar::random();
        let r = Scalar::random();
        let nonce_sum = r.mul_g();
        let excess_sum = x.mul_g();

        let s = sign_partial(&message, &x, &r, &nonce_sum, &excess_sum);
        let bad = s.add(&Scalar::one());

        assert!(!verify_partial(&bad, &message, &nonce_sum, &excess_sum, &r.mul_g(), &x.mul_g()));
    }

    #[test]
    fn test_point_serialization_roundtrip() {
        let s = Scalar::random();
        let p = s.mul_g();
        let bytes = p.as_bytes();
        let back = CompressedPoint::from_bytes(&bytes).unwrap();
        assert_eq!(p, back);
    }
}
