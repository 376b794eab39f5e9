/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [cipher suite](Suite) abstraction that the signing protocol is written against, and its
//! [Ristretto255] implementation.
//!
//! The protocol only ever needs a prime-order group with a fixed generator, its scalar field, and a hash
//! function. Points and scalars cross the wire in their suite-specific byte encoding (see
//! [EncodedPoint](crate::messages::EncodedPoint) and [EncodedScalar](crate::messages::EncodedScalar)).
//!
//! Group operations are written additively: `g^v` in the literature is `base_mul(v)` here, and a product of
//! points is `point_add`.

use std::fmt::Debug;

use curve25519_dalek::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
    traits::Identity,
};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256, Sha512};

pub trait Suite: Clone + Send + Sync + 'static {
    type Point: Clone + PartialEq + Debug + Send + Sync + 'static;
    type Scalar: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Human readable name, used in logs.
    fn name(&self) -> &'static str;

    /// The identity element of the group.
    fn null_point(&self) -> Self::Point;

    /// The identity element of the scalar field's additive group.
    fn zero_scalar(&self) -> Self::Scalar;

    /// Multiply the suite's fixed generator by `scalar`.
    fn base_mul(&self, scalar: &Self::Scalar) -> Self::Point;

    fn point_mul(&self, point: &Self::Point, scalar: &Self::Scalar) -> Self::Point;

    fn point_add(&self, a: &Self::Point, b: &Self::Point) -> Self::Point;

    fn point_sub(&self, a: &Self::Point, b: &Self::Point) -> Self::Point;

    fn scalar_add(&self, a: &Self::Scalar, b: &Self::Scalar) -> Self::Scalar;

    fn scalar_sub(&self, a: &Self::Scalar, b: &Self::Scalar) -> Self::Scalar;

    fn scalar_mul(&self, a: &Self::Scalar, b: &Self::Scalar) -> Self::Scalar;

    fn random_scalar<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Self::Scalar;

    /// Hash a sequence of byte strings onto a scalar. Each part is length-prefixed, so `["ab", "c"]` and
    /// `["a", "bc"]` hash differently.
    fn hash_to_scalar(&self, parts: &[&[u8]]) -> Self::Scalar;

    /// Hash the plain concatenation of `parts`. This is the hash used for Merkle trees and round logs.
    fn hash(&self, parts: &[&[u8]]) -> Vec<u8>;

    fn encode_point(&self, point: &Self::Point) -> Vec<u8>;

    fn decode_point(&self, bytes: &[u8]) -> Option<Self::Point>;

    fn encode_scalar(&self, scalar: &Self::Scalar) -> Vec<u8>;

    fn decode_scalar(&self, bytes: &[u8]) -> Option<Self::Scalar>;

    /// Sum of `points`, or the null point if there are none.
    fn point_sum<'a, I>(&self, points: I) -> Self::Point
    where
        I: IntoIterator<Item = &'a Self::Point>,
    {
        points
            .into_iter()
            .fold(self.null_point(), |acc, point| self.point_add(&acc, point))
    }
}

/// The Ristretto prime-order group over Curve25519, with SHA-512 for hashing onto scalars and SHA-256 for
/// plain hashing.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ristretto255;

impl Suite for Ristretto255 {
    type Point = RistrettoPoint;
    type Scalar = Scalar;

    fn name(&self) -> &'static str {
        "Ristretto255"
    }

    fn null_point(&self) -> RistrettoPoint {
        RistrettoPoint::identity()
    }

    fn zero_scalar(&self) -> Scalar {
        Scalar::ZERO
    }

    fn base_mul(&self, scalar: &Scalar) -> RistrettoPoint {
        RistrettoPoint::mul_base(scalar)
    }

    fn point_mul(&self, point: &RistrettoPoint, scalar: &Scalar) -> RistrettoPoint {
        point * scalar
    }

    fn point_add(&self, a: &RistrettoPoint, b: &RistrettoPoint) -> RistrettoPoint {
        a + b
    }

    fn point_sub(&self, a: &RistrettoPoint, b: &RistrettoPoint) -> RistrettoPoint {
        a - b
    }

    fn scalar_add(&self, a: &Scalar, b: &Scalar) -> Scalar {
        a + b
    }

    fn scalar_sub(&self, a: &Scalar, b: &Scalar) -> Scalar {
        a - b
    }

    fn scalar_mul(&self, a: &Scalar, b: &Scalar) -> Scalar {
        a * b
    }

    fn random_scalar<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Scalar {
        Scalar::random(rng)
    }

    fn hash_to_scalar(&self, parts: &[&[u8]]) -> Scalar {
        let mut hasher = Sha512::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Scalar::from_hash(hasher)
    }

    fn hash(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }

    fn encode_point(&self, point: &RistrettoPoint) -> Vec<u8> {
        point.compress().to_bytes().to_vec()
    }

    fn decode_point(&self, bytes: &[u8]) -> Option<RistrettoPoint> {
        CompressedRistretto::from_slice(bytes).ok()?.decompress()
    }

    fn encode_scalar(&self, scalar: &Scalar) -> Vec<u8> {
        scalar.to_bytes().to_vec()
    }

    fn decode_scalar(&self, bytes: &[u8]) -> Option<Scalar> {
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Option::from(Scalar::from_canonical_bytes(bytes))
    }
}
