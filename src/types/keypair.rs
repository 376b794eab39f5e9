/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [Keypair] type as an object used to sign messages and access the public key, and
//! for [SchnorrSignature], the individual signature nodes attach to their votes.

use borsh::{BorshDeserialize, BorshSerialize};
use rand_core::{CryptoRng, RngCore};

use super::suite::Suite;

/// A secret scalar `x` of a [Suite] together with its public point `X = g^x`.
#[derive(Clone)]
pub struct Keypair<S: Suite> {
    secret: S::Scalar,
    public: S::Point,
}

impl<S: Suite> Keypair<S> {
    pub fn new(suite: &S, secret: S::Scalar) -> Keypair<S> {
        let public = suite.base_mul(&secret);
        Keypair { secret, public }
    }

    pub fn generate<R: RngCore + CryptoRng>(suite: &S, rng: &mut R) -> Keypair<S> {
        Self::new(suite, suite.random_scalar(rng))
    }

    pub fn public(&self) -> &S::Point {
        &self.public
    }

    pub(crate) fn secret(&self) -> &S::Scalar {
        &self.secret
    }

    /// Deterministic per-`(context, message)` secret, used to seed round commitments and signature nonces.
    pub(crate) fn derive_scalar(&self, suite: &S, context: &[u8], message: &[u8]) -> S::Scalar {
        suite.hash_to_scalar(&[context, &suite.encode_scalar(&self.secret), message])
    }

    /// Convenience method for creating a Schnorr signature over a message represented as bytes.
    pub fn sign(&self, suite: &S, message: &[u8]) -> SchnorrSignature {
        let k = self.derive_scalar(suite, b"schnorr-nonce", message);
        let big_r = suite.base_mul(&k);
        let c = schnorr_challenge(suite, &big_r, &self.public, message);
        let r = suite.scalar_sub(&k, &suite.scalar_mul(&self.secret, &c));
        SchnorrSignature {
            challenge: suite.encode_scalar(&c),
            response: suite.encode_scalar(&r),
        }
    }
}

/// An individual Schnorr signature `(c, r)` with `c = H(g^r + c*X, X, message)`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SchnorrSignature {
    pub challenge: Vec<u8>,
    pub response: Vec<u8>,
}

impl SchnorrSignature {
    pub fn verify<S: Suite>(&self, suite: &S, public: &S::Point, message: &[u8]) -> bool {
        let (Some(c), Some(r)) = (
            suite.decode_scalar(&self.challenge),
            suite.decode_scalar(&self.response),
        ) else {
            return false;
        };
        let big_r = suite.point_add(&suite.base_mul(&r), &suite.point_mul(public, &c));
        schnorr_challenge(suite, &big_r, public, message) == c
    }
}

fn schnorr_challenge<S: Suite>(suite: &S, big_r: &S::Point, public: &S::Point, message: &[u8]) -> S::Scalar {
    suite.hash_to_scalar(&[
        &suite.encode_point(big_r),
        &suite.encode_point(public),
        message,
    ])
}
