/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The output of a completed round, as seen by the root.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::{EncodedPoint, EncodedScalar};
use crate::types::{
    basic::{RoundNumber, ViewNumber},
    roster::Roster,
    suite::Suite,
};

/// An aggregate Schnorr signature over `message` by every node in the view except those whose keys are in
/// `exception_list`.
///
/// With `c = challenge`, `r = response`, `X = aggregate_public`, `V = commitment` and
/// `E = exception_commitment`, the signature is valid when `g^r + c*X + E == V` and `c == H(message, V)`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CollectiveSignature {
    pub view: ViewNumber,
    pub round: RoundNumber,
    pub message: Vec<u8>,
    pub challenge: EncodedScalar,
    pub response: EncodedScalar,
    pub commitment: EncodedPoint,
    pub aggregate_public: EncodedPoint,
    pub exception_list: Vec<EncodedPoint>,
    pub exception_commitment: EncodedPoint,
}

impl CollectiveSignature {
    pub fn verify<S: Suite>(&self, suite: &S) -> bool {
        let decoded = (|| {
            Some((
                self.challenge.decode(suite).ok()?,
                self.response.decode(suite).ok()?,
                self.commitment.decode(suite).ok()?,
                self.aggregate_public.decode(suite).ok()?,
                self.exception_commitment.decode(suite).ok()?,
            ))
        })();
        let Some((c, r, v_hat, x_hat, exception_v_hat)) = decoded else {
            return false;
        };

        let t = suite.point_add(
            &suite.point_add(&suite.base_mul(&r), &suite.point_mul(&x_hat, &c)),
            &exception_v_hat,
        );
        t == v_hat && challenge(suite, &self.message, &v_hat) == c
    }

    /// Like [verify](Self::verify), and additionally check that `aggregate_public` is exactly the sum of
    /// `public_keys` minus the excepted keys.
    pub fn verify_with_keys<'a, S: Suite>(
        &self,
        suite: &S,
        public_keys: impl IntoIterator<Item = &'a S::Point>,
    ) -> bool {
        let Ok(aggregate_public) = self.aggregate_public.decode(suite) else {
            return false;
        };
        let Ok(exceptions) = self
            .exception_list
            .iter()
            .map(|key| key.decode(suite))
            .collect::<Result<Vec<_>, _>>()
        else {
            return false;
        };
        let expected = suite.point_sub(&suite.point_sum(public_keys), &suite.point_sum(&exceptions));
        expected == aggregate_public && self.verify(suite)
    }

    /// [verify_with_keys](Self::verify_with_keys) over every key in the roster's host list.
    pub fn verify_with_roster<S: Suite>(&self, suite: &S, roster: &Roster<S>) -> bool {
        let keys: Vec<&S::Point> = roster
            .host_list()
            .iter()
            .filter_map(|name| roster.public_key(name))
            .collect();
        keys.len() == roster.len() && self.verify_with_keys(suite, keys)
    }
}

/// The Fiat-Shamir challenge `H(message, V_hat)`.
pub(crate) fn challenge<S: Suite>(suite: &S, message: &[u8], v_hat: &S::Point) -> S::Scalar {
    suite.hash_to_scalar(&[message, &suite.encode_point(v_hat)])
}
