/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The state a node keeps for one round while the round is in flight.

use std::collections::HashMap;
use std::time::Instant;

use crate::types::{
    basic::{NodeName, RoundNumber, ViewNumber},
    suite::Suite,
    vote::{Vote, VoteKind},
};

use super::merkle::{CombinedTree, Proof};

/// What a round is signing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoundType {
    Signing,
    ViewChange,
    Add,
    Remove,
    Shutdown,
    NoOp,
}

impl From<&VoteKind> for RoundType {
    fn from(kind: &VoteKind) -> Self {
        match kind {
            VoteKind::ViewChange(_) => RoundType::ViewChange,
            VoteKind::Add(_) => RoundType::Add,
            VoteKind::Remove(_) => RoundType::Remove,
            VoteKind::Shutdown => RoundType::Shutdown,
            VoteKind::NoOp => RoundType::NoOp,
        }
    }
}

/// How signing rounds build the message they sign.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SigningMode {
    /// Sign the root of a Merkle tree over every node's application leaf.
    #[default]
    MerkleTree,
    /// Sign the message carried in the announcement.
    PubKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RoundPhase {
    Announced,
    Committed,
    Challenged,
    Responded,
}

/// What a child contributed in the Commit phase.
#[derive(Clone, Debug)]
pub(crate) struct ChildCommit<S: Suite> {
    pub(crate) v_hat: S::Point,
    pub(crate) x_hat: S::Point,
    pub(crate) mt_root: Vec<u8>,
}

/// What a child contributed in the Respond phase.
#[derive(Clone, Debug)]
pub(crate) struct ChildResponse<S: Suite> {
    pub(crate) r_hat: S::Scalar,
    pub(crate) exception_list: Vec<S::Point>,
    pub(crate) exception_v_hat: S::Point,
    pub(crate) exception_x_hat: S::Point,
}

pub(crate) struct Round<S: Suite> {
    pub(crate) number: RoundNumber,
    pub(crate) view: ViewNumber,
    pub(crate) round_type: RoundType,
    pub(crate) phase: RoundPhase,
    pub(crate) log_test: Vec<u8>,
    pub(crate) vote: Option<Vote>,

    // Commit.
    pub(crate) v: S::Scalar,
    pub(crate) big_v: S::Point,
    pub(crate) v_hat: S::Point,
    pub(crate) x_hat: S::Point,
    pub(crate) commits: HashMap<NodeName, ChildCommit<S>>,
    pub(crate) commit_exceptions: Vec<S::Point>,
    pub(crate) commit_deadline: Instant,

    // Merkle.
    pub(crate) local_leaf: Option<Vec<u8>>,
    pub(crate) tree: Option<CombinedTree>,
    pub(crate) child_proofs: HashMap<NodeName, Proof>,
    pub(crate) local_proof: Option<Proof>,
    pub(crate) mt_root: Vec<u8>,

    // Challenge and response.
    pub(crate) signed_message: Vec<u8>,
    pub(crate) c: Option<S::Scalar>,
    pub(crate) r: Option<S::Scalar>,
    pub(crate) r_hat: Option<S::Scalar>,
    pub(crate) responses: HashMap<NodeName, ChildResponse<S>>,
    pub(crate) response_deadline: Option<Instant>,
    pub(crate) exception_list: Vec<S::Point>,
    pub(crate) exception_v_hat: S::Point,
    pub(crate) exception_x_hat: S::Point,
}

impl<S: Suite> Round<S> {
    pub(crate) fn new(
        suite: &S,
        number: RoundNumber,
        view: ViewNumber,
        log_test: Vec<u8>,
        vote: Option<Vote>,
        v: S::Scalar,
        public_key: &S::Point,
        commit_deadline: Instant,
    ) -> Round<S> {
        let big_v = suite.base_mul(&v);
        let round_type = vote
            .as_ref()
            .map_or(RoundType::Signing, |vote| RoundType::from(&vote.kind));
        Round {
            number,
            view,
            round_type,
            phase: RoundPhase::Announced,
            log_test,
            vote,
            v,
            v_hat: big_v.clone(),
            big_v,
            x_hat: public_key.clone(),
            commits: HashMap::new(),
            commit_exceptions: Vec::new(),
            commit_deadline,
            local_leaf: None,
            tree: None,
            child_proofs: HashMap::new(),
            local_proof: None,
            mt_root: Vec::new(),
            signed_message: Vec::new(),
            c: None,
            r: None,
            r_hat: None,
            responses: HashMap::new(),
            response_deadline: None,
            exception_list: Vec::new(),
            exception_v_hat: suite.null_point(),
            exception_x_hat: suite.null_point(),
        }
    }

    pub(crate) fn is_vote_round(&self) -> bool {
        self.vote.is_some()
    }

    /// Whether `child` made it into this node's aggregates in the Commit phase.
    pub(crate) fn committed(&self, child: &NodeName) -> bool {
        self.commits.contains_key(child)
    }

    /// Re-derive the Merkle root from the recorded leaves and proofs.
    pub(crate) fn check_local_proofs(&self, suite: &S) -> bool {
        match &self.tree {
            Some(tree) => tree.root == self.mt_root && tree.check_local_proofs(suite),
            None => true,
        }
    }
}
