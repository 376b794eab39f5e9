/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [App] trait: the hooks through which an application contributes to, and learns the outcome of,
//! collective signing rounds.

use crate::signing::{merkle::Proof, signature::CollectiveSignature};
use crate::types::{basic::ViewNumber, vote::Vote};

/// Methods that a type needs to implement to take part in collective signing.
///
/// All methods are called from the node's dispatch thread and should return promptly; a slow hook delays
/// the round past its phase deadlines and gets this node excluded.
pub trait App: Send + 'static {
    /// Called in the Commit phase of every signing round in Merkle mode. The returned bytes (typically the
    /// root of the application's own Merkle tree of pending messages) become this node's leaf in the round's
    /// Merkle tree. Return `None` to contribute no leaf.
    fn commit(&mut self, view: ViewNumber) -> Option<Vec<u8>>;

    /// Called in the Challenge phase of a signing round in Merkle mode, if this node contributed a leaf.
    ///
    /// `client_root` is the leaf returned by [commit](Self::commit), `collective_root` the Merkle root the
    /// whole tree is signing, and `proof` links one to the other (see
    /// [check_proof](crate::signing::merkle::check_proof)).
    fn done(&mut self, view: ViewNumber, client_root: &[u8], collective_root: &[u8], proof: &Proof);

    /// Called on the root when a round (signing or voting) has completed.
    fn round_done(&mut self, _view: ViewNumber, _signature: &CollectiveSignature) {}

    /// Decide whether to approve a proposed vote. Approves everything by default.
    fn accept_vote(&mut self, _vote: &Vote) -> bool {
        true
    }
}
