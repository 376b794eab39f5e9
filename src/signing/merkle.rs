/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Merkle accountability: every node folds its children's Merkle roots and its own application leaf into
//! a tree, and hands each child the proof that links the child's root to the collective root.
//!
//! ## Layout of a node's tree
//!
//! ```text
//!                 mt_root = H(leaves_root || hashed_log)
//!                /                                       \
//!         leaves_root                                 hashed_log = H(V || V_hat)
//!       /     |      \
//!   child   child   app leaf       (sorted, binary tree, odd nodes promoted)
//! ```
//!
//! ## Proofs
//!
//! A [Proof] is a list of [ProofStep]s ordered from the root down to the leaf. Each step holds the two
//! hashes whose concatenation hashes to the level above. This makes the proof of a child's leaf inside
//! the collective tree simply `base_proof ++ segment`, where `base_proof` is what this node received from
//! its parent and `segment` is the path inside this node's own tree.

use std::collections::HashMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{basic::NodeName, suite::Suite};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProofStep {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
}

pub type Proof = Vec<ProofStep>;

/// Build a binary Merkle tree over `leaves` in the given order. Returns the root and, for every leaf, its
/// proof (root first). Odd nodes are promoted to the next level unchanged. No leaves hash to `H("")`.
pub fn proof_tree<S: Suite>(suite: &S, leaves: &[Vec<u8>]) -> (Vec<u8>, Vec<Proof>) {
    if leaves.is_empty() {
        return (suite.hash(&[]), Vec::new());
    }

    let mut level: Vec<Vec<u8>> = leaves.to_vec();
    let mut positions: Vec<usize> = (0..leaves.len()).collect();
    let mut paths: Vec<Proof> = vec![Vec::new(); leaves.len()];

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    let step_position = next.len();
                    for (leaf, position) in positions.iter().enumerate() {
                        if position / 2 == step_position {
                            paths[leaf].push(ProofStep {
                                left: left.clone(),
                                right: right.clone(),
                            });
                        }
                    }
                    next.push(suite.hash(&[left, right]));
                }
                [single] => next.push(single.clone()),
                _ => unreachable!(),
            }
        }
        positions.iter_mut().for_each(|position| *position /= 2);
        level = next;
    }

    paths.iter_mut().for_each(|path| path.reverse());
    (level.remove(0), paths)
}

/// Recompute the root from `leaf` along `proof` and compare it to `root`.
pub fn check_proof<S: Suite>(suite: &S, root: &[u8], leaf: &[u8], proof: &[ProofStep]) -> bool {
    let mut current = leaf.to_vec();
    for step in proof.iter().rev() {
        if current != step.left && current != step.right {
            return false;
        }
        current = suite.hash(&[&step.left, &step.right]);
    }
    current == root
}

/// Check that every leaf's proof leads to `root`.
pub fn check_local_proofs<S: Suite>(suite: &S, root: &[u8], leaves: &[Vec<u8>], proofs: &[Proof]) -> bool {
    leaves.len() == proofs.len()
        && leaves
            .iter()
            .zip(proofs)
            .all(|(leaf, proof)| check_proof(suite, root, leaf, proof))
}

/// Root of a node's whole tree: its leaves' root on the left, its round log hash on the right.
pub fn combined_root<S: Suite>(suite: &S, leaves_root: &[u8], hashed_log: &[u8]) -> Vec<u8> {
    suite.hash(&[leaves_root, hashed_log])
}

/// Hash of a round's log: the node's own commitment followed by its subtree's aggregate commitment.
pub fn hash_log<S: Suite>(suite: &S, v: &S::Point, v_hat: &S::Point) -> Vec<u8> {
    suite.hash(&[&suite.encode_point(v), &suite.encode_point(v_hat)])
}

/// A node's whole tree for one round: sorted leaves, the root of the leaves, the round log hash on the
/// right, and full proofs (top step included) for every leaf.
#[derive(Clone, Debug, Default)]
pub struct CombinedTree {
    pub leaves: Vec<Vec<u8>>,
    pub leaves_root: Vec<u8>,
    pub hashed_log: Vec<u8>,
    pub root: Vec<u8>,
    pub proofs: Vec<Proof>,
}

impl CombinedTree {
    pub fn build<S: Suite>(suite: &S, mut leaves: Vec<Vec<u8>>, hashed_log: Vec<u8>) -> CombinedTree {
        leaves.sort();
        let (leaves_root, leaf_proofs) = proof_tree(suite, &leaves);
        let root = combined_root(suite, &leaves_root, &hashed_log);
        let top = ProofStep {
            left: leaves_root.clone(),
            right: hashed_log.clone(),
        };
        let proofs = leaf_proofs
            .into_iter()
            .map(|path| std::iter::once(top.clone()).chain(path).collect())
            .collect();
        CombinedTree {
            leaves,
            leaves_root,
            hashed_log,
            root,
            proofs,
        }
    }

    /// The segment of the proof that leads from this tree's root to `leaf`.
    pub fn proof_for(&self, leaf: &[u8]) -> Option<&Proof> {
        let index = self.leaves.iter().position(|l| l == leaf)?;
        self.proofs.get(index)
    }

    /// Locate each child's segment by the sub-root it committed.
    pub fn separate_proofs<'a>(
        &self,
        child_roots: impl IntoIterator<Item = (&'a NodeName, &'a Vec<u8>)>,
    ) -> HashMap<NodeName, Proof> {
        child_roots
            .into_iter()
            .filter_map(|(child, root)| Some((child.clone(), self.proof_for(root)?.clone())))
            .collect()
    }

    pub fn check_local_proofs<S: Suite>(&self, suite: &S) -> bool {
        check_local_proofs(suite, &self.root, &self.leaves, &self.proofs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::suite::Ristretto255;

    fn leaves(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i; 4]).collect()
    }

    #[test]
    fn every_leaf_proves_into_root() {
        let suite = Ristretto255;
        for n in 1..=9 {
            let leaves = leaves(n);
            let (root, proofs) = proof_tree(&suite, &leaves);
            assert!(check_local_proofs(&suite, &root, &leaves, &proofs), "{} leaves", n);
        }
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let suite = Ristretto255;
        let (root, proofs) = proof_tree(&suite, &[b"only".to_vec()]);
        assert_eq!(root, b"only".to_vec());
        assert_eq!(proofs, vec![Vec::new()]);
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let suite = Ristretto255;
        let leaves = leaves(5);
        let (root, mut proofs) = proof_tree(&suite, &leaves);
        assert!(!check_proof(&suite, &root, b"stranger", &proofs[0]));
        proofs[2][0].left[0] ^= 1;
        assert!(!check_proof(&suite, &root, &leaves[2], &proofs[2]));
    }

    #[test]
    fn base_proof_extends_through_nested_trees() {
        let suite = Ristretto255;
        let child = CombinedTree::build(&suite, vec![b"child app".to_vec()], b"child log".to_vec());
        let parent = CombinedTree::build(
            &suite,
            vec![b"parent app".to_vec(), child.root.clone()],
            b"parent log".to_vec(),
        );
        assert!(parent.check_local_proofs(&suite));

        let child_name = NodeName::new("child");
        let base = parent.separate_proofs([(&child_name, &child.root)]).remove(&child_name).unwrap();
        let full: Proof = base
            .iter()
            .chain(child.proof_for(b"child app").unwrap())
            .cloned()
            .collect();
        assert!(check_proof(&suite, &parent.root, b"child app", &full));
    }

    #[test]
    fn leaf_order_does_not_change_root() {
        let suite = Ristretto255;
        let mut reversed = leaves(4);
        reversed.reverse();
        let a = CombinedTree::build(&suite, leaves(4), b"log".to_vec());
        let b = CombinedTree::build(&suite, reversed, b"log".to_vec());
        assert_eq!(a.root, b.root);
    }
}
