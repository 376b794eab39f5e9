/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Votes: proposals that ride through a regular signing round, get counted on the way up, and are applied
//! by every node once the root has decided on them.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    basic::{NodeName, RoundNumber, ViewNumber, VoteIndex},
    keypair::SchnorrSignature,
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum VoteKind {
    ViewChange(ViewChangeVote),
    Add(AddVote),
    Remove(RemoveVote),
    Shutdown,
    NoOp,
}

impl VoteKind {
    pub fn is_view_change(&self) -> bool {
        matches!(self, VoteKind::ViewChange(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            VoteKind::ViewChange(_) => "ViewChange",
            VoteKind::Add(_) => "Add",
            VoteKind::Remove(_) => "Remove",
            VoteKind::Shutdown => "Shutdown",
            VoteKind::NoOp => "NoOp",
        }
    }
}

/// Move every node to `view`, rooted at `root`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChangeVote {
    pub view: ViewNumber,
    pub root: NodeName,
}

/// Admit `name` (with its encoded public key) to the host list from `view` onwards. `parent` is the member
/// that relayed the request and tells `name` about the outcome.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AddVote {
    pub view: ViewNumber,
    pub name: NodeName,
    pub parent: NodeName,
    pub public_key: Vec<u8>,
}

/// Drop `name` from the host list from `view` onwards. `parent` tells `name` about the outcome.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RemoveVote {
    pub view: ViewNumber,
    pub name: NodeName,
    pub parent: NodeName,
}

/// One node's verdict on a proposal, signed over [Vote::proposal_bytes].
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteResponse {
    pub name: NodeName,
    pub accepted: bool,
    pub signature: SchnorrSignature,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Count {
    pub approve: u64,
    pub reject: u64,
    pub responses: Vec<VoteResponse>,
}

impl Count {
    /// Add a response, unless the same node has been counted already.
    pub fn add(&mut self, response: VoteResponse) {
        if self.responses.iter().any(|r| r.name == response.name) {
            return;
        }
        if response.accepted {
            self.approve += 1;
        } else {
            self.reject += 1;
        }
        self.responses.push(response);
    }

    pub fn merge(&mut self, other: &Count) {
        for response in &other.responses {
            self.add(response.clone())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    pub index: VoteIndex,
    pub view: ViewNumber,
    pub round: RoundNumber,
    pub kind: VoteKind,
    pub count: Count,
    pub confirmed: bool,
}

impl Vote {
    pub fn new(index: VoteIndex, view: ViewNumber, round: RoundNumber, kind: VoteKind) -> Vote {
        Vote {
            index,
            view,
            round,
            kind,
            count: Count::default(),
            confirmed: false,
        }
    }

    /// The part of the vote that individual vote responses sign: everything except the tally.
    pub fn proposal_bytes(&self) -> Vec<u8> {
        (self.index, self.view, self.round, self.kind.clone())
            .try_to_vec()
            .unwrap()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.try_to_vec().unwrap()
    }

    /// Whether strictly more than two thirds of `host_count` nodes approved.
    pub fn is_accepted(&self, host_count: usize) -> bool {
        self.count.approve * 3 > 2 * host_count as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(name: &str, accepted: bool) -> VoteResponse {
        VoteResponse {
            name: NodeName::new(name),
            accepted,
            signature: SchnorrSignature {
                challenge: Vec::new(),
                response: Vec::new(),
            },
        }
    }

    #[test]
    fn acceptance_needs_more_than_two_thirds() {
        let mut vote = Vote::new(1, ViewNumber::init(), RoundNumber::new(1), VoteKind::Shutdown);
        for name in ["a", "b", "c", "d"] {
            vote.count.add(response(name, true));
        }
        vote.count.add(response("e", false));
        assert!(!vote.is_accepted(7));
        assert!(!vote.is_accepted(6));
        assert!(vote.is_accepted(5));
    }

    #[test]
    fn counts_ignore_duplicate_responders() {
        let mut mine = Count::default();
        mine.add(response("a", true));
        let mut theirs = Count::default();
        theirs.add(response("a", true));
        theirs.add(response("b", false));
        mine.merge(&theirs);
        assert_eq!((mine.approve, mine.reject), (1, 1));
    }
}
