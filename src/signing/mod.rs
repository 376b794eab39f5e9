/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The four-phase collective signing protocol.
//!
//! A round moves down the tree and back up twice:
//! 1. **Announce** (down): the root announces a round number; every node seeds its commitment `v`.
//! 2. **Commit** (up): every node aggregates `V_hat` and `X_hat` over its subtree and, in Merkle mode,
//!    folds its children's Merkle roots and its own application leaf into a tree.
//! 3. **Challenge** (down): the root derives `c = H(message, V_hat)`; every node passes `c` on together with
//!    each child's inclusion proof.
//! 4. **Respond** (up): every node computes `r = v - x*c` and aggregates responses. Children that do not
//!    respond in time are excluded: their keys go on the exception list and their commitments are
//!    subtracted.
//!
//! The phase handlers live in [protocol]. Round state lives in [round], the Merkle engine in [merkle],
//! and the finished product in [signature].

use thiserror::Error;

use crate::messages::MessageType;
use crate::networking::NetworkError;
use crate::types::basic::{NodeName, RoundNumber, ViewNumber, VoteIndex};

pub mod merkle;

pub(crate) mod protocol;

pub mod round;

pub mod signature;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SignError {
    #[error("unknown message type")]
    UnknownMessageType,
    #[error("announcement for round {round} is not newer than last seen round {last_seen}")]
    PastRound {
        round: RoundNumber,
        last_seen: RoundNumber,
    },
    #[error("view change to {view} rejected: already in view {current}")]
    ViewRejected {
        view: ViewNumber,
        current: ViewNumber,
    },
    #[error("in the process of changing view")]
    ChangingView,
    #[error("imposed failure")]
    ImposedFailure,
    #[error("not caught up: last seen vote {last_seen}, last applied vote {last_applied}")]
    NotCaughtUp {
        last_seen: VoteIndex,
        last_applied: VoteIndex,
    },
    #[error("unexpected {message_type} from {from} in view {view}")]
    UnexpectedSender {
        message_type: MessageType,
        from: NodeName,
        view: ViewNumber,
    },
    #[error("unknown view {0}")]
    UnknownView(ViewNumber),
    #[error("not the root of view {0}")]
    NotRoot(ViewNumber),
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Network(#[from] NetworkError),
}
