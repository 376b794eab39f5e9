/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of events for event handling and logging.
//! Note: an event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::failure::Phase;
use crate::signing::{round::RoundType, signature::CollectiveSignature};
use crate::types::{
    basic::{NodeName, RoundNumber, ViewNumber, VoteIndex},
    vote::VoteKind,
};

pub enum Event {
    // Events of the signing phases.
    StartRound(StartRoundEvent),
    ReceiveAnnouncement(ReceiveAnnouncementEvent),
    Commit(CommitEvent),
    Challenge(ChallengeEvent),
    Respond(RespondEvent),
    RoundDone(RoundDoneEvent),
    // Faults.
    ImposedFailure(ImposedFailureEvent),
    VerificationFailed(VerificationFailedEvent),
    // View change.
    HeartbeatTimeout(HeartbeatTimeoutEvent),
    StartViewChange(StartViewChangeEvent),
    NewView(NewViewEvent),
    // Voting and catch-up.
    ApplyVote(ApplyVoteEvent),
    CatchUp(CatchUpEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only goes away during shutdown, when losing events is fine.
            let _ = event_publisher.send(event);
        }
    }
}

/// The root announced a new round.
pub struct StartRoundEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub round: RoundNumber,
    pub round_type: RoundType,
}

pub struct ReceiveAnnouncementEvent {
    pub timestamp: SystemTime,
    pub origin: NodeName,
    pub view: ViewNumber,
    pub round: RoundNumber,
}

/// This node finished its Commit phase: it sent its commitment up, or (as root) derived the challenge.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub round: RoundNumber,
    pub children_committed: usize,
    pub children: usize,
}

pub struct ChallengeEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub round: RoundNumber,
    pub collective_root: Vec<u8>,
}

/// This node finished its Respond phase.
pub struct RespondEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub round: RoundNumber,
    pub exceptions: usize,
    pub verified: bool,
}

/// A round completed at the root.
pub struct RoundDoneEvent {
    pub timestamp: SystemTime,
    pub round_type: RoundType,
    pub signature: CollectiveSignature,
    pub verified: bool,
}

pub struct ImposedFailureEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub round: RoundNumber,
    pub phase: Phase,
}

pub struct VerificationFailedEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub round: RoundNumber,
}

pub struct HeartbeatTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub timeout: Duration,
}

pub struct StartViewChangeEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub root: NodeName,
}

/// This node entered a new view.
pub struct NewViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub root: NodeName,
}

pub struct ApplyVoteEvent {
    pub timestamp: SystemTime,
    pub index: VoteIndex,
    pub kind: VoteKind,
    pub confirmed: bool,
}

/// This node asked `peer` for the vote at `index`.
pub struct CatchUpEvent {
    pub timestamp: SystemTime,
    pub peer: NodeName,
    pub index: VoteIndex,
}
