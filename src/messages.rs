/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages sent between nodes.
//!
//! Every message travels inside a [SigningMessage] envelope that carries the view it belongs to, the
//! sender's last seen vote index, and the sender's name. The [Payload] decides the message type.
//!
//! Points and scalars are carried as suite-specific bytes ([EncodedPoint], [EncodedScalar]) so that this
//! module does not depend on the cipher suite in use.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};

use crate::signing::merkle::Proof;
use crate::signing::SignError;
use crate::types::{
    basic::{NodeName, RoundNumber, ViewNumber, VoteIndex},
    suite::Suite,
    vote::Vote,
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EncodedPoint(Vec<u8>);

impl EncodedPoint {
    pub fn new<S: Suite>(suite: &S, point: &S::Point) -> Self {
        Self(suite.encode_point(point))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn decode<S: Suite>(&self, suite: &S) -> Result<S::Point, SignError> {
        suite
            .decode_point(&self.0)
            .ok_or(SignError::Malformed("point"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EncodedScalar(Vec<u8>);

impl EncodedScalar {
    pub fn new<S: Suite>(suite: &S, scalar: &S::Scalar) -> Self {
        Self(suite.encode_scalar(scalar))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn decode<S: Suite>(&self, suite: &S) -> Result<S::Scalar, SignError> {
        suite
            .decode_scalar(&self.0)
            .ok_or(SignError::Malformed("scalar"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SigningMessage {
    pub view: ViewNumber,
    pub last_seen_vote: VoteIndex,
    pub from: NodeName,
    pub payload: Payload,
}

impl SigningMessage {
    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::Announcement(_) => MessageType::Announcement,
            Payload::Commitment(_) => MessageType::Commitment,
            Payload::Challenge(_) => MessageType::Challenge,
            Payload::Response(_) => MessageType::Response,
            Payload::Error(_) => MessageType::Error,
            Payload::CatchUpRequest(_) => MessageType::CatchUpRequest,
            Payload::CatchUpResponse(_) => MessageType::CatchUpResponse,
            Payload::GroupChange(_) => MessageType::GroupChange,
            Payload::GroupChanged(_) => MessageType::GroupChanged,
        }
    }

    /// The round a phase message belongs to, if it is a phase message.
    pub fn round(&self) -> Option<RoundNumber> {
        match &self.payload {
            Payload::Announcement(am) => Some(am.round),
            Payload::Commitment(com) => Some(com.round),
            Payload::Challenge(chm) => Some(chm.round),
            Payload::Response(rm) => Some(rm.round),
            Payload::Error(em) => Some(em.round),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.try_to_vec().unwrap()
    }

    pub fn decode(bytes: &[u8]) -> Result<SigningMessage, SignError> {
        SigningMessage::try_from_slice(bytes).map_err(|_| SignError::UnknownMessageType)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Payload {
    Announcement(AnnouncementMessage),
    Commitment(CommitmentMessage),
    Challenge(ChallengeMessage),
    Response(ResponseMessage),
    Error(ErrorMessage),
    CatchUpRequest(CatchUpRequest),
    CatchUpResponse(CatchUpResponse),
    GroupChange(GroupChangeMessage),
    GroupChanged(GroupChangedMessage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Announcement,
    Commitment,
    Challenge,
    Response,
    Error,
    CatchUpRequest,
    CatchUpResponse,
    GroupChange,
    GroupChanged,
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Starts a round. `log_test` is the message being signed in public-key mode.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AnnouncementMessage {
    pub log_test: Vec<u8>,
    pub round: RoundNumber,
    pub vote: Option<Vote>,
}

/// A subtree's aggregate commitment `V_hat`, aggregate key `X_hat` and Merkle root, sent to the parent.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommitmentMessage {
    pub v: EncodedPoint,
    pub v_hat: EncodedPoint,
    pub x_hat: EncodedPoint,
    pub mt_root: Vec<u8>,
    pub exception_list: Vec<EncodedPoint>,
    pub vote: Option<Vote>,
    pub round: RoundNumber,
}

/// The collective challenge, with the receiver's inclusion proof in Merkle mode.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChallengeMessage {
    pub c: EncodedScalar,
    pub mt_root: Vec<u8>,
    pub proof: Proof,
    pub round: RoundNumber,
    pub vote: Option<Vote>,
}

/// A subtree's aggregate response, together with the keys and aggregates of the nodes it excluded.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ResponseMessage {
    pub r_hat: EncodedScalar,
    pub exception_list: Vec<EncodedPoint>,
    pub exception_v_hat: EncodedPoint,
    pub exception_x_hat: EncodedPoint,
    pub round: RoundNumber,
    pub vote: Option<Vote>,
}

/// A non-networking failure reported to the parent.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ErrorMessage {
    pub round: RoundNumber,
    pub err: String,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CatchUpRequest {
    pub index: VoteIndex,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CatchUpResponse {
    pub vote: Option<Vote>,
}

/// Asks the root of the view to hold a vote. `outsider` is set by peers that are not in the host list.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GroupChangeMessage {
    pub vote: Vote,
    pub outsider: bool,
}

/// Tells a peer the outcome of a vote that concerns it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GroupChangedMessage {
    pub vote: Vote,
    pub host_list: Vec<NodeName>,
}
