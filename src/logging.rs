/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the signer's
//! [configuration](crate::signer::Configuration).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed
//! onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet is
//! how a [RoundDone](crate::events::RoundDoneEvent) is printed:
//!
//! ```text
//! RoundDone, 1701329264, Signing, 3, 12, fNGCJyk, 0, true
//! ```
//!
//! In the snippet:
//! - The third value is the type of the round.
//! - The fourth and fifth values are the view and the round number.
//! - The sixth value is the first seven characters of the Base64 encoding of the signed message.
//! - The seventh value is the number of excepted nodes.
//! - The eighth value is whether the signature verified.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const START_ROUND: &str = "StartRound";
pub const RECEIVE_ANNOUNCEMENT: &str = "ReceiveAnnouncement";
pub const COMMIT: &str = "Commit";
pub const CHALLENGE: &str = "Challenge";
pub const RESPOND: &str = "Respond";
pub const ROUND_DONE: &str = "RoundDone";

pub const IMPOSED_FAILURE: &str = "ImposedFailure";
pub const VERIFICATION_FAILED: &str = "VerificationFailed";

pub const HEARTBEAT_TIMEOUT: &str = "HeartbeatTimeout";
pub const START_VIEW_CHANGE: &str = "StartViewChange";
pub const NEW_VIEW: &str = "NewView";

pub const APPLY_VOTE: &str = "ApplyVote";
pub const CATCH_UP: &str = "CatchUp";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for StartRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_round_event: &StartRoundEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}",
                START_ROUND,
                secs_since_unix_epoch(start_round_event.timestamp),
                start_round_event.round_type,
                start_round_event.view,
                start_round_event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveAnnouncementEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_announcement_event: &ReceiveAnnouncementEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_ANNOUNCEMENT,
                secs_since_unix_epoch(receive_announcement_event.timestamp),
                receive_announcement_event.origin,
                receive_announcement_event.view,
                receive_announcement_event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}/{}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                commit_event.view,
                commit_event.round,
                commit_event.children_committed,
                commit_event.children
            )
        };
        Box::new(logger)
    }
}

impl Logger for ChallengeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |challenge_event: &ChallengeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                CHALLENGE,
                secs_since_unix_epoch(challenge_event.timestamp),
                challenge_event.view,
                challenge_event.round,
                first_seven_base64_chars(&challenge_event.collective_root)
            )
        };
        Box::new(logger)
    }
}

impl Logger for RespondEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |respond_event: &RespondEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RESPOND,
                secs_since_unix_epoch(respond_event.timestamp),
                respond_event.view,
                respond_event.round,
                respond_event.exceptions,
                respond_event.verified
            )
        };
        Box::new(logger)
    }
}

impl Logger for RoundDoneEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |round_done_event: &RoundDoneEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}, {}, {}, {}",
                ROUND_DONE,
                secs_since_unix_epoch(round_done_event.timestamp),
                round_done_event.round_type,
                round_done_event.signature.view,
                round_done_event.signature.round,
                first_seven_base64_chars(&round_done_event.signature.message),
                round_done_event.signature.exception_list.len(),
                round_done_event.verified
            )
        };
        Box::new(logger)
    }
}

impl Logger for ImposedFailureEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |imposed_failure_event: &ImposedFailureEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                IMPOSED_FAILURE,
                secs_since_unix_epoch(imposed_failure_event.timestamp),
                imposed_failure_event.view,
                imposed_failure_event.round,
                imposed_failure_event.phase
            )
        };
        Box::new(logger)
    }
}

impl Logger for VerificationFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |verification_failed_event: &VerificationFailedEvent| {
            log::error!(
                "{}, {}, {}, {}",
                VERIFICATION_FAILED,
                secs_since_unix_epoch(verification_failed_event.timestamp),
                verification_failed_event.view,
                verification_failed_event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for HeartbeatTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |heartbeat_timeout_event: &HeartbeatTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                HEARTBEAT_TIMEOUT,
                secs_since_unix_epoch(heartbeat_timeout_event.timestamp),
                heartbeat_timeout_event.view,
                heartbeat_timeout_event.timeout.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_change_event: &StartViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW_CHANGE,
                secs_since_unix_epoch(start_view_change_event.timestamp),
                start_view_change_event.view,
                start_view_change_event.root
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_view_event: &NewViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                NEW_VIEW,
                secs_since_unix_epoch(new_view_event.timestamp),
                new_view_event.view,
                new_view_event.root
            )
        };
        Box::new(logger)
    }
}

impl Logger for ApplyVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |apply_vote_event: &ApplyVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                APPLY_VOTE,
                secs_since_unix_epoch(apply_vote_event.timestamp),
                apply_vote_event.index,
                apply_vote_event.kind.name(),
                apply_vote_event.confirmed
            )
        };
        Box::new(logger)
    }
}

impl Logger for CatchUpEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |catch_up_event: &CatchUpEvent| {
            log::info!(
                "{}, {}, {}, {}",
                CATCH_UP,
                secs_since_unix_epoch(catch_up_event.timestamp),
                catch_up_event.peer,
                catch_up_event.index
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
