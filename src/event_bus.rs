/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) published by the dispatch thread and fires
//! the handlers registered for them: the user's handlers, and the [logging](crate::logging) handlers if
//! event logging is enabled.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) start_round_handlers: Vec<HandlerPtr<StartRoundEvent>>,
    pub(crate) receive_announcement_handlers: Vec<HandlerPtr<ReceiveAnnouncementEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) challenge_handlers: Vec<HandlerPtr<ChallengeEvent>>,
    pub(crate) respond_handlers: Vec<HandlerPtr<RespondEvent>>,
    pub(crate) round_done_handlers: Vec<HandlerPtr<RoundDoneEvent>>,
    pub(crate) imposed_failure_handlers: Vec<HandlerPtr<ImposedFailureEvent>>,
    pub(crate) verification_failed_handlers: Vec<HandlerPtr<VerificationFailedEvent>>,
    pub(crate) heartbeat_timeout_handlers: Vec<HandlerPtr<HeartbeatTimeoutEvent>>,
    pub(crate) start_view_change_handlers: Vec<HandlerPtr<StartViewChangeEvent>>,
    pub(crate) new_view_handlers: Vec<HandlerPtr<NewViewEvent>>,
    pub(crate) apply_vote_handlers: Vec<HandlerPtr<ApplyVoteEvent>>,
    pub(crate) catch_up_handlers: Vec<HandlerPtr<CatchUpEvent>>,
}

/// The user-registered handlers, one optional handler per event type.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_start_round: Option<HandlerPtr<StartRoundEvent>>,
    pub(crate) on_receive_announcement: Option<HandlerPtr<ReceiveAnnouncementEvent>>,
    pub(crate) on_commit: Option<HandlerPtr<CommitEvent>>,
    pub(crate) on_challenge: Option<HandlerPtr<ChallengeEvent>>,
    pub(crate) on_respond: Option<HandlerPtr<RespondEvent>>,
    pub(crate) on_round_done: Option<HandlerPtr<RoundDoneEvent>>,
    pub(crate) on_imposed_failure: Option<HandlerPtr<ImposedFailureEvent>>,
    pub(crate) on_verification_failed: Option<HandlerPtr<VerificationFailedEvent>>,
    pub(crate) on_heartbeat_timeout: Option<HandlerPtr<HeartbeatTimeoutEvent>>,
    pub(crate) on_start_view_change: Option<HandlerPtr<StartViewChangeEvent>>,
    pub(crate) on_new_view: Option<HandlerPtr<NewViewEvent>>,
    pub(crate) on_apply_vote: Option<HandlerPtr<ApplyVoteEvent>>,
    pub(crate) on_catch_up: Option<HandlerPtr<CatchUpEvent>>,
}

impl EventHandlers {
    pub(crate) fn new(log_events: bool, user: UserHandlers) -> EventHandlers {
        EventHandlers {
            start_round_handlers: handlers(log_events, user.on_start_round),
            receive_announcement_handlers: handlers(log_events, user.on_receive_announcement),
            commit_handlers: handlers(log_events, user.on_commit),
            challenge_handlers: handlers(log_events, user.on_challenge),
            respond_handlers: handlers(log_events, user.on_respond),
            round_done_handlers: handlers(log_events, user.on_round_done),
            imposed_failure_handlers: handlers(log_events, user.on_imposed_failure),
            verification_failed_handlers: handlers(log_events, user.on_verification_failed),
            heartbeat_timeout_handlers: handlers(log_events, user.on_heartbeat_timeout),
            start_view_change_handlers: handlers(log_events, user.on_start_view_change),
            new_view_handlers: handlers(log_events, user.on_new_view),
            apply_vote_handlers: handlers(log_events, user.on_apply_vote),
            catch_up_handlers: handlers(log_events, user.on_catch_up),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start_round_handlers.is_empty()
            && self.receive_announcement_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.challenge_handlers.is_empty()
            && self.respond_handlers.is_empty()
            && self.round_done_handlers.is_empty()
            && self.imposed_failure_handlers.is_empty()
            && self.verification_failed_handlers.is_empty()
            && self.heartbeat_timeout_handlers.is_empty()
            && self.start_view_change_handlers.is_empty()
            && self.new_view_handlers.is_empty()
            && self.apply_vote_handlers.is_empty()
            && self.catch_up_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::StartRound(start_round_event) =>
                self.start_round_handlers.iter().for_each(|handler| handler(&start_round_event)),

            Event::ReceiveAnnouncement(receive_announcement_event) =>
                self.receive_announcement_handlers.iter().for_each(|handler| handler(&receive_announcement_event)),

            Event::Commit(commit_event) =>
                self.commit_handlers.iter().for_each(|handler| handler(&commit_event)),

            Event::Challenge(challenge_event) =>
                self.challenge_handlers.iter().for_each(|handler| handler(&challenge_event)),

            Event::Respond(respond_event) =>
                self.respond_handlers.iter().for_each(|handler| handler(&respond_event)),

            Event::RoundDone(round_done_event) =>
                self.round_done_handlers.iter().for_each(|handler| handler(&round_done_event)),

            Event::ImposedFailure(imposed_failure_event) =>
                self.imposed_failure_handlers.iter().for_each(|handler| handler(&imposed_failure_event)),

            Event::VerificationFailed(verification_failed_event) =>
                self.verification_failed_handlers.iter().for_each(|handler| handler(&verification_failed_event)),

            Event::HeartbeatTimeout(heartbeat_timeout_event) =>
                self.heartbeat_timeout_handlers.iter().for_each(|handler| handler(&heartbeat_timeout_event)),

            Event::StartViewChange(start_view_change_event) =>
                self.start_view_change_handlers.iter().for_each(|handler| handler(&start_view_change_event)),

            Event::NewView(new_view_event) =>
                self.new_view_handlers.iter().for_each(|handler| handler(&new_view_event)),

            Event::ApplyVote(apply_vote_event) =>
                self.apply_vote_handlers.iter().for_each(|handler| handler(&apply_vote_event)),

            Event::CatchUp(catch_up_event) =>
                self.catch_up_handlers.iter().for_each(|handler| handler(&catch_up_event)),
        }
    }
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
    handlers
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            // The dispatch thread has exited (e.g., after a Shutdown vote). Keep waiting for the shutdown signal.
            Err(TryRecvError::Disconnected) => thread::yield_now(),
        }
    })
}
