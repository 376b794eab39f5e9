/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The heartbeat, and starting view changes.
//!
//! Every Announcement and Challenge a node receives pushes its heartbeat deadline `heartbeat_timeout`
//! into the future. If the deadline passes, the root of the current view is presumed dead and the node
//! tries to move to the next view. Moving to a view takes a [ViewChange](crate::types::vote::VoteKind::ViewChange)
//! vote, proposed by that view's designated root; if that root is dead too, the next expiry skips it.
//!
//! The heartbeat stays disarmed until the first round is seen, so a tree with nothing to sign never
//! changes view.

use std::time::{Instant, SystemTime};

use crate::app::App;
use crate::events::{Event, HeartbeatTimeoutEvent, StartViewChangeEvent};
use crate::networking::Network;
use crate::node::{lock, Node};
use crate::signing::SignError;
use crate::types::{
    basic::{RoundNumber, ViewNumber},
    suite::Suite,
    vote::{ViewChangeVote, VoteKind},
};

impl<S: Suite, N: Network, A: App> Node<S, N, A> {
    /// Push the heartbeat deadline out by `heartbeat_timeout`, arming it if needed.
    pub(crate) fn received_heartbeat(&self) {
        if self.is_closed() {
            return;
        }
        lock(&self.shared.heartbeat).deadline = Some(Instant::now() + self.params.heartbeat_timeout);
    }

    pub(crate) fn stop_heartbeat(&self) {
        lock(&self.shared.heartbeat).deadline = None;
    }

    /// Act on an expired heartbeat: try the view after the current one or, if a change is already
    /// pending, give up on it and try the view after its target.
    pub(crate) fn check_heartbeat(&mut self, now: Instant) {
        let expired = {
            let mut heartbeat = lock(&self.shared.heartbeat);
            match heartbeat.deadline {
                Some(deadline) if deadline <= now => {
                    heartbeat.deadline = Some(now + self.params.heartbeat_timeout);
                    true
                }
                _ => false,
            }
        };
        if !expired {
            return;
        }

        let next = {
            let mut view_state = self.shared.view_state();
            match view_state.target.take() {
                Some(target) if view_state.changing_view => {
                    log::info!("{}: view change to {} stalled", self.name, target);
                    view_state.changing_view = false;
                    target + 1
                }
                _ => view_state.view + 1,
            }
        };

        log::info!("{}: heartbeat expired in view {}", self.name, self.view());
        self.publish(Event::HeartbeatTimeout(HeartbeatTimeoutEvent {
            timestamp: SystemTime::now(),
            view: self.view(),
            timeout: self.params.heartbeat_timeout,
        }));
        if let Err(err) = self.try_view_change(next) {
            log::warn!("{}: could not start view change to {}: {}", self.name, next, err);
        }
    }

    /// Start changing to `view`. Only the designated root of `view` proposes the change; everybody else just
    /// marks itself as changing view and waits for the proposal.
    pub(crate) fn try_view_change(&mut self, view: ViewNumber) -> Result<(), SignError> {
        let root = {
            let views = self.shared.views();
            match views.get(view) {
                Some(existing) => Some(existing.root.clone()),
                None => views.root_for(view),
            }
        };
        let Some(root) = root else {
            return Err(SignError::UnknownView(view));
        };

        {
            let mut view_state = self.shared.view_state();
            if view <= view_state.view {
                return Err(SignError::ViewRejected {
                    view,
                    current: view_state.view,
                });
            }
            if view_state.changing_view {
                return Err(SignError::ChangingView);
            }
            view_state.changing_view = true;
            view_state.target = Some(view);
        }

        log::info!("{}: trying view change to {} with root {}", self.name, view, root);
        self.publish(Event::StartViewChange(StartViewChangeEvent {
            timestamp: SystemTime::now(),
            view,
            root: root.clone(),
        }));

        if root == self.name {
            self.start_voting_round(VoteKind::ViewChange(ViewChangeVote { view, root }))?;
        }
        Ok(())
    }

    /// Whether completing `round` closes a view under the configured `rounds_per_view`.
    pub(crate) fn time_for_view_change(&self, round: RoundNumber) -> bool {
        match self.params.rounds_per_view {
            Some(every) if every > 0 => round.int() % every == 0,
            _ => false,
        }
    }
}
