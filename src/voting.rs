/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Voting rounds, the vote log, catch-up, and group changes.
//!
//! A vote rides through an ordinary round: the proposal is carried in the Announcement, every node adds
//! its signed verdict to the count on the way up, and the root fixes the count into the challenge. Every
//! node then puts the counted vote into its [VoteLog] at the vote's index and applies the log in index order.
//! A node that sees a higher index than it has applied asks a peer for the votes it is missing, one at a
//! time.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use crate::app::App;
use crate::events::{ApplyVoteEvent, CatchUpEvent, Event, NewViewEvent, StartRoundEvent};
use crate::messages::{
    AnnouncementMessage, CatchUpRequest, CatchUpResponse, GroupChangeMessage, GroupChangedMessage, Payload,
};
use crate::networking::Network;
use crate::node::Node;
use crate::signing::{round::RoundType, SignError};
use crate::types::{
    basic::{NodeName, RoundNumber, ViewNumber, VoteIndex},
    suite::Suite,
    view::{HostListAction, View},
    vote::{Vote, VoteKind},
};

/// Every vote this node has learned the outcome of, keyed by index.
#[derive(Clone, Debug, Default)]
pub(crate) struct VoteLog {
    votes: BTreeMap<VoteIndex, Vote>,
}

impl VoteLog {
    pub(crate) fn new() -> VoteLog {
        VoteLog::default()
    }

    /// Record `vote`. The first vote recorded at an index wins.
    pub(crate) fn put(&mut self, vote: Vote) {
        self.votes.entry(vote.index).or_insert(vote);
    }

    pub(crate) fn get(&self, index: VoteIndex) -> Option<&Vote> {
        self.votes.get(&index)
    }

    pub(crate) fn len(&self) -> usize {
        self.votes.len()
    }
}

impl<S: Suite, N: Network, A: App> Node<S, N, A> {
    /// Propose `kind` to the tree as the root of the view the vote is held in.
    pub(crate) fn start_voting_round(&mut self, mut kind: VoteKind) -> Result<(), SignError> {
        let (current, changing_view) = {
            let view_state = self.shared.view_state();
            (view_state.view, view_state.changing_view)
        };
        if changing_view && !kind.is_view_change() {
            return Err(SignError::ChangingView);
        }

        let view = match &mut kind {
            VoteKind::ViewChange(vcv) => vcv.view,
            VoteKind::Add(av) => {
                if av.view <= current {
                    av.view = current + 1;
                }
                current
            }
            VoteKind::Remove(rv) => {
                if rv.view <= current {
                    rv.view = current + 1;
                }
                current
            }
            VoteKind::Shutdown | VoteKind::NoOp => current,
        };

        let round = self.last_seen_round() + 1;
        let index = self.last_seen_vote() + 1;
        let round_type = RoundType::from(&kind);
        let am = AnnouncementMessage {
            log_test: Vec::new(),
            round,
            vote: Some(Vote::new(index, view, round, kind)),
        };
        self.propose(view, am, None)?;
        if !self.is_root(view) {
            log::warn!("{}: proposed vote {} in view {} without being its root", self.name, index, view);
        }
        self.received_heartbeat();
        self.publish(Event::StartRound(StartRoundEvent {
            timestamp: SystemTime::now(),
            view,
            round,
            round_type,
        }));
        Ok(())
    }

    /// Validate a proposal and make sure the view it is held in exists. `from` is `None` at the proposer.
    pub(crate) fn setup_proposal(
        &mut self,
        view: ViewNumber,
        am: &AnnouncementMessage,
        from: Option<&NodeName>,
    ) -> Result<View, SignError> {
        let Some(vote) = &am.vote else {
            return self.view_snapshot(view);
        };

        match &vote.kind {
            VoteKind::ViewChange(vcv) => {
                if vcv.view != view {
                    return Err(SignError::InvalidProposal(format!(
                        "view change to {} proposed in view {}",
                        vcv.view, view
                    )));
                }
                if !self.caught_up() {
                    return Err(SignError::NotCaughtUp {
                        last_seen: self.last_seen_vote(),
                        last_applied: self.last_applied_vote(),
                    });
                }
                let new_view = {
                    let mut views = self.shared.views_mut();
                    let expected_root = match views.get(view) {
                        Some(existing) => Some(existing.root.clone()),
                        None => views.root_for(view),
                    };
                    if expected_root.as_ref() != Some(&vcv.root) {
                        return Err(SignError::InvalidProposal(format!(
                            "{} is not the root of view {}",
                            vcv.root, view
                        )));
                    }
                    views.new_view_from_prev(view).cloned().ok_or(SignError::UnknownView(view))?
                };
                if let Some(from) = from {
                    if !new_view.is_parent(from) {
                        return Err(SignError::UnexpectedSender {
                            message_type: crate::messages::MessageType::Announcement,
                            from: from.clone(),
                            view,
                        });
                    }
                }
                Ok(new_view)
            }
            kind => {
                let current = self.view();
                if view != current {
                    return Err(SignError::ViewRejected { view, current });
                }
                let target = match kind {
                    VoteKind::Add(av) => Some(av.view),
                    VoteKind::Remove(rv) => Some(rv.view),
                    _ => None,
                };
                if let Some(target) = target {
                    if target <= current {
                        return Err(SignError::InvalidProposal(format!(
                            "{} targets view {} which is not in the future",
                            kind.name(),
                            target
                        )));
                    }
                }
                self.view_snapshot(view)
            }
        }
    }

    /// Take part in a voting round: validate it, then announce it like any other round.
    pub(crate) fn propose(
        &mut self,
        view: ViewNumber,
        am: AnnouncementMessage,
        from: Option<&NodeName>,
    ) -> Result<(), SignError> {
        log::debug!("{}: proposal for round {} in view {}", self.name, am.round, view);
        self.setup_proposal(view, &am, from)?;
        self.announce_round(view, am)
    }

    /// Decide the counted `vote`, record it, and apply whatever the log now allows.
    pub(crate) fn act_on_votes(&mut self, view: ViewNumber, mut vote: Vote) -> Result<(), SignError> {
        let host_count = self.shared.views().host_list_on(view).len();
        if vote.is_accepted(host_count) {
            vote.confirmed = true;
        } else {
            log::info!(
                "{}: vote {} ({}) rejected with {} of {} approvals",
                self.name,
                vote.index,
                vote.kind.name(),
                vote.count.approve,
                host_count
            );
            let affected = match &vote.kind {
                VoteKind::Add(av) => Some((av.name.clone(), av.parent.clone())),
                VoteKind::Remove(rv) => Some((rv.name.clone(), rv.parent.clone())),
                _ => None,
            };
            if let Some((peer, parent)) = affected {
                if parent == self.name {
                    let payload = Payload::GroupChanged(GroupChangedMessage {
                        vote: vote.clone(),
                        host_list: Vec::new(),
                    });
                    if let Err(err) = self.put_to(&peer, view, payload) {
                        log::warn!("{}: could not tell {} about vote {}: {}", self.name, peer, vote.index, err);
                    }
                }
            }
            vote.kind = VoteKind::NoOp;
        }

        self.update_last_seen_vote(vote.index);
        self.vote_log.put(vote);
        self.apply_votes();
        Ok(())
    }

    /// Apply every logged vote following `last_applied_vote`, stopping at the first gap.
    pub(crate) fn apply_votes(&mut self) {
        loop {
            let next = self.last_applied_vote() + 1;
            let Some(vote) = self.vote_log.get(next).cloned() else {
                break;
            };
            self.apply_vote(&vote);
            self.shared.last_applied_vote.store(next, Ordering::SeqCst);
            self.update_last_seen_vote(next);
            self.publish(Event::ApplyVote(ApplyVoteEvent {
                timestamp: SystemTime::now(),
                index: next,
                kind: vote.kind.clone(),
                confirmed: vote.confirmed,
            }));
            if self.is_closed() {
                break;
            }
        }
    }

    fn apply_vote(&mut self, vote: &Vote) {
        log::debug!("{}: applying vote {} ({})", self.name, vote.index, vote.kind.name());
        match &vote.kind {
            VoteKind::ViewChange(vcv) => self.enter_view(vcv.view),
            VoteKind::Add(av) => {
                match self.suite.decode_point(&av.public_key) {
                    Some(key) => self.roster.insert_key(av.name.clone(), key),
                    None => log::warn!("{}: vote {} carries a malformed key for {}", self.name, vote.index, av.name),
                }
                self.shared
                    .views_mut()
                    .schedule(av.view, HostListAction::Add(av.name.clone()));
                if av.parent == self.name {
                    self.notify_group_changed(&av.name, av.view, vote);
                }
            }
            VoteKind::Remove(rv) => {
                self.shared
                    .views_mut()
                    .schedule(rv.view, HostListAction::Remove(rv.name.clone()));
                self.pending_peers.remove(&rv.name);
                if rv.parent == self.name {
                    self.notify_group_changed(&rv.name, rv.view, vote);
                }
            }
            VoteKind::Shutdown => {
                log::info!("{}: shutting down by vote {}", self.name, vote.index);
                self.close();
            }
            VoteKind::NoOp => (),
        }
    }

    /// Move to `view`, deriving it from its predecessor if needed.
    fn enter_view(&mut self, view: ViewNumber) {
        {
            let mut view_state = self.shared.view_state();
            if view <= view_state.view {
                log::debug!("{}: already past view {}", self.name, view);
                return;
            }
            let root = {
                let mut views = self.shared.views_mut();
                let Some(root) = views.new_view_from_prev(view).map(|v| v.root.clone()) else {
                    log::warn!("{}: cannot derive view {}", self.name, view);
                    return;
                };
                views.prune_before(view.prev());
                root
            };
            view_state.view = view;
            view_state.changing_view = false;
            view_state.target = None;
            drop(view_state);

            self.publish(Event::NewView(NewViewEvent {
                timestamp: SystemTime::now(),
                view,
                root,
            }));
        }
        log::info!("{}: entered view {}", self.name, view);
        self.received_heartbeat();
        self.next_round_at = None;
    }

    fn notify_group_changed(&mut self, peer: &NodeName, target: ViewNumber, vote: &Vote) {
        let host_list = self.shared.views().host_list_on(target);
        let payload = Payload::GroupChanged(GroupChangedMessage {
            vote: vote.clone(),
            host_list,
        });
        let view = self.view();
        if let Err(err) = self.put_to(peer, view, payload) {
            log::warn!("{}: could not tell {} about vote {}: {}", self.name, peer, vote.index, err);
        }
    }

    /// Ask `peer` for the vote at `index`.
    pub(crate) fn catch_up(&mut self, index: VoteIndex, peer: &NodeName) -> Result<(), SignError> {
        log::debug!("{}: asking {} for vote {}", self.name, peer, index);
        let view = self.view();
        self.put_to(peer, view, Payload::CatchUpRequest(CatchUpRequest { index }))?;
        self.publish(Event::CatchUp(CatchUpEvent {
            timestamp: SystemTime::now(),
            peer: peer.clone(),
            index,
        }));
        Ok(())
    }

    pub(crate) fn on_catch_up_request(&mut self, from: &NodeName, request: CatchUpRequest) -> Result<(), SignError> {
        let vote = self.vote_log.get(request.index).cloned();
        log::debug!(
            "{}: {} asks for vote {}, {} logged",
            self.name,
            from,
            request.index,
            self.vote_log.len()
        );
        let view = self.view();
        self.put_to(from, view, Payload::CatchUpResponse(CatchUpResponse { vote }))
    }

    pub(crate) fn on_catch_up_response(&mut self, from: &NodeName, response: CatchUpResponse) -> Result<(), SignError> {
        let Some(vote) = response.vote else {
            return Ok(());
        };
        if vote.index <= self.last_applied_vote() {
            return Ok(());
        }
        self.update_last_seen_vote(vote.index);
        self.vote_log.put(vote);
        self.apply_votes();
        if !self.caught_up() && !self.is_closed() {
            self.catch_up(self.last_applied_vote() + 1, from)?;
        }
        Ok(())
    }

    /// Forward a group change request towards the root, which puts it to a vote.
    pub(crate) fn on_group_change(
        &mut self,
        view: ViewNumber,
        from: &NodeName,
        mut gcm: GroupChangeMessage,
    ) -> Result<(), SignError> {
        let view = if gcm.outsider {
            self.pending_peers.insert(from.clone());
            match &mut gcm.vote.kind {
                VoteKind::Add(av) => av.parent = self.name.clone(),
                VoteKind::Remove(rv) => rv.parent = self.name.clone(),
                _ => (),
            }
            gcm.outsider = false;
            self.view()
        } else {
            view
        };

        if self.is_root(view) {
            log::info!("{}: putting {} requested by {} to a vote", self.name, gcm.vote.kind.name(), from);
            self.start_voting_round(gcm.vote.kind)
        } else {
            self.put_up(view, Payload::GroupChange(gcm))
        }
    }

    /// Learn the outcome of a vote about this node.
    pub(crate) fn on_group_changed(&mut self, from: &NodeName, gcm: GroupChangedMessage) -> Result<(), SignError> {
        if !gcm.vote.confirmed {
            log::info!("{}: {} was rejected (told by {})", self.name, gcm.vote.kind.name(), from);
            return Ok(());
        }
        match &gcm.vote.kind {
            VoteKind::Add(av) if av.name == self.name => {
                let previous: Vec<NodeName> = gcm.host_list.iter().filter(|n| **n != self.name).cloned().collect();
                if previous.is_empty() {
                    return Err(SignError::InvalidProposal("empty host list".to_string()));
                }
                let root = previous[(av.view.int() % previous.len() as u64) as usize].clone();
                self.roster.insert_key(self.name.clone(), self.keypair.public().clone());
                self.shared.views_mut().install(av.view, gcm.host_list, &root);
                {
                    let mut view_state = self.shared.view_state();
                    view_state.view = av.view.prev();
                    view_state.changing_view = false;
                    view_state.target = None;
                }
                let index = gcm.vote.index;
                self.vote_log.put(gcm.vote.clone());
                self.shared.last_applied_vote.store(index, Ordering::SeqCst);
                self.update_last_seen_vote(index);
                self.pending_peers.clear();
                log::info!("{}: admitted from view {}", self.name, av.view);
            }
            VoteKind::Remove(rv) if rv.name == self.name => {
                log::info!("{}: removed from view {}", self.name, rv.view);
                self.stop_heartbeat();
            }
            _ => (),
        }
        Ok(())
    }

    /// Send a group change request to `to`, as a member or as an outsider.
    pub(crate) fn request_group_change(&mut self, to: &NodeName, kind: VoteKind) -> Result<(), SignError> {
        let view = self.view();
        let outsider = self.shared.views().get(view).map_or(true, |v| !v.contains(&self.name));
        let vote = Vote::new(0, view, RoundNumber::new(0), kind);
        self.put_to(to, view, Payload::GroupChange(GroupChangeMessage { vote, outsider }))
    }
}
