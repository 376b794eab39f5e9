/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The dispatch thread: the driving force of a signer.
//!
//! The dispatch thread owns the [Node] and loops forever doing three things:
//! 1. Executing [commands](Command) sent by the [Signer](crate::signer::Signer) handle.
//! 2. [Ticking](Node::tick) the node: heartbeat expiry, phase deadlines, the root's round cadence, vote
//!    gossip, and re-dispatching deferred messages.
//! 3. Receiving one message from the network and [dispatching](Node::dispatch) it to its phase handler.
//!
//! ## Deferred messages
//!
//! A message for a view ahead of the node's current view is only acted on if the node has applied every
//! vote it knows of, since the view it is for may have been created by one of those votes. Otherwise it
//! is kept in a [FutureMessageBuffer] and dispatched again once the node has caught up.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};

use rand::seq::SliceRandom;

use crate::app::App;
use crate::events::{Event, ReceiveAnnouncementEvent};
use crate::messages::{ChallengeMessage, MessageType, Payload, SigningMessage};
use crate::networking::{Network, NetworkError};
use crate::node::Node;
use crate::signing::SignError;
use crate::types::{
    basic::{BufferSize, NodeName, ViewNumber},
    suite::Suite,
    vote::VoteKind,
};

/// Requests from the [Signer](crate::signer::Signer) handle to its dispatch thread.
#[derive(Clone, Debug)]
pub(crate) enum Command {
    StartSigningRound(Vec<u8>),
    StartVotingRound(VoteKind),
    RequestGroupChange { to: NodeName, kind: VoteKind },
    TryViewChange(ViewNumber),
}

/// Buffer for messages for views the node cannot act on yet.
///
/// Its size in encoded bytes is bounded by its capacity. When the capacity is reached, messages for the
/// highest views are dropped first.
pub(crate) struct FutureMessageBuffer {
    buffer_capacity: BufferSize,
    buffer: BTreeMap<ViewNumber, VecDeque<(NodeName, SigningMessage)>>,
    buffer_size: u64,
}

impl FutureMessageBuffer {
    pub(crate) fn new(buffer_capacity: BufferSize) -> Self {
        Self {
            buffer_capacity,
            buffer: BTreeMap::new(),
            buffer_size: 0,
        }
    }

    /// Try inserting the message into the buffer, making room by evicting messages for higher views if
    /// needed. Returns whether the message was stored.
    pub(crate) fn insert(&mut self, origin: NodeName, msg: SigningMessage) -> bool {
        let bytes_requested = Self::size_of(&msg);
        if bytes_requested > self.buffer_capacity.int() {
            return false;
        }
        if self.buffer_size + bytes_requested > self.buffer_capacity.int() {
            let has_higher = self.buffer.keys().next_back().map_or(false, |max_view| msg.view < *max_view);
            if !has_higher {
                return false;
            }
            self.remove_highest_viewed_msgs(self.buffer_size + bytes_requested - self.buffer_capacity.int(), msg.view);
            if self.buffer_size + bytes_requested > self.buffer_capacity.int() {
                return false;
            }
        }
        self.buffer_size += bytes_requested;
        self.buffer.entry(msg.view).or_default().push_back((origin, msg));
        true
    }

    /// Remove and return every buffered message, lowest views first.
    pub(crate) fn take_all(&mut self) -> Vec<(NodeName, SigningMessage)> {
        self.buffer_size = 0;
        std::mem::take(&mut self.buffer).into_values().flatten().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.values().map(VecDeque::len).sum()
    }

    // Only messages for views strictly above `floor` are evicted.
    fn remove_highest_viewed_msgs(&mut self, bytes_to_remove: u64, floor: ViewNumber) {
        let mut bytes_removed = 0;
        while bytes_removed < bytes_to_remove {
            let Some(mut entry) = self.buffer.last_entry() else {
                break;
            };
            if *entry.key() <= floor {
                break;
            }
            if let Some((_, msg)) = entry.get_mut().pop_back() {
                bytes_removed += Self::size_of(&msg);
            }
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        self.buffer_size = self.buffer_size.saturating_sub(bytes_removed);
    }

    fn size_of(msg: &SigningMessage) -> u64 {
        msg.encode().len() as u64
    }
}

impl<S: Suite, N: Network, A: App> Node<S, N, A> {
    /// Route one received message to its handler. `origin` is the peer the network says it came from, and
    /// overrides whatever the envelope claims.
    pub(crate) fn dispatch(&mut self, origin: NodeName, mut msg: SigningMessage) -> Result<(), SignError> {
        msg.from = origin.clone();
        let raised = self.update_last_seen_vote(msg.last_seen_vote);

        if msg.view > self.view() && !self.caught_up() && !self.completes_next_vote(&msg) && !Self::bypasses_buffer(&msg) {
            let err = SignError::NotCaughtUp {
                last_seen: self.last_seen_vote(),
                last_applied: self.last_applied_vote(),
            };
            if !self.future_msgs.insert(origin.clone(), msg) {
                log::debug!("{}: future message buffer full, dropping message", self.name);
            }
            if raised {
                self.catch_up(self.last_applied_vote() + 1, &origin)?;
            }
            return Err(err);
        }

        let result = self.route(&origin, msg);
        if raised && !self.caught_up() && !self.is_closed() {
            self.catch_up(self.last_applied_vote() + 1, &origin)?;
        }
        result
    }

    // Replies that bring a node up to date are never held back by the view they were sent in.
    fn bypasses_buffer(msg: &SigningMessage) -> bool {
        matches!(
            msg.payload,
            Payload::CatchUpRequest(_) | Payload::CatchUpResponse(_) | Payload::GroupChanged(_)
        )
    }

    // A challenge carrying the very vote this node is missing brings it up to date by itself.
    fn completes_next_vote(&self, msg: &SigningMessage) -> bool {
        match &msg.payload {
            Payload::Challenge(ChallengeMessage { vote: Some(vote), .. }) => {
                vote.index == self.last_applied_vote() + 1 && msg.last_seen_vote <= vote.index
            }
            _ => false,
        }
    }

    fn route(&mut self, origin: &NodeName, msg: SigningMessage) -> Result<(), SignError> {
        let view = msg.view;
        let message_type = msg.message_type();
        match msg.payload {
            Payload::Announcement(am) => {
                log::debug!("{}: announcement for round {} from {}", self.name, am.round, origin);
                self.publish(Event::ReceiveAnnouncement(ReceiveAnnouncementEvent {
                    timestamp: SystemTime::now(),
                    origin: origin.clone(),
                    view,
                    round: am.round,
                }));
                self.received_heartbeat();

                let round = am.round;
                let view_change = am.vote.as_ref().map(|vote| vote.kind.is_view_change());
                let result = match view_change {
                    // The view a view change is held in may not exist yet. The proposal creates it before
                    // checking the sender.
                    Some(true) => self.propose(view, am, Some(origin)),
                    Some(false) => {
                        self.expect_parent(view, origin, message_type)?;
                        self.propose(view, am, Some(origin))
                    }
                    None => {
                        self.expect_parent(view, origin, message_type)?;
                        self.announce(view, am)
                    }
                };
                if let Err(err) = &result {
                    if !matches!(err, SignError::ImposedFailure | SignError::UnexpectedSender { .. }) {
                        self.put_up_error(view, round, err);
                    }
                }
                result
            }
            Payload::Commitment(com) => {
                self.expect_child(view, origin, message_type)?;
                self.commit(com.round, Some((origin.clone(), com)))
            }
            Payload::Challenge(chm) => {
                self.expect_parent(view, origin, message_type)?;
                self.received_heartbeat();
                self.challenge(view, chm)
            }
            Payload::Response(rm) => {
                self.expect_child(view, origin, message_type)?;
                self.respond(rm.round, Some((origin.clone(), rm)))
            }
            Payload::Error(em) => {
                log::warn!("{}: {} failed round {}: {}", self.name, origin, em.round, em.err);
                Ok(())
            }
            Payload::CatchUpRequest(request) => self.on_catch_up_request(origin, request),
            Payload::CatchUpResponse(response) => self.on_catch_up_response(origin, response),
            Payload::GroupChange(gcm) => self.on_group_change(view, origin, gcm),
            Payload::GroupChanged(gcm) => self.on_group_changed(origin, gcm),
        }
    }

    fn expect_parent(&self, view: ViewNumber, from: &NodeName, message_type: MessageType) -> Result<(), SignError> {
        if self.view_snapshot(view)?.is_parent(from) {
            Ok(())
        } else {
            Err(SignError::UnexpectedSender {
                message_type,
                from: from.clone(),
                view,
            })
        }
    }

    fn expect_child(&self, view: ViewNumber, from: &NodeName, message_type: MessageType) -> Result<(), SignError> {
        if self.view_snapshot(view)?.is_child(from) {
            Ok(())
        } else {
            Err(SignError::UnexpectedSender {
                message_type,
                from: from.clone(),
                view,
            })
        }
    }

    pub(crate) fn execute(&mut self, command: Command) -> Result<(), SignError> {
        match command {
            Command::StartSigningRound(message) => self.start_signing_round(message),
            Command::StartVotingRound(kind) => self.start_voting_round(kind),
            Command::RequestGroupChange { to, kind } => self.request_group_change(&to, kind),
            Command::TryViewChange(view) => self.try_view_change(view),
        }
    }

    /// Everything time-driven: heartbeat, phase deadlines, round cadence, gossip, deferred messages.
    pub(crate) fn tick(&mut self, now: Instant) {
        self.expire_phases(now);
        self.check_heartbeat(now);
        self.drive_rounds(now);
        self.gossip(now);
        self.drain_future_msgs();
    }

    // A root with a round period starts a signing round every period, over the current time.
    fn drive_rounds(&mut self, now: Instant) {
        let Some(period) = self.params.round_period else {
            return;
        };
        if self.changing_view() || !self.is_root(self.view()) {
            self.next_round_at = None;
            return;
        }
        let due = *self.next_round_at.get_or_insert(now);
        if due > now {
            return;
        }
        self.next_round_at = Some(now + period);

        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        if let Err(err) = self.start_signing_round(millis.to_le_bytes().to_vec()) {
            log::debug!("{}: did not start round: {}", self.name, err);
        }
    }

    // Periodically ask a random member for the vote after the last one applied.
    fn gossip(&mut self, now: Instant) {
        let Some(period) = self.params.gossip_period else {
            return;
        };
        let due = *self.next_gossip_at.get_or_insert(now + period);
        if due > now {
            return;
        }
        self.next_gossip_at = Some(now + period);

        let peers: Vec<NodeName> = self
            .shared
            .views()
            .host_list_on(self.view())
            .into_iter()
            .filter(|peer| *peer != self.name)
            .collect();
        if let Some(peer) = peers.choose(&mut rand::thread_rng()) {
            if let Err(err) = self.catch_up(self.last_applied_vote() + 1, peer) {
                log::debug!("{}: gossip to {} failed: {}", self.name, peer, err);
            }
        }
    }

    fn drain_future_msgs(&mut self) {
        if self.future_msgs.is_empty() || !self.caught_up() {
            return;
        }
        for (origin, msg) in self.future_msgs.take_all() {
            if let Err(err) = self.dispatch(origin, msg) {
                log_dispatch_error(&self.name, &err);
            }
        }
    }
}

pub(crate) fn log_dispatch_error(name: &NodeName, err: &SignError) {
    match err {
        SignError::PastRound { .. }
        | SignError::NotCaughtUp { .. }
        | SignError::ImposedFailure
        | SignError::ChangingView => log::debug!("{}: {}", name, err),
        _ => log::warn!("{}: {}", name, err),
    }
}

pub(crate) fn start_dispatcher<S: Suite, N: Network + 'static, A: App>(
    mut node: Node<S, N, A>,
    mut network: N,
    commands: Receiver<Command>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Err(err) = network.connect() {
            log::error!("{}: could not connect: {}", node.name, err);
            node.close();
            return;
        }

        loop {
            match shutdown_signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    node.close();
                    return;
                }
                Err(TryRecvError::Empty) => (),
            }

            let mut idle = true;
            if let Ok(command) = commands.try_recv() {
                idle = false;
                if let Err(err) = node.execute(command) {
                    log_dispatch_error(&node.name, &err);
                }
            }

            node.tick(Instant::now());

            match network.recv() {
                Ok(Some((origin, msg))) => {
                    idle = false;
                    if let Err(err) = node.dispatch(origin, msg) {
                        log_dispatch_error(&node.name, &err);
                    }
                }
                Ok(None) => (),
                Err(NetworkError::Temporary(reason)) => log::warn!("{}: receive failed: {}", node.name, reason),
                Err(err) => {
                    log::error!("{}: network gone: {}", node.name, err);
                    node.close();
                    return;
                }
            }

            if node.is_closed() {
                log::info!("{}: closed", node.name);
                return;
            }
            if idle {
                thread::yield_now();
            }
        }
    })
}
