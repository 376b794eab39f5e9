/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [Node]: everything one participant owns while taking part in collective signing, and the small
//! helpers the protocol handlers share: tree navigation, message envelopes, counters and fault injection.
//!
//! A `Node` is owned by its dispatch thread. The pieces of its state that the [Signer](crate::signer::Signer)
//! handle needs to read or poke at live in [SharedState] behind an `Arc`:
//! - `views`, behind a read/write lock (readers take snapshots),
//! - `view_state`, the current view and the changing-view flag, behind a mutex,
//! - `last_seen_round`, behind a mutex,
//! - the vote counters, as atomics,
//! - the heartbeat deadline, behind a mutex.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::app::App;
use crate::dispatch::FutureMessageBuffer;
use crate::events::{Event, ImposedFailureEvent};
use crate::failure::{FailureContext, FailureStrategy, Phase};
use crate::messages::{ErrorMessage, Payload, SigningMessage};
use crate::networking::{Network, SenderHandle};
use crate::signing::{
    round::{Round, SigningMode},
    SignError,
};
use crate::types::{
    basic::{BufferSize, NodeName, RoundNumber, ViewNumber, VoteIndex},
    keypair::Keypair,
    roster::Roster,
    suite::Suite,
    view::{View, Views},
};
use crate::voting::VoteLog;

/// Protocol parameters taken from the [Configuration](crate::signer::Configuration).
#[derive(Clone, Debug)]
pub(crate) struct ProtocolParams {
    pub(crate) signing_mode: SigningMode,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) phase_timeout: Duration,
    pub(crate) round_period: Option<Duration>,
    pub(crate) rounds_per_view: Option<u64>,
    pub(crate) gossip_period: Option<Duration>,
    pub(crate) round_retention: u64,
    pub(crate) future_msg_buffer_capacity: BufferSize,
    pub(crate) assert_verification: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct ViewState {
    pub(crate) view: ViewNumber,
    pub(crate) changing_view: bool,
    pub(crate) target: Option<ViewNumber>,
}

/// `None` until the first heartbeat is received, so an idle tree never changes view.
#[derive(Clone, Debug, Default)]
pub(crate) struct Heartbeat {
    pub(crate) deadline: Option<Instant>,
}

pub(crate) struct SharedState {
    pub(crate) views: RwLock<Views>,
    pub(crate) view_state: Mutex<ViewState>,
    pub(crate) last_seen_round: Mutex<RoundNumber>,
    pub(crate) last_seen_vote: AtomicU64,
    pub(crate) last_applied_vote: AtomicU64,
    pub(crate) heartbeat: Mutex<Heartbeat>,
    pub(crate) closed: AtomicBool,
}

impl SharedState {
    pub(crate) fn new(views: Views, view: ViewNumber) -> SharedState {
        SharedState {
            views: RwLock::new(views),
            view_state: Mutex::new(ViewState {
                view,
                changing_view: false,
                target: None,
            }),
            last_seen_round: Mutex::new(RoundNumber::new(0)),
            last_seen_vote: AtomicU64::new(0),
            last_applied_vote: AtomicU64::new(0),
            heartbeat: Mutex::new(Heartbeat::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn views(&self) -> RwLockReadGuard<'_, Views> {
        self.views.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn views_mut(&self) -> RwLockWriteGuard<'_, Views> {
        self.views.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn view_state(&self) -> MutexGuard<'_, ViewState> {
        lock(&self.view_state)
    }

    pub(crate) fn last_seen_round(&self) -> RoundNumber {
        *lock(&self.last_seen_round)
    }

    pub(crate) fn last_seen_vote(&self) -> VoteIndex {
        self.last_seen_vote.load(Ordering::SeqCst)
    }

    pub(crate) fn last_applied_vote(&self) -> VoteIndex {
        self.last_applied_vote.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Node<S: Suite, N: Network, A: App> {
    pub(crate) name: NodeName,
    pub(crate) suite: S,
    pub(crate) keypair: Keypair<S>,
    pub(crate) roster: Roster<S>,
    pub(crate) params: ProtocolParams,
    pub(crate) sender: SenderHandle<N>,
    pub(crate) app: A,
    pub(crate) failure: Box<dyn FailureStrategy>,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) rounds: BTreeMap<RoundNumber, Round<S>>,
    pub(crate) vote_log: VoteLog,
    pub(crate) pending_peers: HashSet<NodeName>,
    pub(crate) future_msgs: FutureMessageBuffer,
    pub(crate) next_round_at: Option<Instant>,
    pub(crate) next_gossip_at: Option<Instant>,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<S: Suite, N: Network, A: App> Node<S, N, A> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: NodeName,
        suite: S,
        keypair: Keypair<S>,
        roster: Roster<S>,
        branching_factor: usize,
        params: ProtocolParams,
        network: N,
        app: A,
        failure: Box<dyn FailureStrategy>,
        event_publisher: Option<Sender<Event>>,
    ) -> Node<S, N, A> {
        let views = if roster.contains(&name) {
            Views::new(name.clone(), branching_factor, roster.host_list().to_vec())
        } else {
            Views::empty(name.clone(), branching_factor)
        };
        let shared = Arc::new(SharedState::new(views, ViewNumber::init()));
        let future_msgs = FutureMessageBuffer::new(params.future_msg_buffer_capacity);
        Node {
            name,
            suite,
            keypair,
            roster,
            params,
            sender: SenderHandle::new(network),
            app,
            failure,
            shared,
            rounds: BTreeMap::new(),
            vote_log: VoteLog::new(),
            pending_peers: HashSet::new(),
            future_msgs,
            next_round_at: None,
            next_gossip_at: None,
            event_publisher,
        }
    }

    pub(crate) fn view(&self) -> ViewNumber {
        self.shared.view_state().view
    }

    pub(crate) fn changing_view(&self) -> bool {
        self.shared.view_state().changing_view
    }

    pub(crate) fn last_seen_round(&self) -> RoundNumber {
        self.shared.last_seen_round()
    }

    /// Raise `last_seen_round` to `round` if it is higher.
    pub(crate) fn update_last_seen_round(&self, round: RoundNumber) {
        let mut last_seen_round = lock(&self.shared.last_seen_round);
        if round > *last_seen_round {
            *last_seen_round = round;
        }
    }

    pub(crate) fn last_seen_vote(&self) -> VoteIndex {
        self.shared.last_seen_vote()
    }

    pub(crate) fn last_applied_vote(&self) -> VoteIndex {
        self.shared.last_applied_vote()
    }

    /// Raise `last_seen_vote` to `index`. Returns whether it went up.
    pub(crate) fn update_last_seen_vote(&self, index: VoteIndex) -> bool {
        self.shared.last_seen_vote.fetch_max(index, Ordering::SeqCst) < index
    }

    pub(crate) fn caught_up(&self) -> bool {
        self.last_seen_vote() == self.last_applied_vote()
    }

    pub(crate) fn view_snapshot(&self, view: ViewNumber) -> Result<View, SignError> {
        self.shared
            .views()
            .get(view)
            .cloned()
            .ok_or(SignError::UnknownView(view))
    }

    pub(crate) fn is_root(&self, view: ViewNumber) -> bool {
        self.shared
            .views()
            .get(view)
            .map_or(false, |v| v.is_root(&self.name))
    }

    pub(crate) fn envelope(&self, view: ViewNumber, payload: Payload) -> SigningMessage {
        SigningMessage {
            view,
            last_seen_vote: self.last_seen_vote(),
            from: self.name.clone(),
            payload,
        }
    }

    /// Send `payload` to the parent in `view`. Does nothing at the root.
    pub(crate) fn put_up(&mut self, view: ViewNumber, payload: Payload) -> Result<(), SignError> {
        let parent = self.view_snapshot(view)?.parent;
        match parent {
            Some(parent) => self.put_to(&parent, view, payload),
            None => Ok(()),
        }
    }

    /// Send `payload` to every child in `view`.
    pub(crate) fn put_down(&mut self, view: ViewNumber, payload: Payload) -> Result<(), SignError> {
        let children = self.view_snapshot(view)?.children;
        let message = self.envelope(view, payload);
        self.sender.multicast(&children, &message)?;
        Ok(())
    }

    pub(crate) fn put_to(&mut self, peer: &NodeName, view: ViewNumber, payload: Payload) -> Result<(), SignError> {
        let message = self.envelope(view, payload);
        self.sender.send(peer, message)?;
        Ok(())
    }

    /// Report a non-networking failure to the parent.
    pub(crate) fn put_up_error(&mut self, view: ViewNumber, round: RoundNumber, err: &SignError) {
        if matches!(err, SignError::Network(_)) {
            return;
        }
        let payload = Payload::Error(ErrorMessage {
            round,
            err: err.to_string(),
        });
        if let Err(send_err) = self.put_up(view, payload) {
            log::warn!("{}: could not report error to parent: {}", self.name, send_err);
        }
    }

    pub(crate) fn publish(&self, event: Event) {
        Event::publish(&self.event_publisher, event)
    }

    /// Ask the failure strategy whether to fail `phase` of a signing round, publishing an event if so.
    pub(crate) fn fail_at(&mut self, view: ViewNumber, round: RoundNumber, phase: Phase) -> bool {
        let context = FailureContext {
            phase,
            round,
            view,
            is_root: self.is_root(view),
        };
        if !self.failure.should_fail(&context) {
            return false;
        }
        log::info!("{}: imposed failure at {:?} of round {}", self.name, phase, round);
        self.publish(Event::ImposedFailure(ImposedFailureEvent {
            timestamp: SystemTime::now(),
            view,
            round,
            phase,
        }));
        true
    }

    /// The Announce-phase failure gate.
    pub(crate) fn try_failure(&mut self, view: ViewNumber, round: RoundNumber) -> Result<(), SignError> {
        if self.fail_at(view, round, Phase::Announce) {
            Err(SignError::ImposedFailure)
        } else {
            Ok(())
        }
    }

    /// Public keys of every node in the subtree rooted at `child` in `view`.
    pub(crate) fn subtree_keys(&self, view: &View, child: &NodeName) -> Vec<S::Point> {
        view.subtree(child)
            .iter()
            .filter_map(|name| self.roster.public_key(name).cloned())
            .collect()
    }

    /// Forget rounds that fell more than `round_retention` rounds behind `newest`.
    pub(crate) fn gc_rounds(&mut self, newest: RoundNumber) {
        let retention = self.params.round_retention;
        self.rounds.retain(|number, _| newest - *number <= retention);
    }

    pub(crate) fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        lock(&self.shared.heartbeat).deadline = None;
        self.sender.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.is_closed() || self.sender.closed()
    }
}
