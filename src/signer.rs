/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a signer.
//!
//! A signer is one node of a collective signing tree. The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the signer](SignerSpec) with:
//!   1. `SignerSpec::builder` to construct a `SignerSpecBuilder`,
//!   2. The setters of the `SignerSpecBuilder`, and
//!   3. The `SignerSpecBuilder::build` method to construct a [SignerSpec],
//! - The function to [start](SignerSpec::start) a [Signer] given its specification,
//! - [The type](Signer) which keeps the signer alive and lets the user drive it.
//!
//! ## Starting a signer
//!
//! ```ignore
//! let signer =
//!     SignerSpec::builder()
//!     .app(app)
//!     .network(network)
//!     .configuration(configuration)
//!     .on_round_done(round_done_handler)
//!     .build()
//!     .start();
//!
//! signer.start_signing_round(b"Hello World".to_vec())?;
//! ```
//!
//! ### Required setters
//!
//! - `.app(...)`
//! - `.network(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.failure_strategy(...)`, to impose failures on this signer (see [crate::failure]).
//! - One `.on_*(...)` setter per event in [crate::events], to register a handler for it.
//!
//! The signer's [configuration](Configuration) is also built with the builder pattern:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(NodeName::new("node-0"))
//!     .keypair(keypair)
//!     .suite(Ristretto255)
//!     .roster(roster)
//!     .branching_factor(2)
//!     .heartbeat_timeout(Duration::from_secs(5))
//!     .phase_timeout(Duration::from_millis(500))
//!     .future_msg_buffer_capacity(BufferSize::new(1 << 20))
//!     .log_events(true)
//!     .build()
//! ```

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::app::App;
use crate::dispatch::{start_dispatcher, Command};
use crate::event_bus::*;
use crate::events::*;
use crate::failure::{FailureStrategy, NeverFail};
use crate::networking::Network;
use crate::node::{Node, ProtocolParams, SharedState};
use crate::signing::{round::SigningMode, SignError};
use crate::types::{
    basic::{BufferSize, NodeName, RoundNumber, ViewNumber, VoteIndex},
    keypair::Keypair,
    roster::Roster,
    suite::Suite,
    view::View,
    vote::VoteKind,
};

/// Stores the user-defined parameters required to start a signer.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.keypair(...)`
    - `.suite(...)`
    - `.roster(...)`
    - `.branching_factor(...)`
    - `.heartbeat_timeout(...)`
    - `.phase_timeout(...)`
    - `.future_msg_buffer_capacity(...)`
    - `.log_events(...)`

    Optional:
    - `.signing_mode(...)`
    - `.round_period(...)`
    - `.rounds_per_view(...)`
    - `.gossip_period(...)`
    - `.round_retention(...)`
    - `.assert_verification(...)`
"))]
pub struct Configuration<S: Suite> {
    #[builder(setter(doc = "Set the name this signer is known by on the network. Required."))]
    pub me: NodeName,
    #[builder(setter(doc = "Set the signer's keypair. Its public key must match the one in the roster. Required."))]
    pub keypair: Keypair<S>,
    #[builder(setter(doc = "Set the cipher suite. Required."))]
    pub suite: S,
    #[builder(setter(doc = "Set the initial host list, with every member's public key. A signer that is not in it starts as an outsider. Required."))]
    pub roster: Roster<S>,
    #[builder(setter(doc = "Set the maximum number of children of each node in the signing tree. Required."))]
    pub branching_factor: usize,
    #[builder(default, setter(doc = "Set how signing rounds build the message they sign. Defaults to Merkle mode. Optional."))]
    pub signing_mode: SigningMode,
    #[builder(setter(doc = "Set how long the signer waits for an announcement or challenge before trying a view change. Required."))]
    pub heartbeat_timeout: Duration,
    #[builder(setter(doc = "Set how long a signer waits for each level of its subtree in the commit and respond phases. Required."))]
    pub phase_timeout: Duration,
    #[builder(default, setter(strip_option, doc = "Set the period at which the root starts signing rounds on its own. Optional."))]
    pub round_period: Option<Duration>,
    #[builder(default, setter(strip_option, doc = "Set the number of rounds after which the tree moves to the next view. Optional."))]
    pub rounds_per_view: Option<u64>,
    #[builder(default, setter(strip_option, doc = "Set the period at which the signer asks a random peer for votes it may have missed. Optional."))]
    pub gossip_period: Option<Duration>,
    #[builder(default = 16, setter(doc = "Set how many rounds behind the newest one unfinished rounds are kept. Defaults to 16. Optional."))]
    pub round_retention: u64,
    #[builder(setter(doc = "Set the maximum number of bytes of messages for future views kept while catching up. Required."))]
    pub future_msg_buffer_capacity: BufferSize,
    #[builder(default, setter(doc = "Trip a debug assertion when a round fails verification. Optional."))]
    pub assert_verification: bool,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl<S: Suite> Configuration<S> {
    fn protocol_params(&self) -> ProtocolParams {
        ProtocolParams {
            signing_mode: self.signing_mode,
            heartbeat_timeout: self.heartbeat_timeout,
            phase_timeout: self.phase_timeout,
            round_period: self.round_period,
            rounds_per_view: self.rounds_per_view,
            gossip_period: self.gossip_period,
            round_retention: self.round_retention,
            future_msg_buffer_capacity: self.future_msg_buffer_capacity,
            assert_verification: self.assert_verification,
        }
    }
}

/// Stores all necessary parameters and trait implementations required to run a [Signer].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [SignerSpec]. On the builder call the following methods to construct a valid [SignerSpec].

    Required:
    - `.app(...)`
    - `.network(...)`
    - `.configuration(...)`

    Optional:
    - `.failure_strategy(...)`
    - `.on_start_round(...)`
    - `.on_receive_announcement(...)`
    - `.on_commit(...)`
    - `.on_challenge(...)`
    - `.on_respond(...)`
    - `.on_round_done(...)`
    - `.on_imposed_failure(...)`
    - `.on_verification_failed(...)`
    - `.on_heartbeat_timeout(...)`
    - `.on_start_view_change(...)`
    - `.on_new_view(...)`
    - `.on_apply_vote(...)`
    - `.on_catch_up(...)`
"))]
pub struct SignerSpec<S: Suite, A: App, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the application hooks. The argument must implement the [App](crate::app::App) trait. Required."))]
    app: A,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a signer. Required."))]
    configuration: Configuration<S>,
    // Optional parameters
    #[builder(default = Box::new(NeverFail), setter(transform = |strategy: impl FailureStrategy| Box::new(strategy) as Box<dyn FailureStrategy>,
    doc = "Set the [failure strategy](crate::failure::FailureStrategy) imposed on this signer. Defaults to never failing. Optional."))]
    failure_strategy: Box<dyn FailureStrategy>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartRoundEvent>),
    doc = "Register a handler closure to be invoked after the signer starts a round as root. Optional."))]
    on_start_round: Option<HandlerPtr<StartRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveAnnouncementEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveAnnouncementEvent>),
    doc = "Register a handler closure to be invoked after the signer receives an announcement. Optional."))]
    on_receive_announcement: Option<HandlerPtr<ReceiveAnnouncementEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the signer aggregates its subtree's commitments. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ChallengeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ChallengeEvent>),
    doc = "Register a handler closure to be invoked after the signer handles a challenge. Optional."))]
    on_challenge: Option<HandlerPtr<ChallengeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RespondEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RespondEvent>),
    doc = "Register a handler closure to be invoked after the signer aggregates its subtree's responses. Optional."))]
    on_respond: Option<HandlerPtr<RespondEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RoundDoneEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RoundDoneEvent>),
    doc = "Register a handler closure to be invoked after a round completes at the root. Optional."))]
    on_round_done: Option<HandlerPtr<RoundDoneEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ImposedFailureEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ImposedFailureEvent>),
    doc = "Register a handler closure to be invoked after the failure strategy makes the signer fail a phase. Optional."))]
    on_imposed_failure: Option<HandlerPtr<ImposedFailureEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VerificationFailedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VerificationFailedEvent>),
    doc = "Register a handler closure to be invoked after a round fails verification. Optional."))]
    on_verification_failed: Option<HandlerPtr<VerificationFailedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&HeartbeatTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<HeartbeatTimeoutEvent>),
    doc = "Register a handler closure to be invoked after the signer's heartbeat expires. Optional."))]
    on_heartbeat_timeout: Option<HandlerPtr<HeartbeatTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the signer starts changing view. Optional."))]
    on_start_view_change: Option<HandlerPtr<StartViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewViewEvent>),
    doc = "Register a handler closure to be invoked after the signer enters a new view. Optional."))]
    on_new_view: Option<HandlerPtr<NewViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ApplyVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ApplyVoteEvent>),
    doc = "Register a handler closure to be invoked after the signer applies a vote. Optional."))]
    on_apply_vote: Option<HandlerPtr<ApplyVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CatchUpEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CatchUpEvent>),
    doc = "Register a handler closure to be invoked after the signer asks a peer for a vote it is missing. Optional."))]
    on_catch_up: Option<HandlerPtr<CatchUpEvent>>,
}

impl<S: Suite, A: App, N: Network + 'static> SignerSpec<S, A, N> {
    /// Starts all threads and channels associated with running a signer, and returns the handles to them
    /// in a [Signer] struct.
    pub fn start(self) -> Signer<S> {
        let configuration = self.configuration;
        let params = configuration.protocol_params();

        let event_handlers = EventHandlers::new(
            configuration.log_events,
            UserHandlers {
                on_start_round: self.on_start_round,
                on_receive_announcement: self.on_receive_announcement,
                on_commit: self.on_commit,
                on_challenge: self.on_challenge,
                on_respond: self.on_respond,
                on_round_done: self.on_round_done,
                on_imposed_failure: self.on_imposed_failure,
                on_verification_failed: self.on_verification_failed,
                on_heartbeat_timeout: self.on_heartbeat_timeout,
                on_start_view_change: self.on_start_view_change,
                on_new_view: self.on_new_view,
                on_apply_vote: self.on_apply_vote,
                on_catch_up: self.on_catch_up,
            },
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let name = configuration.me.clone();
        let node = Node::new(
            configuration.me,
            configuration.suite,
            configuration.keypair,
            configuration.roster,
            configuration.branching_factor,
            params,
            self.network.clone(),
            self.app,
            self.failure_strategy,
            event_publisher,
        );
        let shared = node.shared.clone();

        let (commands, command_receiver) = mpsc::channel();
        let (dispatcher_shutdown, dispatcher_shutdown_receiver) = mpsc::channel();
        let dispatcher = start_dispatcher(node, self.network, command_receiver, dispatcher_shutdown_receiver);

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
                (Some(event_bus), Some(event_bus_shutdown))
            }
            None => (None, None),
        };

        Signer {
            name,
            shared,
            commands,
            dispatcher: Some(dispatcher),
            dispatcher_shutdown,
            event_bus,
            event_bus_shutdown,
            _suite: std::marker::PhantomData,
        }
    }
}

/// A snapshot of a signer's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerStatus {
    pub view: ViewNumber,
    pub changing_view: bool,
    pub last_seen_round: RoundNumber,
    pub last_seen_vote: VoteIndex,
    pub last_applied_vote: VoteIndex,
    pub is_root: bool,
    pub closed: bool,
}

/// A handle to the background threads of a signer. When this value is dropped, all background threads are
/// gracefully shut down.
pub struct Signer<S: Suite> {
    name: NodeName,
    shared: Arc<SharedState>,
    commands: Sender<Command>,
    dispatcher: Option<JoinHandle<()>>,
    dispatcher_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
    _suite: std::marker::PhantomData<S>,
}

impl<S: Suite> Signer<S> {
    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// Start a signing round over `message`. Only the root of the current view can do this, and not while
    /// the tree is changing view.
    pub fn start_signing_round(&self, message: Vec<u8>) -> Result<(), SignError> {
        let view = {
            let view_state = self.shared.view_state();
            if view_state.changing_view {
                return Err(SignError::ChangingView);
            }
            view_state.view
        };
        if !self.view(view).map_or(false, |v| v.is_root(&self.name)) {
            return Err(SignError::NotRoot(view));
        }
        self.send(Command::StartSigningRound(message))
    }

    /// Put `kind` to a vote. Only meaningful on the root of the view the vote is held in.
    pub fn start_voting_round(&self, kind: VoteKind) -> Result<(), SignError> {
        self.send(Command::StartVotingRound(kind))
    }

    /// Ask `to` to have the tree vote on `kind`, for example to admit this signer.
    pub fn request_group_change(&self, to: NodeName, kind: VoteKind) -> Result<(), SignError> {
        self.send(Command::RequestGroupChange { to, kind })
    }

    pub fn try_view_change(&self, view: ViewNumber) -> Result<(), SignError> {
        self.send(Command::TryViewChange(view))
    }

    pub fn status(&self) -> SignerStatus {
        let (view, changing_view) = {
            let view_state = self.shared.view_state();
            (view_state.view, view_state.changing_view)
        };
        SignerStatus {
            view,
            changing_view,
            last_seen_round: self.shared.last_seen_round(),
            last_seen_vote: self.shared.last_seen_vote(),
            last_applied_vote: self.shared.last_applied_vote(),
            is_root: self.view(view).map_or(false, |v| v.is_root(&self.name)),
            closed: self.shared.is_closed(),
        }
    }

    /// A copy of this signer's picture of `view`, if it knows it.
    pub fn view(&self, view: ViewNumber) -> Option<View> {
        self.shared.views().get(view).cloned()
    }

    fn send(&self, command: Command) -> Result<(), SignError> {
        if self.shared.is_closed() {
            return Err(SignError::Network(crate::networking::NetworkError::Closed));
        }
        self.commands
            .send(command)
            .map_err(|_| SignError::Network(crate::networking::NetworkError::Closed))
    }
}

impl<S: Suite> Drop for Signer<S> {
    fn drop(&mut self) {
        // The dispatch thread publishes to the event bus, so it goes first.
        let _ = self.dispatcher_shutdown.send(());
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }

        if let Some(shutdown) = self.event_bus_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
