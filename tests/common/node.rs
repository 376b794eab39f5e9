use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use cosi_rs::{
    events::{ApplyVoteEvent, CatchUpEvent, NewViewEvent, RoundDoneEvent, StartViewChangeEvent},
    failure::FailureStrategy,
    signer::{Configuration, Signer, SignerSpec, SignerStatus},
    signing::{
        round::{RoundType, SigningMode},
        signature::CollectiveSignature,
        SignError,
    },
    types::{
        basic::{BufferSize, NodeName, ViewNumber},
        keypair::Keypair,
        roster::Roster,
        suite::Ristretto255,
        vote::VoteKind,
    },
};

use crate::common::{
    app::{Inclusion, LeafApp},
    logging::{first_seven_base64_chars, log_with_context},
    network::NetworkStub,
};

/// The knobs integration tests turn. Everything else is the same for every node.
#[derive(Clone)]
pub(crate) struct NodeOptions {
    pub(crate) branching_factor: usize,
    pub(crate) signing_mode: SigningMode,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) phase_timeout: Duration,
    pub(crate) round_period: Option<Duration>,
    pub(crate) rounds_per_view: Option<u64>,
    pub(crate) gossip_period: Option<Duration>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            branching_factor: 2,
            signing_mode: SigningMode::MerkleTree,
            heartbeat_timeout: Duration::from_secs(60),
            phase_timeout: Duration::from_millis(500),
            round_period: None,
            rounds_per_view: None,
            gossip_period: None,
        }
    }
}

/// A round as the root saw it finish.
#[derive(Clone, Debug)]
pub(crate) struct FinishedRound {
    pub(crate) round_type: RoundType,
    pub(crate) signature: CollectiveSignature,
    pub(crate) verified: bool,
}

pub(crate) struct Node {
    name: NodeName,
    network: NetworkStub,
    rounds: Arc<Mutex<Vec<FinishedRound>>>,
    inclusions: Arc<Mutex<Vec<Inclusion>>>,
    catch_ups: Arc<Mutex<u64>>,
    view_change_attempts: Arc<Mutex<Vec<ViewNumber>>>,
    signer: Signer<Ristretto255>,
}

impl Node {
    pub(crate) fn new(
        name: NodeName,
        keypair: Keypair<Ristretto255>,
        roster: Roster<Ristretto255>,
        network: NetworkStub,
        options: NodeOptions,
        failure_strategy: impl FailureStrategy,
    ) -> Node {
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let inclusions = Arc::new(Mutex::new(Vec::new()));
        let catch_ups = Arc::new(Mutex::new(0));
        let view_change_attempts = Arc::new(Mutex::new(Vec::new()));

        let configuration = Configuration {
            me: name.clone(),
            keypair,
            suite: Ristretto255,
            roster,
            branching_factor: options.branching_factor,
            signing_mode: options.signing_mode,
            heartbeat_timeout: options.heartbeat_timeout,
            phase_timeout: options.phase_timeout,
            round_period: options.round_period,
            rounds_per_view: options.rounds_per_view,
            gossip_period: options.gossip_period,
            round_retention: 16,
            future_msg_buffer_capacity: BufferSize::new(1 << 20),
            assert_verification: false,
            log_events: false,
        };

        let signer = SignerSpec::builder()
            .app(LeafApp::new(name.clone(), inclusions.clone()))
            .network(network.clone())
            .configuration(configuration)
            .failure_strategy(failure_strategy)
            .on_round_done(round_done_handler(name.clone(), rounds.clone()))
            .on_new_view(new_view_handler(name.clone()))
            .on_apply_vote(apply_vote_handler(name.clone()))
            .on_catch_up(catch_up_handler(name.clone(), catch_ups.clone()))
            .on_start_view_change(start_view_change_handler(name.clone(), view_change_attempts.clone()))
            .build()
            .start();

        Node {
            name,
            network,
            rounds,
            inclusions,
            catch_ups,
            view_change_attempts,
            signer,
        }
    }

    pub(crate) fn name(&self) -> &NodeName {
        &self.name
    }

    pub(crate) fn status(&self) -> SignerStatus {
        self.signer.status()
    }

    pub(crate) fn view(&self) -> ViewNumber {
        self.signer.status().view
    }

    pub(crate) fn start_signing_round(&self, message: &[u8]) -> Result<(), SignError> {
        self.signer.start_signing_round(message.to_vec())
    }

    pub(crate) fn request_group_change(&self, to: &NodeName, kind: VoteKind) -> Result<(), SignError> {
        self.signer.request_group_change(to.clone(), kind)
    }

    pub(crate) fn try_view_change(&self, view: ViewNumber) -> Result<(), SignError> {
        self.signer.try_view_change(view)
    }

    pub(crate) fn host_list_on(&self, view: ViewNumber) -> Option<Vec<NodeName>> {
        self.signer.view(view).map(|v| v.host_list)
    }

    /// Rounds this node finished as root, oldest first.
    pub(crate) fn finished_rounds(&self) -> Vec<FinishedRound> {
        self.rounds.lock().unwrap().clone()
    }

    pub(crate) fn finished_signing_rounds(&self) -> Vec<FinishedRound> {
        self.finished_rounds()
            .into_iter()
            .filter(|round| round.round_type == RoundType::Signing)
            .collect()
    }

    pub(crate) fn inclusions(&self) -> Vec<Inclusion> {
        self.inclusions.lock().unwrap().clone()
    }

    pub(crate) fn catch_ups(&self) -> u64 {
        *self.catch_ups.lock().unwrap()
    }

    /// How many times this node started changing to `view`.
    pub(crate) fn view_change_attempts(&self, view: ViewNumber) -> usize {
        self.view_change_attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|attempt| **attempt == view)
            .count()
    }

    pub(crate) fn set_down(&self, down: bool) {
        log_with_context(&self.name, if down { "Going down" } else { "Coming back up" });
        self.network.set_down(down);
    }
}

fn round_done_handler(
    name: NodeName,
    rounds: Arc<Mutex<Vec<FinishedRound>>>,
) -> impl Fn(&RoundDoneEvent) + Send + 'static {
    move |round_done_event| {
        let signature = &round_done_event.signature;
        log_with_context(
            &name,
            &format!(
                "Round done, type: {:?}, view: {}, round: {}, message: {}, exceptions: {}, verified: {}",
                round_done_event.round_type,
                signature.view,
                signature.round,
                first_seven_base64_chars(&signature.message),
                signature.exception_list.len(),
                round_done_event.verified
            ),
        );
        rounds.lock().unwrap().push(FinishedRound {
            round_type: round_done_event.round_type,
            signature: signature.clone(),
            verified: round_done_event.verified,
        });
    }
}

fn new_view_handler(name: NodeName) -> impl Fn(&NewViewEvent) + Send + 'static {
    move |new_view_event| {
        log_with_context(
            &name,
            &format!("Entered view {}, root: {}", new_view_event.view, new_view_event.root),
        );
    }
}

fn apply_vote_handler(name: NodeName) -> impl Fn(&ApplyVoteEvent) + Send + 'static {
    move |apply_vote_event| {
        log_with_context(
            &name,
            &format!(
                "Applied vote {}, kind: {}, confirmed: {}",
                apply_vote_event.index,
                apply_vote_event.kind.name(),
                apply_vote_event.confirmed
            ),
        );
    }
}

fn catch_up_handler(name: NodeName, catch_ups: Arc<Mutex<u64>>) -> impl Fn(&CatchUpEvent) + Send + 'static {
    move |catch_up_event| {
        log_with_context(
            &name,
            &format!("Catching up on vote {} from {}", catch_up_event.index, catch_up_event.peer),
        );
        *catch_ups.lock().unwrap() += 1;
    }
}

fn start_view_change_handler(
    name: NodeName,
    attempts: Arc<Mutex<Vec<ViewNumber>>>,
) -> impl Fn(&StartViewChangeEvent) + Send + 'static {
    move |start_view_change_event| {
        log_with_context(
            &name,
            &format!(
                "Changing to view {}, root: {}",
                start_view_change_event.view, start_view_change_event.root
            ),
        );
        attempts.lock().unwrap().push(start_view_change_event.view);
    }
}
