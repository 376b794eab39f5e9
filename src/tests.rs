/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deterministic protocol tests. Nodes are driven directly on the test thread: messages go into one shared
//! queue and are delivered by [Cluster::pump], and time only moves when a test calls [Cluster::tick_all]
//! with an instant of its choosing.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, SeedableRng};

use crate::app::App;
use crate::events::Event;
use crate::failure::{FailureStrategy, ImposedFailures, NeverFail, Phase};
use crate::messages::{AnnouncementMessage, Payload, SigningMessage};
use crate::networking::{Network, NetworkError};
use crate::node::{Node, ProtocolParams};
use crate::signing::{
    merkle::{check_proof, Proof},
    round::{RoundType, SigningMode},
    signature::CollectiveSignature,
    SignError,
};
use crate::types::{
    basic::{BufferSize, NodeName, RoundNumber, ViewNumber},
    keypair::Keypair,
    roster::Roster,
    suite::{Ristretto255, Suite},
    vote::{AddVote, VoteKind},
};

type Point = <Ristretto255 as Suite>::Point;
type Queue = Arc<Mutex<VecDeque<(NodeName, NodeName, SigningMessage)>>>;

#[derive(Clone)]
struct QueueNetwork {
    me: NodeName,
    queue: Queue,
    cut_off: Arc<Mutex<HashSet<NodeName>>>,
}

impl Network for QueueNetwork {
    fn connect(&mut self) -> Result<(), NetworkError> {
        Ok(())
    }

    fn send(&mut self, peer: &NodeName, message: SigningMessage) -> Result<(), NetworkError> {
        let cut_off = self.cut_off.lock().unwrap();
        if cut_off.contains(peer) || cut_off.contains(&self.me) {
            return Ok(());
        }
        self.queue
            .lock()
            .unwrap()
            .push_back((self.me.clone(), peer.clone(), message));
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<(NodeName, SigningMessage)>, NetworkError> {
        Ok(None)
    }

    fn close(&mut self) {}

    fn closed(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct Record {
    done: Vec<(Vec<u8>, Vec<u8>, Proof)>,
    signatures: Vec<CollectiveSignature>,
}

#[derive(Clone)]
struct RecordingApp {
    name: NodeName,
    record: Arc<Mutex<Record>>,
}

impl RecordingApp {
    fn leaf(&self, view: ViewNumber) -> Vec<u8> {
        format!("{}@{}", self.name, view).into_bytes()
    }
}

impl App for RecordingApp {
    fn commit(&mut self, view: ViewNumber) -> Option<Vec<u8>> {
        Some(self.leaf(view))
    }

    fn done(&mut self, _view: ViewNumber, client_root: &[u8], collective_root: &[u8], proof: &Proof) {
        self.record
            .lock()
            .unwrap()
            .done
            .push((client_root.to_vec(), collective_root.to_vec(), proof.clone()));
    }

    fn round_done(&mut self, _view: ViewNumber, signature: &CollectiveSignature) {
        self.record.lock().unwrap().signatures.push(signature.clone());
    }
}

struct Member {
    node: Node<Ristretto255, QueueNetwork, RecordingApp>,
    record: Arc<Mutex<Record>>,
    events: Receiver<Event>,
}

struct Cluster {
    suite: Ristretto255,
    members: BTreeMap<NodeName, Member>,
    keys: Vec<(NodeName, Point)>,
    queue: Queue,
    cut_off: Arc<Mutex<HashSet<NodeName>>>,
    params: ProtocolParams,
    branching_factor: usize,
}

fn name(i: usize) -> NodeName {
    NodeName::new(format!("n{}", i))
}

fn params(signing_mode: SigningMode) -> ProtocolParams {
    ProtocolParams {
        signing_mode,
        heartbeat_timeout: Duration::from_secs(1000),
        phase_timeout: Duration::from_secs(10),
        round_period: None,
        rounds_per_view: None,
        gossip_period: None,
        round_retention: 16,
        future_msg_buffer_capacity: BufferSize::new(1 << 20),
        assert_verification: false,
    }
}

fn keypair(suite: &Ristretto255, i: usize) -> Keypair<Ristretto255> {
    Keypair::generate(suite, &mut StdRng::seed_from_u64(i as u64))
}

impl Cluster {
    fn new(
        size: usize,
        branching_factor: usize,
        params: ProtocolParams,
        failure_for: impl Fn(&NodeName) -> Box<dyn FailureStrategy>,
    ) -> Cluster {
        let suite = Ristretto255;
        let keys: Vec<(NodeName, Point)> = (0..size)
            .map(|i| (name(i), keypair(&suite, i).public().clone()))
            .collect();
        let mut cluster = Cluster {
            suite,
            members: BTreeMap::new(),
            keys,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            cut_off: Arc::new(Mutex::new(HashSet::new())),
            params,
            branching_factor,
        };
        for i in 0..size {
            let failure = failure_for(&name(i));
            cluster.spawn(i, failure);
        }
        cluster
    }

    /// Start node `i` with the cluster's initial roster. A node outside it is an outsider.
    fn spawn(&mut self, i: usize, failure: Box<dyn FailureStrategy>) {
        let me = name(i);
        let record = Arc::new(Mutex::new(Record::default()));
        let (publisher, events) = mpsc::channel();
        let network = QueueNetwork {
            me: me.clone(),
            queue: self.queue.clone(),
            cut_off: self.cut_off.clone(),
        };
        let app = RecordingApp {
            name: me.clone(),
            record: record.clone(),
        };
        let node = Node::new(
            me.clone(),
            self.suite,
            keypair(&self.suite, i),
            Roster::new(self.keys.clone()),
            self.branching_factor,
            self.params.clone(),
            network,
            app,
            failure,
            Some(publisher),
        );
        self.members.insert(me, Member { node, record, events });
    }

    fn node(&mut self, i: usize) -> &mut Node<Ristretto255, QueueNetwork, RecordingApp> {
        &mut self.members.get_mut(&name(i)).unwrap().node
    }

    fn record(&self, i: usize) -> std::sync::MutexGuard<'_, Record> {
        self.members[&name(i)].record.lock().unwrap()
    }

    fn events(&self, i: usize) -> Vec<Event> {
        self.members[&name(i)].events.try_iter().collect()
    }

    /// Deliver queued messages until the queue is empty. Returns the number delivered.
    fn pump(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.queue.lock().unwrap().pop_front();
            let Some((from, to, msg)) = next else {
                return delivered;
            };
            delivered += 1;
            if let Some(member) = self.members.get_mut(&to) {
                let _ = member.node.dispatch(from, msg);
            }
        }
    }

    fn tick_all(&mut self, now: Instant) {
        for member in self.members.values_mut() {
            member.node.tick(now);
        }
    }

    fn key(&self, i: usize) -> Point {
        self.keys[i].1
    }

    fn all_keys(&self) -> Vec<Point> {
        self.keys.iter().map(|(_, key)| *key).collect()
    }
}

fn never_fail(_: &NodeName) -> Box<dyn FailureStrategy> {
    Box::new(NeverFail)
}

fn encoded(suite: &Ristretto255, keys: &[Point]) -> Vec<Vec<u8>> {
    let mut encoded: Vec<Vec<u8>> = keys.iter().map(|key| suite.encode_point(key)).collect();
    encoded.sort();
    encoded
}

fn exception_keys(signature: &CollectiveSignature) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = signature.exception_list.iter().map(|key| key.bytes().to_vec()).collect();
    keys.sort();
    keys
}

#[test]
fn hello_world_over_a_chain() {
    let mut cluster = Cluster::new(3, 1, params(SigningMode::PubKey), never_fail);
    cluster.node(0).start_signing_round(b"Hello World".to_vec()).unwrap();
    cluster.pump();

    let signature = cluster.record(0).signatures[0].clone();
    assert_eq!(signature.message, b"Hello World".to_vec());
    assert_eq!(signature.round, RoundNumber::new(1));
    assert!(signature.exception_list.is_empty());
    assert!(signature.verify(&cluster.suite));
    assert!(signature.verify_with_keys(&cluster.suite, &cluster.all_keys()));
    assert!(signature.verify_with_roster(&cluster.suite, &Roster::new(cluster.keys.clone())));

    let mut tampered = signature.clone();
    tampered.message = b"Hello Wordl".to_vec();
    assert!(!tampered.verify(&cluster.suite));

    for i in 0..3 {
        assert!(cluster.node(i).rounds.is_empty());
        assert_eq!(cluster.node(i).last_seen_round(), RoundNumber::new(1));
    }
}

#[test]
fn every_leaf_is_proven_into_the_collective_root() {
    let mut cluster = Cluster::new(7, 2, params(SigningMode::MerkleTree), never_fail);
    cluster.node(0).start_signing_round(Vec::new()).unwrap();
    cluster.pump();

    let signature = cluster.record(0).signatures[0].clone();
    assert!(signature.verify_with_keys(&cluster.suite, &cluster.all_keys()));

    for i in 0..7 {
        let record = cluster.record(i);
        assert_eq!(record.done.len(), 1, "node {} got no proof", i);
        let (leaf, collective_root, proof) = &record.done[0];
        assert_eq!(leaf, &format!("n{}@0", i).into_bytes());
        assert_eq!(collective_root, &signature.message);
        assert!(check_proof(&cluster.suite, collective_root, leaf, proof));
    }
}

#[test]
fn silent_leaves_are_excepted() {
    let mut cluster = Cluster::new(7, 2, params(SigningMode::MerkleTree), |name| {
        if ["n3", "n4", "n5", "n6"].contains(&name.as_str()) {
            Box::new(ImposedFailures::for_node(name).dead_for(Phase::Respond)) as Box<dyn FailureStrategy>
        } else {
            Box::new(NeverFail)
        }
    });
    cluster.node(0).start_signing_round(Vec::new()).unwrap();
    cluster.pump();
    assert!(cluster.record(0).signatures.is_empty());

    // The middle layer gives up on the leaves first, then the root has every response it waits for.
    cluster.tick_all(Instant::now() + Duration::from_secs(15));
    cluster.pump();

    let signature = cluster.record(0).signatures[0].clone();
    let leaves: Vec<Point> = (3..7).map(|i| cluster.key(i)).collect();
    assert_eq!(exception_keys(&signature), encoded(&cluster.suite, &leaves));
    assert!(signature.verify(&cluster.suite));
    assert!(signature.verify_with_keys(&cluster.suite, &cluster.all_keys()));

    let failures = cluster
        .events(3)
        .into_iter()
        .filter(|event| matches!(event, Event::ImposedFailure(_)))
        .count();
    assert_eq!(failures, 1);
}

#[test]
fn child_that_never_commits_is_excepted() {
    let mut cluster = Cluster::new(3, 2, params(SigningMode::PubKey), |name| {
        if name.as_str() == "n2" {
            Box::new(ImposedFailures::for_node(name).dead_for(Phase::Announce)) as Box<dyn FailureStrategy>
        } else {
            Box::new(NeverFail)
        }
    });
    cluster.node(0).start_signing_round(b"partial".to_vec()).unwrap();
    cluster.pump();
    assert!(cluster.node(2).rounds.is_empty());

    cluster.tick_all(Instant::now() + Duration::from_secs(15));
    cluster.pump();
    cluster.tick_all(Instant::now() + Duration::from_secs(30));
    cluster.pump();

    let signature = cluster.record(0).signatures[0].clone();
    assert_eq!(exception_keys(&signature), encoded(&cluster.suite, &[cluster.key(2)]));
    assert!(signature.verify_with_keys(&cluster.suite, &cluster.all_keys()));
}

#[test]
fn leaf_left_out_at_commit_gets_no_inclusion_proof() {
    let mut cluster = Cluster::new(3, 2, params(SigningMode::MerkleTree), |name| {
        if name.as_str() == "n2" {
            Box::new(ImposedFailures::for_node(name).dead_for(Phase::Commit)) as Box<dyn FailureStrategy>
        } else {
            Box::new(NeverFail)
        }
    });
    cluster.node(0).start_signing_round(Vec::new()).unwrap();
    cluster.pump();

    cluster.tick_all(Instant::now() + Duration::from_secs(15));
    cluster.pump();

    let signature = cluster.record(0).signatures[0].clone();
    assert_eq!(exception_keys(&signature), encoded(&cluster.suite, &[cluster.key(2)]));
    assert!(signature.verify_with_keys(&cluster.suite, &cluster.all_keys()));

    assert!(cluster.record(2).done.is_empty());
    let included = cluster.record(1).done.clone();
    assert_eq!(included.len(), 1);
    let (leaf, root, proof) = &included[0];
    assert_eq!(root, &signature.message);
    assert!(check_proof(&cluster.suite, root, leaf, proof));
}

#[test]
fn uncommitted_child_is_not_waited_for_at_respond() {
    let mut cluster = Cluster::new(3, 2, params(SigningMode::PubKey), |name| {
        if name.as_str() == "n2" {
            let strategy = ImposedFailures::for_node(name)
                .dead_for(Phase::Commit)
                .dead_for(Phase::Respond);
            Box::new(strategy) as Box<dyn FailureStrategy>
        } else {
            Box::new(NeverFail)
        }
    });
    cluster.node(0).start_signing_round(b"no second wait".to_vec()).unwrap();
    cluster.pump();
    assert!(cluster.record(0).signatures.is_empty());

    // Only the commit deadline passes. n1's response alone completes the round.
    cluster.tick_all(Instant::now() + Duration::from_secs(15));
    cluster.pump();

    let signatures = cluster.record(0).signatures.clone();
    assert_eq!(signatures.len(), 1);
    assert_eq!(exception_keys(&signatures[0]), encoded(&cluster.suite, &[cluster.key(2)]));
    assert!(signatures[0].verify_with_keys(&cluster.suite, &cluster.all_keys()));
}

#[test]
fn stale_announcement_is_rejected_without_new_state() {
    let mut cluster = Cluster::new(3, 1, params(SigningMode::PubKey), never_fail);
    cluster.node(0).start_signing_round(b"first".to_vec()).unwrap();
    cluster.pump();

    let am = AnnouncementMessage {
        log_test: b"again".to_vec(),
        round: RoundNumber::new(1),
        vote: None,
    };
    let replay = cluster.node(0).envelope(ViewNumber::init(), Payload::Announcement(am));
    let result = cluster.node(1).dispatch(name(0), replay);
    assert!(matches!(result, Err(SignError::PastRound { .. })));
    assert!(cluster.node(1).rounds.is_empty());
}

#[test]
fn expired_heartbeat_moves_the_tree_to_the_next_view() {
    let mut cluster = Cluster::new(4, 3, params(SigningMode::PubKey), never_fail);
    cluster.node(0).start_signing_round(b"arm".to_vec()).unwrap();
    cluster.pump();

    cluster.tick_all(Instant::now() + Duration::from_secs(2000));
    cluster.pump();

    for i in 0..4 {
        let node = cluster.node(i);
        assert_eq!(node.view(), ViewNumber::new(1));
        assert!(!node.changing_view());
        assert_eq!(node.last_applied_vote(), 1);
        assert_eq!(node.view_snapshot(ViewNumber::new(1)).unwrap().root, name(1));
    }
    assert_eq!(cluster.record(1).signatures.len(), 1);
    assert!(cluster
        .events(1)
        .iter()
        .any(|event| matches!(event, Event::RoundDone(done) if done.round_type == RoundType::ViewChange)));

    // The new root signs.
    cluster.node(1).start_signing_round(b"view one".to_vec()).unwrap();
    cluster.pump();
    let signature = cluster.record(1).signatures[1].clone();
    assert_eq!(signature.view, ViewNumber::new(1));
    assert!(signature.verify_with_keys(&cluster.suite, &cluster.all_keys()));
}

#[test]
fn partitioned_node_catches_up_before_acting_on_a_new_view() {
    let mut cluster = Cluster::new(4, 3, params(SigningMode::PubKey), never_fail);
    cluster.cut_off.lock().unwrap().insert(name(3));

    for i in 0..4 {
        let _ = cluster.node(i).try_view_change(ViewNumber::new(1));
    }
    cluster.pump();
    cluster.tick_all(Instant::now() + Duration::from_secs(15));
    cluster.pump();
    cluster.tick_all(Instant::now() + Duration::from_secs(30));
    cluster.pump();
    assert_eq!(cluster.node(1).view(), ViewNumber::new(1));
    assert_eq!(cluster.node(3).view(), ViewNumber::init());

    cluster.cut_off.lock().unwrap().clear();
    cluster.node(1).start_signing_round(b"after the partition".to_vec()).unwrap();
    cluster.pump();
    assert_eq!(cluster.node(3).view(), ViewNumber::new(1));
    assert_eq!(cluster.node(3).last_applied_vote(), 1);
    assert!(cluster.events(3).iter().any(|event| matches!(event, Event::CatchUp(_))));

    // The deferred announcement is dispatched on the next tick.
    cluster.node(3).tick(Instant::now());
    cluster.pump();
    let signatures = cluster.record(1).signatures.clone();
    let signature = signatures.last().unwrap();
    assert_eq!(signature.message, b"after the partition".to_vec());
    assert!(signature.exception_list.is_empty());
    assert!(signature.verify_with_keys(&cluster.suite, &cluster.all_keys()));
}

#[test]
fn outsider_is_admitted_by_vote() {
    let mut cluster = Cluster::new(3, 2, params(SigningMode::PubKey), never_fail);
    let suite = cluster.suite;
    let newcomer = keypair(&suite, 3);
    cluster.spawn(3, Box::new(NeverFail));
    assert!(cluster.node(3).view_snapshot(ViewNumber::init()).is_err());

    let add = VoteKind::Add(AddVote {
        view: ViewNumber::init(),
        name: name(3),
        parent: name(3),
        public_key: suite.encode_point(newcomer.public()),
    });
    cluster.node(3).request_group_change(&name(1), add).unwrap();
    cluster.pump();

    for i in 0..3 {
        let host_list = cluster.node(i).shared.views().host_list_on(ViewNumber::new(1));
        assert!(host_list.contains(&name(3)));
        assert_eq!(cluster.node(i).last_applied_vote(), 1);
    }
    let joined = cluster.node(3).view_snapshot(ViewNumber::new(1)).unwrap();
    assert!(joined.contains(&name(3)));
    assert_eq!(joined.root, name(1));

    for i in 0..4 {
        let _ = cluster.node(i).try_view_change(ViewNumber::new(1));
    }
    cluster.pump();
    for i in 0..4 {
        assert_eq!(cluster.node(i).view(), ViewNumber::new(1), "node {} did not move", i);
    }

    cluster.node(1).start_signing_round(b"four of us".to_vec()).unwrap();
    cluster.pump();
    let signature = cluster.record(1).signatures.last().unwrap().clone();
    let mut keys = cluster.all_keys();
    keys.push(*newcomer.public());
    assert!(signature.exception_list.is_empty());
    assert!(signature.verify_with_keys(&suite, &keys));
}
