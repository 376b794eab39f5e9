use std::time::Duration;

use cosi_rs::{
    failure::ImposedFailures,
    signing::round::{RoundType, SigningMode},
    types::{basic::ViewNumber, suite::Ristretto255},
};
use log::LevelFilter;

mod common;

use crate::common::{
    cluster::{name, start_cluster, wait_until},
    logging::setup_logger,
    node::NodeOptions,
};

#[test]
fn dead_root_is_replaced_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Start 4 signers under one root. Every root signs a round every 300ms on its own.
    let options = NodeOptions {
        branching_factor: 3,
        signing_mode: SigningMode::PubKey,
        heartbeat_timeout: Duration::from_secs(2),
        round_period: Some(Duration::from_millis(300)),
        ..NodeOptions::default()
    };
    let cluster = start_cluster(4, options, ImposedFailures::for_node);
    let first_root = &cluster.nodes[0];
    wait_until("node-0 signs as root", Duration::from_secs(10), || {
        !first_root.finished_rounds().is_empty()
    });

    // 2. Kill the root. The others stop hearing from it and move to view 1, where node-1 is root.
    first_root.set_down(true);
    let next_root = &cluster.nodes[1];
    wait_until("the live signers reach view 1", Duration::from_secs(20), || {
        cluster.nodes[1..].iter().all(|node| node.view() >= ViewNumber::new(1))
    });

    // 3. The new root keeps signing, with node-0 excepted.
    wait_until("node-1 signs as root", Duration::from_secs(20), || {
        !next_root.finished_signing_rounds().is_empty()
    });
    let view_change = &next_root.finished_rounds()[0];
    assert_eq!(view_change.round_type, RoundType::ViewChange);
    assert!(view_change.verified);

    let round = &next_root.finished_signing_rounds()[0];
    assert_eq!(round.signature.view, ViewNumber::new(1));
    assert!(round.verified);
    assert_eq!(round.signature.exception_list.len(), 1);
    assert!(round.signature.verify_with_keys(&Ristretto255, &cluster.keys));
}

#[test]
fn views_rotate_after_fixed_number_of_rounds_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Start 4 signers that change view after every 2nd round.
    let options = NodeOptions {
        branching_factor: 3,
        signing_mode: SigningMode::PubKey,
        round_period: Some(Duration::from_millis(200)),
        rounds_per_view: Some(2),
        ..NodeOptions::default()
    };
    let cluster = start_cluster(4, options, ImposedFailures::for_node);

    // 2. Wait for two view changes.
    wait_until("every signer reaches view 2", Duration::from_secs(30), || {
        cluster.nodes.iter().all(|node| node.view() >= ViewNumber::new(2))
    });

    // 3. Round numbers run on across views: node-0 signs rounds 1 and 2, node-1 proposes round 3 and signs
    // round 4, and node-2 proposes the change to view 2.
    assert_eq!(cluster.nodes[0].finished_signing_rounds().len(), 2);
    assert!(!cluster.nodes[1].finished_signing_rounds().is_empty());
    assert!(cluster.nodes[2]
        .finished_rounds()
        .iter()
        .any(|round| round.round_type == RoundType::ViewChange && round.signature.view == ViewNumber::new(2)));
    assert!(cluster.nodes.iter().all(|node| node.status().last_applied_vote >= 2));
}

#[test]
fn failing_root_is_skipped_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Start 7 signers in a binary tree. Every root fails every 2nd round it announces.
    let options = NodeOptions {
        signing_mode: SigningMode::PubKey,
        heartbeat_timeout: Duration::from_secs(2),
        round_period: Some(Duration::from_millis(300)),
        ..NodeOptions::default()
    };
    let cluster = start_cluster(7, options, |me| ImposedFailures::for_node(me).fail_as_root_every(2));

    // 2. The silent round stalls the heartbeat, so the tree moves on.
    wait_until("every signer reaches view 1", Duration::from_secs(30), || {
        cluster.nodes.iter().all(|node| node.view() >= ViewNumber::new(1))
    });

    // 3. node-0 only ever finished its first round.
    let first_root_rounds = cluster.nodes[0].finished_signing_rounds();
    assert_eq!(first_root_rounds.len(), 1);
    assert_eq!(first_root_rounds[0].signature.round.int(), 1);
    assert_eq!(cluster.nodes[1].host_list_on(ViewNumber::new(1)).map(|hosts| hosts.len()), Some(7));
    assert_eq!(cluster.nodes[1].name(), &name(1));

    // 4. The stall started one change to view 1 per signer. node-0 and node-1 time out first, so both tried;
    // a signer that hears node-1's proposal before its own heartbeat expires never needs to.
    let attempts: Vec<usize> = cluster
        .nodes
        .iter()
        .map(|node| node.view_change_attempts(ViewNumber::new(1)))
        .collect();
    assert!(attempts.iter().all(|count| *count <= 1), "attempts per signer: {:?}", attempts);
    assert_eq!(attempts[0], 1);
    assert_eq!(attempts[1], 1);

    // 5. Round numbers keep growing across the change.
    let next_root = &cluster.nodes[1];
    wait_until("node-1 signs in view 1", Duration::from_secs(20), || {
        next_root
            .finished_signing_rounds()
            .iter()
            .any(|round| round.signature.view == ViewNumber::new(1))
    });
    let first_in_view_1 = next_root
        .finished_signing_rounds()
        .into_iter()
        .find(|round| round.signature.view == ViewNumber::new(1))
        .unwrap();
    assert!(first_in_view_1.verified);
    assert!(first_in_view_1.signature.round > first_root_rounds[0].signature.round);
}
