use std::{
    thread,
    time::{Duration, Instant},
};

use cosi_rs::{
    failure::ImposedFailures,
    types::{
        basic::NodeName,
        keypair::Keypair,
        roster::Roster,
        suite::{Ristretto255, Suite},
    },
};
use rand_core::OsRng;

use crate::common::{
    network::mock_network,
    node::{Node, NodeOptions},
};

pub(crate) type Point = <Ristretto255 as Suite>::Point;

pub(crate) fn name(i: usize) -> NodeName {
    NodeName::new(format!("node-{}", i))
}

/// `size` signers sharing one roster and one mock network, `node-0` first in the host list.
pub(crate) struct Cluster {
    pub(crate) nodes: Vec<Node>,
    pub(crate) keys: Vec<Point>,
}

pub(crate) fn start_cluster(
    size: usize,
    options: NodeOptions,
    failures: impl Fn(&NodeName) -> ImposedFailures,
) -> Cluster {
    // 1. Create a keypair for every signer.
    let mut csprg = OsRng {};
    let keypairs: Vec<Keypair<Ristretto255>> = (0..size)
        .map(|_| Keypair::generate(&Ristretto255, &mut csprg))
        .collect();
    let keys: Vec<Point> = keypairs.iter().map(|keypair| *keypair.public()).collect();

    // 2. Everybody starts from the same roster.
    let roster = Roster::new((0..size).map(name).zip(keys.iter().cloned()));

    // 3. Connect and start them all.
    let network_stubs = mock_network((0..size).map(name));
    let nodes = keypairs
        .into_iter()
        .zip(network_stubs)
        .enumerate()
        .map(|(i, (keypair, network))| {
            let me = name(i);
            let failure_strategy = failures(&me);
            Node::new(me, keypair, roster.clone(), network, options.clone(), failure_strategy)
        })
        .collect();

    Cluster { nodes, keys }
}

pub(crate) fn no_failures(name: &NodeName) -> ImposedFailures {
    ImposedFailures::for_node(name)
}

/// Poll `condition` every 100ms until it holds. Panics after `timeout`.
pub(crate) fn wait_until(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    log::debug!("Waiting until {}", what);
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(100));
    }
}
