//! [`LeafApp`], a simple implementation of [`App`] used in all of the integration tests.

use std::sync::{Arc, Mutex};

use cosi_rs::{
    app::App,
    signing::merkle::Proof,
    types::basic::{NodeName, ViewNumber},
};

/// An inclusion proof handed to the app at the end of a round.
#[derive(Clone, Debug)]
pub(crate) struct Inclusion {
    pub(crate) leaf: Vec<u8>,
    pub(crate) collective_root: Vec<u8>,
    pub(crate) proof: Proof,
}

/// Contributes one leaf per round, `<name>/<view>/<count>`, and records the proof it gets back for it.
pub(crate) struct LeafApp {
    name: NodeName,
    count: u64,
    inclusions: Arc<Mutex<Vec<Inclusion>>>,
}

impl LeafApp {
    pub(crate) fn new(name: NodeName, inclusions: Arc<Mutex<Vec<Inclusion>>>) -> LeafApp {
        LeafApp {
            name,
            count: 0,
            inclusions,
        }
    }
}

impl App for LeafApp {
    fn commit(&mut self, view: ViewNumber) -> Option<Vec<u8>> {
        self.count += 1;
        Some(format!("{}/{}/{}", self.name, view, self.count).into_bytes())
    }

    fn done(&mut self, _view: ViewNumber, client_root: &[u8], collective_root: &[u8], proof: &Proof) {
        self.inclusions.lock().unwrap().push(Inclusion {
            leaf: client_root.to_vec(),
            collective_root: collective_root.to_vec(),
            proof: proof.clone(),
        });
    }
}
