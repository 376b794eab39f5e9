use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use cosi_rs::{
    messages::SigningMessage,
    networking::{Network, NetworkError},
    types::basic::NodeName,
};

/// A mock network stub which passes messages from and to threads using channels.
///
/// A stub can be cut off from the rest of the network with [set_down](NetworkStub::set_down): while down,
/// everything it sends is dropped and everything addressed to it is discarded on arrival.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: NodeName,
    all_peers: HashMap<NodeName, Sender<(NodeName, SigningMessage)>>,
    inbox: Arc<Mutex<Receiver<(NodeName, SigningMessage)>>>,
    down: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl NetworkStub {
    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

impl Network for NetworkStub {
    fn connect(&mut self) -> Result<(), NetworkError> {
        Ok(())
    }

    fn send(&mut self, peer: &NodeName, message: SigningMessage) -> Result<(), NetworkError> {
        if self.closed() {
            return Err(NetworkError::Closed);
        }
        if self.is_down() {
            return Ok(());
        }
        if let Some(peer) = self.all_peers.get(peer) {
            let _ = peer.send((self.me.clone(), message));
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<(NodeName, SigningMessage)>, NetworkError> {
        let received = match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => return Err(NetworkError::Closed),
        };
        if self.is_down() {
            return Ok(None);
        }
        Ok(received)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = NodeName>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(NodeName, Receiver<(NodeName, SigningMessage)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer.clone(), sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(me, inbox)| NetworkStub {
            me,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            down: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        })
        .collect()
}
