/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, as well as the internal
//! [SenderHandle] that phase handlers use to reach their parent, children and arbitrary peers.
//!
//! Peers are addressed by [NodeName]. A networking provider is free to use any transport as long as it
//! delivers whole [SigningMessage]s and reports failures as [NetworkError]s. Temporary failures are
//! logged and ignored; the protocol copes with lost messages through its phase deadlines and heartbeat.

use thiserror::Error;

use crate::messages::SigningMessage;
use crate::types::basic::NodeName;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// A transient failure. The caller may continue using the network.
    #[error("temporary network error: {0}")]
    Temporary(String),
    /// The connection has been closed and will not come back.
    #[error("connection closed")]
    Closed,
    /// The connection was never established.
    #[error("connection not established")]
    NotEstablished,
}

impl NetworkError {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NetworkError::Temporary(_))
    }
}

pub trait Network: Clone + Send {
    /// Establish connections to the peers. Called once, on the dispatch thread, before any message is sent.
    fn connect(&mut self) -> Result<(), NetworkError>;

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: &NodeName, message: SigningMessage) -> Result<(), NetworkError>;

    /// Receive a message from any peer. Returns immediately with `Ok(None)` if no message is available now.
    fn recv(&mut self) -> Result<Option<(NodeName, SigningMessage)>, NetworkError>;

    /// Close every connection. Subsequent calls to `send` and `recv` should fail with [NetworkError::Closed].
    fn close(&mut self);

    fn closed(&self) -> bool;
}

/// A wrapper around a [Network] used by the protocol to send messages. Temporary send failures are logged
/// and swallowed; terminal failures are returned.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    pub(crate) fn send(&mut self, peer: &NodeName, message: SigningMessage) -> Result<(), NetworkError> {
        match self.network.send(peer, message) {
            Err(NetworkError::Temporary(reason)) => {
                log::warn!("sending to {} failed temporarily: {}", peer, reason);
                Ok(())
            }
            result => result,
        }
    }

    /// Send a copy of `message` to each of `peers`, stopping at the first terminal failure.
    pub(crate) fn multicast(&mut self, peers: &[NodeName], message: &SigningMessage) -> Result<(), NetworkError> {
        for peer in peers {
            self.send(peer, message.clone())?;
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.network.close()
    }

    pub(crate) fn closed(&self) -> bool {
        self.network.closed()
    }
}
