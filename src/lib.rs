/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Collective Schnorr signing over a tree of signers, with Merkle accountability, exception lists for
//! nodes that fail mid-round, and view changes driven by a heartbeat and decided by voting rounds.
//!
//! Start a [Signer](signer::Signer) for each node through [SignerSpec](signer::SignerSpec), plugging in an
//! [App](app::App) and a [Network](networking::Network). The root of the current view starts rounds; every
//! completed round yields a [CollectiveSignature](signing::signature::CollectiveSignature).

pub mod app;

pub(crate) mod dispatch;

pub(crate) mod event_bus;

pub mod events;

pub mod failure;

pub mod logging;

pub mod messages;

pub mod networking;

pub(crate) mod node;

pub mod signer;

pub mod signing;

pub mod types;

pub(crate) mod view_change;

pub(crate) mod voting;

#[cfg(test)]
mod tests;
