/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the signing protocol.
//!
//! Types specific to single components, e.g., the [round](crate::signing::round) state, live next to
//! those components.

pub mod basic;

pub mod keypair;

pub mod roster;

pub mod suite;

pub mod view;

pub mod vote;
