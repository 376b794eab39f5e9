/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fault injection: a [FailureStrategy] decides, phase by phase, whether a node pretends to have crashed.
//!
//! A failing node simply stays silent for that phase: it does not forward the announcement, send its
//! commitment, or send its response. Its parent's phase deadline then excludes it, and if it is the root,
//! the heartbeat of every other node eventually expires and triggers a view change.
//!
//! Voting rounds are never subject to fault injection.

use std::collections::HashSet;

use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::types::basic::{NodeName, RoundNumber, ViewNumber};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Announce,
    Commit,
    Respond,
}

#[derive(Clone, Debug)]
pub struct FailureContext {
    pub phase: Phase,
    pub round: RoundNumber,
    pub view: ViewNumber,
    pub is_root: bool,
}

pub trait FailureStrategy: Send + 'static {
    fn should_fail(&mut self, context: &FailureContext) -> bool;
}

/// Never fails. The default.
pub struct NeverFail;

impl FailureStrategy for NeverFail {
    fn should_fail(&mut self, _: &FailureContext) -> bool {
        false
    }
}

/// Configurable imposed failures.
///
/// - `fail_as_root_every(n)`: as root, stay silent at the Announce phase of every non-zero round that is a
///   multiple of `n`.
/// - `fail_as_follower_every(n)`: the same, as a non-root node.
/// - `failure_rate(p)`: additionally fail any phase with probability `p` percent.
/// - `dead_for(phase)`: always fail `phase`.
pub struct ImposedFailures {
    fail_as_root_every: u64,
    fail_as_follower_every: u64,
    failure_rate: u32,
    dead_for: HashSet<Phase>,
    rng: StdRng,
}

impl ImposedFailures {
    /// A strategy whose random failures are seeded from the node's name, so runs are reproducible.
    pub fn for_node(name: &NodeName) -> ImposedFailures {
        let digest = Sha256::digest(name.bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        ImposedFailures::with_seed(u64::from_le_bytes(seed))
    }

    pub fn with_seed(seed: u64) -> ImposedFailures {
        ImposedFailures {
            fail_as_root_every: 0,
            fail_as_follower_every: 0,
            failure_rate: 0,
            dead_for: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn fail_as_root_every(mut self, every: u64) -> Self {
        self.fail_as_root_every = every;
        self
    }

    pub fn fail_as_follower_every(mut self, every: u64) -> Self {
        self.fail_as_follower_every = every;
        self
    }

    pub fn failure_rate(mut self, percent: u32) -> Self {
        self.failure_rate = percent.min(100);
        self
    }

    pub fn dead_for(mut self, phase: Phase) -> Self {
        self.dead_for.insert(phase);
        self
    }
}

impl FailureStrategy for ImposedFailures {
    fn should_fail(&mut self, context: &FailureContext) -> bool {
        if self.dead_for.contains(&context.phase) {
            return true;
        }
        if context.phase == Phase::Announce {
            let round = context.round.int();
            let every = if context.is_root {
                self.fail_as_root_every
            } else {
                self.fail_as_follower_every
            };
            if every != 0 && round != 0 && round % every == 0 {
                return true;
            }
        }

        self.failure_rate != 0 && self.rng.gen_range(0..100) < self.failure_rate
    }
}
