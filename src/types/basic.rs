/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected, but have no active behavior. These types follow the
//! newtype pattern and the API for using them is defined in this module.

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
};

/// Number of a view, i.e., an epoch during which one tree topology (and therefore one root) is in force.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub const fn init() -> Self {
        Self(0)
    }

    /// The view immediately before this one. View 0 is its own predecessor.
    pub fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;
    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0 + rhs)
    }
}

impl AddAssign<u64> for ViewNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Number of a signing (or voting) round. Round numbers are strictly increasing on every node.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct RoundNumber(u64);

impl RoundNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for RoundNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for RoundNumber {
    type Output = RoundNumber;
    fn add(self, rhs: u64) -> Self::Output {
        RoundNumber(self.0 + rhs)
    }
}

impl Sub<RoundNumber> for RoundNumber {
    type Output = u64;
    fn sub(self, rhs: RoundNumber) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// Position of a vote in the vote log. Index 0 means "no vote".
pub type VoteIndex = u64;

/// The name a node is known by on the network and in the host list.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Display for NodeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for NodeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Upper bound on the total encoded size, in bytes, of the messages kept in the future-view message buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSize(u64);

impl BufferSize {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}
