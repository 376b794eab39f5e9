/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [Roster]: every node's name and public key, in host-list order.
//!
//! The order of the roster is significant: it is the initial host list, and therefore decides the root of
//! view 0 and the shape of every tree derived from it.

use std::collections::HashMap;

use super::{basic::NodeName, suite::Suite};

#[derive(Clone)]
pub struct Roster<S: Suite> {
    host_list: Vec<NodeName>,
    keys: HashMap<NodeName, S::Point>,
}

impl<S: Suite> Roster<S> {
    /// Build a roster from `(name, public key)` pairs. Later duplicates of a name are ignored.
    pub fn new(entries: impl IntoIterator<Item = (NodeName, S::Point)>) -> Roster<S> {
        let mut host_list = Vec::new();
        let mut keys = HashMap::new();
        for (name, key) in entries {
            if !keys.contains_key(&name) {
                host_list.push(name.clone());
                keys.insert(name, key);
            }
        }
        Roster { host_list, keys }
    }

    pub fn host_list(&self) -> &[NodeName] {
        &self.host_list
    }

    pub fn public_key(&self, name: &NodeName) -> Option<&S::Point> {
        self.keys.get(name)
    }

    pub fn contains(&self, name: &NodeName) -> bool {
        self.keys.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.host_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host_list.is_empty()
    }

    /// Learn the key of a peer that joins later. The initial host list is not changed.
    pub(crate) fn insert_key(&mut self, name: NodeName, key: S::Point) {
        self.keys.insert(name, key);
    }

    /// Sum of the public keys of every node in the roster's host list.
    pub fn aggregate_public_key(&self, suite: &S) -> S::Point {
        suite.point_sum(self.host_list.iter().filter_map(|name| self.keys.get(name)))
    }
}
