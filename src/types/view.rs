/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Tree membership per view: [View] is the topology one node sees during one view, and [Views] is the
//! table of all views that node knows about.
//!
//! ## Topology
//!
//! Every node derives the same tree from the same host list, so no topology needs to be exchanged. For
//! view `v`:
//! 1. The root is `root_for(v)`: the host list of view `v - 1` indexed by `v % len` (view 0 uses its own
//!    host list).
//! 2. The host list of `v` is rotated so that the root comes first.
//! 3. The rotated list is read as a complete k-ary tree: the children of position `i` are positions
//!    `i*k + 1 ..= i*k + k`.
//!
//! ## Host list changes
//!
//! Accepted Add and Remove votes name the view from which they take effect. Until that view is created
//! they wait as pending [HostListAction]s, which are applied when the view is derived from its
//! predecessor.

use std::collections::BTreeMap;

use super::basic::{NodeName, ViewNumber};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostListAction {
    Add(NodeName),
    Remove(NodeName),
}

/// One node's picture of the tree during one view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct View {
    pub num: ViewNumber,
    pub root: NodeName,
    pub parent: Option<NodeName>,
    pub children: Vec<NodeName>,
    pub host_list: Vec<NodeName>,
    order: Vec<NodeName>,
    branching_factor: usize,
}

impl View {
    /// Lay out the k-ary tree for `host_list` rooted at `root`, as seen from `me`.
    pub fn layout(
        num: ViewNumber,
        host_list: Vec<NodeName>,
        root: &NodeName,
        me: &NodeName,
        branching_factor: usize,
    ) -> View {
        let branching_factor = branching_factor.max(1);
        let start = host_list.iter().position(|name| name == root).unwrap_or(0);
        let order: Vec<NodeName> = host_list[start..]
            .iter()
            .chain(host_list[..start].iter())
            .cloned()
            .collect();
        let root = order.first().cloned().unwrap_or_else(|| root.clone());

        let (parent, children) = match order.iter().position(|name| name == me) {
            Some(pos) => (
                (pos > 0).then(|| order[(pos - 1) / branching_factor].clone()),
                child_positions(pos, branching_factor, order.len())
                    .map(|i| order[i].clone())
                    .collect(),
            ),
            None => (None, Vec::new()),
        };

        View {
            num,
            root,
            parent,
            children,
            host_list,
            order,
            branching_factor,
        }
    }

    pub fn is_root(&self, me: &NodeName) -> bool {
        &self.root == me
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_parent(&self, name: &NodeName) -> bool {
        self.parent.as_ref() == Some(name)
    }

    pub fn is_child(&self, name: &NodeName) -> bool {
        self.children.contains(name)
    }

    pub fn contains(&self, name: &NodeName) -> bool {
        self.host_list.contains(name)
    }

    pub fn add_parent(&mut self, parent: NodeName) {
        self.parent = Some(parent);
    }

    pub fn add_children(&mut self, children: impl IntoIterator<Item = NodeName>) {
        for child in children {
            if !self.children.contains(&child) {
                self.children.push(child);
            }
        }
    }

    /// Returns whether `child` was a child in this view.
    pub fn remove_child(&mut self, child: &NodeName) -> bool {
        let before = self.children.len();
        self.children.retain(|name| name != child);
        before != self.children.len()
    }

    /// Forget `peer` entirely: host list, children and parent. Returns whether anything changed.
    pub fn remove_peer(&mut self, peer: &NodeName) -> bool {
        let before = self.host_list.len();
        self.host_list.retain(|name| name != peer);
        self.order.retain(|name| name != peer);
        let was_child = self.remove_child(peer);
        let was_parent = self.parent.as_ref() == Some(peer);
        if was_parent {
            self.parent = None;
        }
        before != self.host_list.len() || was_child || was_parent
    }

    /// Every node in the subtree rooted at `name` (including `name`), following this view's layout.
    pub fn subtree(&self, name: &NodeName) -> Vec<NodeName> {
        let Some(top) = self.order.iter().position(|n| n == name) else {
            return Vec::new();
        };
        let mut members = Vec::new();
        let mut stack = vec![top];
        while let Some(pos) = stack.pop() {
            members.push(self.order[pos].clone());
            stack.extend(child_positions(pos, self.branching_factor, self.order.len()));
        }
        members
    }

    /// Number of levels below `name` in this view's layout. Zero for a leaf (or an unknown name).
    pub fn subtree_height(&self, name: &NodeName) -> usize {
        let Some(top) = self.order.iter().position(|n| n == name) else {
            return 0;
        };
        let mut height = 0;
        let mut frontier = vec![top];
        loop {
            frontier = frontier
                .iter()
                .flat_map(|pos| child_positions(*pos, self.branching_factor, self.order.len()))
                .collect();
            if frontier.is_empty() {
                return height;
            }
            height += 1;
        }
    }
}

fn child_positions(pos: usize, branching_factor: usize, len: usize) -> impl Iterator<Item = usize> {
    let first = pos * branching_factor + 1;
    (first..first + branching_factor).filter(move |i| *i < len)
}

/// All views a node knows about, keyed by view number.
#[derive(Clone, Debug)]
pub struct Views {
    me: NodeName,
    branching_factor: usize,
    views: BTreeMap<ViewNumber, View>,
    pending: BTreeMap<ViewNumber, Vec<HostListAction>>,
}

impl Views {
    /// Create the table with view 0 laid out over `host_list`.
    pub fn new(me: NodeName, branching_factor: usize, host_list: Vec<NodeName>) -> Views {
        let mut views = Views::empty(me, branching_factor);
        if let Some(root) = host_list.first().cloned() {
            views.install(ViewNumber::init(), host_list, &root);
        }
        views
    }

    /// A table with no views, for a node that has not been admitted to the host list yet.
    pub fn empty(me: NodeName, branching_factor: usize) -> Views {
        Views {
            me,
            branching_factor,
            views: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn me(&self) -> &NodeName {
        &self.me
    }

    pub fn get(&self, view: ViewNumber) -> Option<&View> {
        self.views.get(&view)
    }

    pub fn latest(&self) -> Option<&View> {
        self.views.values().next_back()
    }

    /// The host list in force at `view`: the newest known view at or below `view`, with the pending actions
    /// of every later view up to `view` applied.
    pub fn host_list_on(&self, view: ViewNumber) -> Vec<NodeName> {
        if let Some(existing) = self.views.get(&view) {
            return existing.host_list.clone();
        }
        let (base_view, mut host_list) = match self.views.range(..=view).next_back() {
            Some((num, existing)) => (*num, existing.host_list.clone()),
            None => return Vec::new(),
        };
        for (_, actions) in self.pending.range(base_view + 1..=view) {
            apply_actions(&mut host_list, actions);
        }
        host_list
    }

    /// The node expected to be root in `view`.
    pub fn root_for(&self, view: ViewNumber) -> Option<NodeName> {
        let host_list = self.host_list_on(view.prev());
        if host_list.is_empty() {
            return None;
        }
        Some(host_list[(view.int() % host_list.len() as u64) as usize].clone())
    }

    /// Derive `view` from its predecessor if it does not exist yet, creating any missing views in
    /// between. Returns `None` if there is no earlier view to derive from.
    pub fn new_view_from_prev(&mut self, view: ViewNumber) -> Option<&View> {
        if !self.views.contains_key(&view) {
            let latest = *self.views.keys().next_back()?;
            if latest > view {
                return None;
            }
            let mut num = latest + 1;
            while num <= view {
                let root = self.root_for(num)?;
                let host_list = self.host_list_on(num);
                self.install(num, host_list, &root);
                num += 1;
            }
        }
        self.views.get(&view)
    }

    /// Install `view` with an explicit host list and root, replacing whatever was known about it.
    pub fn install(&mut self, view: ViewNumber, host_list: Vec<NodeName>, root: &NodeName) -> &View {
        let laid_out = View::layout(view, host_list, root, &self.me, self.branching_factor);
        self.views.insert(view, laid_out);
        &self.views[&view]
    }

    /// Schedule a host-list change that takes effect from `view`. If `view` already exists it is re-laid out.
    pub fn schedule(&mut self, view: ViewNumber, action: HostListAction) {
        self.pending.entry(view).or_default().push(action.clone());
        if let Some(existing) = self.views.get(&view) {
            let mut host_list = existing.host_list.clone();
            let root = existing.root.clone();
            apply_actions(&mut host_list, &[action]);
            self.install(view, host_list, &root);
        }
    }

    /// Drop views (and applied actions) older than `view`, always keeping at least one view.
    pub fn prune_before(&mut self, view: ViewNumber) {
        let keep_from = match self.views.range(..=view).next_back() {
            Some((num, _)) => *num,
            None => return,
        };
        self.views = self.views.split_off(&keep_from);
        self.pending = self.pending.split_off(&keep_from);
    }
}

fn apply_actions(host_list: &mut Vec<NodeName>, actions: &[HostListAction]) {
    for action in actions {
        match action {
            HostListAction::Add(name) => {
                if !host_list.contains(name) {
                    host_list.push(name.clone())
                }
            }
            HostListAction::Remove(name) => host_list.retain(|n| n != name),
        }
    }
}
