//! Disjoint-set of member ids that refer to the same person.
//!
//! The canonical id of a class is chosen deterministically:
//! a pinned id (the signed-in user's real id) always wins its class, otherwise
//! the smallest id in UUID byte order wins. The root of every class is kept
//! equal to that canonical id, so `canonical` is a plain parent walk.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::schemas::MemberId;

#[derive(Clone, Debug, Default)]
pub struct IdentityGraph {
    parent: HashMap<MemberId, MemberId>,
    pinned: HashSet<MemberId>,
}

impl IdentityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `id` the canonical id of whatever class it ends up in.
    pub fn pin(&mut self, id: MemberId) {
        self.parent.entry(id).or_insert(id);
        let root = self.find(id);
        if root != id && !self.pinned.contains(&root) {
            self.parent.insert(root, id);
            self.parent.insert(id, id);
        }
        self.pinned.insert(id);
    }

    /// Register an id without relating it to anything.
    pub fn insert(&mut self, id: MemberId) {
        self.parent.entry(id).or_insert(id);
    }

    /// Merge the classes of `a` and `b`; returns the surviving canonical id.
    pub fn union(&mut self, a: MemberId, b: MemberId) -> MemberId {
        self.insert(a);
        self.insert(b);
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return root_a;
        }
        let winner = self.preferred(root_a, root_b);
        let loser = if winner == root_a { root_b } else { root_a };
        self.parent.insert(loser, winner);
        winner
    }

    /// Canonical id for `id`. Unknown ids are their own canonical id.
    pub fn canonical(&self, id: MemberId) -> MemberId {
        let mut current = id;
        while let Some(&parent) = self.parent.get(&current) {
            if parent == current {
                break;
            }
            current = parent;
        }
        current
    }

    pub fn are_same_person(&self, a: MemberId, b: MemberId) -> bool {
        a == b || self.canonical(a) == self.canonical(b)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.parent.contains_key(&id)
    }

    /// Every known id that is not canonical, mapped to its canonical id.
    pub fn alias_map(&self) -> BTreeMap<MemberId, MemberId> {
        self.parent
            .keys()
            .filter_map(|&id| {
                let canonical = self.canonical(id);
                (canonical != id).then_some((id, canonical))
            })
            .collect()
    }

    /// Equivalence classes keyed by canonical id.
    pub fn classes(&self) -> BTreeMap<MemberId, BTreeSet<MemberId>> {
        let mut classes: BTreeMap<MemberId, BTreeSet<MemberId>> = BTreeMap::new();
        for &id in self.parent.keys() {
            classes.entry(self.canonical(id)).or_default().insert(id);
        }
        classes
    }

    /// Fold every relation known to `other` into this graph.
    pub fn absorb(&mut self, other: &IdentityGraph) {
        for &id in other.parent.keys() {
            self.union(id, other.canonical(id));
        }
        for &id in &other.pinned {
            self.pin(id);
        }
    }

    fn find(&mut self, id: MemberId) -> MemberId {
        let root = self.canonical(id);
        let mut current = id;
        while current != root {
            let next = self.parent.get(&current).copied().unwrap_or(root);
            self.parent.insert(current, root);
            current = next;
        }
        root
    }

    fn preferred(&self, a: MemberId, b: MemberId) -> MemberId {
        match (self.pinned.contains(&a), self.pinned.contains(&b)) {
            (true, false) => a,
            (false, true) => b,
            _ => a.min(b),
        }
    }
}
