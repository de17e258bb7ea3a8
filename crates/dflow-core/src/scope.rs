//! Scope tree: the conditional/loop region structure of a resolved graph.
//!
//! Every node of a resolved graph belongs to exactly one scope:
//! - [`Scope::Root`] is the unconditional region seeded by the output node;
//! - [`Scope::Branch`] is one arm of a [`Switch`](crate::ops::OpKind::Switch)
//!   or the body of a [`LoopEnd`](crate::ops::OpKind::LoopEnd);
//! - [`Scope::Union`] is the least upper bound of several branches -- the
//!   scope a node must live in when its value is consumed along more than
//!   one path.
//!
//! Scopes are interned in a [`ScopeArena`]: structurally equal scopes share a
//! [`ScopeId`], so scope comparison downstream is id equality.
//!
//! Union normalization (run to fixpoint by [`ScopeArena::union`]):
//! 1. flatten nested unions and drop duplicates;
//! 2. drop every branch that descends from another member (the wider region
//!    subsumes it);
//! 3. a set containing all arms of one switch collapses to that switch's
//!    parent scope (loop bodies never collapse -- a loop has a single arm).
//! Root subsumes everything, so any Root member makes the union Root.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::id::{NodeId, ScopeId};

/// One region in the scope tree. See the module docs for the three forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Root,
    Branch {
        parent: ScopeId,
        /// The `Switch` or `LoopEnd` node owning this region.
        switch: NodeId,
        /// Arm index within the switch (always 0 for loop bodies).
        arm: u16,
        /// Total number of sibling arms, for all-arms collapse.
        arms: u16,
        /// Loop bodies are branches that re-enter; they never collapse.
        is_loop: bool,
        /// Nesting depth; Root is 0.
        lvl: u32,
    },
    Union {
        /// Normalized member branches, sorted, length >= 2.
        branches: Vec<ScopeId>,
    },
}

/// Interning arena for scopes. Id 0 is always [`Scope::Root`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
    intern: IndexMap<Scope, ScopeId>,
}

/// The root scope's id in every arena.
pub const ROOT: ScopeId = ScopeId(0);

impl ScopeArena {
    pub fn new() -> Self {
        let mut arena = ScopeArena {
            scopes: Vec::new(),
            intern: IndexMap::new(),
        };
        arena.insert(Scope::Root);
        arena
    }

    fn insert(&mut self, scope: Scope) -> ScopeId {
        if let Some(&id) = self.intern.get(&scope) {
            return id;
        }
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(scope.clone());
        self.intern.insert(scope, id);
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Interns one arm region of `switch`.
    pub fn branch(
        &mut self,
        parent: ScopeId,
        switch: NodeId,
        arm: u16,
        arms: u16,
        is_loop: bool,
    ) -> ScopeId {
        let lvl = self.lvl(parent) + 1;
        self.insert(Scope::Branch {
            parent,
            switch,
            arm,
            arms,
            is_loop,
            lvl,
        })
    }

    /// Nesting depth. Unions report the deepest member.
    pub fn lvl(&self, id: ScopeId) -> u32 {
        match self.get(id) {
            Scope::Root => 0,
            Scope::Branch { lvl, .. } => *lvl,
            Scope::Union { branches } => branches
                .iter()
                .map(|&b| self.lvl(b))
                .max()
                .unwrap_or(0),
        }
    }

    /// The parent scope of a branch; `None` for Root and unions.
    pub fn parent_of(&self, id: ScopeId) -> Option<ScopeId> {
        match self.get(id) {
            Scope::Branch { parent, .. } => Some(*parent),
            _ => None,
        }
    }

    /// True iff `id` is the body region of a loop.
    pub fn is_loop_branch(&self, id: ScopeId) -> bool {
        matches!(self.get(id), Scope::Branch { is_loop: true, .. })
    }

    /// The switch/loop node owning branch `id`.
    pub fn region_owner(&self, id: ScopeId) -> Option<NodeId> {
        match self.get(id) {
            Scope::Branch { switch, .. } => Some(*switch),
            _ => None,
        }
    }

    /// True iff region `a` is contained in region `b` (or equal).
    pub fn descends_from(&self, a: ScopeId, b: ScopeId) -> bool {
        if a == b || b == ROOT {
            return true;
        }
        match self.get(a) {
            Scope::Root => false,
            Scope::Branch { parent, .. } => {
                // A branch is inside b if its parent region is, or if b is a
                // union containing a region the branch is inside of.
                if self.descends_from(*parent, b) {
                    return true;
                }
                match self.get(b) {
                    Scope::Union { branches } => {
                        branches.iter().any(|&m| self.descends_from(a, m))
                    }
                    _ => false,
                }
            }
            Scope::Union { branches } => {
                let members = branches.clone();
                members.iter().all(|&m| self.descends_from(m, b))
            }
        }
    }

    /// Least upper bound of a set of scopes, normalized per the module docs.
    ///
    /// An empty input yields Root (a node nobody consumes is unconstrained).
    pub fn union(&mut self, inputs: &[ScopeId]) -> ScopeId {
        let mut set: BTreeSet<ScopeId> = BTreeSet::new();
        let mut pending: Vec<ScopeId> = inputs.to_vec();

        // Flatten unions; Root short-circuits the whole computation.
        while let Some(id) = pending.pop() {
            match self.get(id) {
                Scope::Root => return ROOT,
                Scope::Branch { .. } => {
                    set.insert(id);
                }
                Scope::Union { branches } => pending.extend(branches.iter().copied()),
            }
        }

        loop {
            // Drop members subsumed by a wider member.
            let members: Vec<ScopeId> = set.iter().copied().collect();
            let mut changed = false;
            for &m in &members {
                if set.contains(&m)
                    && members
                        .iter()
                        .any(|&o| o != m && set.contains(&o) && self.descends_from(m, o))
                {
                    set.remove(&m);
                    changed = true;
                }
            }

            // All arms of one switch present: collapse to the switch's parent.
            let members: Vec<ScopeId> = set.iter().copied().collect();
            'collapse: for &m in &members {
                let (switch, arms, parent, is_loop) = match self.get(m) {
                    Scope::Branch {
                        switch,
                        arms,
                        parent,
                        is_loop,
                        ..
                    } => (*switch, *arms, *parent, *is_loop),
                    _ => continue,
                };
                if is_loop {
                    continue;
                }
                let siblings: Vec<ScopeId> = members
                    .iter()
                    .copied()
                    .filter(|&o| self.region_owner(o) == Some(switch))
                    .collect();
                if siblings.len() == arms as usize {
                    for s in siblings {
                        set.remove(&s);
                    }
                    match self.get(parent) {
                        Scope::Root => return ROOT,
                        Scope::Branch { .. } => {
                            set.insert(parent);
                        }
                        Scope::Union { branches } => {
                            let extra = branches.clone();
                            set.extend(extra);
                        }
                    }
                    changed = true;
                    break 'collapse;
                }
            }

            if !changed {
                break;
            }
        }

        match set.len() {
            0 => ROOT,
            1 => *set.iter().next().unwrap(),
            _ => {
                let branches: Vec<ScopeId> = set.into_iter().collect();
                self.insert(Scope::Union { branches })
            }
        }
    }
}
