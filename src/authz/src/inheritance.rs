//! Single-parent inheritance tree with write-time cycle and depth guards
//!
//! Roles and groups both form forests where each node has at most one parent.
//! Every re-parenting goes through [`ParentTree::set_parent`], which walks the
//! proposed ancestor chain before committing, so read paths never need cycle
//! detection.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use thiserror::Error;

use crate::error::AuthzError;

/// Tree-related errors
#[derive(Debug, Error, PartialEq)]
pub enum TreeError {
    /// Proposed parent chain contains the node itself
    #[error("Circular inheritance: {0}")]
    Cycle(String),

    /// Resulting chain would exceed the depth bound
    #[error("Inheritance chain of {depth} exceeds maximum depth {max}")]
    TooDeep { depth: usize, max: usize },

    /// Node or parent is not part of the tree
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Node already present
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),
}

impl From<TreeError> for AuthzError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::Cycle(msg) => AuthzError::CircularInheritance(msg),
            e @ TreeError::TooDeep { .. } => AuthzError::HierarchyTooDeep(e.to_string()),
            TreeError::UnknownNode(msg) => AuthzError::NotFound(msg),
            TreeError::DuplicateNode(msg) => AuthzError::Duplicate(msg),
        }
    }
}

/// Forest of nodes with nullable single-parent pointers
#[derive(Debug, Clone)]
pub struct ParentTree<Id> {
    parents: HashMap<Id, Option<Id>>,
    children: HashMap<Id, HashSet<Id>>,
    max_depth: usize,
}

impl<Id> ParentTree<Id>
where
    Id: Copy + Eq + Hash + Debug,
{
    /// Create an empty tree whose chains may hold at most `max_depth` nodes
    pub fn new(max_depth: usize) -> Self {
        Self {
            parents: HashMap::new(),
            children: HashMap::new(),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.parents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn parent_of(&self, id: &Id) -> Option<Id> {
        self.parents.get(id).copied().flatten()
    }

    /// Insert a node, optionally under an existing parent
    pub fn insert(&mut self, id: Id, parent: Option<Id>) -> Result<(), TreeError> {
        if self.parents.contains_key(&id) {
            return Err(TreeError::DuplicateNode(format!("{:?}", id)));
        }

        if let Some(parent) = parent {
            let depth = self.chain_len(&parent)? + 1;
            if depth > self.max_depth {
                return Err(TreeError::TooDeep {
                    depth,
                    max: self.max_depth,
                });
            }
        }

        self.parents.insert(id, parent);
        if let Some(parent) = parent {
            self.children.entry(parent).or_default().insert(id);
        }

        Ok(())
    }

    /// Re-parent `id`, rejecting cycles and over-deep chains before commit.
    ///
    /// The depth check covers the whole subtree hanging off `id`, not just the
    /// node itself.
    pub fn set_parent(&mut self, id: Id, new_parent: Option<Id>) -> Result<(), TreeError> {
        if !self.parents.contains_key(&id) {
            return Err(TreeError::UnknownNode(format!("{:?}", id)));
        }

        if let Some(parent) = new_parent {
            if !self.parents.contains_key(&parent) {
                return Err(TreeError::UnknownNode(format!("{:?}", parent)));
            }

            // Walk upward from the proposed parent collecting visited ids
            let mut visited = HashSet::new();
            let mut cursor = Some(parent);
            while let Some(current) = cursor {
                if current == id {
                    return Err(TreeError::Cycle(format!(
                        "{:?} is an ancestor of proposed parent {:?}",
                        id, parent
                    )));
                }
                if !visited.insert(current) || visited.len() > self.max_depth {
                    return Err(TreeError::TooDeep {
                        depth: visited.len(),
                        max: self.max_depth,
                    });
                }
                cursor = self.parent_of(&current);
            }

            let depth = visited.len() + 1 + self.subtree_height(&id);
            if depth > self.max_depth {
                return Err(TreeError::TooDeep {
                    depth,
                    max: self.max_depth,
                });
            }
        }

        if let Some(old) = self.parent_of(&id) {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.remove(&id);
            }
        }
        self.parents.insert(id, new_parent);
        if let Some(parent) = new_parent {
            self.children.entry(parent).or_default().insert(id);
        }

        Ok(())
    }

    /// Node followed by its ancestors up to the root
    pub fn chain(&self, id: &Id) -> Result<Vec<Id>, TreeError> {
        if !self.parents.contains_key(id) {
            return Err(TreeError::UnknownNode(format!("{:?}", id)));
        }

        let mut chain = vec![*id];
        let mut cursor = self.parent_of(id);
        while let Some(current) = cursor {
            chain.push(current);
            if chain.len() > self.max_depth {
                return Err(TreeError::TooDeep {
                    depth: chain.len(),
                    max: self.max_depth,
                });
            }
            cursor = self.parent_of(&current);
        }

        Ok(chain)
    }

    /// Direct children of `id`
    pub fn children_of(&self, id: &Id) -> Vec<Id> {
        self.children
            .get(id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove a node; its children become roots
    pub fn remove(&mut self, id: &Id) -> Vec<Id> {
        let orphans = self.children.remove(id).unwrap_or_default();
        for child in &orphans {
            self.parents.insert(*child, None);
        }
        if let Some(Some(parent)) = self.parents.remove(id) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(id);
            }
        }
        orphans.into_iter().collect()
    }

    fn chain_len(&self, id: &Id) -> Result<usize, TreeError> {
        self.chain(id).map(|c| c.len())
    }

    /// Longest downward path from `id`, in edges
    fn subtree_height(&self, id: &Id) -> usize {
        let mut height = 0;
        let mut frontier = vec![*id];
        while !frontier.is_empty() {
            let next: Vec<Id> = frontier
                .iter()
                .flat_map(|n| self.children.get(n).into_iter().flatten().copied())
                .collect();
            if next.is_empty() {
                break;
            }
            height += 1;
            frontier = next;
        }
        height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(n: u32, max: usize) -> ParentTree<u32> {
        let mut tree = ParentTree::new(max);
        tree.insert(0, None).unwrap();
        for i in 1..n {
            tree.insert(i, Some(i - 1)).unwrap();
        }
        tree
    }

    #[test]
    fn test_chain_order() {
        let tree = linear(4, 10);
        assert_eq!(tree.chain(&3).unwrap(), vec![3, 2, 1, 0]);
        assert_eq!(tree.chain(&0).unwrap(), vec![0]);
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let mut tree = ParentTree::new(10);
        tree.insert(1u32, None).unwrap();
        tree.insert(2u32, None).unwrap();

        tree.set_parent(1, Some(2)).unwrap();
        let result = tree.set_parent(2, Some(1));
        assert!(matches!(result, Err(TreeError::Cycle(_))));

        // Rejected write left the tree untouched
        assert_eq!(tree.parent_of(&2), None);
        assert_eq!(tree.chain(&1).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_self_parent_rejected() {
        let mut tree = ParentTree::new(10);
        tree.insert(1u32, None).unwrap();
        assert!(matches!(tree.set_parent(1, Some(1)), Err(TreeError::Cycle(_))));
    }

    #[test]
    fn test_insert_depth_bound() {
        let mut tree = linear(3, 3);
        let result = tree.insert(3, Some(2));
        assert_eq!(result, Err(TreeError::TooDeep { depth: 4, max: 3 }));
    }

    #[test]
    fn test_depth_accounts_for_subtree() {
        let mut tree = linear(3, 4);
        tree.insert(10, None).unwrap();
        tree.insert(11, Some(10)).unwrap();

        // 0 <- 1 <- 2 plus 10 <- 11 would give 11,10,2,1,0 = 5 nodes
        let result = tree.set_parent(10, Some(2));
        assert!(matches!(result, Err(TreeError::TooDeep { depth: 5, max: 4 })));

        tree.set_parent(10, Some(1)).unwrap();
        assert_eq!(tree.chain(&11).unwrap(), vec![11, 10, 1, 0]);
    }

    #[test]
    fn test_reparent_updates_children() {
        let mut tree = linear(3, 10);
        tree.set_parent(2, None).unwrap();
        assert!(tree.children_of(&1).is_empty());
        assert_eq!(tree.chain(&2).unwrap(), vec![2]);
    }

    #[test]
    fn test_remove_orphans_children() {
        let mut tree = linear(3, 10);
        let orphans = tree.remove(&1);
        assert_eq!(orphans, vec![2]);
        assert_eq!(tree.chain(&2).unwrap(), vec![2]);
        assert!(!tree.contains(&1));
    }

    #[test]
    fn test_unknown_nodes() {
        let mut tree: ParentTree<u32> = ParentTree::new(5);
        assert!(matches!(tree.chain(&9), Err(TreeError::UnknownNode(_))));
        tree.insert(1, None).unwrap();
        assert!(matches!(tree.set_parent(1, Some(9)), Err(TreeError::UnknownNode(_))));
        assert!(matches!(tree.insert(1, None), Err(TreeError::DuplicateNode(_))));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_reparenting_keeps_every_chain_bounded(
                moves in proptest::collection::vec((0u32..8, proptest::option::of(0u32..8)), 0..64)
            ) {
                let mut tree = ParentTree::new(4);
                for id in 0..8u32 {
                    tree.insert(id, None).unwrap();
                }

                for (id, parent) in moves {
                    let _ = tree.set_parent(id, parent);
                    for node in 0..8u32 {
                        let chain = tree.chain(&node).unwrap();
                        prop_assert!(chain.len() <= 4);
                        prop_assert_eq!(chain[0], node);
                    }
                }
            }
        }
    }
}
