//! Pipeline tree builder
//!
//! Turns the flat set of pipings of one pipeline into a rooted tree and
//! exposes the breadth-first order in which instances are created.

use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::pipeline::Piping;

/// Errors raised when pipings do not form exactly one tree
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("pipeline has no pipings")]
    Empty,

    #[error("pipeline has no root piping")]
    NoRoot,

    #[error("pipeline has more than one root piping: {0:?}")]
    MultipleRoots(Vec<Uuid>),

    #[error("piping {0} appears more than once")]
    DuplicatePiping(Uuid),

    #[error("piping {piping_id} references unknown previous piping {previous_id}")]
    UnknownParent { piping_id: Uuid, previous_id: Uuid },

    #[error("pipings not reachable from the root: {0:?}")]
    Unreachable(Vec<Uuid>),
}

/// A piping together with the ids of its children
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub piping: Piping,
    pub child_ids: Vec<Uuid>,
}

/// Rooted tree of pipings
#[derive(Debug, Clone)]
pub struct PipingTree {
    root_id: Uuid,
    nodes: HashMap<Uuid, TreeNode>,
}

impl PipingTree {
    /// Build the tree from a pipeline's pipings.
    ///
    /// Children keep the relative order in which their pipings were supplied.
    pub fn build(pipings: Vec<Piping>) -> Result<Self, TreeError> {
        if pipings.is_empty() {
            return Err(TreeError::Empty);
        }

        let order: Vec<Uuid> = pipings.iter().map(|p| p.id).collect();
        let mut nodes = HashMap::with_capacity(pipings.len());
        for piping in pipings {
            let id = piping.id;
            let node = TreeNode {
                piping,
                child_ids: Vec::new(),
            };
            if nodes.insert(id, node).is_some() {
                return Err(TreeError::DuplicatePiping(id));
            }
        }

        let mut roots = Vec::new();
        for id in &order {
            match nodes[id].piping.previous_id {
                None => roots.push(*id),
                Some(previous_id) => match nodes.get_mut(&previous_id) {
                    Some(parent) => parent.child_ids.push(*id),
                    None => {
                        return Err(TreeError::UnknownParent {
                            piping_id: *id,
                            previous_id,
                        });
                    }
                },
            }
        }

        let root_id = match roots.as_slice() {
            [] => return Err(TreeError::NoRoot),
            [root] => *root,
            _ => return Err(TreeError::MultipleRoots(roots)),
        };

        let tree = Self { root_id, nodes };

        // Parent pointers closing a cycle leave nodes the root never reaches
        let visited = tree.bfs().count();
        if visited != tree.nodes.len() {
            let reachable: Vec<Uuid> = tree.bfs().map(|p| p.id).collect();
            let unreachable = order
                .into_iter()
                .filter(|id| !reachable.contains(id))
                .collect();
            return Err(TreeError::Unreachable(unreachable));
        }

        Ok(tree)
    }

    pub fn root_id(&self) -> Uuid {
        self.root_id
    }

    pub fn root(&self) -> &Piping {
        &self.nodes[&self.root_id].piping
    }

    pub fn get(&self, id: Uuid) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn child_ids(&self, id: Uuid) -> &[Uuid] {
        self.nodes
            .get(&id)
            .map(|n| n.child_ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Breadth-first walk starting at the root
    pub fn bfs(&self) -> Bfs<'_> {
        Bfs {
            tree: self,
            queue: VecDeque::from([self.root_id]),
        }
    }
}

/// Breadth-first iterator over the pipings of a [`PipingTree`]
pub struct Bfs<'a> {
    tree: &'a PipingTree,
    queue: VecDeque<Uuid>,
}

impl<'a> Iterator for Bfs<'a> {
    type Item = &'a Piping;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.queue.pop_front()?;
        let node = self.tree.nodes.get(&id)?;
        self.queue.extend(node.child_ids.iter().copied());
        Some(&node.piping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn piping(id: Uuid, previous_id: Option<Uuid>, title: &str) -> Piping {
        Piping {
            id,
            pipeline_id: Uuid::nil(),
            plugin_id: Uuid::new_v4(),
            previous_id,
            title: title.to_string(),
            defaults: vec![],
        }
    }

    #[test]
    fn test_single_root_and_children_partition() {
        let (a, b, c, d, e) = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        // Supplied out of order on purpose
        let tree = PipingTree::build(vec![
            piping(d, Some(b), "d"),
            piping(b, Some(a), "b"),
            piping(a, None, "a"),
            piping(c, Some(a), "c"),
            piping(e, Some(c), "e"),
        ])
        .unwrap();

        assert_eq!(tree.root_id(), a);
        assert_eq!(tree.len(), 5);

        let mut seen = HashSet::new();
        for id in [a, b, c, d, e] {
            for child in tree.child_ids(id) {
                assert!(seen.insert(*child), "child listed twice");
            }
        }
        let expected: HashSet<_> = [b, c, d, e].into_iter().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_bfs_visits_parents_before_children() {
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let tree = PipingTree::build(vec![
            piping(a, None, "a"),
            piping(b, Some(a), "b"),
            piping(c, Some(b), "c"),
            piping(d, Some(a), "d"),
        ])
        .unwrap();

        let order: Vec<&str> = tree.bfs().map(|p| p.title.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "d", "c"]);
    }

    #[test]
    fn test_rejects_zero_or_many_roots() {
        assert_eq!(PipingTree::build(vec![]).unwrap_err(), TreeError::Empty);

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let err = PipingTree::build(vec![piping(a, None, "a"), piping(b, None, "b")]).unwrap_err();
        assert_eq!(err, TreeError::MultipleRoots(vec![a, b]));

        let err =
            PipingTree::build(vec![piping(a, Some(b), "a"), piping(b, Some(a), "b")]).unwrap_err();
        assert_eq!(err, TreeError::NoRoot);
    }

    #[test]
    fn test_rejects_unknown_parent() {
        let (a, b, ghost) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let err = PipingTree::build(vec![piping(a, None, "a"), piping(b, Some(ghost), "b")])
            .unwrap_err();
        assert_eq!(
            err,
            TreeError::UnknownParent {
                piping_id: b,
                previous_id: ghost
            }
        );
    }

    #[test]
    fn test_rejects_cycle_detached_from_root() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let err = PipingTree::build(vec![
            piping(a, None, "a"),
            piping(b, Some(c), "b"),
            piping(c, Some(b), "c"),
        ])
        .unwrap_err();
        assert_eq!(err, TreeError::Unreachable(vec![b, c]));
    }
}
