//! The refinement hierarchy: a DAG mapping concrete states to the ID of
//! their current abstract state.
//!
//! Inner nodes correspond to splits; leaf nodes to the current (unsplit)
//! abstract states. When a split moves several "wanted" values to one child,
//! a chain of helper nodes is inserted, one per wanted value, all sharing the
//! same right child. Lookup therefore costs one comparison per helper node on
//! the path, proportional to refinement depth rather than domain size.

use std::sync::Arc;

use crate::task::Task;
use crate::{NodeId, StateId, INF};

#[derive(Clone, Copy, Debug)]
pub enum Node {
    /// An unsplit abstract state. `None` routes values that belong to no
    /// abstract state (dropped by disambiguation).
    Leaf { state: Option<StateId> },
    /// A split on `var`: states with `var = value` descend right, the rest
    /// left (possibly into the next helper of the chain).
    Inner {
        var: usize,
        value: usize,
        left: NodeId,
        right: NodeId,
    },
}

impl Node {
    pub fn is_split(&self) -> bool {
        matches!(self, Node::Inner { .. })
    }

    fn child(&self, val: usize) -> NodeId {
        match *self {
            Node::Inner { value, left, right, .. } => {
                if val == value {
                    right
                } else {
                    left
                }
            }
            Node::Leaf { .. } => panic!("leaf nodes have no children"),
        }
    }

    pub fn state_id(&self) -> Option<StateId> {
        match *self {
            Node::Leaf { state } => state,
            Node::Inner { .. } => panic!("inner nodes carry no state"),
        }
    }
}

pub struct RefinementHierarchy {
    task: Arc<dyn Task>,
    nodes: Vec<Node>,
}

impl RefinementHierarchy {
    pub fn new(task: Arc<dyn Task>) -> RefinementHierarchy {
        RefinementHierarchy {
            task,
            nodes: vec![Node::Leaf {
                state: Some(StateId::from(0usize)),
            }],
        }
    }

    fn add_node(&mut self, state: Option<StateId>) -> NodeId {
        let id = NodeId::from(self.nodes.len());
        self.nodes.push(Node::Leaf { state });
        id
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn node_for_values(&self, values: &[usize]) -> NodeId {
        let mut id = NodeId::from(0usize);
        while let Node::Inner { var, .. } = self.nodes[id] {
            id = self.nodes[id].child(values[var]);
        }
        id
    }

    /// Converts `node_id` into the root of a helper chain routing each of
    /// `values` (of `var`) to a fresh right leaf for `right_state` and
    /// everything else to a fresh left leaf for `left_state`. No node is ever
    /// deleted; leaves are only converted in place and appended.
    ///
    /// Returns `(left_leaf, right_leaf)`.
    pub fn split(
        &mut self,
        node_id: NodeId,
        var: usize,
        values: &[usize],
        left_state: Option<StateId>,
        right_state: StateId,
    ) -> (NodeId, NodeId) {
        debug_assert!(!values.is_empty());
        debug_assert!(!self.nodes[node_id].is_split());
        let right_child = self.add_node(Some(right_state));
        let mut helper = node_id;
        for &value in values {
            let next_helper = self.add_node(left_state);
            self.nodes[helper] = Node::Inner {
                var,
                value,
                left: next_helper,
                right: right_child,
            };
            helper = next_helper;
        }
        (helper, right_child)
    }

    /// Maps a concrete state (of the original task) to its current abstract
    /// state, or `None` if its values were dropped by disambiguation.
    pub fn abstract_state_id(&self, values: &[usize]) -> Option<StateId> {
        if self.task.needs_ancestor_conversion() {
            let mut converted = values.to_vec();
            self.task.convert_ancestor_state(&mut converted);
            self.nodes[self.node_for_values(&converted)].state_id()
        } else {
            self.nodes[self.node_for_values(values)].state_id()
        }
    }

    /// Counts sibling leaf pairs with equal goal distance: refinements that
    /// did not improve the heuristic. Merged equal pairs act as a leaf with
    /// that distance for their parent pair, so whole useless subtrees are
    /// counted once per split.
    pub fn num_useless_refinements(&self, goal_distances: &[u32]) -> usize {
        let mut useless = 0;
        self.effective_distance(NodeId::from(0usize), goal_distances, &mut useless);
        useless
    }

    /// The distance this subtree collapses to when all of its sibling pairs
    /// agree, `None` otherwise.
    fn effective_distance(&self, node: NodeId, goal_distances: &[u32], useless: &mut usize) -> Option<u32> {
        match self.nodes[node] {
            Node::Leaf { state } => Some(state.map_or(INF, |id| goal_distances[id])),
            Node::Inner { left, right, .. } => {
                // Skip over the helper chain: helpers share our right child.
                let mut bottom_left = left;
                while let Node::Inner {
                    left: next,
                    right: helper_right,
                    ..
                } = self.nodes[bottom_left]
                {
                    if helper_right != right {
                        break;
                    }
                    bottom_left = next;
                }
                let l = self.effective_distance(bottom_left, goal_distances, useless);
                let r = self.effective_distance(right, goal_distances, useless);
                match (l, r) {
                    (Some(a), Some(b)) if a == b => {
                        *useless += 1;
                        Some(a)
                    }
                    _ => None,
                }
            }
        }
    }
}

impl std::ops::Index<NodeId> for RefinementHierarchy {
    type Output = Node;

    fn index(&self, index: NodeId) -> &Node {
        &self.nodes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutexes::MutexInformation;
    use crate::task::ExplicitTask;

    fn dummy_task(domains: Vec<usize>) -> Arc<dyn Task> {
        let init = vec![0; domains.len()];
        Arc::new(
            ExplicitTask::new(domains.clone(), vec![], init, vec![], MutexInformation::new(&domains)).unwrap(),
        )
    }

    #[test]
    fn lookup_after_single_split() {
        let mut hierarchy = RefinementHierarchy::new(dummy_task(vec![3, 2]));
        // Split off value 2 of variable 0 into state 1.
        let (left, right) = hierarchy.split(
            NodeId::from(0usize),
            0,
            &[2],
            Some(StateId::from(0usize)),
            StateId::from(1usize),
        );
        assert_ne!(left, right);
        assert_eq!(hierarchy.abstract_state_id(&[2, 0]), Some(StateId::from(1usize)));
        assert_eq!(hierarchy.abstract_state_id(&[0, 0]), Some(StateId::from(0usize)));
        assert_eq!(hierarchy.abstract_state_id(&[1, 1]), Some(StateId::from(0usize)));
    }

    #[test]
    fn helper_chain_routes_every_wanted_value() {
        let mut hierarchy = RefinementHierarchy::new(dummy_task(vec![5]));
        hierarchy.split(
            NodeId::from(0usize),
            0,
            &[1, 3, 4],
            Some(StateId::from(0usize)),
            StateId::from(1usize),
        );
        // One right leaf, one left leaf and two extra helpers.
        assert_eq!(hierarchy.num_nodes(), 5);
        for value in [1, 3, 4] {
            assert_eq!(hierarchy.abstract_state_id(&[value]), Some(StateId::from(1usize)));
        }
        for value in [0, 2] {
            assert_eq!(hierarchy.abstract_state_id(&[value]), Some(StateId::from(0usize)));
        }
    }

    #[test]
    fn dropped_values_route_to_no_state() {
        let mut hierarchy = RefinementHierarchy::new(dummy_task(vec![3]));
        // Values 0 and 1 stay in state 0, value 2 belongs to no state.
        hierarchy.split(NodeId::from(0usize), 0, &[0, 1], None, StateId::from(0usize));
        assert_eq!(hierarchy.abstract_state_id(&[2]), None);
        assert_eq!(hierarchy.abstract_state_id(&[0]), Some(StateId::from(0usize)));
    }

    #[test]
    fn useless_refinements_spot_equal_siblings() {
        let mut hierarchy = RefinementHierarchy::new(dummy_task(vec![4]));
        let (left, _right) = hierarchy.split(
            NodeId::from(0usize),
            0,
            &[3],
            Some(StateId::from(0usize)),
            StateId::from(1usize),
        );
        hierarchy.split(left, 0, &[2], Some(StateId::from(0usize)), StateId::from(2usize));
        // States 0 and 2 share distance 1, their parent pair then agrees with
        // state 1 as well.
        assert_eq!(hierarchy.num_useless_refinements(&[1, 1, 1]), 2);
        assert_eq!(hierarchy.num_useless_refinements(&[1, 2, 1]), 1);
        assert_eq!(hierarchy.num_useless_refinements(&[1, 2, 3]), 0);
    }
}
