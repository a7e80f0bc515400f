//! The lookup table produced per abstraction: refinement hierarchy plus goal
//! distances, optionally with saturated operator costs for cost partitioning.

use crate::refinement_hierarchy::RefinementHierarchy;
use crate::transition_system::TransitionSystem;
use crate::{StateId, INF};

/// Evaluates a concrete state by mapping it through the refinement hierarchy
/// and reading the abstract goal distance.
pub struct CartesianHeuristicFunction {
    hierarchy: RefinementHierarchy,
    goal_distances: Vec<u32>,
    saturated_costs: Option<Vec<i64>>,
}

impl CartesianHeuristicFunction {
    pub fn new(
        hierarchy: RefinementHierarchy,
        goal_distances: Vec<u32>,
        saturated_costs: Option<Vec<i64>>,
    ) -> CartesianHeuristicFunction {
        CartesianHeuristicFunction {
            hierarchy,
            goal_distances,
            saturated_costs,
        }
    }

    /// `INF` for states outside every abstract state or with unreachable goal.
    pub fn value(&self, concrete_state: &[usize]) -> u32 {
        match self.hierarchy.abstract_state_id(concrete_state) {
            Some(id) => self.goal_distances[id],
            None => INF,
        }
    }

    pub fn goal_distances(&self) -> &[u32] {
        &self.goal_distances
    }

    /// Per-operator minimum costs preserving the goal distances, `i64::MIN`
    /// standing for minus infinity.
    pub fn saturated_costs(&self) -> Option<&[i64]> {
        self.saturated_costs.as_deref()
    }

    pub fn hierarchy(&self) -> &RefinementHierarchy {
        &self.hierarchy
    }
}

/// The minimum cost each operator needs for the abstraction to keep its goal
/// distances: the maximum of `h(src) - h(target)` over its state-changing
/// transitions, and at least 0 where it self-loops on a solvable state.
pub fn compute_saturated_costs(transition_system: &TransitionSystem, goal_distances: &[u32]) -> Vec<i64> {
    const MINUS_INF: i64 = i64::MIN;
    let mut saturated = vec![MINUS_INF; transition_system.num_operators()];
    for i in 0..transition_system.num_states() {
        let state = StateId::from(i);
        let h_src = goal_distances[i];
        if h_src == INF {
            continue;
        }
        for t in &transition_system.outgoing()[state] {
            let h_target = goal_distances[usize::from(t.target)];
            if h_target == INF {
                continue;
            }
            let needed = h_src as i64 - h_target as i64;
            let entry = &mut saturated[usize::from(t.op)];
            *entry = (*entry).max(needed);
        }
        for &op in &transition_system.loops()[state] {
            let entry = &mut saturated[usize::from(op)];
            *entry = (*entry).max(0);
        }
    }
    saturated
}
