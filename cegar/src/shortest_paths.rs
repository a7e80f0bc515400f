//! Goal-distance and init-distance trees over the abstract transition system,
//! patched locally after each split instead of recomputed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tracing::{debug, trace};

use crate::transition_system::{Transition, Transitions};
use crate::{Cost, Goals, StateId, INF, INF_COSTS};

/// Sentinel for states whose distance is pending recomputation during an
/// incremental update.
pub const DIRTY: Cost = INF_COSTS - 1;

/// Distances plus shortest-path trees for both directions. `shortest_path[s]`
/// is the next hop from `s` toward a goal, `reverse_shortest_path[s]` the next
/// hop toward the initial state.
#[derive(Clone, Default)]
struct DistanceData {
    goal_distances: Vec<Cost>,
    init_distances: Vec<Cost>,
    shortest_path: Vec<Option<Transition>>,
    reverse_shortest_path: Vec<Option<Transition>>,
}

pub struct ShortestPaths {
    operator_costs: Vec<Cost>,
    task_has_zero_costs: bool,
    real: DistanceData,
    /// Copy-on-demand data for simulated refinements; never read back into
    /// `real`, so discarding a simulation leaves the real state untouched.
    sim: DistanceData,
}

impl ShortestPaths {
    pub fn new(costs: &[u32]) -> ShortestPaths {
        let task_has_zero_costs = costs.iter().any(|&c| c == 0);
        let mut paths = ShortestPaths {
            operator_costs: Vec::with_capacity(costs.len()),
            task_has_zero_costs,
            real: DistanceData::default(),
            sim: DistanceData::default(),
        };
        for &cost in costs {
            paths.operator_costs.push(paths.convert_to_64bit_cost(cost));
        }
        debug!("task has zero-cost operators: {task_has_zero_costs}");
        paths
    }

    pub fn task_has_zero_costs(&self) -> bool {
        self.task_has_zero_costs
    }

    pub fn add_costs(a: Cost, b: Cost) -> Cost {
        debug_assert!(a != DIRTY && b != DIRTY);
        if a == INF_COSTS || b == INF_COSTS {
            INF_COSTS
        } else {
            a + b
        }
    }

    /// Strips the tie-breaking step count, keeping the 32-bit cost.
    pub fn convert_to_32bit_cost(&self, cost: Cost) -> u32 {
        debug_assert_ne!(cost, DIRTY);
        if cost == INF_COSTS {
            INF
        } else if self.task_has_zero_costs {
            (cost >> 32) as u32
        } else {
            cost as u32
        }
    }

    /// With zero-cost operators present, a cost packs into the high half and
    /// one step into the low half, so comparisons break cost ties by length.
    pub fn convert_to_64bit_cost(&self, cost: u32) -> Cost {
        if cost == INF {
            INF_COSTS
        } else if self.task_has_zero_costs {
            if cost == 0 {
                1
            } else {
                (cost as u64) << 32
            }
        } else {
            cost as u64
        }
    }

    pub fn operator_cost(&self, op: crate::OpId) -> Cost {
        self.operator_costs[usize::from(op)]
    }

    /// Full Dijkstra in both directions; used once after pre-refinement.
    pub fn recompute(&mut self, incoming: &[Transitions], outgoing: &[Transitions], goals: &Goals, init: StateId) {
        let num_states = incoming.len();
        let data = &mut self.real;
        data.goal_distances = vec![INF_COSTS; num_states];
        data.init_distances = vec![INF_COSTS; num_states];
        data.shortest_path = vec![None; num_states];
        data.reverse_shortest_path = vec![None; num_states];
        dijkstra(
            &mut data.goal_distances,
            &mut data.shortest_path,
            incoming,
            &self.operator_costs,
            goals.iter().copied(),
        );
        dijkstra(
            &mut data.init_distances,
            &mut data.reverse_shortest_path,
            outgoing,
            &self.operator_costs,
            std::iter::once(init),
        );
    }

    /// Patches both distance trees after `v` split into `v1` and `v2`.
    ///
    /// With `simulated` set, the update runs on a scratch copy of the current
    /// distances (read through the `simulated_*` accessors) and the real data
    /// stays bit-identical.
    #[allow(clippy::too_many_arguments)]
    pub fn update_incrementally(
        &mut self,
        incoming: &[Transitions],
        outgoing: &[Transitions],
        v: StateId,
        v1: StateId,
        v2: StateId,
        disambiguated: bool,
        old_incoming: &[Transition],
        old_outgoing: &[Transition],
        goals: &Goals,
        init: StateId,
        simulated: bool,
    ) {
        debug_assert_eq!(incoming.len(), outgoing.len());
        let num_states = incoming.len();

        if simulated {
            self.sim = self.real.clone();
        }
        let data = if simulated { &mut self.sim } else { &mut self.real };
        data.goal_distances.resize(num_states, 0);
        data.init_distances.resize(num_states, 0);
        data.shortest_path.resize(num_states, None);
        data.reverse_shortest_path.resize(num_states, None);

        for backward in [false, true] {
            update_in_direction(
                data,
                &self.operator_costs,
                incoming,
                outgoing,
                v,
                v1,
                v2,
                disambiguated,
                old_incoming,
                old_outgoing,
                goals,
                init,
                backward,
            );
        }
    }

    /// Follows the goal-distance tree from `init` until a goal state.
    /// `None` iff the abstract task is unsolvable.
    pub fn extract_solution(&self, init: StateId, goals: &Goals, simulated: bool) -> Option<crate::Solution> {
        let data = if simulated { &self.sim } else { &self.real };
        if data.goal_distances[init] == INF_COSTS {
            return None;
        }
        let mut solution = Vec::new();
        let mut current = init;
        while !goals.contains(&current) {
            let t = data.shortest_path[current].expect("state with finite goal distance has a tree edge");
            debug_assert_ne!(t.target, current);
            debug_assert!(data.goal_distances[t.target] <= data.goal_distances[current]);
            solution.push(t);
            current = t.target;
        }
        Some(solution)
    }

    pub fn goal_distance_64(&self, state: StateId) -> Cost {
        self.real.goal_distances[state]
    }

    pub fn simulated_goal_distance_64(&self, state: StateId) -> Cost {
        self.sim.goal_distances[state]
    }

    pub fn goal_distance_32(&self, state: StateId) -> u32 {
        self.convert_to_32bit_cost(self.real.goal_distances[state])
    }

    pub fn init_distance_64(&self, state: StateId) -> Cost {
        self.real.init_distances[state]
    }

    /// 32-bit goal distances for all states, the heuristic table.
    pub fn goal_distances_32(&self) -> Vec<u32> {
        self.real
            .goal_distances
            .iter()
            .map(|&d| self.convert_to_32bit_cost(d))
            .collect()
    }

    pub fn is_optimal_transition(&self, start: StateId, op: crate::OpId, target: StateId) -> bool {
        self.real.goal_distances[start]
            .checked_sub(self.operator_costs[usize::from(op)])
            .is_some_and(|rest| rest == self.real.goal_distances[target])
            && self.real.goal_distances[start] != INF_COSTS
    }

    pub fn is_backward_optimal_transition(&self, start: StateId, op: crate::OpId, target: StateId) -> bool {
        self.real.init_distances[start]
            .checked_sub(self.operator_costs[usize::from(op)])
            .is_some_and(|rest| rest == self.real.init_distances[target])
            && self.real.init_distances[start] != INF_COSTS
    }

    /// Debug cross-check: the incremental distances and tree edges must agree
    /// with a fresh Dijkstra. Always returns true; failures panic.
    pub fn test_distances(&self, incoming: &[Transitions], outgoing: &[Transitions], goals: &Goals, init: StateId) -> bool {
        let data = &self.real;
        assert!(data.goal_distances.iter().all(|&d| d != DIRTY));
        let num_states = incoming.len();

        let costs_32: Vec<u32> = self
            .operator_costs
            .iter()
            .map(|&c| self.convert_to_32bit_cost(c))
            .collect();

        let init_distances_32 = compute_distances_32(outgoing, &costs_32, std::iter::once(init));

        for i in 0..num_states {
            let state = StateId::from(i);
            if data.goal_distances[i] != INF_COSTS && init_distances_32[i] != INF && !goals.contains(&state) {
                let t = data.shortest_path[i].expect("solvable state has a tree edge");
                assert!(
                    outgoing[i].contains(&t),
                    "tree edge {t} of state {i} is not an outgoing transition"
                );
                assert_eq!(
                    data.goal_distances[i],
                    Self::add_costs(self.operator_costs[usize::from(t.op)], data.goal_distances[usize::from(t.target)]),
                    "tree edge of state {i} is not optimal"
                );
            }
        }

        let goal_distances_32 = compute_distances_32(incoming, &costs_32, goals.iter().copied());
        for i in 0..num_states {
            let rounded = self.convert_to_32bit_cost(data.goal_distances[i]);
            if rounded != goal_distances_32[i] && init_distances_32[i] != INF {
                panic!(
                    "distances are wrong for state {i}: incremental {rounded} vs fresh {}",
                    goal_distances_32[i]
                );
            }
        }
        true
    }
}

fn dijkstra(
    distances: &mut [Cost],
    tree: &mut [Option<Transition>],
    graph: &[Transitions],
    operator_costs: &[Cost],
    sources: impl Iterator<Item = StateId>,
) {
    let mut open: BinaryHeap<(Reverse<Cost>, StateId)> = BinaryHeap::new();
    for source in sources {
        distances[usize::from(source)] = 0;
        tree[usize::from(source)] = None;
        open.push((Reverse(0), source));
    }
    while let Some((Reverse(old_dist), state)) = open.pop() {
        let dist = distances[usize::from(state)];
        debug_assert!(dist <= old_dist);
        if dist < old_dist {
            continue;
        }
        for t in &graph[usize::from(state)] {
            let succ = usize::from(t.target);
            let succ_dist = ShortestPaths::add_costs(dist, operator_costs[usize::from(t.op)]);
            if succ_dist < distances[succ] {
                distances[succ] = succ_dist;
                tree[succ] = Some(Transition::new(t.op, state));
                open.push((Reverse(succ_dist), t.target));
            }
        }
    }
}

/// Fresh 32-bit Dijkstra used by the debug cross-check.
pub fn compute_distances_32(
    graph: &[Transitions],
    costs: &[u32],
    sources: impl Iterator<Item = StateId>,
) -> Vec<u32> {
    let mut distances = vec![INF; graph.len()];
    let mut open: BinaryHeap<(Reverse<u32>, StateId)> = BinaryHeap::new();
    for source in sources {
        distances[usize::from(source)] = 0;
        open.push((Reverse(0), source));
    }
    while let Some((Reverse(old_dist), state)) = open.pop() {
        let dist = distances[usize::from(state)];
        if dist < old_dist {
            continue;
        }
        for t in &graph[usize::from(state)] {
            let succ = usize::from(t.target);
            let cost = costs[usize::from(t.op)];
            let succ_dist = if dist == INF || cost == INF { INF } else { dist + cost };
            if succ_dist < distances[succ] {
                distances[succ] = succ_dist;
                open.push((Reverse(succ_dist), t.target));
            }
        }
    }
    distances
}

/// One direction of the incremental update: assign the parent's distance to
/// both children, patch tree edges that pointed to the split state, detect
/// orphans by walking the tree against the distance direction (reconnecting
/// at no extra cost where possible), then run Dijkstra seeded from the
/// settled fringe over the dirty states only.
#[allow(clippy::too_many_arguments)]
fn update_in_direction(
    data: &mut DistanceData,
    operator_costs: &[Cost],
    incoming: &[Transitions],
    outgoing: &[Transitions],
    v: StateId,
    v1: StateId,
    v2: StateId,
    disambiguated: bool,
    old_incoming: &[Transition],
    old_outgoing: &[Transition],
    goals: &Goals,
    init: StateId,
    backward: bool,
) {
    let (virtual_in, virtual_out, old_virtual_in) = if backward {
        (outgoing, incoming, old_outgoing)
    } else {
        (incoming, outgoing, old_incoming)
    };
    let (distances, tree) = if backward {
        (&mut data.init_distances, &mut data.reverse_shortest_path)
    } else {
        (&mut data.goal_distances, &mut data.shortest_path)
    };
    let num_states = virtual_in.len();

    trace!("reflect splitting {v} into {v1} and {v2} (backward: {backward})");

    // Both children tentatively inherit the parent's distance.
    let parent_distance = distances[usize::from(v)];
    distances[usize::from(v1)] = parent_distance;
    distances[usize::from(v2)] = parent_distance;

    // Re-point tree edges that used to go to v at whichever child kept the
    // transition, as long as the operator cost matches. Dirty children will
    // revisit these edges anyway.
    for state in [v1, v2] {
        for t in &virtual_in[usize::from(state)] {
            let u = usize::from(t.target);
            if let Some(sp) = tree[u] {
                if sp.target == v && operator_costs[usize::from(t.op)] == operator_costs[usize::from(sp.op)] {
                    tree[u] = Some(Transition::new(t.op, state));
                }
            }
        }
    }

    /*
      Instead of recursively marking all orphans right away, candidates are
      kept in a queue ordered by (old, possibly too low) distance. A candidate
      that can be reconnected to a settled state at no additional cost stays
      settled and its subtree is never visited. Only otherwise is it marked
      dirty and its tree predecessors become candidates.
    */
    let mut dirty_candidate = vec![false; num_states];
    let mut candidate_queue: BinaryHeap<(Reverse<Cost>, StateId)> = BinaryHeap::new();
    let mut dirty_states: Vec<StateId> = Vec::new();

    dirty_candidate[usize::from(v1)] = true;
    dirty_candidate[usize::from(v2)] = true;
    candidate_queue.push((Reverse(distances[usize::from(v1)]), v1));
    candidate_queue.push((Reverse(distances[usize::from(v2)]), v2));

    // When disambiguation dropped transitions, a tree edge into v may have
    // vanished entirely; its source must be revisited as a candidate.
    if disambiguated {
        for t in old_virtual_in {
            let u = t.target;
            if !dirty_candidate[usize::from(u)]
                && distances[usize::from(u)] != DIRTY
                && tree[usize::from(u)].is_some_and(|sp| sp.target == v)
            {
                dirty_candidate[usize::from(u)] = true;
                candidate_queue.push((Reverse(distances[usize::from(u)]), u));
            }
        }
    }

    while let Some((Reverse(_), state)) = candidate_queue.pop() {
        if !dirty_candidate[usize::from(state)] {
            continue;
        }
        dirty_candidate[usize::from(state)] = false;
        // Goal states (forward) and the initial state (backward) have
        // distance zero and can never become dirty.
        if (backward && state == init) || (!backward && goals.contains(&state)) {
            continue;
        }
        let current = distances[usize::from(state)];
        debug_assert_ne!(current, DIRTY);
        if current == INF_COSTS {
            continue;
        }
        let mut reconnected = false;
        for t in &virtual_out[usize::from(state)] {
            let succ = usize::from(t.target);
            if distances[succ] != DIRTY
                && ShortestPaths::add_costs(distances[succ], operator_costs[usize::from(t.op)]) == current
            {
                tree[usize::from(state)] = Some(*t);
                reconnected = true;
                break;
            }
        }
        if !reconnected {
            trace!("mark {state} as dirty");
            distances[usize::from(state)] = DIRTY;
            tree[usize::from(state)] = None;
            dirty_states.push(state);
            for t in &virtual_in[usize::from(state)] {
                let prev = usize::from(t.target);
                if !dirty_candidate[prev]
                    && distances[prev] != DIRTY
                    && tree[prev].is_some_and(|sp| sp.target == state)
                {
                    dirty_candidate[prev] = true;
                    candidate_queue.push((Reverse(distances[prev]), t.target));
                }
            }
        }
    }

    /*
      Dijkstra-style recomputation for the dirty region. A virtual source
      stands for all settled states: every arc from a settled state s to a
      dirty state s' seeds s' with distance(s) + cost. From there on, normal
      Dijkstra restricted to dirty-to-dirty arcs.
    */
    let mut open: BinaryHeap<(Reverse<Cost>, StateId)> = BinaryHeap::new();
    for &state in &dirty_states {
        debug_assert_eq!(distances[usize::from(state)], DIRTY);
        let mut min_dist = INF_COSTS;
        for t in &virtual_out[usize::from(state)] {
            let succ = usize::from(t.target);
            if distances[succ] != DIRTY {
                let new_dist = ShortestPaths::add_costs(operator_costs[usize::from(t.op)], distances[succ]);
                if new_dist < min_dist {
                    min_dist = new_dist;
                    tree[usize::from(state)] = Some(*t);
                }
            }
        }
        distances[usize::from(state)] = min_dist;
        if min_dist != INF_COSTS {
            open.push((Reverse(min_dist), state));
        }
    }
    while let Some((Reverse(g), state)) = open.pop() {
        debug_assert_ne!(distances[usize::from(state)], DIRTY);
        if g > distances[usize::from(state)] {
            continue;
        }
        for t in &virtual_in[usize::from(state)] {
            let succ = usize::from(t.target);
            let succ_g = ShortestPaths::add_costs(operator_costs[usize::from(t.op)], g);
            if distances[succ] == DIRTY || succ_g < distances[succ] {
                distances[succ] = succ_g;
                tree[succ] = Some(Transition::new(t.op, state));
                open.push((Reverse(succ_g), t.target));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpId;

    fn t(op: usize, target: usize) -> Transition {
        Transition::new(OpId::from(op), StateId::from(target))
    }

    fn goals(ids: &[usize]) -> Goals {
        ids.iter().map(|&i| StateId::from(i)).collect()
    }

    /// Two states, op 0 moving 0 -> 1, goal {1}.
    fn two_state_system() -> (Vec<Transitions>, Vec<Transitions>) {
        let incoming = vec![vec![], vec![t(0, 0)]];
        let outgoing = vec![vec![t(0, 1)], vec![]];
        (incoming, outgoing)
    }

    #[test]
    fn recompute_simple_chain() {
        let (incoming, outgoing) = two_state_system();
        let mut paths = ShortestPaths::new(&[1]);
        paths.recompute(&incoming, &outgoing, &goals(&[1]), StateId::from(0usize));
        assert_eq!(paths.goal_distance_32(StateId::from(0usize)), 1);
        assert_eq!(paths.goal_distance_32(StateId::from(1usize)), 0);
        assert_eq!(paths.init_distance_64(StateId::from(1usize)), 1);
        let solution = paths.extract_solution(StateId::from(0usize), &goals(&[1]), false).unwrap();
        assert_eq!(solution, vec![t(0, 1)]);
    }

    #[test]
    fn unsolvable_has_no_solution() {
        let incoming = vec![vec![]];
        let outgoing = vec![vec![]];
        let mut paths = ShortestPaths::new(&[1]);
        paths.recompute(&incoming, &outgoing, &Goals::default(), StateId::from(0usize));
        assert!(paths.extract_solution(StateId::from(0usize), &Goals::default(), false).is_none());
    }

    #[test]
    fn zero_cost_packing_prefers_fewer_steps() {
        // 0 -a-> 1 -b-> 2 and 0 -c-> 2, all costs 0.
        let incoming = vec![vec![], vec![t(0, 0)], vec![t(1, 1), t(2, 0)]];
        let outgoing = vec![vec![t(0, 1), t(2, 2)], vec![t(1, 2)], vec![]];
        let mut paths = ShortestPaths::new(&[0, 0, 0]);
        assert!(paths.task_has_zero_costs());
        paths.recompute(&incoming, &outgoing, &goals(&[2]), StateId::from(0usize));
        // One step beats two steps even though both cost 0.
        let solution = paths.extract_solution(StateId::from(0usize), &goals(&[2]), false).unwrap();
        assert_eq!(solution, vec![t(2, 2)]);
        assert_eq!(paths.goal_distance_32(StateId::from(0usize)), 0);
        assert!(paths.is_optimal_transition(StateId::from(0usize), OpId::from(2usize), StateId::from(2usize)));
        assert!(!paths.is_optimal_transition(StateId::from(0usize), OpId::from(0usize), StateId::from(1usize)));
    }

    #[test]
    fn incremental_update_matches_recompute() {
        // State 0 with a self-loop op and a goal op was split into 0 and 1:
        // after the split, 0 -op0-> 1 (the goal op now leads to the goal
        // state 1) and the old loop becomes 0 -op1-> 0 (kept as loop, not
        // modelled here).
        let mut paths = ShortestPaths::new(&[1]);
        let incoming_before = vec![vec![]];
        let outgoing_before = vec![vec![]];
        paths.recompute(&incoming_before, &outgoing_before, &goals(&[0]), StateId::from(0usize));

        let incoming = vec![vec![], vec![t(0, 0)]];
        let outgoing = vec![vec![t(0, 1)], vec![]];
        let new_goals = goals(&[1]);
        paths.update_incrementally(
            &incoming,
            &outgoing,
            StateId::from(0usize),
            StateId::from(0usize),
            StateId::from(1usize),
            false,
            &[],
            &[],
            &new_goals,
            StateId::from(0usize),
            false,
        );
        assert!(paths.test_distances(&incoming, &outgoing, &new_goals, StateId::from(0usize)));
        assert_eq!(paths.goal_distance_32(StateId::from(0usize)), 1);
        assert_eq!(paths.goal_distance_32(StateId::from(1usize)), 0);
    }

    #[test]
    fn vanished_tree_edge_after_disambiguation_is_revisited() {
        // 0 -op0-> 1, goal {1}. State 1 splits into 1 and 2 and
        // disambiguation drops the transition from 0 entirely, so 0 must
        // become unreachable instead of keeping its stale tree edge.
        let (incoming, outgoing) = two_state_system();
        let mut paths = ShortestPaths::new(&[1]);
        paths.recompute(&incoming, &outgoing, &goals(&[1]), StateId::from(0usize));
        assert_eq!(paths.goal_distance_32(StateId::from(0usize)), 1);

        let new_incoming = vec![vec![], vec![], vec![]];
        let new_outgoing = vec![vec![], vec![], vec![]];
        let new_goals = goals(&[2]);
        paths.update_incrementally(
            &new_incoming,
            &new_outgoing,
            StateId::from(1usize),
            StateId::from(1usize),
            StateId::from(2usize),
            true,
            &[t(0, 0)],
            &[],
            &new_goals,
            StateId::from(0usize),
            false,
        );
        assert_eq!(paths.goal_distance_64(StateId::from(0usize)), INF_COSTS);
        assert_eq!(paths.goal_distance_64(StateId::from(1usize)), INF_COSTS);
        assert!(paths.test_distances(&new_incoming, &new_outgoing, &new_goals, StateId::from(0usize)));
    }

    #[test]
    fn simulated_update_leaves_real_data_untouched(){
        let (incoming, outgoing) = two_state_system();
        let mut paths = ShortestPaths::new(&[1]);
        paths.recompute(&incoming, &outgoing, &goals(&[1]), StateId::from(0usize));
        let before = paths.goal_distances_32();

        // Pretend state 1 splits into 1 and 2, with the goal moving to 2.
        let sim_incoming = vec![vec![], vec![t(0, 0)], vec![]];
        let sim_outgoing = vec![vec![t(0, 1)], vec![], vec![]];
        paths.update_incrementally(
            &sim_incoming,
            &sim_outgoing,
            StateId::from(1usize),
            StateId::from(1usize),
            StateId::from(2usize),
            false,
            &[t(0, 0)],
            &[],
            &goals(&[2]),
            StateId::from(0usize),
            true,
        );
        assert_eq!(paths.goal_distances_32(), before);
        // In the simulation, state 1 lost its goal status and state 2 is
        // unreachable, so the simulated abstract task became unsolvable.
        assert_eq!(paths.simulated_goal_distance_64(StateId::from(0usize)), INF_COSTS);
    }
}
