//! The Cartesian abstraction: abstract states, their transition system and
//! the refinement hierarchy, refined one split at a time.

use std::sync::Arc;

use tracing::debug;

use crate::abstract_state::AbstractState;
use crate::cartesian_set::CartesianSet;
use crate::disambiguation::{DisambiguatedOperator, DisambiguationMethod};
use crate::refinement_hierarchy::RefinementHierarchy;
use crate::task::{Fact, Task};
use crate::transition_system::{TransitionSystem, Transitions};
use crate::{Goals, StateId};

pub type AbstractStates = Vec<AbstractState>;

/// What [`Abstraction::refine`] hands back to the shortest-path update.
pub struct Refinement {
    pub v1_id: StateId,
    pub v2_id: StateId,
    /// Whether disambiguation shrank a child beyond the plain split.
    pub disambiguated: bool,
    pub old_incoming: Transitions,
    pub old_outgoing: Transitions,
}

/// The outcome of a split applied to a scratch transition system only. The
/// real abstraction is left untouched.
pub struct SimulatedRefinement {
    pub v1_id: StateId,
    pub v2_id: StateId,
    pub disambiguated: bool,
    pub goals: Goals,
    pub old_incoming: Transitions,
    pub old_outgoing: Transitions,
}

struct SplitResult {
    v1_id: StateId,
    v2_id: StateId,
    /// The values routed to the right child in the refinement hierarchy.
    v2_values: Vec<usize>,
    v1_set: CartesianSet,
    v2_set: CartesianSet,
}

pub struct Abstraction {
    task: Arc<dyn Task>,
    states: AbstractStates,
    init_id: StateId,
    goals: Goals,
    goal_facts: Vec<Fact>,
    concrete_initial_state: Vec<usize>,
    transition_system: TransitionSystem,
    refinement_hierarchy: RefinementHierarchy,
    disambiguation: DisambiguationMethod,

    num_disambiguations: usize,
    num_removed_states: usize,
}

impl Abstraction {
    /// Creates the trivial one-state abstraction: a single state covering the
    /// whole space, marked as a goal, with a self-loop for every applicable
    /// operator.
    pub fn new(
        task: Arc<dyn Task>,
        operators: Arc<Vec<DisambiguatedOperator>>,
        disambiguation: DisambiguationMethod,
    ) -> Abstraction {
        let domain_sizes = crate::task::domain_sizes(task.as_ref());
        let mut init_state = AbstractState::trivial(&domain_sizes);
        let init_id = init_state.id();

        let mut num_disambiguations = 0;
        let disambiguated = disambiguation.disambiguate(&mut init_state, task.mutexes());
        if disambiguated {
            num_disambiguations += 1;
        }

        let mut transition_system = TransitionSystem::new(operators);
        transition_system.add_loops_in_trivial_abstraction(&init_state, disambiguated);

        let mut goals = Goals::default();
        goals.insert(init_id);

        Abstraction {
            refinement_hierarchy: RefinementHierarchy::new(Arc::clone(&task)),
            goal_facts: task.goals().to_vec(),
            concrete_initial_state: task.initial_state().to_vec(),
            task,
            states: vec![init_state],
            init_id,
            goals,
            transition_system,
            disambiguation,
            num_disambiguations,
            num_removed_states: 0,
        }
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn init_id(&self) -> StateId {
        self.init_id
    }

    pub fn initial_state(&self) -> &AbstractState {
        &self.states[self.init_id]
    }

    pub fn state(&self, id: StateId) -> &AbstractState {
        &self.states[id]
    }

    pub fn states(&self) -> &AbstractStates {
        &self.states
    }

    pub fn goals(&self) -> &Goals {
        &self.goals
    }

    pub fn transition_system(&self) -> &TransitionSystem {
        &self.transition_system
    }

    pub fn refinement_hierarchy(&self) -> &RefinementHierarchy {
        &self.refinement_hierarchy
    }

    pub fn extract_refinement_hierarchy(self) -> RefinementHierarchy {
        self.refinement_hierarchy
    }

    pub fn num_disambiguations(&self) -> usize {
        self.num_disambiguations
    }

    pub fn num_removed_states(&self) -> usize {
        self.num_removed_states
    }

    /// Maps a concrete state to its abstract state, `None` if its values were
    /// dropped by disambiguation.
    pub fn abstract_state_id(&self, values: &[usize]) -> Option<StateId> {
        self.refinement_hierarchy.abstract_state_id(values)
    }

    fn disambiguate_state(&mut self, state: &mut AbstractState) -> bool {
        let changed = self.disambiguation.disambiguate(state, self.task.mutexes());
        if changed {
            self.num_disambiguations += 1;
        }
        changed
    }

    /// Rescans all states against the goal facts. Needed after pre-refinement
    /// bursts that split goal values off without going through `refine`.
    pub fn mark_all_goal_states_as_goals(&mut self) {
        self.goals.clear();
        for state in &self.states {
            if state.includes_facts(&self.goal_facts) {
                self.goals.insert(state.id());
            }
        }
        debug!("goal states after rescan: {}", self.goals.len());
    }

    fn split_state(&self, state: &AbstractState, var: usize, wanted: &[usize]) -> SplitResult {
        let v_id = state.id();
        // Reuse the parent's ID for one child so that IDs stay consecutive.
        let mut v1_id = v_id;
        let mut v2_id = StateId::from(self.num_states());

        let (mut v1_set, mut v2_set) = state.split_domain(var, wanted);
        let mut v2_values = wanted.to_vec();

        // The hierarchy stores one helper node per value routed to the right
        // child, so the smaller subset should end up there.
        if v2_values.len() > 1 {
            let v1_values = v1_set.get_values(var);
            if v2_values.len() > v1_values.len() {
                std::mem::swap(&mut v1_id, &mut v2_id);
                std::mem::swap(&mut v1_set, &mut v2_set);
                v2_values = v1_values;
            }
        }

        // The initial state keeps ID 0: give the old ID to whichever child
        // still contains the concrete initial state.
        let init_value = self.concrete_initial_state[var];
        if (v1_id == self.init_id && v2_set.test(var, init_value))
            || (v2_id == self.init_id && v1_set.test(var, init_value))
        {
            std::mem::swap(&mut v1_id, &mut v2_id);
        }

        SplitResult {
            v1_id,
            v2_id,
            v2_values,
            v1_set,
            v2_set,
        }
    }

    /// Variables on which either child's subset differs from the parent's.
    fn modified_vars(parent: &CartesianSet, v1: &AbstractState, v2: &AbstractState) -> Vec<usize> {
        (0..parent.num_vars())
            .filter(|&var| {
                !parent.is_equal_in_var(v1.cartesian_set(), var)
                    || !parent.is_equal_in_var(v2.cartesian_set(), var)
            })
            .collect()
    }

    /// Splits `state` on `var`, moving `wanted` into one child. Updates the
    /// hierarchy, the goal set and the transition system.
    pub fn refine(&mut self, state_id: StateId, var: usize, wanted: &[usize]) -> Refinement {
        debug!("refine {} for {}={:?}", self.states[state_id], var, wanted);

        let v_id = state_id;
        let split = self.split_state(&self.states[state_id], var, wanted);
        let parent_set = self.states[state_id].cartesian_set().clone();

        let (left_node, right_node) = self.refinement_hierarchy.split(
            self.states[state_id].node_id(),
            var,
            &split.v2_values,
            Some(split.v1_id),
            split.v2_id,
        );

        let mut v1 = AbstractState::new(split.v1_id, left_node, split.v1_set);
        let mut v2 = AbstractState::new(split.v2_id, right_node, split.v2_set);
        debug_assert!(self.states[state_id].includes(&v1));
        debug_assert!(self.states[state_id].includes(&v2));

        let wanted_in_v1 = v1.contains(var, wanted[0]);
        let disambiguated = {
            let d1 = self.disambiguate_state(&mut v1);
            let d2 = self.disambiguate_state(&mut v2);
            d1 || d2
        };

        let mut modified_vars = Vec::new();
        if disambiguated {
            if v1.is_spurious() {
                self.num_removed_states += 1;
            }
            if v2.is_spurious() {
                self.num_removed_states += 1;
            }
            modified_vars = Self::modified_vars(&parent_set, &v1, &v2);
            // Values dropped by disambiguation belong to no abstract state;
            // the hierarchy must route them to the "no state" leaf.
            for &analysed_var in &modified_vars {
                let parent_count = parent_set.count(analysed_var);
                let (v1_expected, v2_expected) = if analysed_var == var {
                    if wanted_in_v1 {
                        (wanted.len(), parent_count - wanted.len())
                    } else {
                        (parent_count - wanted.len(), wanted.len())
                    }
                } else {
                    (parent_count, parent_count)
                };
                if v1.count(analysed_var) != v1_expected {
                    let values = v1.cartesian_set().get_values(analysed_var);
                    let (_, leaf) =
                        self.refinement_hierarchy
                            .split(v1.node_id(), analysed_var, &values, None, v1.id());
                    v1.set_node_id(leaf);
                }
                if v2.count(analysed_var) != v2_expected {
                    let values = v2.cartesian_set().get_values(analysed_var);
                    let (_, leaf) =
                        self.refinement_hierarchy
                            .split(v2.node_id(), analysed_var, &values, None, v2.id());
                    v2.set_node_id(leaf);
                }
            }
        } else {
            modified_vars.push(var);
        }

        if self.goals.remove(&v_id) {
            if v1.includes_facts(&self.goal_facts) {
                self.goals.insert(v1.id());
            }
            if v2.includes_facts(&self.goal_facts) {
                self.goals.insert(v2.id());
            }
            debug!("goal states: {}", self.goals.len());
        }

        let (old_incoming, old_outgoing) =
            self.transition_system
                .rewire(&self.states, v_id, &v1, &v2, &modified_vars, false);

        let fresh_id = self.states.len();
        if usize::from(v1.id()) == fresh_id {
            let v2_id = v2.id();
            self.states.push(v1);
            self.states[v2_id] = v2;
        } else {
            debug_assert_eq!(usize::from(v2.id()), fresh_id);
            let v1_id = v1.id();
            self.states.push(v2);
            self.states[v1_id] = v1;
        }

        debug_assert_eq!(usize::from(self.init_id), 0);
        debug_assert!(self.initial_state().includes_values(&self.concrete_initial_state));

        Refinement {
            v1_id: split.v1_id,
            v2_id: split.v2_id,
            disambiguated,
            old_incoming,
            old_outgoing,
        }
    }

    /// Performs the split against `scratch` only, so a caller can score it by
    /// its effect on distances and then throw it away. The abstraction, its
    /// hierarchy and its own transition system stay untouched.
    pub fn simulate_refinement(
        &self,
        scratch: &mut TransitionSystem,
        state_id: StateId,
        var: usize,
        wanted: &[usize],
    ) -> SimulatedRefinement {
        debug!("simulate refinement {} for {}={:?}", self.states[state_id], var, wanted);

        let v_id = state_id;
        let state = &self.states[state_id];
        let split = self.split_state(state, var, wanted);

        // Hierarchy nodes are irrelevant here; reuse the parent's.
        let mut v1 = AbstractState::new(split.v1_id, state.node_id(), split.v1_set);
        let mut v2 = AbstractState::new(split.v2_id, state.node_id(), split.v2_set);
        debug_assert!(state.includes(&v1));
        debug_assert!(state.includes(&v2));

        scratch.force_new_transitions(
            self.transition_system.incoming(),
            self.transition_system.outgoing(),
            self.transition_system.loops(),
        );

        // Bypass disambiguate_state: statistics must not count simulations.
        let d1 = self.disambiguation.disambiguate(&mut v1, self.task.mutexes());
        let d2 = self.disambiguation.disambiguate(&mut v2, self.task.mutexes());
        let disambiguated = d1 || d2;
        let modified_vars = if disambiguated {
            Self::modified_vars(state.cartesian_set(), &v1, &v2)
        } else {
            vec![var]
        };

        let mut goals = self.goals.clone();
        if goals.remove(&v_id) {
            if v1.includes_facts(&self.goal_facts) {
                goals.insert(v1.id());
            }
            if v2.includes_facts(&self.goal_facts) {
                goals.insert(v2.id());
            }
        }

        let old_incoming = self.transition_system.incoming()[v_id].clone();
        let old_outgoing = self.transition_system.outgoing()[v_id].clone();
        scratch.rewire(&self.states, v_id, &v1, &v2, &modified_vars, true);

        SimulatedRefinement {
            v1_id: split.v1_id,
            v2_id: split.v2_id,
            disambiguated,
            goals,
            old_incoming,
            old_outgoing,
        }
    }

    pub fn log_statistics(&self) {
        tracing::info!("States: {}", self.num_states());
        tracing::info!("Goal states: {}", self.goals.len());
        tracing::info!("Looping transitions: {}", self.transition_system.num_loops());
        tracing::info!("Non-looping transitions: {}", self.transition_system.num_non_loops());
        tracing::info!("Nodes in refinement hierarchy: {}", self.refinement_hierarchy.num_nodes());
        tracing::info!("Disambiguated states: {}", self.num_disambiguations);
        tracing::info!("Removed states: {}", self.num_removed_states);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutexes::MutexInformation;
    use crate::task::{ExplicitTask, Operator};

    /// Two variables, one operator setting y to 1, goal y=1.
    fn simple_task() -> Arc<dyn Task> {
        let domains = vec![3, 2];
        Arc::new(
            ExplicitTask::new(
                domains.clone(),
                vec![Operator {
                    name: "set-y".to_string(),
                    preconditions: vec![Fact::new(1, 0)],
                    effects: vec![Fact::new(1, 1)],
                    cost: 1,
                }],
                vec![0, 0],
                vec![Fact::new(1, 1)],
                MutexInformation::new(&domains),
            )
            .unwrap(),
        )
    }

    fn build(task: &Arc<dyn Task>) -> Abstraction {
        let operators = Arc::new(crate::disambiguation::DisambiguatedOperator::for_task(
            task.as_ref(),
            DisambiguationMethod::None,
        ));
        Abstraction::new(Arc::clone(task), operators, DisambiguationMethod::None)
    }

    #[test]
    fn trivial_abstraction_loops_every_operator() {
        let task = simple_task();
        let abstraction = build(&task);
        assert_eq!(abstraction.num_states(), 1);
        assert!(abstraction.goals().contains(&abstraction.init_id()));
        assert_eq!(abstraction.transition_system().num_loops(), 1);
        assert_eq!(abstraction.transition_system().num_non_loops(), 0);
    }

    #[test]
    fn refine_keeps_initial_state_at_id_zero() {
        let task = simple_task();
        let mut abstraction = build(&task);
        // Split off the goal value of y; the concrete init has y=0.
        let refinement = abstraction.refine(abstraction.init_id(), 1, &[1]);
        assert_eq!(abstraction.num_states(), 2);
        assert_eq!(usize::from(abstraction.init_id()), 0);
        assert!(abstraction.initial_state().includes_values(&[0, 0]));
        // The parent was a goal; only the y=1 child remains one.
        assert_eq!(abstraction.goals().len(), 1);
        assert!(!abstraction.goals().contains(&abstraction.init_id()));
        // The old self-loop became a cross transition.
        assert_eq!(abstraction.transition_system().num_non_loops(), 1);
        assert!(abstraction.transition_system().is_consistent());
        assert_eq!(refinement.v1_id, abstraction.init_id());
        // Lookup agrees with the split.
        assert_eq!(abstraction.abstract_state_id(&[2, 0]), Some(abstraction.init_id()));
        assert_eq!(abstraction.abstract_state_id(&[2, 1]), Some(refinement.v2_id));
    }

    #[test]
    fn every_concrete_state_maps_into_its_abstract_state() {
        let task = simple_task();
        let mut abstraction = build(&task);
        abstraction.refine(abstraction.init_id(), 1, &[1]);
        abstraction.refine(abstraction.init_id(), 0, &[1, 2]);
        for x in 0..3 {
            for y in 0..2 {
                let id = abstraction.abstract_state_id(&[x, y]).unwrap();
                assert!(abstraction.state(id).includes_values(&[x, y]));
            }
        }
    }

    #[test]
    fn simulate_refinement_leaves_abstraction_untouched() {
        let task = simple_task();
        let mut abstraction = build(&task);
        abstraction.refine(abstraction.init_id(), 1, &[1]);
        let states_before = abstraction.num_states();
        let nodes_before = abstraction.refinement_hierarchy().num_nodes();
        let non_loops_before = abstraction.transition_system().num_non_loops();

        let mut scratch = TransitionSystem::new(Arc::clone(abstraction.transition_system().operators()));
        let sim = abstraction.simulate_refinement(&mut scratch, abstraction.init_id(), 0, &[0]);

        assert_eq!(abstraction.num_states(), states_before);
        assert_eq!(abstraction.refinement_hierarchy().num_nodes(), nodes_before);
        assert_eq!(abstraction.transition_system().num_non_loops(), non_loops_before);
        // One of the children gets the fresh ID, the other reuses the parent's.
        let fresh = usize::from(sim.v1_id) == states_before || usize::from(sim.v2_id) == states_before;
        assert!(fresh);
        assert_eq!(scratch.num_states(), states_before + 1);
    }
}
