//! The refinement loop: extract an abstract trace, find a flaw, split, patch
//! distances, until a resource budget runs out or the abstraction is exact.

use std::sync::Arc;
use std::time::Duration;

use anyhow::ensure;
use hashbrown::HashSet;
use tracing::{debug, info};

use crate::abstraction::Abstraction;
use crate::disambiguation::{DisambiguatedOperator, DisambiguationMethod};
use crate::dot::{create_dot_graph, write_to_file, DotGraphVerbosity};
use crate::flaw_search::{solution_cost, FlawSearch, FlawSearchCtx, PickFlawedAbstractState};
use crate::heuristic::{compute_saturated_costs, CartesianHeuristicFunction};
use crate::shortest_paths::ShortestPaths;
use crate::split_selector::SplitOptions;
use crate::task::{Fact, Task};
use crate::timers::{CountdownTimer, MemoryPadding};
use crate::transition_system::TransitionSystem;
use crate::{Cost, StateId};

#[derive(Clone)]
pub struct CegarOptions {
    /// Stop once the abstraction has this many states.
    pub max_states: usize,
    /// Stop once this many non-loop transitions exist.
    pub max_non_looping_transitions: usize,
    /// Wall-clock budget; `None` is unlimited.
    pub max_time: Option<Duration>,
    /// Extra memory reserved up front; refinement stops when it is released.
    pub memory_padding_mb: usize,
    pub pick_flawed_abstract_state: PickFlawedAbstractState,
    pub split: SplitOptions,
    pub max_concrete_states_per_abstract_state: usize,
    pub max_state_expansions: usize,
    pub intersect_flaw_search_abstract_states: bool,
    /// Split the abstract initial state down to the concrete one up front
    /// (implied by the backward strategies).
    pub refine_init: bool,
    pub operators_disambiguation: DisambiguationMethod,
    pub abstract_space_disambiguation: DisambiguationMethod,
    pub flaw_search_states_disambiguation: DisambiguationMethod,
    pub dot_graph_verbosity: DotGraphVerbosity,
    pub rng_seed: u64,
}

impl Default for CegarOptions {
    fn default() -> CegarOptions {
        CegarOptions {
            max_states: usize::MAX,
            max_non_looping_transitions: 1_000_000,
            max_time: None,
            memory_padding_mb: 0,
            pick_flawed_abstract_state: PickFlawedAbstractState::default(),
            split: SplitOptions::default(),
            max_concrete_states_per_abstract_state: usize::MAX,
            max_state_expansions: 1_000_000,
            intersect_flaw_search_abstract_states: false,
            refine_init: false,
            operators_disambiguation: DisambiguationMethod::None,
            abstract_space_disambiguation: DisambiguationMethod::None,
            flaw_search_states_disambiguation: DisambiguationMethod::None,
            dot_graph_verbosity: DotGraphVerbosity::Silent,
            rng_seed: 2023,
        }
    }
}

/// Why the refinement loop ended.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StopReason {
    MaxStates,
    MaxTransitions,
    TimeLimit,
    MemoryLimit,
    /// No abstract solution exists; the heuristic is infinite at the initial state.
    AbstractUnsolvable,
    /// No flaw along any optimal trace; the abstraction is exact enough.
    ConcreteSolutionFound,
    FlawSearchTimeout,
}

#[derive(Default)]
pub struct CegarStats {
    pub num_refinements: usize,
    pub forward_refinements: usize,
    pub backward_refinements: usize,
    pub forward_flawed_states: usize,
    pub backward_flawed_states: usize,
    pub num_optimal_cost_increases: usize,
    pub abstract_solution_cost: u32,
    pub stop_reason: Option<StopReason>,
    pub find_trace_time: Duration,
    pub find_flaw_time: Duration,
    pub refine_time: Duration,
    pub update_distances_time: Duration,
}

/// Builds one Cartesian abstraction for one (sub)task.
pub struct Cegar {
    task: Arc<dyn Task>,
    abstraction: Abstraction,
    shortest_paths: ShortestPaths,
    flaw_search: FlawSearch,
    /// Scratch transition system reused across simulated refinements.
    scratch: TransitionSystem,
    timer: CountdownTimer,
    memory: Arc<MemoryPadding>,
    max_states: usize,
    max_non_looping_transitions: usize,
    dot_graph_verbosity: DotGraphVerbosity,
    stats: CegarStats,
}

impl Cegar {
    /// Constructs the trivial abstraction, pre-refines, then runs the
    /// refinement loop until a budget gate closes.
    pub fn build(task: Arc<dyn Task>, options: CegarOptions) -> anyhow::Result<Cegar> {
        ensure!(options.max_states >= 1, "need room for at least one abstract state");
        let memory = Arc::new(MemoryPadding::reserve(options.memory_padding_mb));
        Cegar::build_with_memory(task, options, memory)
    }

    /// Like [`Cegar::build`] with an externally owned memory padding, so that
    /// several abstractions can share one reservation.
    pub fn build_with_memory(
        task: Arc<dyn Task>,
        options: CegarOptions,
        memory: Arc<MemoryPadding>,
    ) -> anyhow::Result<Cegar> {
        ensure!(options.max_states >= 1, "need room for at least one abstract state");

        let operators = Arc::new(DisambiguatedOperator::for_task(
            task.as_ref(),
            options.operators_disambiguation,
        ));
        let abstraction = Abstraction::new(
            Arc::clone(&task),
            Arc::clone(&operators),
            options.abstract_space_disambiguation,
        );
        let shortest_paths = ShortestPaths::new(&crate::task::operator_costs(task.as_ref()));
        let flaw_search = FlawSearch::new(
            task.as_ref(),
            options.pick_flawed_abstract_state,
            &options.split,
            options.max_concrete_states_per_abstract_state,
            options.max_state_expansions,
            options.intersect_flaw_search_abstract_states,
            options.flaw_search_states_disambiguation,
            options.rng_seed,
        )?;
        let scratch = TransitionSystem::new(operators);

        let mut cegar = Cegar {
            task,
            abstraction,
            shortest_paths,
            flaw_search,
            scratch,
            timer: CountdownTimer::new(options.max_time),
            memory,
            max_states: options.max_states,
            max_non_looping_transitions: options.max_non_looping_transitions,
            dot_graph_verbosity: options.dot_graph_verbosity,
            stats: CegarStats::default(),
        };

        info!("Start building abstraction.");
        info!("Maximum number of states: {}", cegar.max_states);
        info!("Maximum number of transitions: {}", cegar.max_non_looping_transitions);

        cegar.refinement_loop(options.refine_init);

        info!("Done building abstraction.");
        info!("Time for building abstraction: {:.3}s", cegar.timer.elapsed().as_secs_f64());
        cegar.log_statistics();
        Ok(cegar)
    }

    pub fn abstraction(&self) -> &Abstraction {
        &self.abstraction
    }

    pub fn shortest_paths(&self) -> &ShortestPaths {
        &self.shortest_paths
    }

    pub fn stats(&self) -> &CegarStats {
        &self.stats
    }

    pub fn memory(&self) -> &Arc<MemoryPadding> {
        &self.memory
    }

    /// Turns the built abstraction into its heuristic lookup table.
    pub fn extract_heuristic_function(self, with_saturated_costs: bool) -> CartesianHeuristicFunction {
        let goal_distances = self.shortest_paths.goal_distances_32();
        let saturated = with_saturated_costs
            .then(|| compute_saturated_costs(self.abstraction.transition_system(), &goal_distances));
        CartesianHeuristicFunction::new(
            self.abstraction.extract_refinement_hierarchy(),
            goal_distances,
            saturated,
        )
    }

    /// The budget gate. `divider` 2 checks the half budgets used by the
    /// direction-switching strategies.
    fn limit_reached(&self, divider: u32) -> Option<StopReason> {
        if self.abstraction.num_states() >= self.max_states / divider as usize {
            return Some(StopReason::MaxStates);
        }
        if self.abstraction.transition_system().num_non_loops()
            >= self.max_non_looping_transitions / divider as usize
        {
            return Some(StopReason::MaxTransitions);
        }
        if self.timer.fraction_elapsed(1, divider) {
            return Some(StopReason::TimeLimit);
        }
        if !self.memory.is_reserved() {
            return Some(StopReason::MemoryLimit);
        }
        None
    }

    fn may_keep_refining(&self) -> bool {
        self.limit_reached(1).is_none()
    }

    /// Delete-relaxed fixpoint of the facts reachable without achieving
    /// `last_fact`, starting from the initial state.
    fn relaxed_possible_before(&self, last_fact: Fact) -> Vec<HashSet<usize>> {
        let num_vars = self.task.num_variables();
        let mut facts: Vec<HashSet<usize>> = vec![HashSet::new(); num_vars];
        for (var, &value) in self.task.initial_state().iter().enumerate() {
            facts[var].insert(value);
        }

        let operators = self.abstraction.transition_system().operators();
        let applicable = |op: &DisambiguatedOperator, facts: &[HashSet<usize>]| {
            let pre = op.precondition().cartesian_set();
            (0..num_vars).all(|var| {
                pre.all_values_set(var) || pre.values(var).any(|value| facts[var].contains(&value))
            })
        };

        let mut updated = true;
        while updated {
            updated = false;
            for op in operators.iter() {
                if op.is_redundant() {
                    continue;
                }
                // Ignore operators that achieve the fact in question.
                if op.effect_on(last_fact.var) == Some(last_fact.value) {
                    continue;
                }
                if applicable(op, &facts) {
                    for &eff in op.effects() {
                        if facts[eff.var].insert(eff.value) {
                            updated = true;
                        }
                    }
                }
            }
        }
        facts[last_fact.var].insert(last_fact.value);
        facts
    }

    /// Pre-refinement for single-goal subtasks: split every value a variable
    /// cannot reach before the goal off the initial abstract state, then
    /// separate the goal fact itself.
    fn separate_facts_unreachable_before_goal(&mut self, refine_goals: bool) {
        debug_assert_eq!(self.abstraction.goals().len(), 1);
        debug_assert_eq!(self.abstraction.num_states(), 1);
        debug_assert_eq!(self.task.goals().len(), 1);
        let goal = self.task.goals()[0];
        let reachable = self.relaxed_possible_before(goal);
        for var in 0..self.task.num_variables() {
            if !self.may_keep_refining() {
                break;
            }
            let init_set = self.abstraction.initial_state().cartesian_set();
            let unreachable_values: Vec<usize> = init_set
                .values(var)
                .filter(|value| !reachable[var].contains(value))
                .collect();
            if !unreachable_values.is_empty() && init_set.count(var) > unreachable_values.len() {
                let init_id = self.abstraction.init_id();
                self.abstraction.refine(init_id, var, &unreachable_values);
            }
        }
        self.abstraction.mark_all_goal_states_as_goals();

        /*
          Splitting off the goal fact leaves the new initial state as the only
          non-goal state, so no goal state has to be split later. If the
          limits cut the unreachable-fact splits short, the goal fact is not
          split either; h stays 0 for all states that might already satisfy
          the goal.
        */
        debug_assert!(self
            .abstraction
            .initial_state()
            .includes_values(self.task.initial_state()));
        if refine_goals && self.may_keep_refining() {
            let init_id = self.abstraction.init_id();
            if self.abstraction.initial_state().count(goal.var) > 1 {
                self.abstraction.refine(init_id, goal.var, &[goal.value]);
            }
        }
    }

    /// Iteratively split each goal fact into its own abstract state.
    fn separate_goal_facts(&mut self) {
        debug_assert_eq!(self.abstraction.num_states(), 1);
        let goals = self.task.goals().to_vec();
        let mut current = self.abstraction.init_id();
        for goal in goals {
            if !self.may_keep_refining() {
                break;
            }
            if self.abstraction.state(current).count(goal.var) > 1 {
                let refinement = self.abstraction.refine(current, goal.var, &[goal.value]);
                current = refinement.v2_id;
            }
        }
    }

    /// Split the abstract initial state down to exactly the concrete initial
    /// state. Backward strategies need this because they only ever follow
    /// optimal transitions and the initial state has none.
    fn separate_init_facts(&mut self) {
        let initial_state = self.task.initial_state().to_vec();
        for (var, &value) in initial_state.iter().enumerate() {
            if !self.may_keep_refining() {
                break;
            }
            let init_set = self.abstraction.initial_state().cartesian_set();
            let other_values: Vec<usize> = init_set.values(var).filter(|&v| v != value).collect();
            // The state could have been disambiguated below the full domain.
            if !other_values.is_empty() && init_set.count(var) > other_values.len() {
                let init_id = self.abstraction.init_id();
                self.abstraction.refine(init_id, var, &other_values);
            }
        }
    }

    fn emit_dot_graph(&self) {
        match self.dot_graph_verbosity {
            DotGraphVerbosity::Silent => {}
            DotGraphVerbosity::WriteToConsole => {
                println!("{}", create_dot_graph(self.task.as_ref(), &self.abstraction));
            }
            DotGraphVerbosity::WriteToFile => {
                let name = format!("graph{}.dot", self.abstraction.num_states());
                if let Err(error) = write_to_file(&name, &create_dot_graph(self.task.as_ref(), &self.abstraction)) {
                    tracing::warn!("{error}");
                }
            }
        }
    }

    fn refinement_loop(&mut self, refine_init_option: bool) {
        /*
          Landmark subtasks map every state where the landmark might already
          hold to an abstract goal state, which the unreachable-fact splits
          realize. For other single-goal subtasks the scan finds nothing but
          is harmless. In both cases goal states are separated up front so
          they never have to be split later.
        */
        let refine_goals = self.flaw_search.refine_goals();
        if self.task.goals().len() == 1 {
            self.separate_facts_unreachable_before_goal(refine_goals);
        } else if refine_goals {
            self.separate_goal_facts();
            debug_assert!(!self
                .abstraction
                .goals()
                .contains(&self.abstraction.init_id()));
            debug_assert_eq!(self.abstraction.goals().len(), 1);
        }
        if refine_init_option || self.flaw_search.refine_init() {
            self.separate_init_facts();
        }

        self.shortest_paths.recompute(
            self.abstraction.transition_system().incoming(),
            self.abstraction.transition_system().outgoing(),
            self.abstraction.goals(),
            self.abstraction.init_id(),
        );
        self.debug_check_distances();

        self.stats.num_refinements = self.abstraction.num_states() - 1;
        let mut previous_optimal_cost: Cost = 0;
        let mut half_limits_reached = false;
        loop {
            if let Some(reason) = self.limit_reached(1) {
                info!("Reached {reason:?} limit.");
                self.stats.stop_reason = Some(reason);
                break;
            }

            let find_trace_started = std::time::Instant::now();
            let solution = self.shortest_paths.extract_solution(
                self.abstraction.init_id(),
                self.abstraction.goals(),
                false,
            );
            self.stats.find_trace_time += find_trace_started.elapsed();

            let Some(solution) = solution else {
                info!("Abstract task is unsolvable.");
                self.stats.stop_reason = Some(StopReason::AbstractUnsolvable);
                break;
            };
            let new_cost = self.shortest_paths.goal_distance_32(self.abstraction.init_id());
            if new_cost > self.stats.abstract_solution_cost {
                self.stats.abstract_solution_cost = new_cost;
                info!("Abstract solution cost: {new_cost}");
            }

            self.emit_dot_graph();

            // Once reached, the half budget never un-reaches.
            if !half_limits_reached {
                half_limits_reached = self.limit_reached(2).is_some();
            }

            let find_flaw_started = std::time::Instant::now();
            let split_properties = {
                let mut ctx = FlawSearchCtx {
                    task: self.task.as_ref(),
                    abstraction: &self.abstraction,
                    shortest_paths: &mut self.shortest_paths,
                    scratch: &mut self.scratch,
                    timer: &self.timer,
                    memory: self.memory.as_ref(),
                };
                self.flaw_search
                    .get_split_and_direction(&mut ctx, &solution, half_limits_reached)
            };
            self.stats.find_flaw_time += find_flaw_started.elapsed();

            if !self.memory.is_reserved() {
                info!("Reached memory limit in flaw search.");
                self.stats.stop_reason = Some(StopReason::MemoryLimit);
                break;
            }
            if self.timer.is_expired() {
                info!("Reached time limit in flaw search.");
                self.stats.stop_reason = Some(StopReason::FlawSearchTimeout);
                break;
            }
            let Some(split) = split_properties.split else {
                info!("Found concrete solution.");
                self.stats.stop_reason = Some(StopReason::ConcreteSolutionFound);
                break;
            };

            let refine_started = std::time::Instant::now();
            let state_id: StateId = split.abstract_state_id;
            let refinement = self.abstraction.refine(state_id, split.var, &split.values);
            self.flaw_search.notify_refined(state_id);
            self.stats.refine_time += refine_started.elapsed();

            self.stats.num_refinements += 1;
            if split_properties.backward {
                self.stats.backward_refinements += 1;
            } else {
                self.stats.forward_refinements += 1;
            }
            self.stats.forward_flawed_states += split_properties.n_forward_flawed_states;
            self.stats.backward_flawed_states += split_properties.n_backward_flawed_states;
            let optimal_cost = solution_cost(self.task.as_ref(), &solution);
            if optimal_cost > previous_optimal_cost {
                self.stats.num_optimal_cost_increases += 1;
            }
            previous_optimal_cost = optimal_cost;

            let update_started = std::time::Instant::now();
            self.shortest_paths.update_incrementally(
                self.abstraction.transition_system().incoming(),
                self.abstraction.transition_system().outgoing(),
                state_id,
                refinement.v1_id,
                refinement.v2_id,
                refinement.disambiguated,
                &refinement.old_incoming,
                &refinement.old_outgoing,
                self.abstraction.goals(),
                self.abstraction.init_id(),
                false,
            );
            self.stats.update_distances_time += update_started.elapsed();
            self.debug_check_distances();

            if self.abstraction.num_states() % 1000 == 0 {
                debug!(
                    "{}/{} states, {}/{} transitions",
                    self.abstraction.num_states(),
                    self.max_states,
                    self.abstraction.transition_system().num_non_loops(),
                    self.max_non_looping_transitions
                );
            }
        }
    }

    fn debug_check_distances(&self) {
        #[cfg(debug_assertions)]
        {
            assert!(self.abstraction.transition_system().is_consistent());
            assert!(self.shortest_paths.test_distances(
                self.abstraction.transition_system().incoming(),
                self.abstraction.transition_system().outgoing(),
                self.abstraction.goals(),
                self.abstraction.init_id(),
            ));
        }
    }

    fn log_statistics(&self) {
        self.abstraction.log_statistics();
        self.flaw_search.log_statistics(self.stats.num_refinements);
        info!("Time for finding abstract traces: {:.3}s", self.stats.find_trace_time.as_secs_f64());
        info!("Time for finding flaws and computing splits: {:.3}s", self.stats.find_flaw_time.as_secs_f64());
        info!("Time for splitting states: {:.3}s", self.stats.refine_time.as_secs_f64());
        info!("Time for updating goal distances: {:.3}s", self.stats.update_distances_time.as_secs_f64());
        info!("Number of refinements: {}", self.stats.num_refinements);
        info!("Forward refinements: {}", self.stats.forward_refinements);
        info!("Backward refinements: {}", self.stats.backward_refinements);
        info!("Total forward flawed states found: {}", self.stats.forward_flawed_states);
        info!("Total backward flawed states found: {}", self.stats.backward_flawed_states);
        info!(
            "Total number of times the cost of the optimal plan has been increased: {}",
            self.stats.num_optimal_cost_increases
        );
        info!(
            "Useless refinements: {}",
            self.abstraction
                .refinement_hierarchy()
                .num_useless_refinements(&self.shortest_paths.goal_distances_32())
        );
    }
}
