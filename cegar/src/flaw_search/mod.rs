//! Search for flaws: abstract states along the current optimal trace from
//! which the trace cannot be realized in the concrete task.
//!
//! Two families of flaw modes exist. The concrete-search modes expand real
//! states of the task along f-optimal abstract transitions. The trace modes
//! (in `trace`) walk the abstract solution with a Cartesian flaw-search state,
//! either stopping at the first flaw or collecting a whole sequence.

pub mod flaw;
mod trace;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::abstraction::Abstraction;
use crate::collections::{RefMap, RefPool};
use crate::shortest_paths::ShortestPaths;
use crate::split_selector::{
    SelectionContext, Split, SplitOptions, SplitProperties, SplitSelector,
};
use crate::task::{self, Task};
use crate::timers::{CountdownTimer, MemoryPadding};
use crate::transition_system::TransitionSystem;
use crate::{Cost, OpId, Solution, StateId, INF_COSTS};

use flaw::{FlawedState, FlawedStates, LegacyFlaw};

create_ref_type!(ConcreteStateId);

/// Which abstract state to refine when several are flawed, and in which flaw
/// mode to look for them.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum PickFlawedAbstractState {
    /// Concrete search; refine the first encountered flawed state.
    First,
    /// Follow the shortest-path tree with a concrete state (no search).
    FirstOnShortestPath,
    /// Same, but split the offending values off instead of the wanted ones.
    FirstOnShortestPathUnwantedValues,
    /// Walk the trace backward from the goal, splitting unwanted values.
    FirstOnShortestPathBackward,
    /// Walk the trace backward from the goal, splitting wanted values.
    FirstOnShortestPathBackwardWantedValues,
    /// Alternate the walk direction every iteration.
    FirstOnShortestPathBidirectionalInterleaved,
    /// Backward for the first half of the budget, then forward.
    FirstOnShortestPathBidirectionalBackwardForward,
    /// Forward for the first half of the budget, then backward.
    FirstOnShortestPathBidirectionalForwardBackward,
    /// Walk both directions, refine the flaw closer to the goal.
    FirstOnShortestPathBidirectionalClosestToGoal,
    /// Concrete search; collect all flawed states, refine a random one.
    Random,
    /// Concrete search; refine a flawed state of minimum h.
    MinH,
    /// Concrete search; refine a flawed state of maximum h.
    MaxH,
    /// Concrete search; refine all collected flawed states by increasing h
    /// before searching again.
    #[default]
    BatchMinH,
    /// Trace walk collecting all flaws (undeviating past each one).
    Sequence,
    /// Sequence restricted to the abstraction (ignores init and goals).
    SequenceInAbstraction,
    SequenceBackward,
    SequenceInAbstractionBackward,
    SequenceBidirectional,
    SequenceInAbstractionBidirectional,
    /// Sequence modes that refine every collected flaw before searching again.
    SequenceBatch,
    SequenceBatchBackward,
    SequenceInAbstractionBatch,
    SequenceInAbstractionBatchBackward,
}

impl PickFlawedAbstractState {
    fn is_legacy(self) -> bool {
        use PickFlawedAbstractState::*;
        matches!(
            self,
            FirstOnShortestPath
                | FirstOnShortestPathUnwantedValues
                | FirstOnShortestPathBackward
                | FirstOnShortestPathBackwardWantedValues
                | FirstOnShortestPathBidirectionalInterleaved
                | FirstOnShortestPathBidirectionalBackwardForward
                | FirstOnShortestPathBidirectionalForwardBackward
                | FirstOnShortestPathBidirectionalClosestToGoal
        )
    }

    fn is_sequence(self) -> bool {
        use PickFlawedAbstractState::*;
        matches!(
            self,
            Sequence
                | SequenceInAbstraction
                | SequenceBackward
                | SequenceInAbstractionBackward
                | SequenceBidirectional
                | SequenceInAbstractionBidirectional
                | SequenceBatch
                | SequenceBatchBackward
                | SequenceInAbstractionBatch
                | SequenceInAbstractionBatchBackward
        )
    }

    fn in_abstraction(self) -> bool {
        use PickFlawedAbstractState::*;
        matches!(
            self,
            SequenceInAbstraction
                | SequenceInAbstractionBackward
                | SequenceInAbstractionBidirectional
                | SequenceInAbstractionBatch
                | SequenceInAbstractionBatchBackward
        )
    }

    fn in_batch(self) -> bool {
        use PickFlawedAbstractState::*;
        matches!(
            self,
            SequenceBatch | SequenceBatchBackward | SequenceInAbstractionBatch | SequenceInAbstractionBatchBackward
        )
    }

    /// Whether the driver should split goal states off before refining.
    pub fn refine_goals(self) -> bool {
        use PickFlawedAbstractState::*;
        matches!(
            self,
            First
                | FirstOnShortestPath
                | FirstOnShortestPathUnwantedValues
                | FirstOnShortestPathBackwardWantedValues
                | Random
                | MinH
                | MaxH
                | BatchMinH
        )
    }

    /// Whether the driver should pre-refine the abstract initial state down
    /// to the concrete one (needed by pure backward strategies, which only
    /// ever see optimal transitions and the initial state has none).
    pub fn refine_init(self) -> bool {
        use PickFlawedAbstractState::*;
        matches!(
            self,
            FirstOnShortestPathBackward | FirstOnShortestPathBackwardWantedValues | SequenceBackward | SequenceInAbstractionBackward | SequenceBatchBackward | SequenceInAbstractionBatchBackward
        )
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SearchStatus {
    InProgress,
    /// The f-optimal state space was exhausted with flaws collected.
    Failed,
    /// A concrete solution was found; the abstraction is exact enough.
    Solved,
    Timeout,
}

/// F-optimal transitions grouped by operator, in deterministic order.
pub type OptimalTransitions = BTreeMap<OpId, Vec<StateId>>;

pub fn f_optimal_transitions(
    abstraction: &Abstraction,
    shortest_paths: &ShortestPaths,
    state_id: StateId,
) -> OptimalTransitions {
    let mut transitions = OptimalTransitions::new();
    for t in &abstraction.transition_system().outgoing()[state_id] {
        if shortest_paths.is_optimal_transition(state_id, t.op, t.target) {
            transitions.entry(t.op).or_default().push(t.target);
        }
    }
    transitions
}

pub fn f_optimal_backward_transitions(
    abstraction: &Abstraction,
    shortest_paths: &ShortestPaths,
    state_id: StateId,
) -> OptimalTransitions {
    let mut transitions = OptimalTransitions::new();
    for t in &abstraction.transition_system().incoming()[state_id] {
        if shortest_paths.is_backward_optimal_transition(state_id, t.op, t.target) {
            transitions.entry(t.op).or_default().push(t.target);
        }
    }
    transitions
}

/// Raw cost of an abstract solution (no zero-cost packing).
pub fn solution_cost(task: &dyn Task, solution: &Solution) -> Cost {
    solution
        .iter()
        .map(|t| task.operators()[usize::from(t.op)].cost as Cost)
        .sum()
}

/// Interning registry for the concrete states touched by a flaw search.
pub struct StateRegistry {
    pool: RefPool<ConcreteStateId, Box<[usize]>>,
    initial: ConcreteStateId,
}

impl StateRegistry {
    pub fn new(initial_state: &[usize]) -> StateRegistry {
        let mut pool = RefPool::default();
        let initial = pool.push(initial_state.into());
        StateRegistry { pool, initial }
    }

    pub fn initial(&self) -> ConcreteStateId {
        self.initial
    }

    pub fn lookup(&self, id: ConcreteStateId) -> &[usize] {
        self.pool.get(id)
    }

    /// Interns the successor of `state` under `op`; the flag tells whether
    /// the state was seen for the first time.
    pub fn successor(&mut self, state: &[usize], op: &task::Operator) -> (ConcreteStateId, bool) {
        self.pool.get_or_push(task::apply(op, state))
    }
}

/// Borrowed collaborators threaded through every flaw-search call.
pub struct FlawSearchCtx<'a> {
    pub task: &'a dyn Task,
    pub abstraction: &'a Abstraction,
    pub shortest_paths: &'a mut ShortestPaths,
    pub scratch: &'a mut TransitionSystem,
    pub timer: &'a CountdownTimer,
    pub memory: &'a MemoryPadding,
}

impl<'a> FlawSearchCtx<'a> {
    fn selection(&mut self) -> SelectionContext<'_> {
        SelectionContext {
            abstraction: self.abstraction,
            shortest_paths: &mut *self.shortest_paths,
            scratch: &mut *self.scratch,
        }
    }
}

pub struct FlawSearch {
    domain_sizes: Vec<usize>,
    split_selector: SplitSelector,
    rng: SmallRng,
    pick_flawed_abstract_state: PickFlawedAbstractState,
    max_concrete_states_per_abstract_state: usize,
    max_state_expansions: usize,
    /// Intersect trace-mode flaw-search states with the abstract state they
    /// visit, finding more flaws at the price of smaller sets.
    intersect_flaw_search_abstract_states: bool,
    flaw_search_states_disambiguation: crate::disambiguation::DisambiguationMethod,

    // Concrete search data.
    open_list: Vec<ConcreteStateId>,
    registry: StateRegistry,
    cached_abstract_state_ids: RefMap<ConcreteStateId, StateId>,

    // Flaw data.
    flawed_states: FlawedStates,
    last_refined_flawed_state: Option<FlawedState>,
    best_flaw_h: Cost,
    sequence_flaws_queue: std::collections::VecDeque<(LegacyFlaw, bool)>,

    // Direction switches; at most one direction change happens per run for
    // the half-budget strategies.
    forward_direction: bool,
    backward_direction: bool,
    split_unwanted_values: bool,
    batch_bidirectional_already_changed_dir: bool,

    // Split caches for the trace modes, invalidated on refinement.
    splits_cache: HashMap<(StateId, bool, bool), HashMap<LegacyFlaw, Option<Split>>>,
    opt_tr_cache: HashMap<(StateId, bool), OptimalTransitions>,

    // Statistics.
    num_searches: usize,
    num_overall_expanded_concrete_states: usize,
    max_expanded_concrete_states: usize,
    flaw_search_time: Duration,
    compute_splits_time: Duration,
    pick_split_time: Duration,
}

impl FlawSearch {
    pub fn new(
        task: &dyn Task,
        pick_flawed_abstract_state: PickFlawedAbstractState,
        split_options: &SplitOptions,
        max_concrete_states_per_abstract_state: usize,
        max_state_expansions: usize,
        intersect_flaw_search_abstract_states: bool,
        flaw_search_states_disambiguation: crate::disambiguation::DisambiguationMethod,
        rng_seed: u64,
    ) -> anyhow::Result<FlawSearch> {
        use PickFlawedAbstractState::*;
        let (forward, backward, unwanted) = match pick_flawed_abstract_state {
            FirstOnShortestPathUnwantedValues => (true, false, true),
            FirstOnShortestPathBackward | FirstOnShortestPathBidirectionalBackwardForward => (false, true, true),
            FirstOnShortestPathBackwardWantedValues => (false, true, false),
            SequenceBackward | SequenceInAbstractionBackward | SequenceBatchBackward
            | SequenceInAbstractionBatchBackward => (false, true, false),
            SequenceBidirectional | SequenceInAbstractionBidirectional => (true, true, false),
            // The closest-to-goal strategy decides per iteration.
            FirstOnShortestPathBidirectionalClosestToGoal => (true, true, false),
            _ => (true, false, false),
        };

        Ok(FlawSearch {
            domain_sizes: task::domain_sizes(task),
            split_selector: SplitSelector::new(task, split_options)?,
            rng: SmallRng::seed_from_u64(rng_seed),
            pick_flawed_abstract_state,
            max_concrete_states_per_abstract_state,
            max_state_expansions,
            intersect_flaw_search_abstract_states,
            flaw_search_states_disambiguation,
            open_list: Vec::new(),
            registry: StateRegistry::new(task.initial_state()),
            cached_abstract_state_ids: RefMap::default(),
            flawed_states: FlawedStates::default(),
            last_refined_flawed_state: None,
            best_flaw_h: if pick_flawed_abstract_state == MaxH { 0 } else { INF_COSTS },
            sequence_flaws_queue: std::collections::VecDeque::new(),
            forward_direction: forward,
            backward_direction: backward,
            split_unwanted_values: unwanted,
            batch_bidirectional_already_changed_dir: false,
            splits_cache: HashMap::new(),
            opt_tr_cache: HashMap::new(),
            num_searches: 0,
            num_overall_expanded_concrete_states: 0,
            max_expanded_concrete_states: 0,
            flaw_search_time: Duration::ZERO,
            compute_splits_time: Duration::ZERO,
            pick_split_time: Duration::ZERO,
        })
    }

    pub fn refine_goals(&self) -> bool {
        self.pick_flawed_abstract_state.refine_goals()
    }

    pub fn refine_init(&self) -> bool {
        self.pick_flawed_abstract_state.refine_init()
    }

    fn h_value(&self, ctx: &FlawSearchCtx, abs_id: StateId) -> Cost {
        ctx.shortest_paths.goal_distance_64(abs_id)
    }

    /// Fraction of the trace already behind the flawed abstract state.
    fn plan_position(abstraction: &Abstraction, abs_id: StateId, solution: &Solution) -> f64 {
        if abstraction.init_id() == abs_id || solution.is_empty() {
            return 0.0;
        }
        let mut pos = 0;
        for step in solution {
            pos += 1;
            if step.target == abs_id {
                break;
            }
        }
        pos as f64 / solution.len() as f64
    }

    // ---- concrete-search flaw mode ----

    fn add_flaw(&mut self, ctx: &FlawSearchCtx, abs_id: StateId, state: ConcreteStateId) {
        debug_assert!(ctx.abstraction.state(abs_id).includes_values(self.registry.lookup(state)));
        if self.flawed_states.num_concrete_states(abs_id) >= self.max_concrete_states_per_abstract_state {
            return;
        }

        let h = self.h_value(ctx, abs_id);
        match self.pick_flawed_abstract_state {
            PickFlawedAbstractState::MinH => {
                if self.best_flaw_h > h {
                    self.flawed_states.clear();
                }
                if self.best_flaw_h >= h {
                    self.best_flaw_h = h;
                    self.flawed_states.add_state(abs_id, state, h);
                }
            }
            PickFlawedAbstractState::MaxH => {
                if self.best_flaw_h < h {
                    self.flawed_states.clear();
                }
                if self.best_flaw_h <= h {
                    self.best_flaw_h = h;
                    self.flawed_states.add_state(abs_id, state, h);
                }
            }
            _ => {
                self.flawed_states.add_state(abs_id, state, h);
            }
        }
    }

    fn initialize(&mut self, ctx: &FlawSearchCtx) {
        self.num_searches += 1;
        self.last_refined_flawed_state = None;
        self.best_flaw_h = if self.pick_flawed_abstract_state == PickFlawedAbstractState::MaxH {
            0
        } else {
            INF_COSTS
        };
        debug_assert!(self.open_list.is_empty());
        debug_assert!(self.flawed_states.is_empty());
        self.registry = StateRegistry::new(ctx.task.initial_state());
        self.cached_abstract_state_ids = RefMap::default();

        let initial = self.registry.initial();
        self.cached_abstract_state_ids.insert(initial, ctx.abstraction.init_id());
        self.open_list.push(initial);
    }

    fn step(&mut self, ctx: &FlawSearchCtx) -> SearchStatus {
        let Some(id) = self.open_list.pop() else {
            // Completely explored the f-optimal state space.
            return SearchStatus::Failed;
        };
        let values: Box<[usize]> = self.registry.lookup(id).into();
        self.num_overall_expanded_concrete_states += 1;

        if task::is_goal_state(ctx.task, &values)
            && self.pick_flawed_abstract_state != PickFlawedAbstractState::MaxH
        {
            return SearchStatus::Solved;
        }

        let mut found_flaw = false;
        let abs_id = self.cached_abstract_state_ids[id];
        debug_assert_eq!(Some(abs_id), ctx.abstraction.abstract_state_id(&values));

        // Check each f-optimal transition for inapplicability or deviation.
        for (op_id, targets) in f_optimal_transitions(ctx.abstraction, ctx.shortest_paths, abs_id) {
            if !ctx.memory.is_reserved() {
                return SearchStatus::Timeout;
            }
            let op = &ctx.task.operators()[usize::from(op_id)];

            if !task::is_applicable(op, &values) {
                // Applicability flaw.
                if !found_flaw {
                    self.add_flaw(ctx, abs_id, id);
                    found_flaw = true;
                }
                if self.pick_flawed_abstract_state == PickFlawedAbstractState::First {
                    return SearchStatus::Failed;
                }
                continue;
            }

            let (succ_id, _) = self.registry.successor(&values, op);
            let succ_values: Box<[usize]> = self.registry.lookup(succ_id).into();

            for target in targets {
                if !ctx.abstraction.state(target).includes_values(&succ_values) {
                    // Deviation flaw.
                    if !found_flaw {
                        self.add_flaw(ctx, abs_id, id);
                        found_flaw = true;
                    }
                    if self.pick_flawed_abstract_state == PickFlawedAbstractState::First {
                        return SearchStatus::Failed;
                    }
                } else if !self.cached_abstract_state_ids.contains(succ_id) {
                    // No flaw; open the successor.
                    self.cached_abstract_state_ids.insert(succ_id, target);
                    self.open_list.push(succ_id);
                    if self.pick_flawed_abstract_state == PickFlawedAbstractState::First {
                        break;
                    }
                }
            }
            if self.pick_flawed_abstract_state == PickFlawedAbstractState::First {
                // Only consider one successor, like the trace walks do.
                break;
            }
        }
        SearchStatus::InProgress
    }

    fn search_for_flaws(&mut self, ctx: &FlawSearchCtx) -> SearchStatus {
        let started = Instant::now();
        self.initialize(ctx);
        let expansions_before = self.num_overall_expanded_concrete_states;
        let mut status = SearchStatus::InProgress;
        while status == SearchStatus::InProgress {
            if ctx.timer.is_expired() {
                status = SearchStatus::Timeout;
                break;
            }
            let expanded = self.num_overall_expanded_concrete_states - expansions_before;
            // The expansion limit only counts once a flaw exists, to stay complete.
            if expanded >= self.max_state_expansions && self.flawed_states.num_abstract_states() > 0 {
                debug!("expansion limit reached with flaws");
                status = SearchStatus::Failed;
                break;
            }
            status = self.step(ctx);
        }
        self.open_list.clear();

        let expanded = self.num_overall_expanded_concrete_states - expansions_before;
        self.max_expanded_concrete_states = self.max_expanded_concrete_states.max(expanded);
        debug!("flaw search expanded {expanded} states: {status:?}");

        // MaxH does not stop at goal states, so an exhausted search without
        // flaws means the abstraction is exact.
        if self.pick_flawed_abstract_state == PickFlawedAbstractState::MaxH
            && status == SearchStatus::Failed
            && self.flawed_states.num_abstract_states() == 0
        {
            status = SearchStatus::Solved;
        }

        self.flaw_search_time += started.elapsed();
        status
    }

    /// Variables an operator leaves untouched: no effect and not pinned to a
    /// single precondition value.
    fn unaffected_variables(op: &crate::disambiguation::DisambiguatedOperator, num_vars: usize) -> Vec<usize> {
        let pre = op.precondition().cartesian_set();
        (0..num_vars)
            .filter(|&var| !op.has_effect(var) && pre.count(var) != 1)
            .collect()
    }

    /// Registers a candidate split, grouping and merging by variable unless
    /// the unwanted-values orientation keeps them separate.
    pub(crate) fn push_split(splits: &mut Vec<Vec<Split>>, new_split: Split, split_unwanted_values: bool) {
        if split_unwanted_values {
            splits.push(vec![new_split]);
        } else {
            let var_splits = &mut splits[new_split.var];
            for old_split in var_splits.iter_mut() {
                if *old_split == new_split {
                    old_split.count += new_split.count;
                    return;
                }
            }
            var_splits.push(new_split);
        }
    }

    fn new_split_collection(&self, split_unwanted_values: bool) -> Vec<Vec<Split>> {
        if split_unwanted_values {
            Vec::new()
        } else {
            vec![Vec::new(); self.domain_sizes.len()]
        }
    }

    /// Split construction from concrete flawed states: applicability flaws
    /// against the disambiguated precondition, deviation flaws against the
    /// missed f-optimal targets.
    fn create_split(
        &mut self,
        ctx: &mut FlawSearchCtx,
        state_ids: &[ConcreteStateId],
        abstract_state_id: StateId,
        solution_cost: Cost,
        split_unwanted_values: bool,
    ) -> Option<Split> {
        let compute_started = Instant::now();
        let abstract_state = ctx.abstraction.state(abstract_state_id);
        debug!(
            "create split for abstract state {abstract_state_id} and {} concrete states",
            state_ids.len()
        );

        let mut splits = self.new_split_collection(split_unwanted_values);
        let states: Vec<Box<[usize]>> = state_ids.iter().map(|&id| self.registry.lookup(id).into()).collect();

        for (op_id, targets) in f_optimal_transitions(ctx.abstraction, ctx.shortest_paths, abstract_state_id) {
            let op = ctx.abstraction.transition_system().operator(op_id);
            let pre = op.precondition().cartesian_set();

            let mut applicable = vec![true; states.len()];
            for var in 0..self.domain_sizes.len() {
                let mut state_value_count = vec![0usize; self.domain_sizes[var]];
                for (i, state) in states.iter().enumerate() {
                    let state_value = state[var];
                    if !pre.test(var, state_value) {
                        // Applicability flaw.
                        applicable[i] = false;
                        state_value_count[state_value] += 1;
                    }
                }
                // A disambiguated precondition may allow values outside the
                // abstract state; only the shared ones can be split off.
                let wanted: Vec<usize> = pre.values(var).filter(|&v| abstract_state.contains(var, v)).collect();
                for (value, &count) in state_value_count.iter().enumerate() {
                    if count > 0 {
                        debug_assert!(!pre.test(var, value));
                        if split_unwanted_values {
                            for &wanted_value in &wanted {
                                Self::push_split(
                                    &mut splits,
                                    Split::new(abstract_state_id, var, wanted_value, vec![value], count, Some(op.cost())),
                                    true,
                                );
                            }
                        } else {
                            Self::push_split(
                                &mut splits,
                                Split::new(abstract_state_id, var, value, wanted.clone(), count, Some(op.cost())),
                                false,
                            );
                        }
                    }
                }
            }

            let concrete_op = &ctx.task.operators()[usize::from(op_id)];
            let mut deviation_states_by_target: HashMap<StateId, Vec<usize>> = HashMap::new();
            for (i, state) in states.iter().enumerate() {
                if !applicable[i] {
                    continue;
                }
                let succ = task::apply(concrete_op, state);
                let mut target_hit = false;
                for &target in &targets {
                    if !ctx.memory.is_reserved() {
                        return None;
                    }
                    // At most one f-optimal target can include the successor.
                    if !target_hit && ctx.abstraction.state(target).includes_values(&succ) {
                        target_hit = true;
                    } else {
                        deviation_states_by_target.entry(target).or_default().push(i);
                    }
                }
            }

            for (target, deviating) in deviation_states_by_target {
                let unaffected = Self::unaffected_variables(op, self.domain_sizes.len());
                let target_state = ctx.abstraction.state(target);
                // Count the deviating facts on the unaffected variables.
                let mut fact_count: Vec<Vec<usize>> =
                    self.domain_sizes.iter().map(|&size| vec![0; size]).collect();
                for &i in &deviating {
                    for &var in &unaffected {
                        fact_count[var][states[i][var]] += 1;
                    }
                }
                for (var, var_counts) in fact_count.iter().enumerate() {
                    for (value, &count) in var_counts.iter().enumerate() {
                        if count > 0 && !target_state.contains(var, value) {
                            let wanted: Vec<usize> = (0..self.domain_sizes[var])
                                .filter(|&v| abstract_state.contains(var, v) && target_state.contains(var, v))
                                .collect();
                            debug_assert!(!wanted.is_empty());
                            if split_unwanted_values {
                                for &want in &wanted {
                                    Self::push_split(
                                        &mut splits,
                                        Split::new(abstract_state_id, var, want, vec![value], count, None),
                                        true,
                                    );
                                }
                            } else {
                                Self::push_split(
                                    &mut splits,
                                    Split::new(abstract_state_id, var, value, wanted, count, None),
                                    false,
                                );
                            }
                        }
                    }
                }
            }
        }

        self.compute_splits_time += compute_started.elapsed();
        self.pick_among(ctx, abstract_state_id, splits, solution_cost)
    }

    /// Hands the collected candidates to the split selector.
    pub(crate) fn pick_among(
        &mut self,
        ctx: &mut FlawSearchCtx,
        abstract_state_id: StateId,
        splits: Vec<Vec<Split>>,
        solution_cost: Cost,
    ) -> Option<Split> {
        let num_splits: usize = splits.iter().map(Vec::len).sum();
        debug!("unique splits: {num_splits}");
        if num_splits == 0 {
            return None;
        }
        let pick_started = Instant::now();
        let mut selection = ctx.selection();
        let abstract_state = selection.abstraction.state(abstract_state_id);
        let split = self.split_selector.pick_split(
            &mut selection,
            abstract_state,
            splits,
            solution_cost,
            &mut self.rng,
        );
        self.pick_split_time += pick_started.elapsed();
        Some(split)
    }

    fn get_single_split(&mut self, ctx: &mut FlawSearchCtx, solution_cost: Cost) -> Option<Split> {
        let status = self.search_for_flaws(ctx);
        match status {
            SearchStatus::Timeout => {
                self.flawed_states.clear();
                None
            }
            SearchStatus::Failed => {
                debug_assert!(!self.flawed_states.is_empty());
                let flawed = self.flawed_states.pop_random_flawed_state_and_clear(&mut self.rng);
                let state_id = FlawedStates::pick_random_concrete_state(&flawed, &mut self.rng);
                let unwanted = self.split_unwanted_values;
                self.create_split(ctx, &[state_id], flawed.abs_id, solution_cost, unwanted)
            }
            SearchStatus::Solved => None,
            SearchStatus::InProgress => unreachable!("search loop never returns InProgress"),
        }
    }

    fn flawed_state_with_min_h(&mut self, ctx: &FlawSearchCtx) -> Option<FlawedState> {
        while let Some(flawed) = self.flawed_states.pop_flawed_state_with_min_h() {
            debug_assert!(self.h_value(ctx, flawed.abs_id) >= flawed.h);
            if self.h_value(ctx, flawed.abs_id) == flawed.h {
                debug!("reuse flawed state {}", flawed.abs_id);
                return Some(flawed);
            }
            debug!("ignore flawed state with increased f value: {}", flawed.abs_id);
        }
        None
    }

    fn get_min_h_batch_split(&mut self, ctx: &mut FlawSearchCtx, solution_cost: Cost) -> Option<Split> {
        debug_assert_eq!(self.pick_flawed_abstract_state, PickFlawedAbstractState::BatchMinH);
        if let Some(last) = self.last_refined_flawed_state.take() {
            // Recycle flaws of the last refined abstract state.
            let old_h = last.h;
            for state_id in last.concrete_states {
                let values: Box<[usize]> = self.registry.lookup(state_id).into();
                debug_assert!(!task::is_goal_state(ctx.task, &values));
                if let Some(abs_id) = ctx.abstraction.abstract_state_id(&values) {
                    if self.h_value(ctx, abs_id) == old_h {
                        self.add_flaw(ctx, abs_id, state_id);
                    }
                }
            }
        }

        let mut flawed_state = self.flawed_state_with_min_h(ctx);
        let mut status = SearchStatus::Failed;
        if flawed_state.is_none() {
            status = self.search_for_flaws(ctx);
            if status == SearchStatus::Failed {
                flawed_state = self.flawed_state_with_min_h(ctx);
            }
        }

        match status {
            SearchStatus::Timeout => None,
            SearchStatus::Failed => {
                let flawed = flawed_state.expect("failed search leaves flawed states");
                debug!("use flawed state {} with {} witnesses", flawed.abs_id, flawed.concrete_states.len());
                let unwanted = self.split_unwanted_values;
                let split = self.create_split(ctx, &flawed.concrete_states, flawed.abs_id, solution_cost, unwanted);
                if !ctx.memory.is_reserved() {
                    return None;
                }
                match split {
                    Some(split) => {
                        self.last_refined_flawed_state = Some(flawed);
                        Some(split)
                    }
                    None => {
                        // The selected abstract state has no splits; try again.
                        self.last_refined_flawed_state = None;
                        self.get_min_h_batch_split(ctx, solution_cost)
                    }
                }
            }
            SearchStatus::Solved => None,
            SearchStatus::InProgress => unreachable!("search loop never returns InProgress"),
        }
    }

    fn get_split(&mut self, ctx: &mut FlawSearchCtx, solution_cost: Cost) -> SplitProperties {
        use PickFlawedAbstractState::*;
        let split = match self.pick_flawed_abstract_state {
            First | Random | MinH | MaxH => self.get_single_split(ctx, solution_cost),
            BatchMinH => self.get_min_h_batch_split(ctx, solution_cost),
            _ => unreachable!("trace strategies are dispatched separately"),
        };
        let found = usize::from(split.is_some());
        SplitProperties::new(split, 0.0, false, found, 0)
    }

    /// Entry point of every iteration: dispatches to the configured flaw mode
    /// and returns the chosen split with its direction.
    pub fn get_split_and_direction(
        &mut self,
        ctx: &mut FlawSearchCtx,
        solution: &Solution,
        half_limits_reached: bool,
    ) -> SplitProperties {
        self.update_current_direction(half_limits_reached);
        let cost = solution_cost(ctx.task, solution);
        if self.pick_flawed_abstract_state
            == PickFlawedAbstractState::FirstOnShortestPathBidirectionalClosestToGoal
        {
            self.get_split_legacy_closest_to_goal(ctx, solution, cost)
        } else if self.pick_flawed_abstract_state.is_sequence() {
            self.get_sequence_splits(ctx, solution, cost)
        } else if self.pick_flawed_abstract_state.is_legacy() {
            self.get_split_legacy(ctx, solution, cost)
        } else {
            self.get_split(ctx, cost)
        }
    }

    /// The bidirectional strategies change direction mid-run: interleaved on
    /// every iteration, the half-budget ones exactly once.
    fn update_current_direction(&mut self, half_limits_reached: bool) {
        use PickFlawedAbstractState::*;
        match self.pick_flawed_abstract_state {
            FirstOnShortestPathBidirectionalInterleaved => {
                self.backward_direction = !self.backward_direction;
                self.forward_direction = !self.forward_direction;
                self.split_unwanted_values = self.backward_direction;
            }
            FirstOnShortestPathBidirectionalBackwardForward | FirstOnShortestPathBidirectionalForwardBackward => {
                if !self.batch_bidirectional_already_changed_dir && half_limits_reached {
                    self.backward_direction = !self.backward_direction;
                    self.forward_direction = !self.forward_direction;
                    self.split_unwanted_values = self.backward_direction;
                    self.batch_bidirectional_already_changed_dir = true;
                }
            }
            _ => {}
        }
    }

    pub fn num_expanded_concrete_states(&self) -> usize {
        self.num_overall_expanded_concrete_states
    }

    pub fn log_statistics(&self, num_refinements: usize) {
        info!("Flaw searches: {}", self.num_searches);
        info!("Expanded concrete states: {}", self.num_overall_expanded_concrete_states);
        info!(
            "Maximum expanded concrete states in single flaw search: {}",
            self.max_expanded_concrete_states
        );
        info!("Flaw search time: {:.3}s", self.flaw_search_time.as_secs_f64());
        info!("Time for computing splits: {:.3}s", self.compute_splits_time.as_secs_f64());
        info!("Time for selecting splits: {:.3}s", self.pick_split_time.as_secs_f64());
        if self.num_searches > 0 {
            info!(
                "Average number of refinements per flaw search: {:.2}",
                num_refinements as f64 / self.num_searches as f64
            );
            info!(
                "Average number of expanded concrete states per flaw search: {:.2}",
                self.num_overall_expanded_concrete_states as f64 / self.num_searches as f64
            );
        }
    }
}
