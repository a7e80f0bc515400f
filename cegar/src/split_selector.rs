//! Rating and selection among candidate splits.

use anyhow::Context;
use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use rand::Rng;
use tracing::trace;

use crate::abstract_state::AbstractState;
use crate::abstraction::Abstraction;
use crate::hadd::{compute_hadd, AdditiveHeuristic};
use crate::shortest_paths::ShortestPaths;
use crate::task::{Fact, Task};
use crate::transition_system::TransitionSystem;
use crate::{Cost, StateId, INF_COSTS};

pub(crate) const EPSILON: f64 = 1e-6;

/// Strategies for selecting a split in case there are multiple possibilities.
///
/// The causal-graph strategies rate by variable index, relying on the task
/// preparation convention that variables arrive topologically ordered along
/// the causal graph.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum PickSplit {
    Random,
    /// Number of values that land in the state whose h-value is probably raised.
    MinUnwanted,
    MaxUnwanted,
    /// Refinement: `-(remaining values / original domain size)`.
    MinRefined,
    MaxRefined,
    /// Compare the h^add(s0) values of the facts to split off.
    MinHadd,
    MaxHadd,
    /// Position in the causal-graph ordering.
    MinCg,
    MaxCg,
    /// The split covering the most flawed concrete states.
    #[default]
    MaxCover,
    HighestCostOperator,
    LowestCostOperator,
    /// A variable order shuffled anew on every run.
    RandomVarsOrder,
    /// Landmark variables first, ordered by descending/ascending h^add.
    LandmarksVarsOrderHaddDown,
    LandmarksVarsOrderHaddUp,
    /// Variables ordered by the maximum fact potential of their values.
    MaxPotentialVarsOrder,
    MinPotentialVarsOrder,
    /// How much a child's goal distance grows when the split is simulated.
    GoalDistanceIncreased,
    /// How much the optimal abstract plan cost grows when the split is simulated.
    OptimalPlanCostIncreased,
    /// Most refined and closest to the goal, equally weighted.
    BalanceRefinedClosestGoal,
}

/// Strategies for selecting among sequence flaws. The first group mirrors
/// [`PickSplit`]; the last three pick by position on the trace.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PickSequenceFlaw {
    Random,
    MinUnwanted,
    MaxUnwanted,
    MinRefined,
    MaxRefined,
    MinHadd,
    MaxHadd,
    MinCg,
    MaxCg,
    HighestCostOperator,
    LowestCostOperator,
    RandomVarsOrder,
    LandmarksVarsOrderHaddDown,
    LandmarksVarsOrderHaddUp,
    MaxPotentialVarsOrder,
    MinPotentialVarsOrder,
    GoalDistanceIncreased,
    OptimalPlanCostIncreased,
    BalanceRefinedClosestGoal,
    FirstFlaw,
    LastFlaw,
    /// The first flaw in regression, the last one in progression.
    ClosestToGoalFlaw,
}

impl PickSequenceFlaw {
    /// The rating strategy backing this pick; `None` for the positional picks.
    pub fn rating_kind(self) -> Option<PickSplit> {
        use PickSequenceFlaw::*;
        Some(match self {
            Random => PickSplit::Random,
            MinUnwanted => PickSplit::MinUnwanted,
            MaxUnwanted => PickSplit::MaxUnwanted,
            MinRefined => PickSplit::MinRefined,
            MaxRefined => PickSplit::MaxRefined,
            MinHadd => PickSplit::MinHadd,
            MaxHadd => PickSplit::MaxHadd,
            MinCg => PickSplit::MinCg,
            MaxCg => PickSplit::MaxCg,
            HighestCostOperator => PickSplit::HighestCostOperator,
            LowestCostOperator => PickSplit::LowestCostOperator,
            RandomVarsOrder => PickSplit::RandomVarsOrder,
            LandmarksVarsOrderHaddDown => PickSplit::LandmarksVarsOrderHaddDown,
            LandmarksVarsOrderHaddUp => PickSplit::LandmarksVarsOrderHaddUp,
            MaxPotentialVarsOrder => PickSplit::MaxPotentialVarsOrder,
            MinPotentialVarsOrder => PickSplit::MinPotentialVarsOrder,
            GoalDistanceIncreased => PickSplit::GoalDistanceIncreased,
            OptimalPlanCostIncreased => PickSplit::OptimalPlanCostIncreased,
            BalanceRefinedClosestGoal => PickSplit::BalanceRefinedClosestGoal,
            FirstFlaw | LastFlaw | ClosestToGoalFlaw => return None,
        })
    }
}

/// A proposal to refine abstract state `abstract_state_id` on `var`: move
/// `values` into one child, the complement into the other. `value` is the
/// representative value on the other side of the separation.
#[derive(Clone, Debug)]
pub struct Split {
    /// How many flawed concrete states this split resolves.
    pub count: usize,
    pub abstract_state_id: StateId,
    pub var: usize,
    pub value: usize,
    pub values: Vec<usize>,
    /// Cost of the operator that motivated the split; `None` for splits
    /// derived from goal or initial-state facts.
    pub op_cost: Option<u32>,
}

impl Split {
    pub fn new(
        abstract_state_id: StateId,
        var: usize,
        value: usize,
        values: Vec<usize>,
        count: usize,
        op_cost: Option<u32>,
    ) -> Split {
        debug_assert!(count >= 1);
        Split {
            count,
            abstract_state_id,
            var,
            value,
            values,
            op_cost,
        }
    }

    /// Merges `other` into this split when both separate around a common
    /// singleton value. Returns whether merging succeeded.
    pub fn combine_with(&mut self, mut other: Split) -> bool {
        debug_assert_eq!(self.var, other.var);
        if *self == other {
            return true;
        }
        // Try to switch the orientation to expose a shared singleton.
        if self.values.len() == 1 && self.values[0] == other.value {
            std::mem::swap(&mut self.value, &mut self.values[0]);
        } else if other.values.len() == 1 && self.value == other.values[0] {
            std::mem::swap(&mut other.value, &mut other.values[0]);
        } else if self.values.len() == 1 && other.values.len() == 1 && self.values[0] == other.values[0] {
            std::mem::swap(&mut self.value, &mut self.values[0]);
            std::mem::swap(&mut other.value, &mut other.values[0]);
        }

        if self.value == other.value {
            debug_assert!(self.values.windows(2).all(|w| w[0] < w[1]));
            debug_assert!(other.values.windows(2).all(|w| w[0] < w[1]));
            let mut combined = Vec::with_capacity(self.values.len() + other.values.len());
            let mut it1 = self.values.iter().copied().peekable();
            let mut it2 = other.values.iter().copied().peekable();
            while let (Some(&a), Some(&b)) = (it1.peek(), it2.peek()) {
                match a.cmp(&b) {
                    std::cmp::Ordering::Less => combined.push(it1.next().unwrap()),
                    std::cmp::Ordering::Greater => combined.push(it2.next().unwrap()),
                    std::cmp::Ordering::Equal => {
                        combined.push(it1.next().unwrap());
                        it2.next();
                    }
                }
            }
            combined.extend(it1);
            combined.extend(it2);
            self.values = combined;
            true
        } else {
            // Splits without a common singleton value stay separate.
            false
        }
    }
}

impl PartialEq for Split {
    fn eq(&self, other: &Split) -> bool {
        debug_assert_eq!(self.var, other.var);
        if self.value == other.value {
            self.values == other.values && self.op_cost == other.op_cost
        } else if self.values.len() == 1 && other.values.len() == 1 {
            // Separating exactly two values is symmetric.
            self.value == other.values[0] && other.value == self.values[0] && self.op_cost == other.op_cost
        } else {
            false
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}={}|{:?}:{}", self.var, self.value, self.values, self.count)?;
        if let Some(cost) = self.op_cost {
            write!(f, "({cost})")?;
        }
        write!(f, ">")
    }
}

/// The split chosen for an iteration, with flaw-search bookkeeping for the
/// driver statistics.
pub struct SplitProperties {
    pub split: Option<Split>,
    /// Position of the refined state on the trace, as a fraction of its length.
    pub flawed_state_pos: f64,
    pub backward: bool,
    pub n_forward_flawed_states: usize,
    pub n_backward_flawed_states: usize,
}

impl SplitProperties {
    pub fn new(
        split: Option<Split>,
        flawed_state_pos: f64,
        backward: bool,
        n_forward: usize,
        n_backward: usize,
    ) -> SplitProperties {
        SplitProperties {
            split,
            flawed_state_pos,
            backward,
            n_forward_flawed_states: n_forward,
            n_backward_flawed_states: n_backward,
        }
    }

    pub fn none() -> SplitProperties {
        SplitProperties::new(None, 0.0, false, 0, 0)
    }
}

/// Configuration of the split selection, part of the CEGAR options.
#[derive(Clone, Default)]
pub struct SplitOptions {
    pub pick_split: PickSplit,
    pub tiebreak_split: PickSplit,
    pub sequence_split: PickSequenceFlaw,
    pub sequence_tiebreak_split: PickSequenceFlaw,
    /// Landmark facts from an external landmark analysis; required by the
    /// landmark variable orders.
    pub landmark_facts: Option<Vec<Fact>>,
    /// Per-variable, per-value potentials from an external LP analysis;
    /// required by the potential variable orders.
    pub fact_potentials: Option<Vec<Vec<f64>>>,
}

impl Default for PickSequenceFlaw {
    fn default() -> PickSequenceFlaw {
        PickSequenceFlaw::BalanceRefinedClosestGoal
    }
}

/// Everything the simulation-based ratings need mutable access to.
pub struct SelectionContext<'a> {
    pub abstraction: &'a Abstraction,
    pub shortest_paths: &'a mut ShortestPaths,
    pub scratch: &'a mut TransitionSystem,
}

pub struct SplitSelector {
    domain_sizes: Vec<usize>,
    first_pick: PickSplit,
    tiebreak_pick: PickSplit,
    pub(crate) sequence_pick: PickSequenceFlaw,
    pub(crate) sequence_tiebreak_pick: PickSequenceFlaw,
    /// For the fixed-order strategies: the position of each variable.
    vars_order: Vec<usize>,
    hadd: Option<AdditiveHeuristic>,
}

fn invert_order(sorted_vars: &[usize]) -> Vec<usize> {
    let mut inverted = vec![0; sorted_vars.len()];
    for (position, &var) in sorted_vars.iter().enumerate() {
        inverted[var] = position;
    }
    inverted
}

impl SplitSelector {
    pub fn new(task: &dyn Task, options: &SplitOptions) -> anyhow::Result<SplitSelector> {
        let picks = [
            options.pick_split,
            options.tiebreak_split,
            options.sequence_split.rating_kind().unwrap_or(PickSplit::Random),
            options.sequence_tiebreak_split.rating_kind().unwrap_or(PickSplit::Random),
        ];
        let uses = |p: PickSplit| picks.contains(&p);

        let needs_hadd = uses(PickSplit::MinHadd)
            || uses(PickSplit::MaxHadd)
            || uses(PickSplit::LandmarksVarsOrderHaddDown)
            || uses(PickSplit::LandmarksVarsOrderHaddUp);
        let hadd = needs_hadd.then(|| compute_hadd(task));

        let num_vars = task.num_variables();
        let mut vars_order = Vec::new();
        if uses(PickSplit::RandomVarsOrder) {
            use rand::seq::SliceRandom;
            let mut sorted_vars: Vec<usize> = (0..num_vars).collect();
            // A fresh order on every run, independent of the seeded RNG.
            sorted_vars.shuffle(&mut rand::rng());
            vars_order = invert_order(&sorted_vars);
        }
        if uses(PickSplit::LandmarksVarsOrderHaddDown) || uses(PickSplit::LandmarksVarsOrderHaddUp) {
            let descending = uses(PickSplit::LandmarksVarsOrderHaddDown);
            let mut landmarks = options
                .landmark_facts
                .clone()
                .context("landmark variable orders need landmark facts")?;
            let hadd = hadd.as_ref().expect("hadd is computed for landmark orders");
            landmarks.sort_by_key(|fact| hadd.fact_cost(fact.var, fact.value));
            if descending {
                landmarks.reverse();
            }
            let mut sorted_vars = Vec::with_capacity(num_vars);
            let mut remaining: Vec<bool> = vec![true; num_vars];
            for landmark in &landmarks {
                if remaining[landmark.var] {
                    remaining[landmark.var] = false;
                    sorted_vars.push(landmark.var);
                }
            }
            let mut rest: Vec<usize> = (0..num_vars).filter(|&v| remaining[v]).collect();
            if descending {
                rest.reverse();
            }
            sorted_vars.extend(rest);
            vars_order = invert_order(&sorted_vars);
        }
        if uses(PickSplit::MaxPotentialVarsOrder) || uses(PickSplit::MinPotentialVarsOrder) {
            let descending = uses(PickSplit::MaxPotentialVarsOrder);
            let potentials = options
                .fact_potentials
                .as_ref()
                .context("potential variable orders need fact potentials")?;
            anyhow::ensure!(potentials.len() == num_vars, "potentials cover {} of {num_vars} variables", potentials.len());
            // Each variable is represented by its best fact potential.
            let mut vars_potential: Vec<(usize, f64)> = potentials
                .iter()
                .enumerate()
                .map(|(var, values)| (var, values.iter().copied().fold(f64::NEG_INFINITY, f64::max)))
                .collect();
            if descending {
                vars_potential.sort_by(|a, b| b.1.total_cmp(&a.1));
            } else {
                vars_potential.sort_by(|a, b| a.1.total_cmp(&b.1));
            }
            let sorted_vars: Vec<usize> = vars_potential.into_iter().map(|(var, _)| var).collect();
            vars_order = invert_order(&sorted_vars);
        }

        Ok(SplitSelector {
            domain_sizes: crate::task::domain_sizes(task),
            first_pick: options.pick_split,
            tiebreak_pick: options.tiebreak_split,
            sequence_pick: options.sequence_split,
            sequence_tiebreak_pick: options.sequence_tiebreak_split,
            vars_order,
            hadd,
        })
    }

    fn num_unwanted_values(&self, state: &AbstractState, split: &Split) -> usize {
        let unwanted = state.count(split.var) - split.values.len();
        debug_assert!(unwanted >= 1);
        unwanted
    }

    fn refinedness(&self, state: &AbstractState, var: usize) -> f64 {
        let all_values = self.domain_sizes[var] as f64;
        debug_assert!(all_values >= 2.0);
        let remaining_values = state.count(var) as f64;
        let refinedness = -(remaining_values / all_values);
        debug_assert!((-1.0..0.0).contains(&refinedness));
        refinedness
    }

    fn hadd(&self) -> &AdditiveHeuristic {
        self.hadd.as_ref().expect("hadd is computed when a hadd strategy is configured")
    }

    fn cost_to_f64(cost: Cost) -> f64 {
        if cost == INF_COSTS {
            f64::INFINITY
        } else {
            cost as f64
        }
    }

    /// Rates a split; higher is better.
    pub fn rate_split(
        &self,
        ctx: &mut SelectionContext,
        state: &AbstractState,
        split: &Split,
        pick: PickSplit,
        solution_cost: Cost,
    ) -> f64 {
        let var = split.var;
        match pick {
            PickSplit::Random => 0.0,
            PickSplit::MinUnwanted => -(self.num_unwanted_values(state, split) as f64),
            PickSplit::MaxUnwanted => self.num_unwanted_values(state, split) as f64,
            PickSplit::MinRefined => -self.refinedness(state, var),
            PickSplit::MaxRefined => self.refinedness(state, var),
            PickSplit::MinHadd => -Self::cost_to_f64(self.hadd().min_cost(var, &split.values)),
            PickSplit::MaxHadd => Self::cost_to_f64(self.hadd().max_cost(var, &split.values)),
            PickSplit::MinCg => -(var as f64),
            PickSplit::MaxCg => var as f64,
            PickSplit::MaxCover => split.count as f64,
            PickSplit::HighestCostOperator => {
                // Goal and initial-state splits rank between cost-0 and cost-1
                // operators.
                match split.op_cost {
                    None => 0.5,
                    Some(cost) => cost as f64,
                }
            }
            PickSplit::LowestCostOperator => {
                // A cost of exactly 1 collides with the negated no-operator
                // sentinel and is ranked last.
                match split.op_cost {
                    Some(1) => f64::NEG_INFINITY,
                    Some(cost) => -(cost as f64),
                    None => 1.0,
                }
            }
            PickSplit::RandomVarsOrder
            | PickSplit::LandmarksVarsOrderHaddDown
            | PickSplit::LandmarksVarsOrderHaddUp
            | PickSplit::MaxPotentialVarsOrder
            | PickSplit::MinPotentialVarsOrder => -(self.vars_order[var] as f64),
            PickSplit::GoalDistanceIncreased => {
                let state_id = state.id();
                let current = ctx.shortest_paths.goal_distance_64(state_id);
                let sim = ctx.abstraction.simulate_refinement(ctx.scratch, state_id, var, &split.values);
                ctx.shortest_paths.update_incrementally(
                    ctx.scratch.incoming(),
                    ctx.scratch.outgoing(),
                    state_id,
                    sim.v1_id,
                    sim.v2_id,
                    sim.disambiguated,
                    &sim.old_incoming,
                    &sim.old_outgoing,
                    &sim.goals,
                    ctx.abstraction.init_id(),
                    true,
                );
                let new_dist = ctx
                    .shortest_paths
                    .simulated_goal_distance_64(sim.v1_id)
                    .max(ctx.shortest_paths.simulated_goal_distance_64(sim.v2_id));
                if new_dist == INF_COSTS {
                    f64::INFINITY
                } else {
                    (new_dist - current) as f64
                }
            }
            PickSplit::OptimalPlanCostIncreased => {
                let state_id = state.id();
                let sim = ctx.abstraction.simulate_refinement(ctx.scratch, state_id, var, &split.values);
                ctx.shortest_paths.update_incrementally(
                    ctx.scratch.incoming(),
                    ctx.scratch.outgoing(),
                    state_id,
                    sim.v1_id,
                    sim.v2_id,
                    sim.disambiguated,
                    &sim.old_incoming,
                    &sim.old_outgoing,
                    &sim.goals,
                    ctx.abstraction.init_id(),
                    true,
                );
                match ctx
                    .shortest_paths
                    .extract_solution(ctx.abstraction.init_id(), &sim.goals, true)
                {
                    None => f64::INFINITY,
                    Some(solution) => {
                        let new_cost: Cost = solution
                            .iter()
                            .map(|t| ctx.abstraction.task().operators()[usize::from(t.op)].cost as Cost)
                            .sum();
                        new_cost as f64 - solution_cost as f64
                    }
                }
            }
            PickSplit::BalanceRefinedClosestGoal => {
                let init_dist = ctx.shortest_paths.goal_distance_64(ctx.abstraction.init_id());
                let init_dist = if init_dist == 0 { 1.0 } else { Self::cost_to_f64(init_dist) };
                // Refinedness lies in [-1, 0); the state's goal distance is
                // normalized against the initial state's, the maximum on any
                // optimal trace.
                self.refinedness(state, var)
                    - Self::cost_to_f64(ctx.shortest_paths.goal_distance_64(state.id())) / init_dist
            }
        }
    }

    /// Greedily unions same-variable splits by descending flaw count, then
    /// keeps the best-covering split of every variable.
    fn compute_max_cover_splits(&self, mut splits: Vec<Vec<Split>>) -> Vec<Split> {
        for var_splits in &mut splits {
            if var_splits.len() <= 1 {
                continue;
            }
            var_splits.sort_by(|a, b| b.count.cmp(&a.count));
            let mut rest = var_splits.split_off(1);
            let best = &mut var_splits[0];
            for other in rest.drain(..) {
                let count = other.count;
                if best.combine_with(other) {
                    best.count += count;
                }
            }
        }

        let mut best_splits: Vec<Split> = Vec::new();
        let mut max_count = 0;
        for var_splits in splits {
            for split in var_splits {
                if split.count > max_count {
                    max_count = split.count;
                    best_splits.clear();
                    best_splits.push(split);
                } else if split.count == max_count {
                    best_splits.push(split);
                }
            }
        }
        best_splits
    }

    fn reduce_to_best_splits(
        &self,
        ctx: &mut SelectionContext,
        abstract_state: &AbstractState,
        splits: Vec<Vec<Split>>,
        solution_cost: Cost,
    ) -> Vec<Split> {
        if self.first_pick == PickSplit::MaxCover {
            return self.compute_max_cover_splits(splits);
        }

        let mut best_splits = Vec::new();
        let mut max_rating = f64::NEG_INFINITY;
        for var_splits in splits {
            for split in var_splits {
                let rating = self.rate_split(ctx, abstract_state, &split, self.first_pick, solution_cost);
                if rating > max_rating || best_splits.is_empty() {
                    max_rating = rating;
                    best_splits.clear();
                    best_splits.push(split);
                } else if rating == max_rating {
                    best_splits.push(split);
                }
            }
        }
        best_splits
    }

    fn select_from_best_splits(
        &self,
        ctx: &mut SelectionContext,
        abstract_state: &AbstractState,
        mut splits: Vec<Split>,
        solution_cost: Cost,
        rng: &mut SmallRng,
    ) -> Split {
        debug_assert!(!splits.is_empty());
        if splits.len() == 1 {
            return splits.pop().unwrap();
        }
        if self.tiebreak_pick == PickSplit::Random {
            let index = rng.random_range(0..splits.len());
            return splits.swap_remove(index);
        }
        let mut max_rating = f64::NEG_INFINITY;
        let mut selected = 0;
        for (index, split) in splits.iter().enumerate() {
            let rating = self.rate_split(ctx, abstract_state, split, self.tiebreak_pick, solution_cost);
            if rating > max_rating || index == 0 {
                selected = index;
                max_rating = rating;
            }
        }
        splits.swap_remove(selected)
    }

    /// Picks one split among the candidates, grouped by variable.
    pub fn pick_split(
        &self,
        ctx: &mut SelectionContext,
        abstract_state: &AbstractState,
        splits: Vec<Vec<Split>>,
        solution_cost: Cost,
        rng: &mut SmallRng,
    ) -> Split {
        debug_assert!(splits.iter().any(|group| !group.is_empty()));
        if self.first_pick == PickSplit::Random {
            let groups: Vec<&Vec<Split>> = splits.iter().filter(|group| !group.is_empty()).collect();
            let group = groups.choose(rng).unwrap();
            return (*group.choose(rng).unwrap()).clone();
        }

        let best_splits = self.reduce_to_best_splits(ctx, abstract_state, splits, solution_cost);
        trace!("best splits: {:?}", best_splits.iter().map(Split::to_string).collect::<Vec<_>>());
        let selected = self.select_from_best_splits(ctx, abstract_state, best_splits, solution_cost, rng);
        trace!("selected split: {selected}");
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(value: usize, values: Vec<usize>, count: usize) -> Split {
        Split::new(StateId::from(0usize), 0, value, values, count, Some(2))
    }

    #[test]
    fn equal_two_value_splits_are_symmetric() {
        assert_eq!(split(1, vec![2], 1), split(2, vec![1], 1));
        assert_ne!(split(1, vec![2], 1), split(3, vec![1], 1));
    }

    #[test]
    fn combine_unions_values_around_common_singleton() {
        let mut a = split(0, vec![1], 1);
        let combined = a.combine_with(split(0, vec![3], 2));
        assert!(combined);
        assert_eq!(a.values, vec![1, 3]);
        assert_eq!(a.value, 0);
    }

    #[test]
    fn combine_flips_singleton_orientation() {
        // <0|{2}> and <2|{3}> share the singleton 2 after flipping the first.
        let mut a = split(0, vec![2], 1);
        let combined = a.combine_with(split(2, vec![3], 1));
        assert!(combined);
        assert_eq!(a.value, 2);
        assert_eq!(a.values, vec![0, 3]);
    }

    #[test]
    fn combine_refuses_unrelated_splits() {
        let mut a = split(0, vec![1, 2], 1);
        assert!(!a.combine_with(split(3, vec![4, 5], 1)));
    }
}
