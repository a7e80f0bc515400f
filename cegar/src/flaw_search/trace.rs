//! Trace-simulation flaw modes: walk the abstract solution with a Cartesian
//! flaw-search state, forward by progression or backward by regression from
//! the goal. The first-flaw ("legacy") strategies stop at the first flaw; the
//! sequence strategies undeviate and keep collecting along the same trace.

use std::time::Instant;

use tracing::{debug, trace};

use super::flaw::LegacyFlaw;
use super::{
    f_optimal_backward_transitions, f_optimal_transitions, FlawSearch, FlawSearchCtx, OptimalTransitions,
};
use crate::cartesian_state::CartesianState;
use crate::split_selector::{PickSequenceFlaw, Split, SplitProperties, EPSILON};
use crate::task::Operator;
use crate::{Cost, Solution, StateId};

impl FlawSearch {
    fn operator<'t>(ctx: &FlawSearchCtx<'t>, op: crate::OpId) -> &'t Operator {
        &ctx.task.operators()[usize::from(op)]
    }

    /// Tightens a freshly progressed or regressed flaw-search state with the
    /// configured mutex reasoning.
    fn disambiguate_flaw_state(&self, ctx: &FlawSearchCtx, state: &mut CartesianState) {
        self.flaw_search_states_disambiguation
            .disambiguate(state, ctx.task.mutexes());
    }

    /// Walks the trace forward from the initial state. Returns the flaws in
    /// encounter order; with `in_sequence` unset only the first one.
    pub(super) fn get_forward_flaws(
        &self,
        ctx: &FlawSearchCtx,
        solution: &Solution,
        in_sequence: bool,
        in_abstraction: bool,
    ) -> Vec<LegacyFlaw> {
        let mut flaws = Vec::new();
        let stop_at_first = !in_sequence || self.split_selector.sequence_pick == PickSequenceFlaw::FirstFlaw;

        let mut abstract_state = ctx.abstraction.initial_state();
        let mut flaw_search_state = if in_abstraction {
            abstract_state.cartesian().clone()
        } else {
            let facts: Vec<crate::task::Fact> = ctx
                .task
                .initial_state()
                .iter()
                .enumerate()
                .map(|(var, &value)| crate::task::Fact::new(var, value))
                .collect();
            CartesianState::from_facts(&self.domain_sizes, &facts)
        };
        debug_assert!(abstract_state.intersects(&flaw_search_state));
        trace!("forward walk from {flaw_search_state} in {abstract_state}");

        for step in solution {
            let op = Self::operator(ctx, step.op);
            let next_abstract_state = ctx.abstraction.state(step.target);
            if flaw_search_state.is_applicable(op) {
                let mut next_flaw_search_state = CartesianState::new(flaw_search_state.progress(op));
                self.disambiguate_flaw_state(ctx, &mut next_flaw_search_state);
                if !next_abstract_state.intersects(&next_flaw_search_state) {
                    trace!("paths deviate at {next_flaw_search_state} vs {next_abstract_state}");
                    flaws.push(LegacyFlaw::new(flaw_search_state.clone(), abstract_state.id(), false));
                    if stop_at_first {
                        return flaws;
                    }
                    next_flaw_search_state =
                        CartesianState::new(next_flaw_search_state.undeviate(next_abstract_state));
                    trace!("undeviated to {next_flaw_search_state}");
                }
                abstract_state = next_abstract_state;
                flaw_search_state = next_flaw_search_state;
            } else {
                trace!("operator {} not applicable in {flaw_search_state}", op.name);
                flaws.push(LegacyFlaw::new(flaw_search_state.clone(), abstract_state.id(), false));
                if stop_at_first {
                    return flaws;
                }
                // Apply the operator as if it were applicable and continue.
                abstract_state = next_abstract_state;
                let mut next = CartesianState::new(flaw_search_state.progress(op));
                self.disambiguate_flaw_state(ctx, &mut next);
                if !abstract_state.intersects(&next) {
                    next = CartesianState::new(next.undeviate(abstract_state));
                }
                flaw_search_state = next;
            }
        }

        debug_assert!(ctx.abstraction.goals().contains(&abstract_state.id()));
        if !in_abstraction && !flaw_search_state.includes_facts(ctx.task.goals()) {
            // Goal states may not be separated yet (bidirectional strategies);
            // this flaw needs the goal-fact split construction because goal
            // states have no optimal outgoing transitions.
            trace!("goal test failed for {flaw_search_state}");
            flaws.push(LegacyFlaw::new(flaw_search_state, abstract_state.id(), true));
        }
        flaws
    }

    /// Walks the trace backward from the goal by regression.
    pub(super) fn get_backward_flaws(
        &self,
        ctx: &FlawSearchCtx,
        solution: &Solution,
        in_sequence: bool,
        in_abstraction: bool,
    ) -> Vec<LegacyFlaw> {
        let mut flaws = Vec::new();
        let stop_at_first = !in_sequence
            || self.split_selector.sequence_pick == PickSequenceFlaw::FirstFlaw
            || self.split_selector.sequence_pick == PickSequenceFlaw::ClosestToGoalFlaw;

        let initial_abstract_state = ctx.abstraction.initial_state();
        let mut abstract_state = match solution.last() {
            Some(step) => ctx.abstraction.state(step.target),
            None => initial_abstract_state,
        };

        let mut flaw_search_state = if in_abstraction {
            abstract_state.cartesian().clone()
        } else {
            CartesianState::from_facts(&self.domain_sizes, ctx.task.goals())
        };
        if self.intersect_flaw_search_abstract_states {
            flaw_search_state = flaw_search_state.intersection(abstract_state);
        }
        trace!("backward walk from {flaw_search_state} in {abstract_state}");

        for (i, step) in solution.iter().enumerate().rev() {
            let op = Self::operator(ctx, step.op);
            let next_abstract_state = if i > 0 {
                ctx.abstraction.state(solution[i - 1].target)
            } else {
                initial_abstract_state
            };
            if flaw_search_state.is_backward_applicable(op) {
                let mut next_flaw_search_state = CartesianState::new(flaw_search_state.regress(op));
                self.disambiguate_flaw_state(ctx, &mut next_flaw_search_state);
                trace!("regress over {} to {next_flaw_search_state}", op.name);
                if !next_abstract_state.intersects(&next_flaw_search_state) {
                    trace!("paths deviate at {next_flaw_search_state} vs {next_abstract_state}");
                    flaws.push(LegacyFlaw::new(flaw_search_state.clone(), abstract_state.id(), false));
                    if stop_at_first {
                        return flaws;
                    }
                    next_flaw_search_state =
                        CartesianState::new(next_flaw_search_state.undeviate(next_abstract_state));
                }
                abstract_state = next_abstract_state;
                flaw_search_state = next_flaw_search_state;
                if self.intersect_flaw_search_abstract_states {
                    flaw_search_state = flaw_search_state.intersection(abstract_state);
                    trace!("intersected flaw-search state: {flaw_search_state}");
                }
            } else {
                trace!("operator {} not backward applicable in {flaw_search_state}", op.name);
                flaws.push(LegacyFlaw::new(flaw_search_state.clone(), abstract_state.id(), false));
                if stop_at_first {
                    return flaws;
                }
                abstract_state = next_abstract_state;
                let mut next = CartesianState::new(flaws.last().expect("just pushed").flaw_search_state.regress(op));
                self.disambiguate_flaw_state(ctx, &mut next);
                if !abstract_state.intersects(&next) {
                    next = CartesianState::new(next.undeviate(abstract_state));
                }
                flaw_search_state = next;
            }
        }

        debug_assert_eq!(initial_abstract_state.id(), abstract_state.id());
        if !in_abstraction && !flaw_search_state.includes_values(ctx.task.initial_state()) {
            // Only happens while the abstract initial state is unrefined.
            trace!("initial state test failed for {flaw_search_state}");
            flaws.push(LegacyFlaw::new(flaw_search_state, abstract_state.id(), true));
        }
        flaws
    }

    // ---- split construction from Cartesian flaw-search states ----

    /// Applicability and deviation splits for the forward direction.
    fn create_split_cartesian(
        &mut self,
        ctx: &mut FlawSearchCtx,
        states: &[CartesianState],
        abstract_state_id: StateId,
        solution_cost: Cost,
        split_unwanted_values: bool,
    ) -> Option<Split> {
        let compute_started = Instant::now();
        debug!(
            "create split for abstract state {abstract_state_id} and {} flaw-search states",
            states.len()
        );

        let mut splits = self.new_split_collection(split_unwanted_values);
        let num_vars = self.domain_sizes.len();
        for (op_id, targets) in f_optimal_transitions(ctx.abstraction, ctx.shortest_paths, abstract_state_id) {
            let abstract_state = ctx.abstraction.state(abstract_state_id);
            let op_d = ctx.abstraction.transition_system().operator(op_id);
            let pre = op_d.precondition().cartesian_set();
            let op_cost = op_d.cost();

            let mut applicable = vec![true; states.len()];
            for var in 0..num_vars {
                if pre.all_values_set(var) {
                    continue;
                }
                let mut state_value_count = vec![0usize; self.domain_sizes[var]];
                for (i, state) in states.iter().enumerate() {
                    if !state.cartesian_set().intersects_on(pre, var) {
                        // Applicability flaw on this variable.
                        applicable[i] = false;
                        for value in state.cartesian_set().values(var) {
                            if abstract_state.contains(var, value) {
                                state_value_count[value] += 1;
                            }
                        }
                    }
                }
                let wanted: Vec<usize> = pre.values(var).filter(|&v| abstract_state.contains(var, v)).collect();
                for (value, &count) in state_value_count.iter().enumerate() {
                    if count > 0 && !pre.test(var, value) {
                        if split_unwanted_values {
                            for &want in &wanted {
                                Self::push_split(
                                    &mut splits,
                                    Split::new(abstract_state_id, var, want, vec![value], count, Some(op_cost)),
                                    true,
                                );
                            }
                        } else {
                            Self::push_split(
                                &mut splits,
                                Split::new(abstract_state_id, var, value, wanted.clone(), count, Some(op_cost)),
                                false,
                            );
                        }
                    }
                }
            }

            let op = Self::operator(ctx, op_id);
            let mut deviation_states_by_target: hashbrown::HashMap<StateId, Vec<usize>> = hashbrown::HashMap::new();
            for (i, state) in states.iter().enumerate() {
                if !applicable[i] {
                    continue;
                }
                let succ = CartesianState::new(state.progress(op));
                let mut target_hit = false;
                for &target in &targets {
                    if !ctx.memory.is_reserved() {
                        return None;
                    }
                    // At most one f-optimal target can intersect the successor.
                    if !target_hit && ctx.abstraction.state(target).intersects(&succ) {
                        target_hit = true;
                    } else {
                        deviation_states_by_target.entry(target).or_default().push(i);
                    }
                }
            }
            for (target, deviating) in deviation_states_by_target {
                self.push_deviation_splits(
                    ctx,
                    states,
                    &deviating,
                    abstract_state_id,
                    target,
                    op_id,
                    Some(op_cost),
                    split_unwanted_values,
                    &mut splits,
                );
            }
        }

        self.compute_splits_time += compute_started.elapsed();
        self.pick_among(ctx, abstract_state_id, splits, solution_cost)
    }

    /// Deviation splits over the variables the operator leaves untouched:
    /// wanted values are those shared by the current state and the missed
    /// abstract state (the target in progression, the source in regression).
    #[allow(clippy::too_many_arguments)]
    fn push_deviation_splits(
        &self,
        ctx: &FlawSearchCtx,
        states: &[CartesianState],
        deviating: &[usize],
        abstract_state_id: StateId,
        other_id: StateId,
        op_id: crate::OpId,
        op_cost: Option<u32>,
        split_unwanted_values: bool,
        splits: &mut Vec<Vec<Split>>,
    ) {
        let abstract_state = ctx.abstraction.state(abstract_state_id);
        let other = ctx.abstraction.state(other_id);
        let op_d = ctx.abstraction.transition_system().operator(op_id);
        let unaffected = (0..self.domain_sizes.len())
            .filter(|&var| !op_d.has_effect(var) && op_d.precondition().count(var) != 1)
            .collect::<Vec<usize>>();

        let mut fact_count: Vec<Vec<usize>> = self.domain_sizes.iter().map(|&size| vec![0; size]).collect();
        let mut var_flagged = vec![false; self.domain_sizes.len()];
        for &i in deviating {
            let state = &states[i];
            for &var in &unaffected {
                if !other.intersects_on(state, var) {
                    for value in state.cartesian_set().values(var) {
                        if abstract_state.contains(var, value) {
                            fact_count[var][value] += 1;
                            var_flagged[var] = true;
                        }
                    }
                }
            }
        }
        for (var, flagged) in var_flagged.iter().enumerate() {
            if !flagged {
                continue;
            }
            let wanted: Vec<usize> = (0..self.domain_sizes[var])
                .filter(|&value| abstract_state.contains(var, value) && other.contains(var, value))
                .collect();
            for (value, &count) in fact_count[var].iter().enumerate() {
                if count > 0 && !other.contains(var, value) {
                    debug_assert!(!wanted.is_empty());
                    if split_unwanted_values {
                        for &want in &wanted {
                            Self::push_split(
                                splits,
                                Split::new(abstract_state_id, var, want, vec![value], count, op_cost),
                                true,
                            );
                        }
                    } else {
                        Self::push_split(
                            splits,
                            Split::new(abstract_state_id, var, value, wanted.clone(), count, op_cost),
                            false,
                        );
                    }
                }
            }
        }
    }

    /// Splits separating goal facts from the rest of a goal abstract state,
    /// for flaws at the end of a forward walk.
    fn create_split_from_goal_state(
        &mut self,
        ctx: &mut FlawSearchCtx,
        states: &[CartesianState],
        abstract_state_id: StateId,
        solution_cost: Cost,
        split_unwanted_values: bool,
    ) -> Option<Split> {
        let compute_started = Instant::now();
        let goals = ctx.task.goals().to_vec();
        let mut splits = self.new_split_collection(false);
        {
            let abstract_state = ctx.abstraction.state(abstract_state_id);
            for goal in &goals {
                let var = goal.var;
                if abstract_state.count(var) <= 1 {
                    continue;
                }
                if split_unwanted_values {
                    for state in states {
                        for value in state.cartesian_set().values(var) {
                            if value != goal.value && abstract_state.contains(var, value) {
                                Self::push_split(
                                    &mut splits,
                                    Split::new(abstract_state_id, var, goal.value, vec![value], 1, None),
                                    true,
                                );
                            }
                        }
                    }
                } else {
                    let other_values: Vec<usize> = (0..self.domain_sizes[var])
                        .filter(|&value| value != goal.value && abstract_state.contains(var, value))
                        .collect();
                    if !other_values.is_empty() {
                        Self::push_split(
                            &mut splits,
                            Split::new(abstract_state_id, var, goal.value, other_values, 1, None),
                            false,
                        );
                    }
                }
            }
        }
        self.compute_splits_time += compute_started.elapsed();
        self.pick_among(ctx, abstract_state_id, splits, solution_cost)
    }

    /// Applicability and deviation splits for the backward direction, against
    /// the f-optimal incoming transitions.
    fn create_backward_split(
        &mut self,
        ctx: &mut FlawSearchCtx,
        states: &[CartesianState],
        abstract_state_id: StateId,
        solution_cost: Cost,
        split_unwanted_values: bool,
    ) -> Option<Split> {
        let compute_started = Instant::now();
        debug!(
            "create backward split for abstract state {abstract_state_id} and {} flaw-search states",
            states.len()
        );

        let mut splits = self.new_split_collection(split_unwanted_values);
        let num_vars = self.domain_sizes.len();
        for (op_id, sources) in
            f_optimal_backward_transitions(ctx.abstraction, ctx.shortest_paths, abstract_state_id)
        {
            let abstract_state = ctx.abstraction.state(abstract_state_id);
            let op = Self::operator(ctx, op_id);
            let op_cost = op.cost;

            // The value each variable must hold after the operator: effect
            // values first, prevail conditions otherwise.
            let mut post_values: Vec<Option<usize>> = vec![None; num_vars];
            for &eff in op.eff() {
                post_values[eff.var] = Some(eff.value);
            }
            for &pre in op.pre() {
                if post_values[pre.var].is_none() {
                    post_values[pre.var] = Some(pre.value);
                }
            }

            let mut applicable = vec![true; states.len()];
            let mut state_value_count: Vec<Vec<usize>> =
                self.domain_sizes.iter().map(|&size| vec![0; size]).collect();
            for (i, state) in states.iter().enumerate() {
                for var in state.vars_not_backward_applicable(op) {
                    // Applicability flaw.
                    applicable[i] = false;
                    for value in state.cartesian_set().values(var) {
                        if abstract_state.contains(var, value) {
                            state_value_count[var][value] += 1;
                        }
                    }
                }
            }
            for var in 0..num_vars {
                for (value, &count) in state_value_count[var].iter().enumerate() {
                    if count == 0 {
                        continue;
                    }
                    let post_value = post_values[var].expect("backward-inapplicable variables carry a postcondition");
                    debug_assert_ne!(value, post_value);
                    if split_unwanted_values {
                        Self::push_split(
                            &mut splits,
                            Split::new(abstract_state_id, var, post_value, vec![value], count, Some(op_cost)),
                            true,
                        );
                    } else {
                        Self::push_split(
                            &mut splits,
                            Split::new(abstract_state_id, var, value, vec![post_value], count, Some(op_cost)),
                            false,
                        );
                    }
                }
            }

            let mut deviation_states_by_source: hashbrown::HashMap<StateId, Vec<usize>> = hashbrown::HashMap::new();
            for (i, state) in states.iter().enumerate() {
                if !applicable[i] {
                    continue;
                }
                let pred = CartesianState::new(state.regress(op));
                let mut source_hit = false;
                for &source in &sources {
                    if !ctx.memory.is_reserved() {
                        return None;
                    }
                    if !source_hit && ctx.abstraction.state(source).intersects(&pred) {
                        source_hit = true;
                    } else {
                        deviation_states_by_source.entry(source).or_default().push(i);
                    }
                }
            }
            for (source, deviating) in deviation_states_by_source {
                self.push_deviation_splits(
                    ctx,
                    states,
                    &deviating,
                    abstract_state_id,
                    source,
                    op_id,
                    Some(op_cost),
                    split_unwanted_values,
                    &mut splits,
                );
            }
        }

        self.compute_splits_time += compute_started.elapsed();
        self.pick_among(ctx, abstract_state_id, splits, solution_cost)
    }

    /// Splits separating the initial-state facts off the abstract initial
    /// state, for flaws at the end of a backward walk.
    fn create_backward_split_from_init_state(
        &mut self,
        ctx: &mut FlawSearchCtx,
        states: &[CartesianState],
        abstract_state_id: StateId,
        solution_cost: Cost,
        split_unwanted_values: bool,
    ) -> Option<Split> {
        let compute_started = Instant::now();
        let initial_state = ctx.task.initial_state().to_vec();
        let mut splits = self.new_split_collection(false);
        {
            let abstract_state = ctx.abstraction.state(abstract_state_id);
            for (var, &init_value) in initial_state.iter().enumerate() {
                if abstract_state.count(var) <= 1 {
                    continue;
                }
                if split_unwanted_values {
                    for state in states {
                        for value in state.cartesian_set().values(var) {
                            if value != init_value && abstract_state.contains(var, value) {
                                Self::push_split(
                                    &mut splits,
                                    Split::new(abstract_state_id, var, init_value, vec![value], 1, None),
                                    true,
                                );
                            }
                        }
                    }
                } else {
                    let other_values: Vec<usize> = (0..self.domain_sizes[var])
                        .filter(|&value| value != init_value && abstract_state.contains(var, value))
                        .collect();
                    if !other_values.is_empty() {
                        Self::push_split(
                            &mut splits,
                            Split::new(abstract_state_id, var, init_value, other_values, 1, None),
                            false,
                        );
                    }
                }
            }
        }
        self.compute_splits_time += compute_started.elapsed();
        self.pick_among(ctx, abstract_state_id, splits, solution_cost)
    }

    fn create_split_from_flaw(
        &mut self,
        ctx: &mut FlawSearchCtx,
        flaw: &LegacyFlaw,
        solution_cost: Cost,
        backward: bool,
        split_unwanted_values: bool,
    ) -> Option<Split> {
        let states = std::slice::from_ref(&flaw.flaw_search_state);
        if backward {
            if flaw.split_last_state {
                self.create_backward_split_from_init_state(
                    ctx,
                    states,
                    flaw.abstract_state_id,
                    solution_cost,
                    split_unwanted_values,
                )
            } else {
                self.create_backward_split(ctx, states, flaw.abstract_state_id, solution_cost, split_unwanted_values)
            }
        } else if flaw.split_last_state {
            self.create_split_from_goal_state(ctx, states, flaw.abstract_state_id, solution_cost, split_unwanted_values)
        } else {
            self.create_split_cartesian(ctx, states, flaw.abstract_state_id, solution_cost, split_unwanted_values)
        }
    }

    /// Cached split lookup. A cached entry is only valid while the f-optimal
    /// transitions it was computed from are unchanged.
    fn split_from_flaw(
        &mut self,
        ctx: &mut FlawSearchCtx,
        flaw: &LegacyFlaw,
        solution_cost: Cost,
        backward: bool,
        split_unwanted_values: bool,
    ) -> Option<Split> {
        let abs_id = flaw.abstract_state_id;
        let current_transitions: OptimalTransitions = if backward {
            f_optimal_backward_transitions(ctx.abstraction, ctx.shortest_paths, abs_id)
        } else {
            f_optimal_transitions(ctx.abstraction, ctx.shortest_paths, abs_id)
        };
        let fingerprint_key = (abs_id, backward);
        let cache_key = (abs_id, backward, split_unwanted_values);

        let fingerprint_valid = self.opt_tr_cache.get(&fingerprint_key) == Some(&current_transitions);
        if fingerprint_valid {
            if let Some(split) = self.splits_cache.get(&cache_key).and_then(|cached| cached.get(flaw)) {
                return split.clone();
            }
        } else {
            self.splits_cache.retain(|&(state, bw, _), _| !(state == abs_id && bw == backward));
            self.opt_tr_cache.insert(fingerprint_key, current_transitions);
        }

        let split = self.create_split_from_flaw(ctx, flaw, solution_cost, backward, split_unwanted_values);
        self.splits_cache
            .entry(cache_key)
            .or_default()
            .insert(flaw.clone(), split.clone());
        split
    }

    /// Drops all cached splits of a refined state; its ID gets reused by one
    /// of the children, which has different transitions and sets.
    pub fn notify_refined(&mut self, state_id: StateId) {
        self.splits_cache.retain(|&(state, _, _), _| state != state_id);
        self.opt_tr_cache.retain(|&(state, _), _| state != state_id);
    }

    // ---- first-flaw ("legacy") strategies ----

    pub(super) fn get_split_legacy(
        &mut self,
        ctx: &mut FlawSearchCtx,
        solution: &Solution,
        solution_cost: Cost,
    ) -> SplitProperties {
        let backward = self.backward_direction;
        let unwanted = self.split_unwanted_values;
        let flaw = if backward {
            self.get_backward_flaws(ctx, solution, false, false).into_iter().next()
        } else {
            self.get_forward_flaws(ctx, solution, false, false).into_iter().next()
        };
        match flaw {
            None => SplitProperties::none(),
            Some(flaw) => {
                let abs_id = flaw.abstract_state_id;
                let split = self.split_from_flaw(ctx, &flaw, solution_cost, backward, unwanted);
                let position = Self::plan_position(ctx.abstraction, abs_id, solution);
                let (fw, bw) = if backward { (0, 1) } else { (1, 0) };
                SplitProperties::new(split, position, backward, fw, bw)
            }
        }
    }

    pub(super) fn get_split_legacy_closest_to_goal(
        &mut self,
        ctx: &mut FlawSearchCtx,
        solution: &Solution,
        solution_cost: Cost,
    ) -> SplitProperties {
        let unwanted = self.split_unwanted_values;
        let forward_flaw = self.get_forward_flaws(ctx, solution, false, false).into_iter().next();
        let backward_flaw = self.get_backward_flaws(ctx, solution, false, false).into_iter().next();
        let n_forward = usize::from(forward_flaw.is_some());
        let n_backward = usize::from(backward_flaw.is_some());

        let backward_chosen = match (&forward_flaw, &backward_flaw) {
            (None, None) => return SplitProperties::none(),
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (Some(fw), Some(bw)) => {
                // Prefer the flaw closer to the goal.
                ctx.shortest_paths.goal_distance_64(bw.abstract_state_id)
                    <= ctx.shortest_paths.goal_distance_64(fw.abstract_state_id)
            }
        };
        let flaw = if backward_chosen {
            backward_flaw.expect("chosen direction has a flaw")
        } else {
            forward_flaw.expect("chosen direction has a flaw")
        };
        let abs_id = flaw.abstract_state_id;
        let split = self.split_from_flaw(ctx, &flaw, solution_cost, backward_chosen, unwanted);
        SplitProperties::new(
            split,
            Self::plan_position(ctx.abstraction, abs_id, solution),
            backward_chosen,
            n_forward,
            n_backward,
        )
    }

    // ---- sequence strategies ----

    pub(super) fn get_sequence_splits(
        &mut self,
        ctx: &mut FlawSearchCtx,
        solution: &Solution,
        solution_cost: Cost,
    ) -> SplitProperties {
        let in_abstraction = self.pick_flawed_abstract_state.in_abstraction();
        if self.pick_flawed_abstract_state.in_batch() {
            return self.get_batch_sequence_split(ctx, solution, solution_cost, in_abstraction);
        }

        let forward_flaws = if self.forward_direction {
            let mut flaws = self.get_forward_flaws(ctx, solution, true, in_abstraction);
            if in_abstraction && flaws.is_empty() {
                flaws = self.get_forward_flaws(ctx, solution, true, false);
            }
            flaws
        } else {
            Vec::new()
        };
        let backward_flaws = if self.backward_direction {
            let mut flaws = self.get_backward_flaws(ctx, solution, true, in_abstraction);
            if in_abstraction && flaws.is_empty() {
                flaws = self.get_backward_flaws(ctx, solution, true, false);
            }
            flaws
        } else {
            Vec::new()
        };

        self.select_from_sequence_flaws(ctx, forward_flaws, backward_flaws, solution, solution_cost)
    }

    /// Batch mode: one walk fills the queue; subsequent iterations refine one
    /// queued flaw each until the queue runs dry.
    fn get_batch_sequence_split(
        &mut self,
        ctx: &mut FlawSearchCtx,
        solution: &Solution,
        solution_cost: Cost,
        in_abstraction: bool,
    ) -> SplitProperties {
        let backward = self.backward_direction;
        let mut refilled = false;
        loop {
            match self.sequence_flaws_queue.pop_front() {
                Some((flaw, flaw_backward)) => {
                    // A queued flaw may be stale after intervening refinements.
                    if !ctx
                        .abstraction
                        .state(flaw.abstract_state_id)
                        .intersects(&flaw.flaw_search_state)
                    {
                        continue;
                    }
                    let abs_id = flaw.abstract_state_id;
                    if let Some(split) =
                        self.split_from_flaw(ctx, &flaw, solution_cost, flaw_backward, flaw_backward)
                    {
                        self.notify_refined(abs_id);
                        let position = Self::plan_position(ctx.abstraction, abs_id, solution);
                        let (fw, bw) = if flaw_backward { (0, 1) } else { (1, 0) };
                        return SplitProperties::new(Some(split), position, flaw_backward, fw, bw);
                    }
                }
                None if !refilled => {
                    refilled = true;
                    let mut flaws = if backward {
                        self.get_backward_flaws(ctx, solution, true, in_abstraction)
                    } else {
                        self.get_forward_flaws(ctx, solution, true, in_abstraction)
                    };
                    if in_abstraction && flaws.is_empty() {
                        flaws = if backward {
                            self.get_backward_flaws(ctx, solution, true, false)
                        } else {
                            self.get_forward_flaws(ctx, solution, true, false)
                        };
                    }
                    self.sequence_flaws_queue.extend(flaws.into_iter().map(|f| (f, backward)));
                }
                None => return SplitProperties::none(),
            }
        }
    }

    fn rate_one(
        &self,
        ctx: &mut FlawSearchCtx,
        split: &Split,
        kind: crate::split_selector::PickSplit,
        solution_cost: Cost,
    ) -> f64 {
        let mut selection = ctx.selection();
        let state = selection.abstraction.state(split.abstract_state_id);
        self.split_selector.rate_split(&mut selection, state, split, kind, solution_cost)
    }

    fn select_flaw_and_pick_split(
        &mut self,
        ctx: &mut FlawSearchCtx,
        mut flaws: Vec<LegacyFlaw>,
        backward: bool,
        solution_cost: Cost,
    ) -> Option<Split> {
        debug_assert!(!flaws.is_empty());
        // Sequence walks split wanted values forward, unwanted backward.
        let unwanted = backward;
        if flaws.len() == 1 {
            return self.split_from_flaw(ctx, &flaws.remove(0), solution_cost, backward, unwanted);
        }
        use PickSequenceFlaw::*;
        match self.split_selector.sequence_pick {
            Random => {
                let index = rand::Rng::random_range(&mut self.rng, 0..flaws.len());
                self.split_from_flaw(ctx, &flaws.swap_remove(index), solution_cost, backward, unwanted)
            }
            FirstFlaw => self.split_from_flaw(ctx, &flaws.remove(0), solution_cost, backward, unwanted),
            LastFlaw => self.split_from_flaw(ctx, &flaws.pop().expect("non-empty"), solution_cost, backward, unwanted),
            ClosestToGoalFlaw => {
                let flaw = if backward { flaws.remove(0) } else { flaws.pop().expect("non-empty") };
                self.split_from_flaw(ctx, &flaw, solution_cost, backward, unwanted)
            }
            pick => {
                let rating_kind = pick.rating_kind().expect("positional picks handled above");
                let tiebreak_kind = self.split_selector.sequence_tiebreak_pick.rating_kind();
                let mut selected: Option<Split> = None;
                let mut max_rating = f64::NEG_INFINITY;
                let mut max_tiebreak_rating = f64::NEG_INFINITY;
                for flaw in &flaws {
                    let Some(split) = self.split_from_flaw(ctx, flaw, solution_cost, backward, unwanted) else {
                        continue;
                    };
                    let rating = self.rate_one(ctx, &split, rating_kind, solution_cost);
                    if selected.is_none() || rating > max_rating {
                        max_rating = rating;
                        max_tiebreak_rating = match tiebreak_kind {
                            Some(kind) => self.rate_one(ctx, &split, kind, solution_cost),
                            None => 0.0,
                        };
                        selected = Some(split);
                    } else if max_rating - rating < EPSILON {
                        let tiebreak_rating = match tiebreak_kind {
                            Some(kind) => self.rate_one(ctx, &split, kind, solution_cost),
                            None => 0.0,
                        };
                        if tiebreak_rating > max_tiebreak_rating {
                            max_rating = rating;
                            max_tiebreak_rating = tiebreak_rating;
                            selected = Some(split);
                        }
                    }
                }
                selected
            }
        }
    }

    fn select_from_sequence_flaws(
        &mut self,
        ctx: &mut FlawSearchCtx,
        forward_flaws: Vec<LegacyFlaw>,
        backward_flaws: Vec<LegacyFlaw>,
        solution: &Solution,
        solution_cost: Cost,
    ) -> SplitProperties {
        let n_forward = forward_flaws.len();
        let n_backward = backward_flaws.len();
        if n_forward == 0 && n_backward == 0 {
            return SplitProperties::none();
        }
        let best_fw = if n_forward == 0 {
            None
        } else {
            self.select_flaw_and_pick_split(ctx, forward_flaws, false, solution_cost)
        };
        let best_bw = if n_backward == 0 {
            None
        } else {
            self.select_flaw_and_pick_split(ctx, backward_flaws, true, solution_cost)
        };

        let (best_fw, best_bw) = match (best_fw, best_bw) {
            (None, None) => return SplitProperties::none(),
            (None, Some(bw)) => {
                return self.best_sequence_split(ctx, bw, true, n_forward, n_backward, solution);
            }
            (Some(fw), None) => {
                return self.best_sequence_split(ctx, fw, false, n_forward, n_backward, solution);
            }
            (Some(fw), Some(bw)) => (fw, bw),
        };

        use PickSequenceFlaw::*;
        match self.split_selector.sequence_pick {
            Random => {
                if rand::Rng::random_range(&mut self.rng, 0..2) == 0 {
                    self.best_sequence_split(ctx, best_fw, false, n_forward, n_backward, solution)
                } else {
                    self.best_sequence_split(ctx, best_bw, true, n_forward, n_backward, solution)
                }
            }
            FirstFlaw | LastFlaw => {
                self.sequence_splits_tiebreak(ctx, best_fw, best_bw, n_forward, n_backward, solution, solution_cost)
            }
            ClosestToGoalFlaw => {
                let fw_dist = ctx.shortest_paths.goal_distance_64(best_fw.abstract_state_id);
                let bw_dist = ctx.shortest_paths.goal_distance_64(best_bw.abstract_state_id);
                match fw_dist.cmp(&bw_dist) {
                    std::cmp::Ordering::Greater => {
                        self.best_sequence_split(ctx, best_bw, true, n_forward, n_backward, solution)
                    }
                    std::cmp::Ordering::Less => {
                        self.best_sequence_split(ctx, best_fw, false, n_forward, n_backward, solution)
                    }
                    std::cmp::Ordering::Equal => self.sequence_splits_tiebreak(
                        ctx,
                        best_fw,
                        best_bw,
                        n_forward,
                        n_backward,
                        solution,
                        solution_cost,
                    ),
                }
            }
            pick => {
                let kind = pick.rating_kind().expect("positional picks handled above");
                let diff = self.rate_one(ctx, &best_fw, kind, solution_cost)
                    - self.rate_one(ctx, &best_bw, kind, solution_cost);
                if diff.abs() < EPSILON {
                    self.sequence_splits_tiebreak(ctx, best_fw, best_bw, n_forward, n_backward, solution, solution_cost)
                } else if diff > 0.0 {
                    self.best_sequence_split(ctx, best_fw, false, n_forward, n_backward, solution)
                } else {
                    self.best_sequence_split(ctx, best_bw, true, n_forward, n_backward, solution)
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn sequence_splits_tiebreak(
        &mut self,
        ctx: &mut FlawSearchCtx,
        best_fw: Split,
        best_bw: Split,
        n_forward: usize,
        n_backward: usize,
        solution: &Solution,
        solution_cost: Cost,
    ) -> SplitProperties {
        let diff = match self.split_selector.sequence_tiebreak_pick.rating_kind() {
            // Positional tie-breakers cannot compare across directions.
            None => 0.0,
            Some(kind) => {
                self.rate_one(ctx, &best_fw, kind, solution_cost) - self.rate_one(ctx, &best_bw, kind, solution_cost)
            }
        };
        if diff > EPSILON {
            self.best_sequence_split(ctx, best_fw, false, n_forward, n_backward, solution)
        } else {
            // Ties prefer the backward flaw.
            self.best_sequence_split(ctx, best_bw, true, n_forward, n_backward, solution)
        }
    }

    fn best_sequence_split(
        &mut self,
        ctx: &mut FlawSearchCtx,
        split: Split,
        backward: bool,
        n_forward: usize,
        n_backward: usize,
        solution: &Solution,
    ) -> SplitProperties {
        self.notify_refined(split.abstract_state_id);
        let position = Self::plan_position(ctx.abstraction, split.abstract_state_id, solution);
        SplitProperties::new(Some(split), position, backward, n_forward, n_backward)
    }
}
