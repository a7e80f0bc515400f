//! Cartesian sets with operator semantics: applicability, progression,
//! regression and undeviation.

use crate::cartesian_set::CartesianSet;
use crate::disambiguation::DisambiguatedOperator;
use crate::task::{Fact, Operator};

/// A Cartesian set seen as a set of concrete states that operators act on.
///
/// Operations come in two flavors. The plain-[`Operator`] flavor treats every
/// precondition as a pinned single value; it drives the trace-simulation flaw
/// walks. The [`DisambiguatedOperator`] flavor works on the (possibly
/// multi-valued) disambiguated precondition sets and drives the transition
/// system.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CartesianState {
    cartesian_set: CartesianSet,
}

impl CartesianState {
    pub fn new(cartesian_set: CartesianSet) -> CartesianState {
        CartesianState { cartesian_set }
    }

    pub fn full(domain_sizes: &[usize]) -> CartesianState {
        CartesianState::new(CartesianSet::full(domain_sizes))
    }

    pub fn from_facts(domain_sizes: &[usize], facts: &[Fact]) -> CartesianState {
        CartesianState::new(CartesianSet::from_facts(domain_sizes, facts))
    }

    pub fn cartesian_set(&self) -> &CartesianSet {
        &self.cartesian_set
    }

    pub fn set_cartesian_set(&mut self, set: CartesianSet) {
        self.cartesian_set = set;
    }

    pub fn count(&self, var: usize) -> usize {
        self.cartesian_set.count(var)
    }

    pub fn is_fully_abstracted(&self, var: usize) -> bool {
        self.cartesian_set.all_values_set(var)
    }

    pub fn is_spurious(&self) -> bool {
        self.cartesian_set.is_empty()
    }

    pub fn contains(&self, var: usize, value: usize) -> bool {
        self.cartesian_set.test(var, value)
    }

    pub fn includes_fact(&self, fact: Fact) -> bool {
        self.cartesian_set.test(fact.var, fact.value)
    }

    pub fn includes_facts(&self, facts: &[Fact]) -> bool {
        facts.iter().all(|&f| self.includes_fact(f))
    }

    /// Whether the concrete state given by one value per variable is inside.
    pub fn includes_values(&self, values: &[usize]) -> bool {
        values.iter().enumerate().all(|(var, &value)| self.cartesian_set.test(var, value))
    }

    pub fn includes(&self, other: &CartesianState) -> bool {
        self.cartesian_set.is_superset_of(&other.cartesian_set)
    }

    pub fn intersects(&self, other: &CartesianState) -> bool {
        self.cartesian_set.intersects(&other.cartesian_set)
    }

    pub fn intersects_on(&self, other: &CartesianState, var: usize) -> bool {
        self.cartesian_set.intersects_on(&other.cartesian_set, var)
    }

    pub fn intersection(&self, other: &CartesianState) -> CartesianState {
        CartesianState::new(self.cartesian_set.intersection(&other.cartesian_set))
    }

    // ---- plain operator semantics ----

    pub fn is_applicable(&self, op: &Operator) -> bool {
        op.pre().iter().all(|&p| self.includes_fact(p))
    }

    /// Backward applicability: all effects are inside, and so is every prevail
    /// condition (a precondition on a variable without an effect).
    pub fn is_backward_applicable(&self, op: &Operator) -> bool {
        self.vars_not_backward_applicable(op).is_empty()
    }

    pub fn vars_not_backward_applicable(&self, op: &Operator) -> Vec<usize> {
        let mut not_applicable = Vec::new();
        for &eff in op.eff() {
            if !self.includes_fact(eff) {
                not_applicable.push(eff.var);
            }
        }
        for &pre in op.pre() {
            if op.eff().iter().all(|e| e.var != pre.var) && !self.includes_fact(pre) {
                not_applicable.push(pre.var);
            }
        }
        not_applicable
    }

    /// The abstract successor under `op`. Preconditions are force-set even if
    /// the operator is inapplicable here, so the result is always defined.
    pub fn progress(&self, op: &Operator) -> CartesianSet {
        let mut progression = self.cartesian_set.clone();
        for &pre in op.pre() {
            progression.set_single_value(pre.var, pre.value);
        }
        for &eff in op.eff() {
            progression.set_single_value(eff.var, eff.value);
        }
        progression
    }

    /// The abstract predecessors under `op`: effect variables widen to their
    /// full domain, precondition variables pin to the precondition value.
    pub fn regress(&self, op: &Operator) -> CartesianSet {
        let mut regression = self.cartesian_set.clone();
        for &eff in op.eff() {
            regression.add_all(eff.var);
        }
        for &pre in op.pre() {
            regression.set_single_value(pre.var, pre.value);
        }
        regression
    }

    /// On every variable where the two sets are disjoint, replaces this set's
    /// subset by `mapped`'s. Lets a trace walk continue past a deviation.
    pub fn undeviate(&self, mapped: &CartesianState) -> CartesianSet {
        let mut undeviated = self.cartesian_set.clone();
        for var in 0..undeviated.num_vars() {
            if !self.intersects_on(mapped, var) {
                undeviated.remove_all(var);
                for value in mapped.cartesian_set.values(var) {
                    undeviated.add(var, value);
                }
            }
        }
        undeviated
    }

    // ---- disambiguated operator semantics ----

    /// Set-based applicability: the disambiguated precondition intersects this
    /// state on every variable.
    pub fn admits(&self, op: &DisambiguatedOperator) -> bool {
        self.intersects(op.precondition())
    }

    /// Applicability restricted to the given variables (the only ones whose
    /// subsets changed since the last full check).
    pub fn admits_on(&self, op: &DisambiguatedOperator, vars: &[usize]) -> bool {
        vars.iter().all(|&var| self.intersects_on(op.precondition(), var))
    }

    /// Whether applying `op` somewhere in this state can land inside `other`,
    /// checked on the given variables only. On effect variables the effect
    /// value must be in `other`; elsewhere a value shared by this state, the
    /// precondition and `other` must exist.
    pub fn reach_with_op(&self, other: &CartesianState, op: &DisambiguatedOperator, vars: &[usize]) -> bool {
        let pre = op.precondition().cartesian_set();
        vars.iter().all(|&var| match op.effect_on(var) {
            Some(value) => other.contains(var, value),
            None => self.cartesian_set.intersects_intersection(pre, &other.cartesian_set, var),
        })
    }

    /// Separates the `wanted` values of `var` from the rest of its subset.
    /// Returns the complement set first, the wanted set second.
    pub fn split_domain(&self, var: usize, wanted: &[usize]) -> (CartesianSet, CartesianSet) {
        debug_assert!(!wanted.is_empty());
        debug_assert!(self.count(var) > wanted.len());

        let mut v1_set = self.cartesian_set.clone();
        let mut v2_set = self.cartesian_set.clone();
        v2_set.remove_all(var);
        for &value in wanted {
            debug_assert!(self.cartesian_set.test(var, value));
            v1_set.remove(var, value);
            v2_set.add(var, value);
        }
        debug_assert_eq!(v1_set.count(var), self.count(var) - wanted.len());
        debug_assert_eq!(v2_set.count(var), wanted.len());
        (v1_set, v2_set)
    }
}

impl std::fmt::Display for CartesianState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cartesian_set)
    }
}

impl std::fmt::Debug for CartesianState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cartesian_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(pre: &[(usize, usize)], eff: &[(usize, usize)]) -> Operator {
        Operator {
            name: "op".to_string(),
            preconditions: pre.iter().map(|&(v, x)| Fact::new(v, x)).collect(),
            effects: eff.iter().map(|&(v, x)| Fact::new(v, x)).collect(),
            cost: 1,
        }
    }

    #[test]
    fn progress_of_inapplicable_operator_is_defined() {
        let sizes = [3, 2];
        let state = CartesianState::from_facts(&sizes, &[Fact::new(0, 0)]);
        let o = op(&[(0, 1)], &[(1, 1)]);
        assert!(!state.is_applicable(&o));
        let progressed = state.progress(&o);
        assert_eq!(progressed.get_values(0), vec![1]);
        assert_eq!(progressed.get_values(1), vec![1]);
    }

    #[test]
    fn regress_after_progress_includes_original() {
        let sizes = [3, 2];
        let state = CartesianState::from_facts(&sizes, &[Fact::new(0, 1), Fact::new(1, 0)]);
        let o = op(&[(0, 1)], &[(1, 1)]);
        assert!(state.is_applicable(&o));
        let succ = CartesianState::new(state.progress(&o));
        let regressed = CartesianState::new(succ.regress(&o));
        assert!(regressed.includes(&state));
    }

    #[test]
    fn backward_applicability_checks_prevails() {
        let sizes = [2, 2];
        // Operator with prevail 0=1 and effect 1=1.
        let o = op(&[(0, 1), (1, 0)], &[(1, 1)]);
        let target = CartesianState::from_facts(&sizes, &[Fact::new(0, 0), Fact::new(1, 1)]);
        assert!(!target.is_backward_applicable(&o));
        assert_eq!(target.vars_not_backward_applicable(&o), vec![0]);
        let reachable = CartesianState::from_facts(&sizes, &[Fact::new(0, 1), Fact::new(1, 1)]);
        assert!(reachable.is_backward_applicable(&o));
    }

    #[test]
    fn undeviate_replaces_disjoint_vars() {
        let sizes = [3, 2];
        let state = CartesianState::from_facts(&sizes, &[Fact::new(0, 0), Fact::new(1, 0)]);
        let mapped = CartesianState::from_facts(&sizes, &[Fact::new(0, 2)]);
        let undeviated = state.undeviate(&mapped);
        assert_eq!(undeviated.get_values(0), vec![2]);
        // Variable 1 intersects, so it is kept.
        assert_eq!(undeviated.get_values(1), vec![0]);
    }

    #[test]
    fn split_domain_partitions_the_subset() {
        let sizes = [4];
        let state = CartesianState::full(&sizes);
        let (rest, wanted) = state.split_domain(0, &[1, 3]);
        assert_eq!(rest.get_values(0), vec![0, 2]);
        assert_eq!(wanted.get_values(0), vec![1, 3]);
    }
}
