//! Mutex-based disambiguation of Cartesian sets and the disambiguated
//! operator view used by the transition system.

use crate::cartesian_state::CartesianState;
use crate::mutexes::MutexInformation;
use crate::task::{Fact, Operator, Task};
use crate::OpId;

/// How partial states are tightened using mutex information.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum DisambiguationMethod {
    /// Leave the set unchanged.
    #[default]
    None,
    /// AC-3 style arc consistency: repeatedly drop values all of whose
    /// supports on some mutex-related variable are mutex with them.
    Ac3,
}

impl DisambiguationMethod {
    /// Tightens `state` without losing any concrete state it represents.
    /// Returns true if the set changed.
    pub fn disambiguate(&self, state: &mut CartesianState, mutexes: &MutexInformation) -> bool {
        match self {
            DisambiguationMethod::None => false,
            DisambiguationMethod::Ac3 => ac3(state, mutexes),
        }
    }
}

fn ac3(state: &mut CartesianState, mutexes: &MutexInformation) -> bool {
    if state.is_spurious() {
        return false;
    }
    let mut set = state.cartesian_set().clone();
    let mut changed = false;

    let num_vars = set.num_vars();
    for var in 0..num_vars {
        let mutex_vars = mutexes.var_mutex_vars(var);
        let mut worklist: Vec<usize> = mutex_vars.to_vec();
        while let Some(mutex_var) = worklist.pop() {
            if arc_reduce(&mut set, var, mutex_var, mutexes) {
                changed = true;
                if set.count(var) == 0 {
                    state.set_cartesian_set(set);
                    return true;
                }
                // Every other related arc has to be rechecked.
                worklist.clear();
                worklist.extend(mutex_vars.iter().copied().filter(|&v| v != mutex_var));
            }
        }
    }

    if changed {
        state.set_cartesian_set(set);
    }
    changed
}

/// Removes from `set[var]` every value that is mutex with all remaining
/// values of `mutex_var`. Returns true if a value was removed.
fn arc_reduce(
    set: &mut crate::cartesian_set::CartesianSet,
    var: usize,
    mutex_var: usize,
    mutexes: &MutexInformation,
) -> bool {
    let mut removed = Vec::new();
    for x_value in set.values(var) {
        let all_mutex = set
            .values(mutex_var)
            .all(|y_value| mutexes.are_facts_mutex(Fact::new(var, x_value), Fact::new(mutex_var, y_value)));
        if all_mutex {
            removed.push(x_value);
        }
    }
    for value in &removed {
        set.remove(var, *value);
    }
    !removed.is_empty()
}

/// An operator whose precondition has been tightened by disambiguation, with
/// dense per-variable effect lookup.
///
/// The precondition set has an entry for every variable: the full domain
/// where the operator has no precondition, the (possibly shrunken) allowed
/// values elsewhere. The postcondition replaces effect variables by their
/// single effect value.
pub struct DisambiguatedOperator {
    id: OpId,
    cost: u32,
    precondition: CartesianState,
    post: CartesianState,
    effects: Vec<Fact>,
    effect_in_var: Vec<Option<usize>>,
    redundant: bool,
}

impl DisambiguatedOperator {
    pub fn new(
        task: &dyn Task,
        id: OpId,
        op: &Operator,
        method: DisambiguationMethod,
        mutexes: &MutexInformation,
    ) -> DisambiguatedOperator {
        let domain_sizes = crate::task::domain_sizes(task);
        let mut precondition = CartesianState::from_facts(&domain_sizes, op.pre());
        method.disambiguate(&mut precondition, mutexes);

        let mut effect_in_var = vec![None; domain_sizes.len()];
        let mut effects = Vec::with_capacity(op.eff().len());
        for &eff in op.eff() {
            if effect_in_var[eff.var].is_none() {
                effects.push(eff);
            }
            effect_in_var[eff.var] = Some(eff.value);
        }

        let mut post_set = precondition.cartesian_set().clone();
        for &eff in &effects {
            post_set.set_single_value(eff.var, eff.value);
        }
        let mut post = CartesianState::new(post_set);
        method.disambiguate(&mut post, mutexes);

        let redundant = effects.is_empty() || precondition.is_spurious() || post.is_spurious();
        DisambiguatedOperator {
            id,
            cost: op.cost,
            precondition,
            post,
            effects,
            effect_in_var,
            redundant,
        }
    }

    /// Builds the disambiguated view of every operator of the task.
    pub fn for_task(task: &dyn Task, method: DisambiguationMethod) -> Vec<DisambiguatedOperator> {
        let mutexes = task.mutexes();
        task.operators()
            .iter()
            .enumerate()
            .map(|(i, op)| DisambiguatedOperator::new(task, OpId::from(i), op, method, mutexes))
            .collect()
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    /// A provably inapplicable or effect-free operator; skipped everywhere.
    pub fn is_redundant(&self) -> bool {
        self.redundant
    }

    pub fn precondition(&self) -> &CartesianState {
        &self.precondition
    }

    pub fn post(&self) -> &CartesianState {
        &self.post
    }

    pub fn effects(&self) -> &[Fact] {
        &self.effects
    }

    pub fn has_effect(&self, var: usize) -> bool {
        self.effect_in_var[var].is_some()
    }

    pub fn effect_on(&self, var: usize) -> Option<usize> {
        self.effect_in_var[var]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Fact;

    fn op(pre: &[(usize, usize)], eff: &[(usize, usize)]) -> Operator {
        Operator {
            name: "op".to_string(),
            preconditions: pre.iter().map(|&(v, x)| Fact::new(v, x)).collect(),
            effects: eff.iter().map(|&(v, x)| Fact::new(v, x)).collect(),
            cost: 1,
        }
    }

    fn task_with(domains: Vec<usize>, ops: Vec<Operator>, mutex_pairs: &[((usize, usize), (usize, usize))]) -> crate::task::ExplicitTask {
        let mutexes = MutexInformation::from_pairs(
            &domains,
            mutex_pairs
                .iter()
                .map(|&((v1, x1), (v2, x2))| (Fact::new(v1, x1), Fact::new(v2, x2))),
        );
        let init = vec![0; domains.len()];
        crate::task::ExplicitTask::new(domains, ops, init, vec![], mutexes).unwrap()
    }

    #[test]
    fn ac3_drops_unsupported_values() {
        // 0=0 is mutex with both values of variable 1, so a partial state
        // allowing 0={0,1} must shrink to 0={1}.
        let task = task_with(vec![2, 2], vec![], &[((0, 0), (1, 0)), ((0, 0), (1, 1))]);
        let mut state = CartesianState::full(&[2, 2]);
        let changed = DisambiguationMethod::Ac3.disambiguate(&mut state, task.mutexes());
        assert!(changed);
        assert_eq!(state.cartesian_set().get_values(0), vec![1]);
    }

    #[test]
    fn spurious_precondition_makes_operator_redundant() {
        let task = task_with(
            vec![2, 2],
            vec![op(&[(0, 0), (1, 0)], &[(1, 1)])],
            &[((0, 0), (1, 0))],
        );
        let ops = DisambiguatedOperator::for_task(&task, DisambiguationMethod::Ac3);
        assert!(ops[0].is_redundant());
    }

    #[test]
    fn post_replaces_effect_variables() {
        let task = task_with(vec![3, 2], vec![op(&[(0, 1)], &[(1, 1)])], &[]);
        let ops = DisambiguatedOperator::for_task(&task, DisambiguationMethod::None);
        let o = &ops[0];
        assert!(!o.is_redundant());
        assert_eq!(o.effect_on(1), Some(1));
        assert_eq!(o.effect_on(0), None);
        assert_eq!(o.post().cartesian_set().get_values(1), vec![1]);
        assert_eq!(o.post().cartesian_set().get_values(0), vec![1]);
    }
}
