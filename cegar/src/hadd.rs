//! Additive heuristic over facts, evaluated once in the initial state.
//!
//! Used to rate candidate splits and to order goal facts for subtask
//! decomposition.

use crate::task::{Fact, Task};
use crate::{Cost, INF_COSTS};

/// Dense indexing of all facts of a task.
pub struct FactIndexer {
    offsets: Vec<usize>,
    num_facts: usize,
}

impl FactIndexer {
    pub fn new(task: &dyn Task) -> FactIndexer {
        let mut offsets = Vec::with_capacity(task.num_variables());
        let mut num_facts = 0;
        for var in 0..task.num_variables() {
            offsets.push(num_facts);
            num_facts += task.domain_size(var);
        }
        FactIndexer { offsets, num_facts }
    }

    pub fn index(&self, fact: Fact) -> usize {
        self.offsets[fact.var] + fact.value
    }

    pub fn num_facts(&self) -> usize {
        self.num_facts
    }
}

/// h^add values for every fact, relative to the task's initial state.
pub struct AdditiveHeuristic {
    indexer: FactIndexer,
    fact_costs: Vec<Cost>,
}

impl AdditiveHeuristic {
    /// Cost of achieving `fact` from the initial state, `INF_COSTS` if it is
    /// relaxed-unreachable.
    pub fn fact_cost(&self, var: usize, value: usize) -> Cost {
        self.fact_costs[self.indexer.index(Fact::new(var, value))]
    }

    pub fn min_cost(&self, var: usize, values: &[usize]) -> Cost {
        values.iter().map(|&v| self.fact_cost(var, v)).min().unwrap_or(INF_COSTS)
    }

    pub fn max_cost(&self, var: usize, values: &[usize]) -> Cost {
        values.iter().map(|&v| self.fact_cost(var, v)).max().unwrap_or(0)
    }
}

fn saturating_add(a: Cost, b: Cost) -> Cost {
    if a == INF_COSTS || b == INF_COSTS {
        INF_COSTS
    } else {
        a + b
    }
}

/// Fixpoint computation: a fact achieved by an operator costs the sum of the
/// operator's precondition costs plus the operator cost.
pub fn compute_hadd(task: &dyn Task) -> AdditiveHeuristic {
    let indexer = FactIndexer::new(task);
    let operators = task.operators();

    // For every fact, the operators with that fact as a precondition.
    let mut dependent: Vec<Vec<usize>> = vec![Vec::new(); indexer.num_facts()];
    for (op_index, op) in operators.iter().enumerate() {
        for &pre in op.pre() {
            dependent[indexer.index(pre)].push(op_index);
        }
    }

    let mut op_costs = vec![INF_COSTS; operators.len()];
    let mut update = vec![false; operators.len()];
    for (op_index, op) in operators.iter().enumerate() {
        if op.pre().is_empty() {
            update[op_index] = true;
        }
    }

    let mut fact_costs = vec![INF_COSTS; indexer.num_facts()];
    for (var, &value) in task.initial_state().iter().enumerate() {
        fact_costs[indexer.index(Fact::new(var, value))] = 0;
        for &op_index in &dependent[indexer.index(Fact::new(var, value))] {
            update[op_index] = true;
        }
    }

    let mut again = true;
    while again {
        again = false;
        for (op_index, op) in operators.iter().enumerate() {
            if !update[op_index] {
                continue;
            }
            update[op_index] = false;
            let cost: Cost = op
                .pre()
                .iter()
                .fold(0, |acc, &pre| saturating_add(acc, fact_costs[indexer.index(pre)]));
            if cost < op_costs[op_index] {
                op_costs[op_index] = cost;
                let achieved = saturating_add(cost, op.cost as Cost);
                for &eff in op.eff() {
                    if achieved < fact_costs[indexer.index(eff)] {
                        fact_costs[indexer.index(eff)] = achieved;
                        for &dependent_op in &dependent[indexer.index(eff)] {
                            update[dependent_op] = true;
                            again = true;
                        }
                    }
                }
            }
        }
    }

    AdditiveHeuristic { indexer, fact_costs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutexes::MutexInformation;
    use crate::task::{ExplicitTask, Operator};

    fn op(pre: &[(usize, usize)], eff: &[(usize, usize)], cost: u32) -> Operator {
        Operator {
            name: "op".to_string(),
            preconditions: pre.iter().map(|&(v, x)| Fact::new(v, x)).collect(),
            effects: eff.iter().map(|&(v, x)| Fact::new(v, x)).collect(),
            cost,
        }
    }

    #[test]
    fn chains_accumulate_costs() {
        // 0: 0 -> 1 -> 2 via two operators of costs 2 and 3.
        let task = ExplicitTask::new(
            vec![3],
            vec![op(&[(0, 0)], &[(0, 1)], 2), op(&[(0, 1)], &[(0, 2)], 3)],
            vec![0],
            vec![Fact::new(0, 2)],
            MutexInformation::new(&[3]),
        )
        .unwrap();
        let hadd = compute_hadd(&task);
        assert_eq!(hadd.fact_cost(0, 0), 0);
        assert_eq!(hadd.fact_cost(0, 1), 2);
        assert_eq!(hadd.fact_cost(0, 2), 5);
    }

    #[test]
    fn unreachable_facts_stay_infinite() {
        let task = ExplicitTask::new(
            vec![2, 2],
            vec![op(&[(1, 1)], &[(0, 1)], 1)],
            vec![0, 0],
            vec![],
            MutexInformation::new(&[2, 2]),
        )
        .unwrap();
        let hadd = compute_hadd(&task);
        assert_eq!(hadd.fact_cost(1, 1), INF_COSTS);
        assert_eq!(hadd.fact_cost(0, 1), INF_COSTS);
        assert_eq!(hadd.min_cost(0, &[0, 1]), 0);
    }
}
