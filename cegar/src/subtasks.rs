//! Task decompositions: each subtask gets its own abstraction, combined
//! additively by a cost-partitioning consumer.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::flaw_search::PickFlawedAbstractState;
use crate::hadd::compute_hadd;
use crate::mutexes::MutexInformation;
use crate::split_selector::{PickSequenceFlaw, PickSplit};
use crate::task::{Fact, Operator, Task};

/// How goal facts are ordered before decomposition.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum FactOrder {
    Original,
    #[default]
    Random,
    HaddUp,
    HaddDown,
}

/// Per-subtask strategy overrides carried next to the derived task.
#[derive(Clone, Default)]
pub struct SubtaskOptions {
    pub pick_flawed_abstract_state: PickFlawedAbstractState,
    pub pick_split: PickSplit,
    pub tiebreak_split: PickSplit,
    pub sequence_split: PickSequenceFlaw,
    pub sequence_tiebreak_split: PickSequenceFlaw,
    pub intersect_flaw_search_abstract_states: bool,
}

pub struct Subtask {
    pub subproblem_id: usize,
    pub task: Arc<dyn Task>,
    pub options: SubtaskOptions,
}

/// Produces the derived tasks to build abstractions for.
pub trait SubtaskGenerator {
    fn get_subtasks(&self, task: &Arc<dyn Task>, rng: &mut SmallRng) -> anyhow::Result<Vec<Subtask>>;
}

/// Removes facts already true initially, then applies the configured order.
pub fn filter_and_order_facts(
    task: &dyn Task,
    order: FactOrder,
    mut facts: Vec<Fact>,
    rng: &mut SmallRng,
) -> Vec<Fact> {
    let initial_state = task.initial_state();
    facts.retain(|fact| initial_state[fact.var] != fact.value);
    match order {
        FactOrder::Original => {}
        FactOrder::Random => facts.shuffle(rng),
        FactOrder::HaddUp | FactOrder::HaddDown => {
            let hadd = compute_hadd(task);
            facts.sort_by_key(|fact| hadd.fact_cost(fact.var, fact.value));
            if order == FactOrder::HaddDown {
                facts.reverse();
            }
        }
    }
    facts
}

/// N copies of the unmodified task.
pub struct TaskDuplicator {
    pub copies: usize,
    pub options: SubtaskOptions,
}

impl SubtaskGenerator for TaskDuplicator {
    fn get_subtasks(&self, task: &Arc<dyn Task>, _rng: &mut SmallRng) -> anyhow::Result<Vec<Subtask>> {
        Ok((0..self.copies)
            .map(|_| Subtask {
                subproblem_id: 0,
                task: Arc::clone(task),
                options: self.options.clone(),
            })
            .collect())
    }
}

/// One subtask per goal fact, each a goal-modified view of the parent task.
pub struct GoalsDecomposition {
    pub order: FactOrder,
    pub options: SubtaskOptions,
}

impl SubtaskGenerator for GoalsDecomposition {
    fn get_subtasks(&self, task: &Arc<dyn Task>, rng: &mut SmallRng) -> anyhow::Result<Vec<Subtask>> {
        let goals = filter_and_order_facts(task.as_ref(), self.order, task.goals().to_vec(), rng);
        anyhow::ensure!(!goals.is_empty(), "every goal fact holds in the initial state");
        Ok(goals
            .into_iter()
            .enumerate()
            .map(|(subproblem_id, goal)| Subtask {
                subproblem_id,
                task: Arc::new(ModifiedGoalsTask::new(Arc::clone(task), vec![goal])),
                options: self.options.clone(),
            })
            .collect())
    }
}

/// A view of another task with a different goal condition. States need no
/// conversion; only the goal changes.
pub struct ModifiedGoalsTask {
    parent: Arc<dyn Task>,
    goals: Vec<Fact>,
}

impl ModifiedGoalsTask {
    pub fn new(parent: Arc<dyn Task>, goals: Vec<Fact>) -> ModifiedGoalsTask {
        ModifiedGoalsTask { parent, goals }
    }
}

impl Task for ModifiedGoalsTask {
    fn num_variables(&self) -> usize {
        self.parent.num_variables()
    }

    fn domain_size(&self, var: usize) -> usize {
        self.parent.domain_size(var)
    }

    fn operators(&self) -> &[Operator] {
        self.parent.operators()
    }

    fn initial_state(&self) -> &[usize] {
        self.parent.initial_state()
    }

    fn goals(&self) -> &[Fact] {
        &self.goals
    }

    fn mutexes(&self) -> &MutexInformation {
        self.parent.mutexes()
    }

    fn needs_ancestor_conversion(&self) -> bool {
        self.parent.needs_ancestor_conversion()
    }

    fn convert_ancestor_state(&self, values: &mut [usize]) {
        self.parent.convert_ancestor_state(values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ExplicitTask;
    use rand::SeedableRng;

    fn task() -> Arc<dyn Task> {
        let domains = vec![2, 2, 2];
        Arc::new(
            ExplicitTask::new(
                domains.clone(),
                vec![
                    Operator {
                        name: "a".to_string(),
                        preconditions: vec![],
                        effects: vec![Fact::new(1, 1)],
                        cost: 1,
                    },
                    Operator {
                        name: "b".to_string(),
                        preconditions: vec![Fact::new(1, 1)],
                        effects: vec![Fact::new(2, 1)],
                        cost: 1,
                    },
                ],
                vec![0, 0, 0],
                vec![Fact::new(0, 0), Fact::new(1, 1), Fact::new(2, 1)],
                MutexInformation::new(&domains),
            )
            .unwrap(),
        )
    }

    #[test]
    fn goals_decomposition_drops_satisfied_goals() {
        let task = task();
        let mut rng = SmallRng::seed_from_u64(0);
        let generator = GoalsDecomposition {
            order: FactOrder::Original,
            options: SubtaskOptions::default(),
        };
        let subtasks = generator.get_subtasks(&task, &mut rng).unwrap();
        // Goal 0=0 already holds initially and is dropped.
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].task.goals(), &[Fact::new(1, 1)]);
        assert_eq!(subtasks[1].task.goals(), &[Fact::new(2, 1)]);
    }

    #[test]
    fn hadd_order_sorts_by_achievement_cost() {
        let task = task();
        let facts = filter_and_order_facts(
            task.as_ref(),
            FactOrder::HaddUp,
            vec![Fact::new(2, 1), Fact::new(1, 1)],
            &mut SmallRng::seed_from_u64(0),
        );
        assert_eq!(facts, vec![Fact::new(1, 1), Fact::new(2, 1)]);
    }
}
