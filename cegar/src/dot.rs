//! DOT rendering of the abstract transition system.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use itertools::Itertools;

use crate::abstraction::Abstraction;
use crate::task::Task;
use crate::StateId;

/// Whether and where to emit the transition-system graph between iterations.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum DotGraphVerbosity {
    #[default]
    Silent,
    WriteToConsole,
    WriteToFile,
}

/// The transition system as a `digraph`: the initial state gets an incoming
/// `start` edge, goal states are double circles and parallel transitions are
/// merged into one edge labeled by the sorted operator names.
pub fn create_dot_graph(task: &dyn Task, abstraction: &Abstraction) -> String {
    let mut out = String::new();
    let num_states = abstraction.num_states();
    out.push_str("digraph transition_system {\n");
    out.push_str("    node [shape = none] start;\n");
    for i in 0..num_states {
        let state = StateId::from(i);
        let is_goal = abstraction.goals().contains(&state);
        let shape = if is_goal { "doublecircle" } else { "circle" };
        writeln!(out, "    node [shape = {shape}] {i};").expect("writing to a string cannot fail");
        if state == abstraction.init_id() {
            writeln!(out, "    start -> {i};").expect("writing to a string cannot fail");
        }
    }
    for i in 0..num_states {
        let state = StateId::from(i);
        let mut parallel_transitions: BTreeMap<StateId, Vec<crate::OpId>> = BTreeMap::new();
        for t in &abstraction.transition_system().outgoing()[state] {
            parallel_transitions.entry(t.target).or_default().push(t.op);
        }
        for (target, mut operators) in parallel_transitions {
            operators.sort_unstable();
            let label = operators.iter().map(|&op| task.operator_name(op)).join(", ");
            writeln!(out, "    {i} -> {target} [label = \"{label}\"];").expect("writing to a string cannot fail");
        }
    }
    out.push_str("}\n");
    out
}

pub fn write_to_file(file_name: &str, content: &str) -> anyhow::Result<()> {
    std::fs::write(file_name, content).map_err(|e| anyhow::anyhow!("failed to write {file_name}: {e}"))
}
