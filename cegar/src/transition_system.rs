//! Incoming/outgoing transitions and self-loops of the abstraction, rewired
//! incrementally on every split.

use std::sync::Arc;

use tracing::debug;

use crate::abstract_state::AbstractState;
use crate::disambiguation::DisambiguatedOperator;
use crate::{OpId, StateId};

/// One endpoint of a state-changing transition. In `outgoing[s]`, `target` is
/// the successor; in `incoming[s]`, the predecessor.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Transition {
    pub op: OpId,
    pub target: StateId,
}

impl Transition {
    pub fn new(op: OpId, target: StateId) -> Transition {
        Transition { op, target }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.op, self.target)
    }
}

pub type Transitions = Vec<Transition>;
pub type Loops = Vec<OpId>;

fn remove_transitions_with_target(transitions: &mut Transitions, state_id: StateId) {
    let before = transitions.len();
    transitions.retain(|t| t.target != state_id);
    debug_assert!(transitions.len() < before);
}

pub struct TransitionSystem {
    operators: Arc<Vec<DisambiguatedOperator>>,

    // Per-state transitions to and from other states; self-loops are stored
    // separately as bare operator IDs to save space.
    incoming: Vec<Transitions>,
    outgoing: Vec<Transitions>,
    loops: Vec<Loops>,

    num_non_loops: usize,
    num_loops: usize,
}

impl TransitionSystem {
    pub fn new(operators: Arc<Vec<DisambiguatedOperator>>) -> TransitionSystem {
        TransitionSystem {
            operators,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            loops: Vec::new(),
            num_non_loops: 0,
            num_loops: 0,
        }
    }

    fn enlarge_vectors_by_one(&mut self) {
        let new_num_states = self.num_states() + 1;
        self.incoming.resize(new_num_states, Vec::new());
        self.outgoing.resize(new_num_states, Vec::new());
        self.loops.resize(new_num_states, Vec::new());
    }

    /// Gives the single state of the trivial abstraction a self-loop for
    /// every operator applicable in it.
    pub fn add_loops_in_trivial_abstraction(&mut self, init: &AbstractState, disambiguated: bool) {
        assert_eq!(self.num_states(), 0);
        self.enlarge_vectors_by_one();
        let all_vars: Vec<usize> = (0..init.cartesian_set().num_vars()).collect();
        let operators = Arc::clone(&self.operators);
        for op in operators.iter() {
            // The initial abstract state could have been disambiguated below
            // the full product, in which case applicability must be checked.
            if !op.is_redundant()
                && (!disambiguated || (init.admits(op) && init.reach_with_op(init, op, &all_vars)))
            {
                self.add_loop(init.id(), op.id());
            }
        }
    }

    fn add_transition(&mut self, src: StateId, op: OpId, target: StateId) {
        debug_assert_ne!(src, target);
        self.outgoing[src].push(Transition::new(op, target));
        self.incoming[target].push(Transition::new(op, src));
        self.num_non_loops += 1;
    }

    fn add_loop(&mut self, state_id: StateId, op: OpId) {
        self.loops[state_id].push(op);
        self.num_loops += 1;
    }

    /// Overwrites all transitions; used to seed the scratch system before a
    /// simulated rewire.
    pub fn force_new_transitions(
        &mut self,
        incoming: &[Transitions],
        outgoing: &[Transitions],
        loops: &[Loops],
    ) {
        self.incoming = incoming.to_vec();
        self.outgoing = outgoing.to_vec();
        self.loops = loops.to_vec();
        self.num_non_loops = outgoing.iter().map(Vec::len).sum();
        self.num_loops = loops.iter().map(Vec::len).sum();
    }

    fn rewire_incoming_transitions(
        &mut self,
        old_incoming: &Transitions,
        states: &[AbstractState],
        v_id: StateId,
        v1: &AbstractState,
        v2: &AbstractState,
        modified_vars: &[usize],
    ) {
        // State v has been split into v1 and v2. For all transitions u->v we
        // need to add transitions u->v1, u->v2, or both.
        let operators = Arc::clone(&self.operators);
        let mut updated_states = hashbrown::HashSet::new();
        for transition in old_incoming {
            let u_id = transition.target;
            if updated_states.insert(u_id) {
                remove_transitions_with_target(&mut self.outgoing[u_id], v_id);
            }
        }
        self.num_non_loops -= old_incoming.len();

        for transition in old_incoming {
            let op = &operators[usize::from(transition.op)];
            let u_id = transition.target;
            let u = &states[usize::from(u_id)];
            if u.reach_with_op(v1, op, modified_vars) {
                self.add_transition(u_id, transition.op, v1.id());
            }
            if u.reach_with_op(v2, op, modified_vars) {
                self.add_transition(u_id, transition.op, v2.id());
            }
        }
    }

    fn rewire_outgoing_transitions(
        &mut self,
        old_outgoing: &Transitions,
        states: &[AbstractState],
        v_id: StateId,
        v1: &AbstractState,
        v2: &AbstractState,
        modified_vars: &[usize],
    ) {
        // For all transitions v->w we need v1->w, v2->w, or both.
        let operators = Arc::clone(&self.operators);
        let mut updated_states = hashbrown::HashSet::new();
        for transition in old_outgoing {
            let w_id = transition.target;
            if updated_states.insert(w_id) {
                remove_transitions_with_target(&mut self.incoming[w_id], v_id);
            }
        }
        self.num_non_loops -= old_outgoing.len();

        for transition in old_outgoing {
            let op = &operators[usize::from(transition.op)];
            let w_id = transition.target;
            let w = &states[usize::from(w_id)];
            if v1.admits_on(op, modified_vars) && v1.reach_with_op(w, op, modified_vars) {
                self.add_transition(v1.id(), transition.op, w_id);
            }
            if v2.admits_on(op, modified_vars) && v2.reach_with_op(w, op, modified_vars) {
                self.add_transition(v2.id(), transition.op, w_id);
            }
        }
    }

    fn rewire_loops(
        &mut self,
        old_loops: &Loops,
        v1: &AbstractState,
        v2: &AbstractState,
        modified_vars: &[usize],
        simulated: bool,
    ) {
        // Each old self-loop v->v becomes some subset of the four edges
        // v1->v1, v1->v2, v2->v1 and v2->v2.
        let operators = Arc::clone(&self.operators);
        for &op_id in old_loops {
            let op = &operators[usize::from(op_id)];
            let applicable_v1 = v1.admits_on(op, modified_vars);
            let applicable_v2 = v2.admits_on(op, modified_vars);
            // New loops are irrelevant for a simulated rewire: the simulated
            // distances never look at them.
            if !simulated {
                if applicable_v1 && v1.reach_with_op(v1, op, modified_vars) {
                    self.add_loop(v1.id(), op_id);
                }
                if applicable_v2 && v2.reach_with_op(v2, op, modified_vars) {
                    self.add_loop(v2.id(), op_id);
                }
            }
            if applicable_v1 && v1.reach_with_op(v2, op, modified_vars) {
                self.add_transition(v1.id(), op_id, v2.id());
            }
            if applicable_v2 && v2.reach_with_op(v1, op, modified_vars) {
                self.add_transition(v2.id(), op_id, v1.id());
            }
        }
        self.num_loops -= old_loops.len();
    }

    /// Replaces all transitions touching `v` by transitions touching whichever
    /// of its children `v1`/`v2` still supports them. Only `modified_vars`
    /// need rechecking. Returns the old incoming and outgoing lists of `v`,
    /// which the shortest-path update needs.
    pub fn rewire(
        &mut self,
        states: &[AbstractState],
        v_id: StateId,
        v1: &AbstractState,
        v2: &AbstractState,
        modified_vars: &[usize],
        simulated: bool,
    ) -> (Transitions, Transitions) {
        let old_incoming = std::mem::take(&mut self.incoming[v_id]);
        let old_outgoing = std::mem::take(&mut self.outgoing[v_id]);
        let old_loops = std::mem::take(&mut self.loops[v_id]);
        self.enlarge_vectors_by_one();
        debug_assert!(self.incoming[v1.id()].is_empty() && self.outgoing[v1.id()].is_empty());
        debug_assert!(self.incoming[v2.id()].is_empty() && self.outgoing[v2.id()].is_empty());

        debug!(
            "rewire {v_id} -> {} + {}: {} in, {} out, {} loops",
            v1.id(),
            v2.id(),
            old_incoming.len(),
            old_outgoing.len(),
            old_loops.len()
        );

        self.rewire_incoming_transitions(&old_incoming, states, v_id, v1, v2, modified_vars);
        self.rewire_outgoing_transitions(&old_outgoing, states, v_id, v1, v2, modified_vars);
        self.rewire_loops(&old_loops, v1, v2, modified_vars, simulated);

        (old_incoming, old_outgoing)
    }

    pub fn incoming(&self) -> &[Transitions] {
        &self.incoming
    }

    pub fn outgoing(&self) -> &[Transitions] {
        &self.outgoing
    }

    pub fn loops(&self) -> &[Loops] {
        &self.loops
    }

    pub fn operators(&self) -> &Arc<Vec<DisambiguatedOperator>> {
        &self.operators
    }

    pub fn operator(&self, op: OpId) -> &DisambiguatedOperator {
        &self.operators[usize::from(op)]
    }

    pub fn preconditions(&self, op: OpId) -> &crate::cartesian_state::CartesianState {
        self.operators[usize::from(op)].precondition()
    }

    pub fn num_states(&self) -> usize {
        debug_assert_eq!(self.incoming.len(), self.outgoing.len());
        debug_assert_eq!(self.loops.len(), self.outgoing.len());
        self.outgoing.len()
    }

    pub fn num_operators(&self) -> usize {
        self.operators.len()
    }

    pub fn num_non_loops(&self) -> usize {
        self.num_non_loops
    }

    pub fn num_loops(&self) -> usize {
        self.num_loops
    }

    /// Checks the bidirectional bookkeeping; only meant for debug assertions.
    pub fn is_consistent(&self) -> bool {
        let total_outgoing: usize = self.outgoing.iter().map(Vec::len).sum();
        let total_incoming: usize = self.incoming.iter().map(Vec::len).sum();
        let total_loops: usize = self.loops.iter().map(Vec::len).sum();
        if total_outgoing != total_incoming
            || total_outgoing != self.num_non_loops
            || total_loops != self.num_loops
        {
            return false;
        }
        self.outgoing.iter().enumerate().all(|(s, transitions)| {
            transitions.iter().all(|t| {
                self.incoming[usize::from(t.target)]
                    .iter()
                    .any(|back| back.op == t.op && usize::from(back.target) == s)
            })
        })
    }
}
