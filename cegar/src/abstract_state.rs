//! Abstract states of the Cartesian abstraction.

use std::ops::{Deref, DerefMut};

use crate::cartesian_set::CartesianSet;
use crate::cartesian_state::CartesianState;
use crate::{NodeId, StateId};

/// A Cartesian state together with its dense state ID and the leaf node that
/// represents it in the refinement hierarchy.
///
/// IDs are consecutive, so they index the per-state vectors of the transition
/// system and the distance tables. Node IDs stay stable across splits.
pub struct AbstractState {
    state_id: StateId,
    node_id: NodeId,
    state: CartesianState,
}

impl AbstractState {
    pub fn new(state_id: StateId, node_id: NodeId, cartesian_set: CartesianSet) -> AbstractState {
        AbstractState {
            state_id,
            node_id,
            state: CartesianState::new(cartesian_set),
        }
    }

    /// The single abstract state of the unrefined abstraction.
    pub fn trivial(domain_sizes: &[usize]) -> AbstractState {
        AbstractState {
            state_id: StateId::from(0usize),
            node_id: NodeId::from(0usize),
            state: CartesianState::full(domain_sizes),
        }
    }

    pub fn id(&self) -> StateId {
        self.state_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.node_id = node_id;
    }

    pub fn cartesian(&self) -> &CartesianState {
        &self.state
    }
}

impl Deref for AbstractState {
    type Target = CartesianState;

    fn deref(&self) -> &CartesianState {
        &self.state
    }
}

impl DerefMut for AbstractState {
    fn deref_mut(&mut self) -> &mut CartesianState {
        &mut self.state
    }
}

impl std::fmt::Display for AbstractState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}{}", self.state_id, self.state)
    }
}
