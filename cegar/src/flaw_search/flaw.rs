//! Bookkeeping of flawed abstract states found during a flaw search.

use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;

use super::ConcreteStateId;
use crate::cartesian_state::CartesianState;
use crate::{Cost, StateId};

/// An abstract state caught deviating from the trace, with the concrete
/// states that witnessed it and its h-value at collection time.
#[derive(Clone, Debug, PartialEq)]
pub struct FlawedState {
    pub abs_id: StateId,
    pub h: Cost,
    pub concrete_states: Vec<ConcreteStateId>,
}

/// All flawed states of the current flaw search, addressable by abstract
/// state and by minimum h.
#[derive(Default)]
pub struct FlawedStates {
    states: Vec<FlawedState>,
}

impl FlawedStates {
    pub fn add_state(&mut self, abs_id: StateId, concrete: ConcreteStateId, h: Cost) {
        match self.states.iter_mut().find(|f| f.abs_id == abs_id) {
            Some(flawed) => {
                debug_assert_eq!(flawed.h, h);
                if !flawed.concrete_states.contains(&concrete) {
                    flawed.concrete_states.push(concrete);
                }
            }
            None => self.states.push(FlawedState {
                abs_id,
                h,
                concrete_states: vec![concrete],
            }),
        }
    }

    pub fn num_concrete_states(&self, abs_id: StateId) -> usize {
        self.states
            .iter()
            .find(|f| f.abs_id == abs_id)
            .map_or(0, |f| f.concrete_states.len())
    }

    pub fn num_abstract_states(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    /// Picks a random flawed state and forgets all others.
    pub fn pop_random_flawed_state_and_clear(&mut self, rng: &mut SmallRng) -> FlawedState {
        debug_assert!(!self.is_empty());
        let index = rand::Rng::random_range(rng, 0..self.states.len());
        let state = self.states.swap_remove(index);
        self.states.clear();
        state
    }

    /// Removes and returns the entry with the smallest h-value.
    pub fn pop_flawed_state_with_min_h(&mut self) -> Option<FlawedState> {
        let index = self
            .states
            .iter()
            .enumerate()
            .min_by_key(|(_, f)| f.h)
            .map(|(i, _)| i)?;
        Some(self.states.swap_remove(index))
    }

    pub fn pick_random_concrete_state(flawed: &FlawedState, rng: &mut SmallRng) -> ConcreteStateId {
        *flawed.concrete_states.choose(rng).expect("flawed state has witnesses")
    }
}

/// A flaw found by walking the abstract trace with a Cartesian flaw-search
/// state instead of a concrete search.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct LegacyFlaw {
    pub flaw_search_state: CartesianState,
    pub abstract_state_id: StateId,
    /// The flaw sits at the end of the walk (goal test in progression, initial
    /// state test in regression), not at a transition.
    pub split_last_state: bool,
}

impl LegacyFlaw {
    pub fn new(flaw_search_state: CartesianState, abstract_state_id: StateId, split_last_state: bool) -> LegacyFlaw {
        LegacyFlaw {
            flaw_search_state,
            abstract_state_id,
            split_last_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(i: usize) -> ConcreteStateId {
        ConcreteStateId::from(i)
    }

    #[test]
    fn min_h_pops_in_order() {
        let mut flawed = FlawedStates::default();
        flawed.add_state(StateId::from(0usize), state(0), 5);
        flawed.add_state(StateId::from(1usize), state(1), 2);
        flawed.add_state(StateId::from(1usize), state(2), 2);
        assert_eq!(flawed.num_abstract_states(), 2);
        assert_eq!(flawed.num_concrete_states(StateId::from(1usize)), 2);
        let first = flawed.pop_flawed_state_with_min_h().unwrap();
        assert_eq!(first.abs_id, StateId::from(1usize));
        let second = flawed.pop_flawed_state_with_min_h().unwrap();
        assert_eq!(second.abs_id, StateId::from(0usize));
        assert!(flawed.pop_flawed_state_with_min_h().is_none());
    }
}
