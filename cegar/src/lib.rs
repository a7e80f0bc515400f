//! Cartesian abstractions for classical planning, built by counterexample-guided
//! abstraction refinement (CEGAR).
//!
//! Starting from the trivial one-state abstraction of a finite-domain planning
//! task, the refinement loop repeatedly extracts an optimal abstract trace,
//! searches it for a flaw (an abstract state from which the trace cannot be
//! realized in the concrete task), splits the flawed state on one variable and
//! patches the abstract goal distances incrementally. The final goal-distance
//! table together with the refinement hierarchy forms a consistent, admissible
//! heuristic for the concrete task.

#[macro_use]
pub mod collections;

pub mod abstract_state;
pub mod abstraction;
pub mod cartesian_set;
pub mod cartesian_state;
pub mod cegar;
pub mod disambiguation;
pub mod dot;
pub mod flaw_search;
pub mod hadd;
pub mod heuristic;
pub mod mutexes;
pub mod refinement_hierarchy;
pub mod shortest_paths;
pub mod split_selector;
pub mod subtasks;
pub mod task;
pub mod timers;
pub mod transition_system;

create_ref_type!(StateId);
create_ref_type!(NodeId);
create_ref_type!(OpId);

/// 64-bit distance value. When the task has zero-cost operators this packs a
/// 32-bit cost into the high half and a step count into the low half, so that
/// comparisons break cost ties by plan length.
pub type Cost = u64;

/// Infinite 64-bit distance.
pub const INF_COSTS: Cost = u64::MAX;

/// Infinite 32-bit cost (the value reported for unreachable states).
pub const INF: u32 = u32::MAX;

/// IDs of the abstract goal states.
pub type Goals = hashbrown::HashSet<StateId>;

/// An abstract trace from the initial state to a goal state.
pub type Solution = Vec<transition_system::Transition>;
