//! Products of per-variable value subsets.

use fixedbitset::FixedBitSet;
use itertools::Itertools;

use crate::task::Fact;

/// For each variable, a subset of its domain, representing the Cartesian
/// product of the subsets. An empty subset in any dimension makes the whole
/// product empty.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CartesianSet {
    domain_subsets: Vec<FixedBitSet>,
}

impl CartesianSet {
    /// The full product over the given domains.
    pub fn full(domain_sizes: &[usize]) -> CartesianSet {
        let domain_subsets = domain_sizes
            .iter()
            .map(|&size| {
                let mut domain = FixedBitSet::with_capacity(size);
                domain.insert_range(..);
                domain
            })
            .collect();
        CartesianSet { domain_subsets }
    }

    /// The full product restricted by a conjunction of facts. The first fact
    /// on a variable pins it to that single value; later facts on the same
    /// variable widen the subset again (a disjunctive condition).
    pub fn from_facts(domain_sizes: &[usize], facts: &[Fact]) -> CartesianSet {
        let mut set = CartesianSet::full(domain_sizes);
        let mut reset_vars = vec![false; domain_sizes.len()];
        for fact in facts {
            if !reset_vars[fact.var] {
                set.set_single_value(fact.var, fact.value);
                reset_vars[fact.var] = true;
            } else {
                set.add(fact.var, fact.value);
            }
        }
        set
    }

    pub fn num_vars(&self) -> usize {
        self.domain_subsets.len()
    }

    /// The domain size of `var`, not the size of the current subset.
    pub fn var_size(&self, var: usize) -> usize {
        self.domain_subsets[var].len()
    }

    pub fn test(&self, var: usize, value: usize) -> bool {
        self.domain_subsets[var].contains(value)
    }

    pub fn add(&mut self, var: usize, value: usize) {
        self.domain_subsets[var].insert(value);
    }

    pub fn remove(&mut self, var: usize, value: usize) {
        self.domain_subsets[var].set(value, false);
    }

    pub fn set_single_value(&mut self, var: usize, value: usize) {
        self.remove_all(var);
        self.add(var, value);
    }

    pub fn add_all(&mut self, var: usize) {
        self.domain_subsets[var].insert_range(..);
    }

    pub fn remove_all(&mut self, var: usize) {
        self.domain_subsets[var].clear();
    }

    pub fn set_values(&mut self, var: usize, values: &[usize]) {
        self.remove_all(var);
        for &value in values {
            self.add(var, value);
        }
    }

    /// Replaces the subset for `var` by its intersection with `other`'s.
    pub fn intersect_var(&mut self, var: usize, other: &CartesianSet) {
        self.domain_subsets[var].intersect_with(&other.domain_subsets[var]);
    }

    pub fn count(&self, var: usize) -> usize {
        self.domain_subsets[var].count_ones(..)
    }

    pub fn all_values_set(&self, var: usize) -> bool {
        self.count(var) == self.var_size(var)
    }

    pub fn is_empty(&self) -> bool {
        (0..self.num_vars()).any(|var| self.count(var) == 0)
    }

    pub fn values(&self, var: usize) -> impl Iterator<Item = usize> + '_ {
        self.domain_subsets[var].ones()
    }

    pub fn get_values(&self, var: usize) -> Vec<usize> {
        self.values(var).collect()
    }

    pub fn intersects_on(&self, other: &CartesianSet, var: usize) -> bool {
        !self.domain_subsets[var].is_disjoint(&other.domain_subsets[var])
    }

    pub fn intersects(&self, other: &CartesianSet) -> bool {
        (0..self.num_vars()).all(|var| self.intersects_on(other, var))
    }

    /// Whether `self[var] ∩ other[var] ∩ another[var]` is non-empty.
    pub fn intersects_intersection(&self, other: &CartesianSet, another: &CartesianSet, var: usize) -> bool {
        let a = &self.domain_subsets[var];
        let b = &other.domain_subsets[var];
        let c = &another.domain_subsets[var];
        a.intersection(b).any(|value| c.contains(value))
    }

    pub fn is_superset_of(&self, other: &CartesianSet) -> bool {
        (0..self.num_vars()).all(|var| other.domain_subsets[var].is_subset(&self.domain_subsets[var]))
    }

    pub fn is_equal_in_var(&self, other: &CartesianSet, var: usize) -> bool {
        self.domain_subsets[var] == other.domain_subsets[var]
    }

    pub fn intersection(&self, other: &CartesianSet) -> CartesianSet {
        let mut result = self.clone();
        for var in 0..result.num_vars() {
            result.intersect_var(var, other);
        }
        result
    }
}

impl std::fmt::Display for CartesianSet {
    /// Prints only the variables that are restricted below their full domain.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<")?;
        let mut sep = "";
        for var in 0..self.num_vars() {
            if !self.all_values_set(var) {
                write!(f, "{}{}={{{}}}", sep, var, self.values(var).format(","))?;
                sep = ",";
            }
        }
        write!(f, ">")
    }
}

impl std::fmt::Debug for CartesianSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_set_contains_everything() {
        let set = CartesianSet::full(&[3, 2]);
        assert!(set.all_values_set(0));
        assert!(set.all_values_set(1));
        assert!(!set.is_empty());
        assert_eq!(set.count(0), 3);
    }

    #[test]
    fn facts_pin_and_widen() {
        let set = CartesianSet::from_facts(&[4, 2], &[Fact::new(0, 1), Fact::new(0, 3)]);
        assert_eq!(set.get_values(0), vec![1, 3]);
        assert!(set.all_values_set(1));
    }

    #[test]
    fn empty_dimension_empties_product() {
        let mut set = CartesianSet::full(&[2, 2]);
        set.remove_all(1);
        assert!(set.is_empty());
        let other = CartesianSet::full(&[2, 2]);
        assert!(!set.intersects(&other));
        assert!(!set.is_superset_of(&other));
        // The empty set is still a subset of anything.
        assert!(other.is_superset_of(&set));
    }

    #[test]
    fn three_way_intersection() {
        let sizes = [4];
        let a = CartesianSet::from_facts(&sizes, &[Fact::new(0, 1), Fact::new(0, 2)]);
        let b = CartesianSet::from_facts(&sizes, &[Fact::new(0, 2), Fact::new(0, 3)]);
        let c = CartesianSet::from_facts(&sizes, &[Fact::new(0, 2)]);
        assert!(a.intersects_intersection(&b, &c, 0));
        let d = CartesianSet::from_facts(&sizes, &[Fact::new(0, 3)]);
        assert!(!a.intersects_intersection(&b, &d, 0));
    }

    #[test]
    fn display_hides_full_domains() {
        let mut set = CartesianSet::full(&[3, 2]);
        set.set_single_value(0, 2);
        assert_eq!(set.to_string(), "<0={2}>");
    }
}
