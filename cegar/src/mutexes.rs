//! Fact-to-fact mutex table used for disambiguation.

use hashbrown::HashSet;

use crate::task::Fact;

/// For every fact, the set of facts it can never co-occur with, plus a
/// per-variable index of the variables it shares mutexes with.
#[derive(Default)]
pub struct MutexInformation {
    /// `mutexes[var][value]` holds all facts mutex with `(var, value)`.
    mutexes: Vec<Vec<HashSet<Fact>>>,
    /// For every variable, the other variables some of its values are mutex with.
    var_mutex_vars: Vec<Vec<usize>>,
}

impl MutexInformation {
    pub fn new(domain_sizes: &[usize]) -> MutexInformation {
        MutexInformation {
            mutexes: domain_sizes.iter().map(|&d| vec![HashSet::new(); d]).collect(),
            var_mutex_vars: vec![Vec::new(); domain_sizes.len()],
        }
    }

    pub fn from_pairs(
        domain_sizes: &[usize],
        pairs: impl IntoIterator<Item = (Fact, Fact)>,
    ) -> MutexInformation {
        let mut info = MutexInformation::new(domain_sizes);
        for (f1, f2) in pairs {
            info.add_mutex(f1, f2);
        }
        info
    }

    pub fn add_mutex(&mut self, f1: Fact, f2: Fact) {
        debug_assert!(f1.var != f2.var || f1.value != f2.value);
        if self.mutexes[f1.var][f1.value].insert(f2) {
            Self::index_var(&mut self.var_mutex_vars[f1.var], f2.var);
        }
        if self.mutexes[f2.var][f2.value].insert(f1) {
            Self::index_var(&mut self.var_mutex_vars[f2.var], f1.var);
        }
    }

    fn index_var(vars: &mut Vec<usize>, var: usize) {
        if !vars.contains(&var) {
            vars.push(var);
            vars.sort_unstable();
        }
    }

    pub fn are_facts_mutex(&self, f1: Fact, f2: Fact) -> bool {
        self.mutexes
            .get(f1.var)
            .and_then(|values| values.get(f1.value))
            .is_some_and(|set| set.contains(&f2))
    }

    pub fn mutexes_of(&self, fact: Fact) -> impl Iterator<Item = &Fact> {
        self.mutexes[fact.var][fact.value].iter()
    }

    /// The variables that share at least one mutex with `var`, in ascending order.
    pub fn var_mutex_vars(&self, var: usize) -> &[usize] {
        self.var_mutex_vars.get(var).map_or(&[], |v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_registration() {
        let mut info = MutexInformation::new(&[2, 3]);
        info.add_mutex(Fact::new(0, 1), Fact::new(1, 2));
        assert!(info.are_facts_mutex(Fact::new(0, 1), Fact::new(1, 2)));
        assert!(info.are_facts_mutex(Fact::new(1, 2), Fact::new(0, 1)));
        assert!(!info.are_facts_mutex(Fact::new(0, 0), Fact::new(1, 2)));
        assert_eq!(info.var_mutex_vars(0), &[1]);
        assert_eq!(info.var_mutex_vars(1), &[0]);
    }
}
