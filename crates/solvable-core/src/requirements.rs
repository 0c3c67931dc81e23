//! Ordered, de-duplicated requirement lists.

use std::collections::HashSet;

use indexmap::IndexSet;
use solvable_schema::spec_name;

/// Requirement strings for one tier of one recipe output.
///
/// Entries keep insertion order and are unique by their whitespace-collapsed
/// text. Entries are raw strings because they may still hold unevaluated pin
/// expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementSet(IndexSet<String>);

fn collapse(spec: &str) -> String {
    spec.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl RequirementSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one requirement; blank entries are ignored.
    pub fn push(&mut self, spec: &str) {
        let spec = collapse(spec);
        if !spec.is_empty() {
            self.0.insert(spec);
        }
    }

    /// Union other requirements in, keeping the existing order first.
    pub fn extend<I, S>(&mut self, specs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for spec in specs {
            self.push(spec.as_ref());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.iter().any(|spec| spec_name(spec) == name)
    }

    /// Drop every requirement whose package name is in `names`.
    ///
    /// Used to strip an output's references to itself and its sibling outputs.
    pub fn without_names<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let names: HashSet<&str> = names.iter().map(AsRef::as_ref).collect();
        self.iter()
            .filter(|spec| !names.contains(spec_name(spec)))
            .collect()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for RequirementSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl IntoIterator for RequirementSet {
    type Item = String;
    type IntoIter = indexmap::set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
