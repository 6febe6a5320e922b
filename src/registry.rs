use std::collections::BTreeSet;

use serde::Serialize;

use crate::domain::QuerySpec;

/// Ordered, read-only set of query definitions making up one report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryRegistry {
    specs: Vec<QuerySpec>,
}

impl QueryRegistry {
    pub fn new(specs: Vec<QuerySpec>) -> Self {
        Self { specs }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QuerySpec> {
        self.specs.iter()
    }

    pub fn specs(&self) -> &[QuerySpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&QuerySpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn sheets(&self) -> BTreeSet<&str> {
        self.specs
            .iter()
            .map(|spec| spec.destination_sheet.as_str())
            .collect()
    }

    /// Groups in first-seen registry order.
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for spec in &self.specs {
            if !groups.contains(&spec.group.as_str()) {
                groups.push(spec.group.as_str());
            }
        }
        groups
    }
}

impl<'a> IntoIterator for &'a QueryRegistry {
    type Item = &'a QuerySpec;
    type IntoIter = std::slice::Iter<'a, QuerySpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.specs.iter()
    }
}
